pub mod cli;
pub mod inputs;

use std::path::{Path, PathBuf};

use crate::common::error::config_error;
use crate::common::fsutils::absolute_path;
use crate::config::{Config, Identity};
use crate::manager::command::CommandScheduler;
use crate::submit::remote::SshTransport;
use crate::submit::{JobOutcome, Submitter};
use cli::RootOptions;
use inputs::{InputFilter, InputMode, collect_inputs, sort_naturally};

/// Directory holding `<program>.toml` configuration files.
pub const CONFIG_DIR_ENV: &str = "CLUSTERQ_CONFIG_DIR";

/// Finds the configuration of `program`, unless an explicit file is given.
pub fn config_path(program: &str, explicit: Option<&Path>, cwd: &Path) -> crate::Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(absolute_path(path.to_path_buf(), cwd));
    }
    let directory = match std::env::var_os(CONFIG_DIR_ENV) {
        Some(directory) => PathBuf::from(directory),
        None => match dirs::config_dir() {
            Some(directory) => directory.join("clusterq"),
            None => return config_error("Cannot determine the configuration directory".to_string()),
        },
    };
    Ok(directory.join(format!("{program}.toml")))
}

/// Number of processed and skipped inputs of a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: usize,
    pub skipped: usize,
}

fn report(outcome: &JobOutcome) {
    match outcome {
        JobOutcome::Submitted { jobname, job_id } => {
            log::info!("Job {jobname} submitted with id {job_id}");
        }
        JobOutcome::DryRun { jobname, path } => {
            log::info!("Job {jobname} prepared in {} (dry run)", path.display());
        }
        JobOutcome::Dispatched { jobname, host } => {
            log::info!("Job {jobname} sent to {host}");
        }
    }
}

/// Submits every input named on the command line.
///
/// Per-job errors are logged and counted. A fatal error stops the run.
pub async fn submit_inputs(opts: RootOptions) -> anyhow::Result<RunSummary> {
    let cwd = std::env::current_dir()?;
    let path = config_path(&opts.program, opts.config.as_deref(), &cwd)?;
    let config = Config::load(&path)?;
    if config.program.key != opts.program {
        log::warn!(
            "{} configures program `{}`, not `{}`",
            path.display(),
            config.program.key,
            opts.program
        );
    }
    let options = opts.submit_options()?;
    let filter = opts.filter.as_deref().map(InputFilter::new).transpose()?;
    let mode = if opts.job {
        InputMode::Names(opts.cwd.clone())
    } else {
        InputMode::Files
    };
    let mut arguments = opts.inputs.clone();
    if opts.sort || opts.sort_reverse {
        sort_naturally(&mut arguments, opts.sort_reverse);
    }

    let scheduler = CommandScheduler::new(
        config.scheduler.submit.clone(),
        config.scheduler.status.clone(),
        config.scheduler.job_id_pattern.clone(),
    );
    let inputs = collect_inputs(&config.catalog, &arguments, &mode, &cwd, filter.as_ref());
    let mut submitter = Submitter::new(
        config,
        options,
        Identity::detect()?,
        Box::new(scheduler),
        Box::new(SshTransport),
    )?;
    submitter.start().await?;

    let mut summary = RunSummary::default();
    for input in inputs {
        let input = match input {
            Ok(input) => input,
            Err(error) => {
                log::error!("{error}");
                summary.skipped += 1;
                continue;
            }
        };
        let inputname = input.inputname.clone();
        match submitter.submit(input).await {
            Ok(outcome) => {
                report(&outcome);
                summary.processed += 1;
            }
            Err(error) if error.is_fatal() => return Err(error.into()),
            Err(error) => {
                log::error!("Skipping {inputname}: {error}");
                summary.skipped += 1;
            }
        }
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::config_path;

    #[test]
    fn test_explicit_config_path() {
        let path = config_path("orca", Some(Path::new("conf/orca.toml")), Path::new("/home/ana"))
            .unwrap();
        assert_eq!(path, PathBuf::from("/home/ana/conf/orca.toml"));
        let path = config_path("orca", Some(Path::new("/etc/orca.toml")), Path::new("/home/ana"))
            .unwrap();
        assert_eq!(path, PathBuf::from("/etc/orca.toml"));
    }
}
