use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Output;

use bstr::ByteSlice;
use regex::Regex;
use tokio::process::Command;

use crate::common::error::ClusterqError;
use crate::manager::{QueryError, Scheduler};

/// Scheduler driven by external commands, e.g. `qsub`/`qstat -f`.
///
/// The script path (or the job id) is appended to the configured argument vector.
#[derive(Debug, Clone)]
pub struct CommandScheduler {
    submit_args: Vec<String>,
    status_args: Vec<String>,
    job_id_pattern: Regex,
}

impl CommandScheduler {
    pub fn new(submit_args: Vec<String>, status_args: Vec<String>, job_id_pattern: Regex) -> Self {
        Self {
            submit_args,
            status_args,
            job_id_pattern,
        }
    }
}

impl Scheduler for CommandScheduler {
    fn submit<'a>(
        &'a self,
        script: &'a Path,
    ) -> Pin<Box<dyn Future<Output = crate::Result<String>> + 'a>> {
        Box::pin(async move {
            let script_path = script.display().to_string();
            let mut arguments: Vec<&str> = self.submit_args.iter().map(|s| s.as_str()).collect();
            arguments.push(&script_path);

            log::debug!("Running submit command `{}`", arguments.join(" "));
            let workdir = script.parent().unwrap_or(Path::new("."));
            let output = create_command(&arguments, workdir)
                .output()
                .await
                .map_err(|error| {
                    ClusterqError::SchedulerSubmit(format!("{} start failed: {error}", arguments[0]))
                })?;
            let output = check_command_output(output).map_err(ClusterqError::SchedulerSubmit)?;
            let stdout = output.stdout.to_str_lossy();
            log::trace!("Submit output\n{}", stdout.trim());
            parse_job_id(&self.job_id_pattern, stdout.trim())
        })
    }

    fn status<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, QueryError>> + 'a>> {
        Box::pin(async move {
            let mut arguments: Vec<&str> = self.status_args.iter().map(|s| s.as_str()).collect();
            arguments.push(job_id);

            log::debug!("Running status command `{}`", arguments.join(" "));
            let failed = |message: String| QueryError::Failed {
                job_id: job_id.to_string(),
                message,
            };
            let output = create_command(&arguments, Path::new("."))
                .output()
                .await
                .map_err(|error| failed(format!("{} start failed: {error}", arguments[0])))?;
            let output = check_command_output(output).map_err(failed)?;
            Ok(output.stdout.to_str_lossy().trim().to_string())
        })
    }
}

pub fn create_command(arguments: &[&str], workdir: &Path) -> Command {
    let mut command = Command::new(arguments[0]);
    command.args(&arguments[1..]);
    command.current_dir(workdir);
    command
}

/// Returns the output of a successful command, or its error text otherwise.
pub fn check_command_output(output: Output) -> Result<Output, String> {
    let status = output.status;
    if !status.success() {
        let stderr = output.stderr.to_str_lossy();
        let stderr = stderr.trim();
        return Err(if stderr.is_empty() {
            format!("Exit code: {}", status.code().unwrap_or(-1))
        } else {
            stderr.to_string()
        });
    }
    Ok(output)
}

/// Extracts the job id from the first capture group of `pattern`.
pub fn parse_job_id(pattern: &Regex, output: &str) -> crate::Result<String> {
    pattern
        .captures(output)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str().to_string())
        .ok_or_else(|| {
            ClusterqError::SchedulerSubmit(format!(
                "Cannot find a job id in the submit output `{output}`"
            ))
        })
}
