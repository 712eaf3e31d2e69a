use std::path::PathBuf;

use clap::Parser;

use crate::config::{NodeTarget, RemoteArgs, StagingPolicy, SubmitOptions};

/// Parses `name=value` pairs of `--key`.
pub fn parse_key_value(value: &str) -> anyhow::Result<(String, String)> {
    match value.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => anyhow::bail!("Expected `name=value`, got `{value}`"),
    }
}

#[derive(Parser)]
#[command(
    name = "clusterq",
    about = "Submit computations to a cluster batch scheduler",
    disable_version_flag(true)
)]
pub struct RootOptions {
    /// Program to run, selects `<program>.toml` in the configuration directory
    pub program: String,

    /// Input files (or input names with `--job`)
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Configuration file, overrides the program lookup
    #[arg(long, env = "CLUSTERQ_CONFIG", value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Enables debug logging
    #[arg(long, env = "CLUSTERQ_DEBUG")]
    pub debug: bool,

    /// Output directory, relative to the input directory
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Run in the input directory without staging or interpolation
    #[arg(long)]
    pub raw: bool,

    /// Inputs are input names found in `--cwd`
    #[arg(long)]
    pub job: bool,

    /// Directory of the input names given with `--job`
    #[arg(long, default_value = ".")]
    pub cwd: PathBuf,

    /// Move staged inputs into scratch instead of copying them
    #[arg(long = "move", alias = "dispose")]
    pub move_inputs: bool,

    #[arg(short, long)]
    pub queue: Option<String>,

    /// Number of processes
    #[arg(short, long, default_value_t = 1)]
    pub nproc: u32,

    /// Number of nodes
    #[arg(short = 'N', long, conflicts_with = "host")]
    pub nodes: Option<u32>,

    /// Hosts to run on
    #[arg(long, value_delimiter(','))]
    pub host: Vec<String>,

    /// Program version
    #[arg(short = 'V', long = "version")]
    pub program_version: Option<String>,

    /// Scratch root directory
    #[arg(long)]
    pub scratch: Option<PathBuf>,

    /// Extra delay between submissions (e.g. `2s`)
    #[arg(long)]
    pub delay: Option<humantime::Duration>,

    /// Prepare everything but do not submit
    #[arg(long)]
    pub dry_run: bool,

    /// Skip jobs whose output files already exist
    #[arg(long)]
    pub no: bool,

    /// Interpolation variable, `value` or `name:value`
    #[arg(short = 'x', long = "var")]
    pub variables: Vec<String>,

    /// Delimiter of interpolation tokens in input files
    #[arg(long, default_value = "%")]
    pub delimiter: String,

    #[arg(long)]
    pub prefix: Option<String>,

    #[arg(long)]
    pub suffix: Option<String>,

    /// Regular expression matching the whole input name
    #[arg(long)]
    pub filter: Option<String>,

    /// Sort inputs naturally
    #[arg(long, conflicts_with = "sort_reverse")]
    pub sort: bool,

    /// Sort inputs naturally in reverse order
    #[arg(long)]
    pub sort_reverse: bool,

    /// Parameter key, `name=value`
    #[arg(short, long = "key", value_parser = parse_key_value)]
    pub keys: Vec<(String, String)>,

    /// Submit through the clusterq installation of a remote host
    #[arg(long)]
    pub remote: Option<String>,
}

impl RootOptions {
    pub fn submit_options(&self) -> crate::Result<SubmitOptions> {
        let mut options = SubmitOptions::new();
        options.out = self.out.clone();
        options.raw = self.raw;
        options.staging = if self.move_inputs {
            StagingPolicy::Move
        } else {
            StagingPolicy::Copy
        };
        options.queue = self.queue.clone();
        options.nproc = self.nproc;
        options.nodes = if self.host.is_empty() {
            NodeTarget::AnyAvailable {
                nodes: self.nodes.unwrap_or(1),
            }
        } else {
            NodeTarget::Hosts(self.host.clone())
        };
        options.version = self.program_version.clone();
        options.scratch = self.scratch.clone();
        options.delay = self.delay.map(Into::into).unwrap_or_default();
        options.dry_run = self.dry_run;
        options.overwrite = !self.no;
        options.interpolation.delimiter = self.delimiter.clone();
        for variable in &self.variables {
            options.interpolation.add_variable(variable)?;
        }
        options.interpolation.prefix = self.prefix.clone();
        options.interpolation.suffix = self.suffix.clone();
        options.parameter_keys = self.keys.iter().cloned().collect();
        options.remote_host = self.remote.clone();
        options.remote_args = self.remote_args();
        Ok(options)
    }

    /// Options repeated on the remote host. Names, paths and parameter keys are
    /// resolved locally and passed separately.
    pub fn remote_args(&self) -> RemoteArgs {
        let mut args = RemoteArgs::default();
        if self.no {
            args.switches.insert("no".to_string());
        }
        let constants = [
            ("queue", self.queue.clone()),
            ("nproc", Some(self.nproc.to_string())),
            ("nodes", self.nodes.map(|nodes| nodes.to_string())),
            ("version", self.program_version.clone()),
            (
                "scratch",
                self.scratch.as_ref().map(|path| path.display().to_string()),
            ),
            ("delay", self.delay.map(|delay| delay.to_string())),
        ];
        for (key, value) in constants {
            if let Some(value) = value {
                args.constants.insert(key.to_string(), value);
            }
        }
        if !self.host.is_empty() {
            args.lists.insert("host".to_string(), self.host.clone());
        }
        args
    }
}
