use std::path::PathBuf;
use std::time::Duration;

use crate::common::error::config_error;
use crate::{Map, Set};

/// What happens to staged input files when the job imports them into scratch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum StagingPolicy {
    #[default]
    Copy,
    /// Move the staged file into scratch and delete it from the stage directory.
    Move,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeTarget {
    AnyAvailable { nodes: u32 },
    Hosts(Vec<String>),
}

impl Default for NodeTarget {
    fn default() -> Self {
        NodeTarget::AnyAvailable { nodes: 1 }
    }
}

#[derive(Debug, Clone)]
pub struct InterpolationOptions {
    pub delimiter: String,
    pub positional: Vec<String>,
    pub named: Map<String, String>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
}

impl Default for InterpolationOptions {
    fn default() -> Self {
        Self {
            delimiter: "%".to_string(),
            positional: vec![],
            named: Map::new(),
            prefix: None,
            suffix: None,
        }
    }
}

impl InterpolationOptions {
    /// Interpolation was requested explicitly by passing at least one variable.
    pub fn requested(&self) -> bool {
        !self.positional.is_empty() || !self.named.is_empty()
    }

    /// Adds a `-x` variable: `value` is positional, `name:value` is named.
    pub fn add_variable(&mut self, variable: &str) -> crate::Result<()> {
        match variable.split_once(':') {
            Some((name, "")) => {
                config_error(format!("No value given for interpolation variable `{name}`"))
            }
            Some((name, value)) => {
                self.named.insert(name.to_string(), value.to_string());
                Ok(())
            }
            None => {
                self.positional.push(variable.to_string());
                Ok(())
            }
        }
    }
}

/// Options forwarded verbatim to the remote invocation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RemoteArgs {
    pub switches: Set<String>,
    pub constants: Map<String, String>,
    pub lists: Map<String, Vec<String>>,
}

/// Choices of a single invocation, independent of the cluster configuration.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Output directory, relative to the directory of each input.
    pub out: Option<PathBuf>,
    /// Submit from the input directory without staging or interpolation.
    pub raw: bool,
    pub staging: StagingPolicy,
    pub queue: Option<String>,
    pub nproc: u32,
    pub nodes: NodeTarget,
    pub version: Option<String>,
    pub scratch: Option<PathBuf>,
    /// Extra wait added to the configured delay between submissions.
    pub delay: Duration,
    pub dry_run: bool,
    /// Clear existing output files without asking; `false` skips such jobs.
    pub overwrite: bool,
    pub interpolation: InterpolationOptions,
    pub parameter_keys: Map<String, String>,
    pub remote_host: Option<String>,
    pub remote_args: RemoteArgs,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self {
            nproc: 1,
            overwrite: true,
            ..Default::default()
        }
    }
}
