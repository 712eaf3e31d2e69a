use std::path::PathBuf;

use thiserror::Error;

use crate::common::placeholders::InterpolationError;

/// How far a failure reaches: the whole run, or only the job being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Aborts the run before any job is processed.
    Fatal,
    /// Reported, the next input is processed normally.
    PerJob,
}

#[derive(Debug, Error)]
pub enum ClusterqError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Interpolation failed in {context}: {source}")]
    Interpolation {
        context: String,
        #[source]
        source: InterpolationError,
    },
    #[error("{0}")]
    Filesystem(String),
    #[error("Job directory {0} already exists")]
    JobDirExists(PathBuf),
    #[error("{reason}")]
    JobActive { job_id: String, reason: String },
    #[error("The scheduler rejected the job: {0}")]
    SchedulerSubmit(String),
    #[error("Remote transport error: {0}")]
    RemoteTransport(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl ClusterqError {
    pub fn severity(&self) -> Severity {
        match self {
            ClusterqError::Config(_) => Severity::Fatal,
            _ => Severity::PerJob,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

pub fn config_error<T>(message: String) -> crate::Result<T> {
    Err(ClusterqError::Config(message))
}

pub fn fs_error<T>(message: String) -> crate::Result<T> {
    Err(ClusterqError::Filesystem(message))
}
