use crate::common::error::config_error;
use crate::common::placeholders::fill_template;
use crate::manager::Scheduler;
use crate::{Map, Set};

/// Classification of a scheduler status token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// The job is still queued or running; carries a human readable reason.
    Blocking(String),
    Ready,
}

/// The state of a job could not be determined. Never blocks a submission.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("Job {job_id} is in an unrecognized state `{token}`")]
    UnknownState { job_id: String, token: String },
    #[error("Cannot query the state of job {job_id}: {message}")]
    Failed { job_id: String, message: String },
}

/// Maps raw status tokens to blocking reasons or to the ready state.
#[derive(Debug, Clone)]
pub struct StateTable {
    /// Token -> reason template with `%id` and `%name` placeholders.
    blocking: Map<String, String>,
    ready: Set<String>,
}

impl StateTable {
    pub fn new(blocking: Map<String, String>, ready: Set<String>) -> crate::Result<Self> {
        if let Some(token) = blocking.keys().find(|token| ready.contains(*token)) {
            return config_error(format!(
                "Scheduler state `{token}` cannot be both blocking and ready"
            ));
        }
        Ok(Self { blocking, ready })
    }

    pub fn classify(&self, job_id: &str, jobname: &str, token: &str) -> Result<JobState, QueryError> {
        let token = token.trim();
        if let Some(template) = self.blocking.get(token) {
            let mut values = Map::new();
            values.insert("id".to_string(), job_id.to_string());
            values.insert("name".to_string(), jobname.to_string());
            let reason = fill_template(template, &values).unwrap_or_else(|_| template.clone());
            Ok(JobState::Blocking(reason))
        } else if self.ready.contains(token) {
            Ok(JobState::Ready)
        } else {
            Err(QueryError::UnknownState {
                job_id: job_id.to_string(),
                token: token.to_string(),
            })
        }
    }
}

/// Asks the scheduler for the state of `job_id` and classifies the answer.
pub async fn check_state(
    scheduler: &dyn Scheduler,
    table: &StateTable,
    job_id: &str,
    jobname: &str,
) -> Result<JobState, QueryError> {
    let token = scheduler.status(job_id).await?;
    log::debug!("Job {job_id} reported state `{token}`");
    table.classify(job_id, jobname, &token)
}
