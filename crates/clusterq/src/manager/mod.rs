pub mod command;
pub mod state;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

pub use state::{JobState, QueryError};

/// Boundary to an external batch scheduler (PBS, Slurm, LSF, ...).
pub trait Scheduler {
    /// Submits the job script at `script` and returns the job id assigned by the
    /// scheduler.
    ///
    /// On rejection the scheduler's error text is returned verbatim inside
    /// [`crate::Error::SchedulerSubmit`].
    fn submit<'a>(
        &'a self,
        script: &'a Path,
    ) -> Pin<Box<dyn Future<Output = crate::Result<String>> + 'a>>;

    /// Returns the raw status token of a job.
    fn status<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, QueryError>> + 'a>>;
}
