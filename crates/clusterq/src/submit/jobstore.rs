//! Job directories, submission throttling and local dispatch.
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::common::error::ClusterqError;
use crate::common::fsutils::{modification_time, touch, write_atomic};
use crate::manager::state::{JobState, StateTable, check_state};
use crate::manager::Scheduler;
use crate::submit::script::ScriptDocument;
use crate::submit::JobOutcome;

/// Name of the job script inside a job directory.
pub const SCRIPT_FILE: &str = "script";
/// Name of the file that stores the scheduler job id inside a job directory.
pub const JOB_ID_FILE: &str = "id";

pub fn read_job_id(jobdir: &Path) -> Option<String> {
    let id = std::fs::read_to_string(jobdir.join(JOB_ID_FILE)).ok()?;
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

pub fn write_job_id(jobdir: &Path, job_id: &str) -> crate::Result<()> {
    let path = jobdir.join(JOB_ID_FILE);
    write_atomic(&path, job_id.as_bytes(), None).map_err(|error| {
        ClusterqError::Filesystem(format!("Cannot write job id into {}: {error}", path.display()))
    })
}

/// Creates the job directory; it must not exist yet.
pub fn create_job_dir(jobdir: &Path) -> crate::Result<()> {
    match std::fs::create_dir(jobdir) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::AlreadyExists => {
            Err(ClusterqError::JobDirExists(jobdir.to_path_buf()))
        }
        Err(error) => Err(ClusterqError::Filesystem(format!(
            "Cannot create job directory {}: {error}",
            jobdir.display()
        ))),
    }
}

/// Removes the job directory of a previous run that no longer blocks resubmission.
pub fn remove_stale_job_dir(jobdir: &Path) -> crate::Result<()> {
    if !jobdir.is_dir() {
        return Ok(());
    }
    std::fs::remove_dir_all(jobdir).map_err(|error| {
        ClusterqError::Filesystem(format!(
            "Cannot remove stale job directory {}: {error}",
            jobdir.display()
        ))
    })
}

/// Writes the executable job script into `jobdir` and returns its path.
pub fn write_script(jobdir: &Path, script: &ScriptDocument) -> crate::Result<PathBuf> {
    let path = jobdir.join(SCRIPT_FILE);
    write_atomic(&path, script.render().as_bytes(), Some(0o755)).map_err(|error| {
        ClusterqError::Filesystem(format!("Cannot write job script {}: {error}", path.display()))
    })?;
    Ok(path)
}

/// Spaces submissions of all invocations sharing one lock file.
///
/// The modification time of the lock file marks the last submission.
#[derive(Debug, Clone)]
pub struct Throttle {
    lock_file: PathBuf,
    delay: Duration,
}

impl Throttle {
    pub fn new(lock_file: PathBuf, delay: Duration) -> Self {
        Self { lock_file, delay }
    }

    /// How long to wait at `now` before the next submission may happen.
    pub fn remaining(&self, now: SystemTime) -> Duration {
        if self.delay.is_zero() {
            return Duration::ZERO;
        }
        match modification_time(&self.lock_file) {
            Some(last) => {
                let elapsed = now.duration_since(last).unwrap_or(Duration::ZERO);
                self.delay.saturating_sub(elapsed)
            }
            None => Duration::ZERO,
        }
    }

    pub async fn wait(&self) {
        let remaining = self.remaining(SystemTime::now());
        if !remaining.is_zero() {
            log::debug!(
                "Waiting {} before the next submission",
                humantime::format_duration(remaining)
            );
            tokio::time::sleep(remaining).await;
        }
    }

    pub fn mark(&self) -> crate::Result<()> {
        touch(&self.lock_file).map_err(|error| {
            ClusterqError::Filesystem(format!(
                "Cannot update lock file {}: {error}",
                self.lock_file.display()
            ))
        })
    }
}

/// Submits job scripts to the local scheduler.
pub struct LocalDispatcher {
    scheduler: Box<dyn Scheduler>,
    states: StateTable,
    throttle: Throttle,
}

impl LocalDispatcher {
    pub fn new(scheduler: Box<dyn Scheduler>, states: StateTable, throttle: Throttle) -> Self {
        Self {
            scheduler,
            states,
            throttle,
        }
    }

    /// Fails if the job recorded in `jobdir` is still alive.
    ///
    /// A state that cannot be determined does not block the job. The directory itself is
    /// left in place, see [`remove_stale_job_dir`].
    pub async fn check_previous_job(&self, jobdir: &Path, jobname: &str) -> crate::Result<()> {
        if !jobdir.is_dir() {
            return Ok(());
        }
        match read_job_id(jobdir) {
            Some(job_id) => {
                match check_state(self.scheduler.as_ref(), &self.states, &job_id, jobname).await {
                    Ok(JobState::Blocking(reason)) => {
                        return Err(ClusterqError::JobActive { job_id, reason });
                    }
                    Ok(JobState::Ready) => {
                        log::debug!("Previous job {job_id} of {jobname} has finished");
                    }
                    Err(error) => {
                        log::warn!("{error}; submitting {jobname} anyway");
                    }
                }
            }
            None => log::debug!("Job directory {} has no job id", jobdir.display()),
        }
        Ok(())
    }

    /// Creates the job directory, writes the script and submits it unless `dry_run`.
    pub async fn dispatch(
        &self,
        jobname: &str,
        jobdir: &Path,
        script: &ScriptDocument,
        dry_run: bool,
    ) -> crate::Result<JobOutcome> {
        create_job_dir(jobdir)?;
        let script_path = write_script(jobdir, script)?;
        if dry_run {
            return Ok(JobOutcome::DryRun {
                jobname: jobname.to_string(),
                path: jobdir.to_path_buf(),
            });
        }

        self.throttle.wait().await;
        let job_id = self.scheduler.submit(&script_path).await?;
        write_job_id(jobdir, &job_id)?;
        self.throttle.mark()?;
        Ok(JobOutcome::Submitted {
            jobname: jobname.to_string(),
            job_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::time::{Duration, Instant, SystemTime};

    use tempfile::TempDir;

    use super::{
        LocalDispatcher, Throttle, create_job_dir, read_job_id, remove_stale_job_dir,
        write_job_id, write_script,
    };
    use crate::common::error::ClusterqError;
    use crate::submit::JobOutcome;
    use crate::submit::script::ScriptDocument;
    use crate::tests::utils::{MockScheduler, test_state_table};

    fn dispatcher(scheduler: &MockScheduler, dir: &TempDir, delay: Duration) -> LocalDispatcher {
        LocalDispatcher::new(
            Box::new(scheduler.clone()),
            test_state_table(),
            Throttle::new(dir.path().join("lock"), delay),
        )
    }

    fn document() -> ScriptDocument {
        ScriptDocument {
            main: vec!["true".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_job_id_round_trip() {
        let dir = TempDir::with_prefix("clusterq").unwrap();
        assert_eq!(read_job_id(dir.path()), None);
        write_job_id(dir.path(), "1234.pbs").unwrap();
        assert_eq!(read_job_id(dir.path()).as_deref(), Some("1234.pbs"));
    }

    #[test]
    fn test_create_job_dir_twice() {
        let dir = TempDir::with_prefix("clusterq").unwrap();
        let jobdir = dir.path().join("water.orca.job");
        create_job_dir(&jobdir).unwrap();
        match create_job_dir(&jobdir) {
            Err(ClusterqError::JobDirExists(path)) => assert_eq!(path, jobdir),
            result => panic!("Unexpected result {result:?}"),
        }
    }

    #[test]
    fn test_script_is_executable() {
        let dir = TempDir::with_prefix("clusterq").unwrap();
        let path = write_script(dir.path(), &document()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "#!/bin/bash\ntrue\n");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn test_throttle_without_lock() {
        let dir = TempDir::with_prefix("clusterq").unwrap();
        let throttle = Throttle::new(dir.path().join("lock"), Duration::from_secs(5));
        assert_eq!(throttle.remaining(SystemTime::now()), Duration::ZERO);
    }

    #[test]
    fn test_throttle_remaining() {
        let dir = TempDir::with_prefix("clusterq").unwrap();
        let throttle = Throttle::new(dir.path().join("lock"), Duration::from_secs(5));
        throttle.mark().unwrap();
        let marked = std::fs::metadata(dir.path().join("lock"))
            .unwrap()
            .modified()
            .unwrap();

        assert_eq!(throttle.remaining(marked), Duration::from_secs(5));
        assert_eq!(
            throttle.remaining(marked + Duration::from_secs(2)),
            Duration::from_secs(3)
        );
        assert_eq!(
            throttle.remaining(marked + Duration::from_secs(5)),
            Duration::ZERO
        );
        assert_eq!(
            throttle.remaining(marked + Duration::from_secs(60)),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_dispatch_submits_and_records_id() {
        let dir = TempDir::with_prefix("clusterq").unwrap();
        let scheduler = MockScheduler::new();
        let dispatcher = dispatcher(&scheduler, &dir, Duration::ZERO);
        let jobdir = dir.path().join("water.orca.job");

        let outcome = dispatcher
            .dispatch("water", &jobdir, &document(), false)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Submitted {
                jobname: "water".to_string(),
                job_id: "42".to_string()
            }
        );
        assert_eq!(read_job_id(&jobdir).as_deref(), Some("42"));
        assert!(dir.path().join("lock").exists());
        assert_eq!(scheduler.submitted()[0].0, jobdir.join("script"));
    }

    #[tokio::test]
    async fn test_dispatch_dry_run() {
        let dir = TempDir::with_prefix("clusterq").unwrap();
        let scheduler = MockScheduler::new();
        let dispatcher = dispatcher(&scheduler, &dir, Duration::ZERO);
        let jobdir = dir.path().join("water.orca.job");

        let outcome = dispatcher
            .dispatch("water", &jobdir, &document(), true)
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::DryRun { .. }));
        assert!(jobdir.join("script").is_file());
        assert!(scheduler.submitted().is_empty());
        assert!(!dir.path().join("lock").exists());
    }

    #[tokio::test]
    async fn test_dispatch_rejected_by_scheduler() {
        let dir = TempDir::with_prefix("clusterq").unwrap();
        let scheduler = MockScheduler::new();
        scheduler.fail_submissions("qsub: Unknown queue");
        let dispatcher = dispatcher(&scheduler, &dir, Duration::ZERO);
        let jobdir = dir.path().join("water.orca.job");

        let error = dispatcher
            .dispatch("water", &jobdir, &document(), false)
            .await
            .unwrap_err();
        assert!(!error.is_fatal());
        assert_eq!(
            error.to_string(),
            "The scheduler rejected the job: qsub: Unknown queue"
        );
        assert_eq!(read_job_id(&jobdir), None);
        assert!(!dir.path().join("lock").exists());
    }

    #[tokio::test]
    async fn test_dispatch_waits_for_delay() {
        let dir = TempDir::with_prefix("clusterq").unwrap();
        let scheduler = MockScheduler::new();
        let dispatcher = dispatcher(&scheduler, &dir, Duration::from_millis(400));
        Throttle::new(dir.path().join("lock"), Duration::ZERO)
            .mark()
            .unwrap();

        let start = Instant::now();
        dispatcher
            .dispatch("water", &dir.path().join("water.orca.job"), &document(), false)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(300));
        assert_eq!(scheduler.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_previous_job_blocking() {
        let dir = TempDir::with_prefix("clusterq").unwrap();
        let scheduler = MockScheduler::new();
        scheduler.set_status("41", "R");
        let dispatcher = dispatcher(&scheduler, &dir, Duration::ZERO);
        let jobdir = dir.path().join("water.orca.job");
        create_job_dir(&jobdir).unwrap();
        write_job_id(&jobdir, "41").unwrap();

        match dispatcher.check_previous_job(&jobdir, "water").await {
            Err(ClusterqError::JobActive { job_id, reason }) => {
                assert_eq!(job_id, "41");
                assert_eq!(reason, "Job water (41) is still running");
            }
            result => panic!("Unexpected result {result:?}"),
        }
        assert!(jobdir.is_dir());
    }

    #[tokio::test]
    async fn test_previous_job_finished() {
        let dir = TempDir::with_prefix("clusterq").unwrap();
        let scheduler = MockScheduler::new();
        scheduler.set_status("41", "C");
        let dispatcher = dispatcher(&scheduler, &dir, Duration::ZERO);
        let jobdir = dir.path().join("water.orca.job");
        create_job_dir(&jobdir).unwrap();
        write_job_id(&jobdir, "41").unwrap();

        dispatcher.check_previous_job(&jobdir, "water").await.unwrap();
        assert_eq!(read_job_id(&jobdir).as_deref(), Some("41"));
        remove_stale_job_dir(&jobdir).unwrap();
        assert!(!jobdir.exists());
        remove_stale_job_dir(&jobdir).unwrap();
    }

    #[tokio::test]
    async fn test_previous_job_unknown_state_does_not_block() {
        let dir = TempDir::with_prefix("clusterq").unwrap();
        let scheduler = MockScheduler::new();
        scheduler.set_status("41", "X");
        let dispatcher = dispatcher(&scheduler, &dir, Duration::ZERO);
        let jobdir = dir.path().join("water.orca.job");
        create_job_dir(&jobdir).unwrap();
        write_job_id(&jobdir, "41").unwrap();

        dispatcher.check_previous_job(&jobdir, "water").await.unwrap();
        assert!(jobdir.is_dir());
        assert_eq!(scheduler.status_queries(), vec!["41".to_string()]);
    }
}
