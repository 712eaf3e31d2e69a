//! Turning input files into submitted batch jobs.
//!
//! [`Submitter`] validates a run once and then processes inputs one at a time. Each
//! job is described, checked for conflicts, staged and dispatched either to the local
//! scheduler or to a remote host.
pub mod conflict;
pub mod filesync;
pub mod jobstore;
pub mod remote;
pub mod script;
pub mod staging;

use std::path::PathBuf;

use crate::common::error::{ClusterqError, config_error, fs_error};
use crate::common::placeholders::{TEMPLATE_DELIMITER, fill_template, interpolate};
use crate::config::{Config, Identity, SubmitOptions};
use crate::manager::Scheduler;
use crate::{Map, Set};
use conflict::check_conflicts;
use jobstore::{LocalDispatcher, Throttle, remove_stale_job_dir};
use remote::{RemoteDispatcher, RemoteTransport};
use script::{JobFiles, ScriptBuilder};
use staging::{job_layout, plan_staging, prepare_output_dir, presence_map};

/// Default lock file, relative to the home directory.
const DEFAULT_LOCK_FILE: &str = ".clusterq/submit.lock";

/// Values captured by the input filter, available to parameter keys.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FilterGroups {
    pub positional: Vec<String>,
    pub named: Map<String, String>,
}

/// One input to submit: files `<workdir>/<inputname>.<role>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInput {
    pub workdir: PathBuf,
    pub inputname: String,
    pub filter_groups: FilterGroups,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDescriptor {
    pub workdir: PathBuf,
    pub inputname: String,
    pub jobname: String,
    pub outputname: String,
    pub filter_groups: FilterGroups,
    /// Program version the job runs with. Remote hosts select their own.
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Submitted { jobname: String, job_id: String },
    /// Files were prepared but nothing was submitted.
    DryRun { jobname: String, path: PathBuf },
    /// Handed over to the clusterq command of a remote host.
    Dispatched { jobname: String, host: String },
}

struct LocalContext {
    dispatcher: LocalDispatcher,
    script: ScriptBuilder,
    template_values: Map<String, String>,
    parameter_keys: Map<String, String>,
}

impl LocalContext {
    /// Resolves the configured parameter path templates for `job`.
    fn parameter_paths(&self, config: &Config, job: &JobDescriptor) -> crate::Result<Vec<PathBuf>> {
        let mut values = self.template_values.clone();
        for (key, value) in &self.parameter_keys {
            let value = interpolate(
                value,
                TEMPLATE_DELIMITER,
                &job.filter_groups.positional,
                &job.filter_groups.named,
            )
            .map_err(|source| ClusterqError::Interpolation {
                context: format!("parameter key `{key}`"),
                source,
            })?;
            values.insert(key.clone(), value);
        }
        config
            .program
            .parameter_paths
            .iter()
            .map(|template| {
                let path = PathBuf::from(fill_template(template, &values).map_err(|source| {
                    ClusterqError::Interpolation {
                        context: format!("parameter path `{template}`"),
                        source,
                    }
                })?);
                if !path.exists() {
                    return fs_error(format!("Parameter path {} does not exist", path.display()));
                }
                Ok(path)
            })
            .collect()
    }
}

enum Dispatch {
    Local(Box<LocalContext>),
    Remote(RemoteDispatcher),
}

pub struct Submitter {
    config: Config,
    options: SubmitOptions,
    prefix: Option<String>,
    suffix: Option<String>,
    version: Option<String>,
    dispatch: Dispatch,
    created_jobdirs: Set<PathBuf>,
}

fn interpolate_affix(
    affix: &Option<String>,
    options: &SubmitOptions,
    field: &str,
) -> crate::Result<Option<String>> {
    let Some(affix) = affix else {
        return Ok(None);
    };
    let interpolation = &options.interpolation;
    interpolate(
        affix,
        TEMPLATE_DELIMITER,
        &interpolation.positional,
        &interpolation.named,
    )
    .map(Some)
    .map_err(|error| ClusterqError::Config(format!("Cannot interpolate the {field}: {error}")))
}

fn select_version(config: &Config, options: &SubmitOptions) -> crate::Result<String> {
    if let Some(version) = &options.version {
        if !config.versions.contains_key(version) {
            return config_error(format!("Version `{version}` is not configured"));
        }
        return Ok(version.clone());
    }
    if let Some(version) = &config.defaults.version {
        return Ok(version.clone());
    }
    match config.versions.keys().collect::<Vec<_>>().as_slice() {
        [version] => Ok((*version).clone()),
        _ => config_error("A program version has to be selected".to_string()),
    }
}

impl Submitter {
    /// Validates the run. Every error returned here is fatal.
    pub fn new(
        config: Config,
        options: SubmitOptions,
        identity: Identity,
        scheduler: Box<dyn Scheduler>,
        transport: Box<dyn RemoteTransport>,
    ) -> crate::Result<Self> {
        let interpolation = &options.interpolation;
        if interpolation.delimiter.is_empty() {
            return config_error("The interpolation delimiter cannot be empty".to_string());
        }
        if interpolation.requested() {
            if options.raw {
                return config_error(
                    "Interpolation variables cannot be used in raw mode".to_string(),
                );
            }
            if interpolation.prefix.is_none() && interpolation.suffix.is_none() {
                return config_error(
                    "A prefix or a suffix is required when interpolation variables are given"
                        .to_string(),
                );
            }
        }
        let prefix = interpolate_affix(&interpolation.prefix, &options, "prefix")?;
        let suffix = interpolate_affix(&interpolation.suffix, &options, "suffix")?;
        if options.nproc == 0 {
            return config_error("The number of processors must be positive".to_string());
        }
        for (key, value) in &options.parameter_keys {
            if value.contains('/') {
                return config_error(format!("The value of `{key}` cannot be a path"));
            }
        }

        let head = config
            .cluster
            .head
            .clone()
            .unwrap_or_else(|| identity.host.clone());
        let names = identity.names(&head, &config.cluster.name, &config.program.name);
        let template_values =
            identity.template_values(&head, &config.cluster.name, &config.program.name);

        let mut selected_version = None;
        let dispatch = match &options.remote_host {
            Some(host) => Dispatch::Remote(RemoteDispatcher::new(
                transport,
                host.clone(),
                identity.home.clone(),
                format!("{}.{}", identity.user, identity.host),
                config.program.key.clone(),
                config.cluster.forward_env.clone(),
                options.remote_args.clone(),
                options.parameter_keys.clone(),
            )),
            None => {
                let version = select_version(&config, &options)?;
                selected_version = Some(version.clone());
                let Some(queue) = options.queue.clone().or(config.defaults.queue.clone()) else {
                    return config_error("A queue has to be selected".to_string());
                };
                let scratch_root = match (&options.scratch, &config.defaults.scratch) {
                    (Some(scratch), _) => scratch.display().to_string(),
                    (None, Some(template)) => {
                        fill_template(template, &template_values).map_err(|error| {
                            ClusterqError::Config(format!(
                                "Cannot interpolate `defaults.scratch`: {error}"
                            ))
                        })?
                    }
                    (None, None) => {
                        return config_error("No scratch directory is configured".to_string());
                    }
                };
                let scratch_dir = format!(
                    "{}/{}",
                    scratch_root.trim_end_matches('/'),
                    config.scheduler.job_id_variable()
                );
                let script = ScriptBuilder::new(
                    &config,
                    &options,
                    &version,
                    &queue,
                    &names,
                    &template_values,
                    scratch_dir,
                )?;
                let lock_file = config
                    .cluster
                    .lock_file
                    .clone()
                    .unwrap_or_else(|| identity.home.join(DEFAULT_LOCK_FILE));
                let throttle = Throttle::new(lock_file, config.cluster.delay + options.delay);
                let mut parameter_keys = config.defaults.parameter_keys.clone();
                parameter_keys.extend(options.parameter_keys.clone());
                log::debug!(
                    "Submitting {} {version} to queue {queue} of {}",
                    config.program.name,
                    config.cluster.name
                );
                Dispatch::Local(Box::new(LocalContext {
                    dispatcher: LocalDispatcher::new(
                        scheduler,
                        config.scheduler.states.clone(),
                        throttle,
                    ),
                    script,
                    template_values,
                    parameter_keys,
                }))
            }
        };

        Ok(Self {
            config,
            options,
            prefix,
            suffix,
            version: selected_version,
            dispatch,
            created_jobdirs: Set::new(),
        })
    }

    /// Establishes the remote session when jobs are dispatched to a remote host.
    pub async fn start(&mut self) -> crate::Result<()> {
        if let Dispatch::Remote(remote) = &mut self.dispatch {
            let session = remote.connect().await?;
            log::info!("Connected to {}", session.host);
        }
        Ok(())
    }

    pub fn describe(&self, input: JobInput) -> JobDescriptor {
        let mut jobname = input.inputname.clone();
        if let Some(prefix) = &self.prefix {
            jobname = format!("{prefix}.{jobname}");
        }
        if let Some(suffix) = &self.suffix {
            jobname = format!("{jobname}.{suffix}");
        }
        JobDescriptor {
            workdir: input.workdir,
            inputname: input.inputname,
            outputname: jobname.clone(),
            jobname,
            filter_groups: input.filter_groups,
            version: self.version.clone(),
        }
    }

    /// Processes one input. Errors returned here only concern this job.
    pub async fn submit(&mut self, input: JobInput) -> crate::Result<JobOutcome> {
        let job = self.describe(input);
        log::debug!("Processing {} as job {}", job.inputname, job.jobname);
        let config = &self.config;
        let options = &self.options;

        let presence = presence_map(&config.catalog, &job.workdir, &job.inputname);
        if !config
            .catalog
            .input_roles()
            .any(|role| presence.get(role).copied().unwrap_or(false))
        {
            return fs_error(format!(
                "No input files of {} were found in {}",
                job.inputname,
                job.workdir.display()
            ));
        }
        check_conflicts(&config.conflicts, &presence, &job.inputname, &job.jobname)?;

        let layout = job_layout(&job, options.out.as_deref(), options.raw, &config.program.key)?;
        if self.created_jobdirs.contains(&layout.jobdir) {
            return fs_error(format!(
                "Job {} was already processed in this run ({})",
                job.jobname,
                layout.jobdir.display()
            ));
        }
        let plan = plan_staging(
            &config.catalog,
            &job,
            &layout,
            &options.interpolation,
            options.staging,
            options.raw,
        )?;

        match &self.dispatch {
            Dispatch::Local(local) => {
                let parameter_paths = local.parameter_paths(config, &job)?;
                let document = local.script.build(&JobFiles {
                    jobname: &job.jobname,
                    staged_name: &layout.staged_name,
                    outputname: &job.outputname,
                    stagedir: &layout.stagedir,
                    outdir: &layout.outdir,
                    present_inputs: &plan.present_inputs,
                    parameter_paths: &parameter_paths,
                })?;
                local
                    .dispatcher
                    .check_previous_job(&layout.jobdir, &job.jobname)
                    .await?;
                prepare_output_dir(&config.catalog, &job, &layout.outdir, options.overwrite)?;
                remove_stale_job_dir(&layout.jobdir)?;
                plan.apply()?;
                self.created_jobdirs.insert(layout.jobdir.clone());
                local
                    .dispatcher
                    .dispatch(&job.jobname, &layout.jobdir, &document, options.dry_run)
                    .await
            }
            Dispatch::Remote(remote) => {
                remote.relative_outdir(&layout.outdir)?;
                prepare_output_dir(&config.catalog, &job, &layout.outdir, options.overwrite)?;
                plan.apply()?;
                self.created_jobdirs.insert(layout.jobdir.clone());
                remote
                    .dispatch(&config.catalog, &job, &layout.outdir, options.dry_run)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use tempfile::TempDir;

    use super::{FilterGroups, JobInput, JobOutcome, Submitter};
    use crate::common::error::ClusterqError;
    use crate::config::{Config, StagingPolicy, SubmitOptions};
    use crate::submit::jobstore::read_job_id;
    use crate::tests::utils::{MockScheduler, MockTransport, test_config, test_identity};

    struct Fixture {
        home: TempDir,
        scheduler: MockScheduler,
        transport: MockTransport,
    }

    impl Fixture {
        fn new() -> Self {
            let home = TempDir::with_prefix("clusterq").unwrap();
            std::fs::create_dir(home.path().join("calc")).unwrap();
            Self {
                home,
                scheduler: MockScheduler::new(),
                transport: MockTransport::new(&[
                    ("JOBCOMMAND", "/opt/bin/clusterq"),
                    ("JOBSYNCDIR", "/sync"),
                ]),
            }
        }

        fn workdir(&self) -> PathBuf {
            self.home.path().join("calc")
        }

        fn write_input(&self, filename: &str, contents: &str) {
            std::fs::write(self.workdir().join(filename), contents).unwrap();
        }

        fn input(&self, inputname: &str) -> JobInput {
            JobInput {
                workdir: self.workdir(),
                inputname: inputname.to_string(),
                filter_groups: FilterGroups::default(),
            }
        }

        fn submitter(&self, config: Config, options: SubmitOptions) -> crate::Result<Submitter> {
            Submitter::new(
                config,
                options,
                test_identity(self.home.path()),
                Box::new(self.scheduler.clone()),
                Box::new(self.transport.clone()),
            )
        }
    }

    fn config_without_stdout() -> Config {
        let mut config = test_config();
        config.program.stdout = None;
        config
    }

    fn jobdir(workdir: &Path, jobname: &str) -> PathBuf {
        workdir.join(jobname).join(format!("{jobname}.orca.job"))
    }

    #[tokio::test]
    async fn test_submit_stages_and_submits() {
        let fixture = Fixture::new();
        fixture.write_input("water.inp", "! B3LYP def2-SVP\n");
        let mut submitter = fixture
            .submitter(config_without_stdout(), SubmitOptions::new())
            .unwrap();

        let outcome = submitter.submit(fixture.input("water")).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Submitted {
                jobname: "water".to_string(),
                job_id: "42".to_string()
            }
        );

        let outdir = fixture.workdir().join("water");
        assert_eq!(
            std::fs::read_to_string(outdir.join("water.inp")).unwrap(),
            "! B3LYP def2-SVP\n"
        );
        assert!(fixture.workdir().join("water.inp").exists());
        let jobdir = jobdir(&fixture.workdir(), "water");
        assert_eq!(read_job_id(&jobdir).as_deref(), Some("42"));

        let submitted = fixture.scheduler.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].0, jobdir.join("script"));
        assert!(
            submitted[0]
                .1
                .lines()
                .any(|line| line == "/opt/orca/5.0/orca water.job.in")
        );
        assert!(fixture.home.path().join(".clusterq/submit.lock").exists());
    }

    #[tokio::test]
    async fn test_resubmit_blocked_by_active_job() {
        let fixture = Fixture::new();
        fixture.write_input("water.inp", "! B3LYP\n");
        let mut submitter = fixture
            .submitter(test_config(), SubmitOptions::new())
            .unwrap();
        submitter.submit(fixture.input("water")).await.unwrap();
        fixture.scheduler.set_status("42", "R");

        let mut second = fixture
            .submitter(test_config(), SubmitOptions::new())
            .unwrap();
        let error = second.submit(fixture.input("water")).await.unwrap_err();
        match error {
            ClusterqError::JobActive { job_id, reason } => {
                assert_eq!(job_id, "42");
                assert_eq!(reason, "Job water (42) is still running");
            }
            error => panic!("Unexpected error {error:?}"),
        }
        assert_eq!(fixture.scheduler.submitted().len(), 1);
        let jobdir = jobdir(&fixture.workdir(), "water");
        assert_eq!(read_job_id(&jobdir).as_deref(), Some("42"));

        fixture.scheduler.set_status("42", "C");
        let mut third = fixture
            .submitter(test_config(), SubmitOptions::new())
            .unwrap();
        let outcome = third.submit(fixture.input("water")).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Submitted {
                jobname: "water".to_string(),
                job_id: "43".to_string()
            }
        );
        assert_eq!(read_job_id(&jobdir).as_deref(), Some("43"));
    }

    #[tokio::test]
    async fn test_conflict_leaves_filesystem_untouched() {
        let fixture = Fixture::new();
        fixture.write_input("water.inp", "! B3LYP\n");
        fixture.write_input("water.xyz", "3\n");
        fixture.write_input("water.gbw", "");
        let mut submitter = fixture
            .submitter(test_config(), SubmitOptions::new())
            .unwrap();

        let error = submitter.submit(fixture.input("water")).await.unwrap_err();
        assert!(matches!(
            error,
            ClusterqError::Conflict(ref message)
                if message == "water: the xyz and gbw files cannot be used together"
        ));
        assert!(!fixture.workdir().join("water").exists());
        assert!(fixture.scheduler.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_missing_input_files() {
        let fixture = Fixture::new();
        let mut submitter = fixture
            .submitter(test_config(), SubmitOptions::new())
            .unwrap();
        let error = submitter.submit(fixture.input("water")).await.unwrap_err();
        assert!(matches!(error, ClusterqError::Filesystem(_)));
    }

    #[tokio::test]
    async fn test_output_dir_equal_to_input_dir() {
        let fixture = Fixture::new();
        fixture.write_input("water.inp", "! B3LYP\n");
        let mut options = SubmitOptions::new();
        options.out = Some(fixture.workdir());
        let mut submitter = fixture.submitter(test_config(), options).unwrap();

        let error = submitter.submit(fixture.input("water")).await.unwrap_err();
        assert!(matches!(error, ClusterqError::Filesystem(_)));
        let entries = std::fs::read_dir(fixture.workdir()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_existing_outputs_without_overwrite() {
        let fixture = Fixture::new();
        fixture.write_input("water.inp", "! B3LYP\n");
        let outdir = fixture.workdir().join("water");
        std::fs::create_dir(&outdir).unwrap();
        std::fs::write(outdir.join("water.out"), "old").unwrap();
        let mut options = SubmitOptions::new();
        options.overwrite = false;
        let mut submitter = fixture.submitter(test_config(), options).unwrap();

        let error = submitter.submit(fixture.input("water")).await.unwrap_err();
        assert!(matches!(error, ClusterqError::Filesystem(_)));
        assert_eq!(
            std::fs::read_to_string(outdir.join("water.out")).unwrap(),
            "old"
        );
    }

    #[tokio::test]
    async fn test_rejected_resubmission_keeps_job_record() {
        let fixture = Fixture::new();
        fixture.write_input("water.inp", "! B3LYP\n");
        let mut first = fixture
            .submitter(test_config(), SubmitOptions::new())
            .unwrap();
        first.submit(fixture.input("water")).await.unwrap();
        fixture.scheduler.set_status("42", "C");

        let outdir = fixture.workdir().join("water");
        std::fs::write(outdir.join("water.out"), "old").unwrap();
        let mut options = SubmitOptions::new();
        options.overwrite = false;
        let mut second = fixture.submitter(test_config(), options).unwrap();

        let error = second.submit(fixture.input("water")).await.unwrap_err();
        assert!(matches!(error, ClusterqError::Filesystem(_)));
        let jobdir = jobdir(&fixture.workdir(), "water");
        assert_eq!(read_job_id(&jobdir).as_deref(), Some("42"));
        assert!(jobdir.join("script").is_file());
        assert_eq!(fixture.scheduler.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_interpolated_dry_run() {
        let fixture = Fixture::new();
        fixture.write_input("water.inp", "%temp %0 K\n");
        let mut options = SubmitOptions::new();
        options.dry_run = true;
        options.interpolation.add_variable("300").unwrap();
        options.interpolation.add_variable("temp:T").unwrap();
        options.interpolation.prefix = Some("T%0".to_string());
        let mut submitter = fixture.submitter(test_config(), options).unwrap();

        let outcome = submitter.submit(fixture.input("water")).await.unwrap();
        let jobdir = jobdir(&fixture.workdir(), "T300.water");
        assert_eq!(
            outcome,
            JobOutcome::DryRun {
                jobname: "T300.water".to_string(),
                path: jobdir.clone()
            }
        );
        assert!(jobdir.join("script").is_file());
        assert_eq!(
            std::fs::read_to_string(fixture.workdir().join("T300.water/T300.water.inp")).unwrap(),
            "T 300 K\n"
        );
        assert!(fixture.scheduler.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_job_processed_once_per_run() {
        let fixture = Fixture::new();
        fixture.write_input("water.inp", "! B3LYP\n");
        let mut options = SubmitOptions::new();
        options.dry_run = true;
        let mut submitter = fixture.submitter(test_config(), options).unwrap();

        submitter.submit(fixture.input("water")).await.unwrap();
        let error = submitter.submit(fixture.input("water")).await.unwrap_err();
        assert!(matches!(error, ClusterqError::Filesystem(_)));
    }

    #[test]
    fn test_fatal_option_errors() {
        let fixture = Fixture::new();

        let mut raw = SubmitOptions::new();
        raw.raw = true;
        raw.interpolation.add_variable("300").unwrap();
        raw.interpolation.prefix = Some("T%0".to_string());
        assert!(fixture.submitter(test_config(), raw).err().unwrap().is_fatal());

        let mut unnamed = SubmitOptions::new();
        unnamed.interpolation.add_variable("300").unwrap();
        assert!(fixture.submitter(test_config(), unnamed).err().unwrap().is_fatal());

        let mut undefined = SubmitOptions::new();
        undefined.interpolation.add_variable("300").unwrap();
        undefined.interpolation.suffix = Some("%1".to_string());
        assert!(fixture.submitter(test_config(), undefined).err().unwrap().is_fatal());

        let mut version = SubmitOptions::new();
        version.version = Some("6.0".to_string());
        assert!(fixture.submitter(test_config(), version).err().unwrap().is_fatal());

        let mut key = SubmitOptions::new();
        key.parameter_keys
            .insert("basis".to_string(), "../basis".to_string());
        assert!(fixture.submitter(test_config(), key).err().unwrap().is_fatal());

        let mut config = test_config();
        config.defaults.queue = None;
        assert!(
            fixture
                .submitter(config, SubmitOptions::new())
                .err()
                .unwrap()
                .is_fatal()
        );
    }

    fn basis_setup() -> (Config, SubmitOptions) {
        let mut config = test_config();
        config.program.parameter_paths = vec!["%home/basis/%basis".to_string()];
        let mut options = SubmitOptions::new();
        options
            .parameter_keys
            .insert("basis".to_string(), "%0".to_string());
        (config, options)
    }

    fn with_groups(mut input: JobInput, positional: &[&str]) -> JobInput {
        input.filter_groups.positional = positional.iter().map(|v| v.to_string()).collect();
        input
    }

    #[tokio::test]
    async fn test_parameter_paths() {
        let fixture = Fixture::new();
        fixture.write_input("water.inp", "! B3LYP\n");
        std::fs::create_dir_all(fixture.home.path().join("basis/SVP")).unwrap();
        let (config, options) = basis_setup();
        let mut submitter = fixture.submitter(config, options).unwrap();

        submitter
            .submit(with_groups(fixture.input("water"), &["SVP"]))
            .await
            .unwrap();
        let script = &fixture.scheduler.submitted()[0].1;
        assert!(script.contains(&format!(
            "cp -r \"{}/basis/SVP/.\"",
            fixture.home.path().display()
        )));
    }

    #[tokio::test]
    async fn test_missing_parameter_path() {
        let fixture = Fixture::new();
        fixture.write_input("water.inp", "! B3LYP\n");
        let (config, options) = basis_setup();
        let mut submitter = fixture.submitter(config, options).unwrap();

        let error = submitter
            .submit(with_groups(fixture.input("water"), &["TZVP"]))
            .await
            .unwrap_err();
        assert!(matches!(error, ClusterqError::Filesystem(_)));
        assert!(!fixture.workdir().join("water").exists());
    }

    #[tokio::test]
    async fn test_remote_dispatch() {
        let fixture = Fixture::new();
        fixture.write_input("water.inp", "! B3LYP\n");
        let mut options = SubmitOptions::new();
        options.remote_host = Some("cluster.example.org".to_string());
        let mut submitter = fixture.submitter(test_config(), options).unwrap();
        submitter.start().await.unwrap();

        let outcome = submitter.submit(fixture.input("water")).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Dispatched {
                jobname: "water".to_string(),
                host: "cluster.example.org".to_string()
            }
        );
        assert_eq!(fixture.transport.executed().len(), 1);
        assert_eq!(fixture.transport.copies().len(), 2);
        assert!(fixture.scheduler.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_remote_outdir_outside_home_is_rejected_before_staging() {
        let fixture = Fixture::new();
        fixture.write_input("water.inp", "! B3LYP\n");
        let elsewhere = TempDir::with_prefix("clusterq").unwrap();
        let outdir = elsewhere.path().join("water");
        let mut options = SubmitOptions::new();
        options.remote_host = Some("cluster.example.org".to_string());
        options.staging = StagingPolicy::Move;
        options.out = Some(outdir.clone());
        let mut submitter = fixture.submitter(test_config(), options).unwrap();
        submitter.start().await.unwrap();

        let error = submitter.submit(fixture.input("water")).await.unwrap_err();
        assert!(matches!(error, ClusterqError::Filesystem(_)));
        assert_eq!(
            std::fs::read_to_string(fixture.workdir().join("water.inp")).unwrap(),
            "! B3LYP\n"
        );
        assert!(!outdir.exists());
        assert!(fixture.transport.copies().is_empty());
        assert!(fixture.transport.executed().is_empty());
    }

    #[tokio::test]
    async fn test_remote_missing_environment_is_fatal() {
        let fixture = Fixture::new();
        let mut options = SubmitOptions::new();
        options.remote_host = Some("cluster.example.org".to_string());
        let mut submitter = Submitter::new(
            test_config(),
            options,
            test_identity(fixture.home.path()),
            Box::new(fixture.scheduler.clone()),
            Box::new(MockTransport::new(&[("JOBCOMMAND", "/opt/bin/clusterq")])),
        )
        .unwrap();
        assert!(submitter.start().await.unwrap_err().is_fatal());
    }
}
