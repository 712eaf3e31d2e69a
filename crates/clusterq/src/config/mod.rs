//! Cluster and program configuration.
//!
//! The configuration is read from a TOML document into [`ConfigFile`], whose fields
//! mirror the document and are mostly optional, and validated once into the immutable
//! [`Config`] that the rest of the crate works with.
pub mod catalog;
pub mod identity;
pub mod options;

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

pub use catalog::{FileCatalog, FileKey};
pub use identity::Identity;
pub use options::{InterpolationOptions, NodeTarget, RemoteArgs, StagingPolicy, SubmitOptions};

use crate::common::error::{ClusterqError, config_error};
use crate::common::placeholders::{StringPart, TEMPLATE_DELIMITER, parse_interpolated_string};
use crate::manager::state::StateTable;
use crate::submit::conflict::ConflictRule;
use crate::{Map, Set};

/// Placeholders available to scheduler header lines.
pub const HEADER_KEYS: &[&str] = &["queue", "nproc", "nodes", "hosts", "jobname", "program"];
/// Placeholders available to log file directives.
pub const LOGFILE_KEYS: &[&str] = &["logdir", "jobname"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileSyncMode {
    #[default]
    Local,
    /// Scratch lives on the compute nodes and is reached with `rsh`/`rcp`.
    RemotePlain,
    /// Scratch lives on the compute nodes and is reached with `ssh`/`scp`.
    RemoteSecure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parallelization {
    Serial,
    /// Shared memory parallelism on a single host.
    Threaded,
    /// The program spawns its own processes across hosts.
    Standalone,
    /// The program is started through a configured launcher (e.g. `mpirun`).
    Launcher(String),
}

/// Environment setup shared by programs and their versions.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct SetupSpec {
    #[serde(default)]
    pub export: Map<String, String>,
    #[serde(default)]
    pub prepend: Map<String, String>,
    #[serde(default)]
    pub source: Vec<String>,
    #[serde(default)]
    pub load: Vec<String>,
}

impl SetupSpec {
    /// Entries of `self` followed by the entries of `other`.
    pub fn merged(&self, other: &SetupSpec) -> SetupSpec {
        let mut merged = self.clone();
        merged
            .export
            .extend(other.export.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
            .prepend
            .extend(other.prepend.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.source.extend(other.source.iter().cloned());
        merged.load.extend(other.load.iter().cloned());
        merged
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProgramSection {
    pub key: Option<String>,
    pub name: Option<String>,
    pub parallelization: Option<String>,
    #[serde(flatten)]
    pub setup: SetupSpec,
    #[serde(default)]
    pub options: Map<String, String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    #[serde(default)]
    pub file_vars: Map<String, String>,
    #[serde(default)]
    pub prescript: Vec<String>,
    #[serde(default)]
    pub postscript: Vec<String>,
    #[serde(default)]
    pub parameter_paths: Vec<String>,
    pub scratch_stem: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConflictSection {
    pub expression: String,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VersionSection {
    pub executable: Option<String>,
    #[serde(flatten)]
    pub setup: SetupSpec,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DefaultsSection {
    pub version: Option<String>,
    pub queue: Option<String>,
    pub scratch: Option<String>,
    #[serde(default)]
    pub parameter_keys: Map<String, String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct HeaderSection {
    #[serde(default)]
    pub serial: Vec<String>,
    #[serde(default)]
    pub serial_at: Vec<String>,
    #[serde(default)]
    pub single_host: Vec<String>,
    #[serde(default)]
    pub single_host_at: Vec<String>,
    #[serde(default)]
    pub multi_host: Vec<String>,
    #[serde(default)]
    pub multi_host_at: Vec<String>,
}

impl HeaderSection {
    fn lines(&self) -> impl Iterator<Item = &String> {
        self.serial
            .iter()
            .chain(&self.serial_at)
            .chain(&self.single_host)
            .chain(&self.single_host_at)
            .chain(&self.multi_host)
            .chain(&self.multi_host_at)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SchedulerSection {
    pub name: Option<String>,
    #[serde(default)]
    pub submit: Vec<String>,
    #[serde(default)]
    pub status: Vec<String>,
    pub job_id_pattern: Option<String>,
    #[serde(default)]
    pub blocking_states: Map<String, String>,
    #[serde(default)]
    pub ready_states: Vec<String>,
    pub jobname: Option<String>,
    pub jobinfo: Option<String>,
    #[serde(default)]
    pub logfiles: Vec<String>,
    #[serde(default)]
    pub environment: Map<String, String>,
    #[serde(default)]
    pub launchers: Map<String, String>,
    #[serde(default)]
    pub headers: HeaderSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ClusterSection {
    pub name: Option<String>,
    pub head: Option<String>,
    #[serde(default)]
    pub filesync: FileSyncMode,
    pub delay: Option<String>,
    pub lock_file: Option<PathBuf>,
    pub logdir: Option<String>,
    #[serde(default)]
    pub offscript: Vec<String>,
    #[serde(default)]
    pub forward_env: Vec<String>,
}

/// Configuration document as written by the cluster administrator.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub program: ProgramSection,
    #[serde(default)]
    pub files: Map<String, FileKey>,
    #[serde(default)]
    pub conflicts: Vec<ConflictSection>,
    #[serde(default)]
    pub versions: Map<String, VersionSection>,
    #[serde(default)]
    pub defaults: DefaultsSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub cluster: ClusterSection,
}

#[derive(Debug, Clone)]
pub struct ProgramSpec {
    /// Short name used in job directory names.
    pub key: String,
    pub name: String,
    pub parallelization: Parallelization,
    pub setup: SetupSpec,
    /// Option name -> file role, rendered as `-<option> <file>`.
    pub options: Map<String, String>,
    /// Each argument lists alternative roles; the first one present is used.
    pub arguments: Vec<Vec<String>>,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub file_vars: Map<String, String>,
    pub prescript: Vec<String>,
    pub postscript: Vec<String>,
    pub parameter_paths: Vec<String>,
    pub scratch_stem: String,
}

#[derive(Debug, Clone)]
pub struct ProgramVersion {
    pub executable: String,
    pub setup: SetupSpec,
}

#[derive(Debug, Clone)]
pub struct SchedulerSpec {
    pub name: String,
    pub submit: Vec<String>,
    pub status: Vec<String>,
    pub job_id_pattern: Regex,
    pub states: StateTable,
    pub jobname: Option<String>,
    pub jobinfo: Option<String>,
    pub logfiles: Vec<String>,
    pub environment: Map<String, String>,
    pub launchers: Map<String, String>,
    pub headers: HeaderSection,
}

impl SchedulerSpec {
    /// Shell expression holding the scheduler job id inside a running job.
    pub fn job_id_variable(&self) -> &str {
        self.environment
            .get("jobid")
            .map(|value| value.as_str())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct ClusterSpec {
    pub name: String,
    /// Host that holds the staged files; the submitting host when unset.
    pub head: Option<String>,
    pub filesync: FileSyncMode,
    pub delay: Duration,
    pub lock_file: Option<PathBuf>,
    pub logdir: Option<String>,
    pub offscript: Vec<String>,
    pub forward_env: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub program: ProgramSpec,
    pub catalog: FileCatalog,
    pub conflicts: Vec<ConflictRule>,
    pub versions: Map<String, ProgramVersion>,
    pub defaults: DefaultsSection,
    pub scheduler: SchedulerSpec,
    pub cluster: ClusterSpec,
}

impl ConfigFile {
    pub fn parse(text: &str) -> crate::Result<Self> {
        toml::from_str(text).map_err(|error| ClusterqError::Config(error.to_string()))
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|error| {
            ClusterqError::Config(format!(
                "Cannot read configuration file {}: {error}",
                path.display()
            ))
        })?;
        Self::parse(&text).map_err(|error| match error {
            ClusterqError::Config(message) => {
                ClusterqError::Config(format!("{}: {message}", path.display()))
            }
            error => error,
        })
    }

    pub fn validate(self) -> crate::Result<Config> {
        let catalog = FileCatalog::new(self.files)?;
        let conflicts = self
            .conflicts
            .iter()
            .map(|conflict| ConflictRule::compile(&conflict.expression, &conflict.message, &catalog))
            .collect::<crate::Result<Vec<_>>>()?;
        let scheduler = validate_scheduler(self.scheduler)?;
        let program = validate_program(self.program, &catalog, &scheduler)?;
        let versions = validate_versions(self.versions)?;
        if let Some(version) = &self.defaults.version {
            if !versions.contains_key(version) {
                return config_error(format!("Default version `{version}` is not configured"));
            }
        }
        for (key, value) in &self.defaults.parameter_keys {
            if value.contains('/') {
                return config_error(format!(
                    "Default value of parameter key `{key}` cannot be a path"
                ));
            }
        }
        let cluster = validate_cluster(self.cluster)?;
        Ok(Config {
            program,
            catalog,
            conflicts,
            versions,
            defaults: self.defaults,
            scheduler,
            cluster,
        })
    }
}

impl Config {
    pub fn load(path: &Path) -> crate::Result<Self> {
        ConfigFile::load(path)?.validate()
    }
}

fn required(value: Option<String>, field: &str) -> crate::Result<String> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => config_error(format!("Missing required value `{field}`")),
    }
}

/// Checks that `template` only refers to names from `allowed`.
pub fn validate_template(template: &str, allowed: &[&str], field: &str) -> crate::Result<()> {
    for part in parse_interpolated_string(template, TEMPLATE_DELIMITER) {
        match part {
            StringPart::Name(name) if allowed.contains(&name) => {}
            StringPart::Name(token) | StringPart::Index(token) | StringPart::Malformed(token) => {
                return config_error(format!(
                    "Template `{template}` of `{field}` uses unknown placeholder `{token}`"
                ));
            }
            StringPart::Verbatim(_) | StringPart::Escaped(_) => {}
        }
    }
    Ok(())
}

fn check_role(catalog: &FileCatalog, role: &str, field: &str) -> crate::Result<()> {
    if catalog.contains(role) {
        Ok(())
    } else {
        config_error(format!("`{field}` refers to unknown file role `{role}`"))
    }
}

fn validate_program(
    section: ProgramSection,
    catalog: &FileCatalog,
    scheduler: &SchedulerSpec,
) -> crate::Result<ProgramSpec> {
    let key = required(section.key, "program.key")?;
    if key.contains(['/', '.']) || key.contains(char::is_whitespace) {
        return config_error(format!("Invalid program key `{key}`"));
    }
    let name = required(section.name, "program.name")?;
    let parallelization = match required(section.parallelization, "program.parallelization")?
        .as_str()
    {
        "serial" => Parallelization::Serial,
        "threaded" => Parallelization::Threaded,
        "standalone" => Parallelization::Standalone,
        launcher if scheduler.launchers.contains_key(launcher) => {
            Parallelization::Launcher(launcher.to_string())
        }
        other => {
            return config_error(format!(
                "Unsupported parallelization `{other}`: expected serial, threaded, standalone or a configured launcher"
            ));
        }
    };

    for role in section.options.values() {
        check_role(catalog, role, "program.options")?;
    }
    let arguments = section
        .arguments
        .iter()
        .map(|argument| {
            argument
                .split('|')
                .map(|role| {
                    check_role(catalog, role, "program.arguments")?;
                    Ok(role.to_string())
                })
                .collect::<crate::Result<Vec<_>>>()
        })
        .collect::<crate::Result<Vec<_>>>()?;
    for (role, field) in [
        (&section.stdin, "program.stdin"),
        (&section.stdout, "program.stdout"),
        (&section.stderr, "program.stderr"),
    ] {
        if let Some(role) = role {
            check_role(catalog, role, field)?;
        }
    }
    for role in section.file_vars.values() {
        check_role(catalog, role, "program.file-vars")?;
    }

    Ok(ProgramSpec {
        key,
        name,
        parallelization,
        setup: section.setup,
        options: section.options,
        arguments,
        stdin: section.stdin,
        stdout: section.stdout,
        stderr: section.stderr,
        file_vars: section.file_vars,
        prescript: section.prescript,
        postscript: section.postscript,
        parameter_paths: section.parameter_paths,
        scratch_stem: section
            .scratch_stem
            .unwrap_or_else(|| "%jobname.job".to_string()),
    })
}

fn validate_versions(
    sections: Map<String, VersionSection>,
) -> crate::Result<Map<String, ProgramVersion>> {
    if sections.is_empty() {
        return config_error("At least one program version has to be configured".to_string());
    }
    sections
        .into_iter()
        .map(|(version, section)| {
            let executable =
                required(section.executable, &format!("versions.{version}.executable"))?;
            Ok((
                version,
                ProgramVersion {
                    executable,
                    setup: section.setup,
                },
            ))
        })
        .collect()
}

fn validate_scheduler(section: SchedulerSection) -> crate::Result<SchedulerSpec> {
    if section.submit.is_empty() {
        return config_error("Missing required value `scheduler.submit`".to_string());
    }
    if section.status.is_empty() {
        return config_error("Missing required value `scheduler.status`".to_string());
    }
    let pattern = required(section.job_id_pattern, "scheduler.job-id-pattern")?;
    let job_id_pattern = Regex::new(&pattern).map_err(|error| {
        ClusterqError::Config(format!("Invalid `scheduler.job-id-pattern`: {error}"))
    })?;
    if job_id_pattern.captures_len() < 2 {
        return config_error(
            "`scheduler.job-id-pattern` must capture the job id in a group".to_string(),
        );
    }
    let ready: Set<String> = section.ready_states.into_iter().collect();
    for (token, reason) in &section.blocking_states {
        validate_template(reason, &["id", "name"], &format!("scheduler.blocking-states.{token}"))?;
    }
    let states = StateTable::new(section.blocking_states, ready)?;
    if !section.environment.contains_key("jobid") {
        return config_error(
            "`scheduler.environment` must define the `jobid` variable".to_string(),
        );
    }
    if let Some(jobname) = &section.jobname {
        validate_template(jobname, &["jobname"], "scheduler.jobname")?;
    }
    if let Some(jobinfo) = &section.jobinfo {
        validate_template(jobinfo, &["program"], "scheduler.jobinfo")?;
    }
    for line in &section.logfiles {
        validate_template(line, LOGFILE_KEYS, "scheduler.logfiles")?;
    }
    for line in section.headers.lines() {
        validate_template(line, HEADER_KEYS, "scheduler.headers")?;
    }
    Ok(SchedulerSpec {
        name: section.name.unwrap_or_else(|| section.submit[0].clone()),
        submit: section.submit,
        status: section.status,
        job_id_pattern,
        states,
        jobname: section.jobname,
        jobinfo: section.jobinfo,
        logfiles: section.logfiles,
        environment: section.environment,
        launchers: section.launchers,
        headers: section.headers,
    })
}

fn validate_cluster(section: ClusterSection) -> crate::Result<ClusterSpec> {
    let name = required(section.name, "cluster.name")?;
    let delay = match section.delay {
        Some(delay) => humantime::parse_duration(&delay).map_err(|error| {
            ClusterqError::Config(format!("Invalid `cluster.delay` `{delay}`: {error}"))
        })?,
        None => Duration::ZERO,
    };
    Ok(ClusterSpec {
        head: section.head,
        name,
        filesync: section.filesync,
        delay,
        lock_file: section.lock_file,
        logdir: section.logdir,
        offscript: section.offscript,
        forward_env: section.forward_env,
    })
}
