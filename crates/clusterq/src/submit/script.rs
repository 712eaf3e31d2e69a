//! Synthesis of batch job scripts.
//!
//! A script is assembled from configuration fragments into a [`ScriptDocument`] whose
//! sections always appear in the same order, regardless of the configuration.
use std::path::{Path, PathBuf};

use crate::common::error::{ClusterqError, config_error};
use crate::common::fsutils::dotted;
use crate::common::placeholders::fill_template;
use crate::config::{
    Config, FileCatalog, NodeTarget, Parallelization, ProgramSpec, SubmitOptions,
    validate_template,
};
use crate::submit::filesync::{FileSync, create_file_sync};
use crate::Map;

const FREE_RAM: &str = "$(free -m | tail -n+3 | head -1 | awk '{print $4}')";
const TOTAL_RAM: &str = "$(free -m | tail -n+2 | head -1 | awk '{print $2}')";
const JOB_RAM: &str = "$((${nproc:-1}*$totalram/$(nproc --all)))";

/// Sections of a job script, in the order in which they are written.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScriptDocument {
    pub header: Vec<String>,
    pub setup: Vec<String>,
    pub environment: Vec<String>,
    pub workdir: Vec<String>,
    pub imports: Vec<String>,
    pub chdir: Vec<String>,
    pub prescript: Vec<String>,
    pub main: Vec<String>,
    pub postscript: Vec<String>,
    pub exports: Vec<String>,
    pub cleanup: Vec<String>,
    pub offscript: Vec<String>,
}

impl ScriptDocument {
    pub fn sections(&self) -> [&[String]; 12] {
        [
            &self.header,
            &self.setup,
            &self.environment,
            &self.workdir,
            &self.imports,
            &self.chdir,
            &self.prescript,
            &self.main,
            &self.postscript,
            &self.exports,
            &self.cleanup,
            &self.offscript,
        ]
    }

    pub fn render(&self) -> String {
        let mut script = String::from("#!/bin/bash\n");
        for line in self.sections().into_iter().flatten() {
            script.push_str(line);
            script.push('\n');
        }
        script
    }
}

/// Per-job inputs of [`ScriptBuilder::build`].
#[derive(Debug)]
pub struct JobFiles<'a> {
    pub jobname: &'a str,
    /// File name stem of the staged input files inside `stagedir`.
    pub staged_name: &'a str,
    pub outputname: &'a str,
    pub stagedir: &'a Path,
    pub outdir: &'a Path,
    /// Input roles whose files exist for this job.
    pub present_inputs: &'a [String],
    pub parameter_paths: &'a [PathBuf],
}

fn assignment(name: &str, value: &str) -> String {
    format!(r#"{name}="{value}""#)
}

fn render_template(template: &str, values: &Map<String, String>, field: &str) -> crate::Result<String> {
    fill_template(template, values).map_err(|error| {
        ClusterqError::Config(format!("Cannot render `{field}` template `{template}`: {error}"))
    })
}

fn select_headers(config: &Config, nodes: &NodeTarget) -> Vec<String> {
    let headers = &config.scheduler.headers;
    let at_hosts = matches!(nodes, NodeTarget::Hosts(_));
    let lines = match (&config.program.parallelization, at_hosts) {
        (Parallelization::Serial, false) => &headers.serial,
        (Parallelization::Serial, true) => &headers.serial_at,
        (Parallelization::Threaded, false) => &headers.single_host,
        (Parallelization::Threaded, true) => &headers.single_host_at,
        (Parallelization::Standalone | Parallelization::Launcher(_), false) => &headers.multi_host,
        (Parallelization::Standalone | Parallelization::Launcher(_), true) => {
            &headers.multi_host_at
        }
    };
    lines.clone()
}

/// Holds everything that is common to the scripts of one run.
pub struct ScriptBuilder {
    program: ProgramSpec,
    catalog: FileCatalog,
    jobname_directive: Option<String>,
    /// Header templates with the configuration field they come from, rendered per job.
    header: Vec<(&'static str, String)>,
    header_values: Map<String, String>,
    logfiles: Vec<String>,
    logdir: String,
    setup: Vec<String>,
    environment: Vec<String>,
    main_prefix: Option<String>,
    executable: String,
    scratch_dir: String,
    offscript: Vec<String>,
    /// Staged inputs are removed once imported; parameter paths never are.
    dispose_inputs: bool,
    sync: Box<dyn FileSync>,
}

impl ScriptBuilder {
    /// Resolves the run-level parts of the script.
    ///
    /// `names` are the identity names exported to the job, `template_values` the
    /// values available to path templates and `scratch_dir` the per-job scratch
    /// directory (usually ending with the scheduler job id variable).
    pub fn new(
        config: &Config,
        options: &SubmitOptions,
        version: &str,
        queue: &str,
        names: &Map<String, String>,
        template_values: &Map<String, String>,
        scratch_dir: String,
    ) -> crate::Result<Self> {
        let Some(program_version) = config.versions.get(version) else {
            return config_error(format!("Version `{version}` is not configured"));
        };
        let program = &config.program;
        validate_template(&program.scratch_stem, &["jobname"], "program.scratch-stem")?;

        let (nodes, hosts) = match &options.nodes {
            NodeTarget::AnyAvailable { nodes } => (nodes.to_string(), String::new()),
            NodeTarget::Hosts(hosts) => (hosts.len().to_string(), hosts.join(",")),
        };
        let header_values: Map<String, String> = [
            ("queue", queue.to_string()),
            ("nproc", options.nproc.to_string()),
            ("nodes", nodes),
            ("hosts", hosts),
            ("program", program.name.clone()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();

        let mut header = vec![];
        if let Some(jobinfo) = &config.scheduler.jobinfo {
            header.push(("scheduler.jobinfo", jobinfo.clone()));
        }
        header.extend(
            select_headers(config, &options.nodes)
                .into_iter()
                .map(|line| ("scheduler.headers", line)),
        );

        let logdir = match &config.cluster.logdir {
            Some(logdir) => render_template(logdir, template_values, "cluster.logdir")?,
            None if config.scheduler.logfiles.is_empty() => String::new(),
            None => {
                return config_error(
                    "`scheduler.logfiles` requires `cluster.logdir` to be set".to_string(),
                );
            }
        };

        let setup_spec = program.setup.merged(&program_version.setup);
        let mut setup = vec![];
        for (name, value) in &setup_spec.export {
            let value = render_template(value, template_values, "export")?;
            setup.push(format!("export {name}={value}"));
        }
        for (name, value) in &setup_spec.prepend {
            let value = render_template(value, template_values, "prepend")?;
            setup.push(format!("{name}={value}:${name}"));
        }
        for path in &setup_spec.source {
            let path = render_template(path, template_values, "source")?;
            setup.push(format!("source {path}"));
        }
        if !setup_spec.load.is_empty() {
            setup.push("module purge".to_string());
        }
        for module in &setup_spec.load {
            setup.push(format!("module load {module}"));
        }
        setup.push("shopt -s nullglob extglob".to_string());

        let mut environment: Vec<String> = config
            .scheduler
            .environment
            .iter()
            .map(|(name, value)| assignment(name, value))
            .collect();
        environment.extend(
            names
                .iter()
                .map(|(key, value)| assignment(&format!("{key}name"), value)),
        );

        let main_prefix = match &program.parallelization {
            Parallelization::Serial | Parallelization::Standalone => None,
            Parallelization::Threaded => Some(format!("OMP_NUM_THREADS={}", options.nproc)),
            Parallelization::Launcher(name) => match config.scheduler.launchers.get(name) {
                Some(launcher) => Some(launcher.clone()),
                None => return config_error(format!("Launcher `{name}` is not configured")),
            },
        };
        let executable = render_template(
            &program_version.executable,
            template_values,
            "versions.executable",
        )?;

        Ok(Self {
            program: program.clone(),
            catalog: config.catalog.clone(),
            jobname_directive: config.scheduler.jobname.clone(),
            header,
            header_values,
            logfiles: config.scheduler.logfiles.clone(),
            logdir,
            setup,
            environment,
            main_prefix,
            executable,
            scratch_dir,
            offscript: config.cluster.offscript.clone(),
            dispose_inputs: options.staging == crate::config::StagingPolicy::Move,
            sync: create_file_sync(config.cluster.filesync),
        })
    }

    /// Name of the file of `role` inside the job scratch directory.
    pub fn scratch_name(&self, jobname: &str, role: &str) -> crate::Result<String> {
        let Some(key) = self.catalog.get(role) else {
            return config_error(format!("Unknown file role `{role}`"));
        };
        let mut values = Map::new();
        values.insert("jobname".to_string(), jobname.to_string());
        let stem = render_template(&self.program.scratch_stem, &values, "program.scratch-stem")?;
        Ok(format!("{stem}{}", key.suffix))
    }

    fn scratch_path(&self, name: &str) -> String {
        format!("{}/{name}", self.scratch_dir)
    }

    fn argument(&self, job: &JobFiles, alternatives: &[String]) -> crate::Result<String> {
        if let Some(role) = alternatives
            .iter()
            .find(|role| job.present_inputs.contains(*role))
        {
            return self.scratch_name(job.jobname, role);
        }
        match alternatives {
            [role] => self.scratch_name(job.jobname, role),
            _ => {
                let names = alternatives
                    .iter()
                    .map(|role| self.scratch_name(job.jobname, role))
                    .collect::<crate::Result<Vec<_>>>()?;
                Ok(format!("@({})", names.join("|")))
            }
        }
    }

    fn main_command(&self, job: &JobFiles) -> crate::Result<String> {
        let mut command: Vec<String> = self.main_prefix.iter().cloned().collect();
        command.push(self.executable.clone());
        for (option, role) in &self.program.options {
            command.push(format!("-{option} {}", self.scratch_name(job.jobname, role)?));
        }
        for alternatives in &self.program.arguments {
            command.push(self.argument(job, alternatives)?);
        }
        for (fd, role) in [
            (0, &self.program.stdin),
            (1, &self.program.stdout),
            (2, &self.program.stderr),
        ] {
            if let Some(role) = role {
                let redirect = if fd == 0 { "<" } else { ">" };
                command.push(format!(
                    "{fd}{redirect} {}",
                    self.scratch_name(job.jobname, role)?
                ));
            }
        }
        Ok(command.join(" "))
    }

    pub fn build(&self, job: &JobFiles) -> crate::Result<ScriptDocument> {
        let mut jobname_values = Map::new();
        jobname_values.insert("jobname".to_string(), job.jobname.to_string());

        let mut header = vec![];
        if let Some(directive) = &self.jobname_directive {
            header.push(render_template(directive, &jobname_values, "scheduler.jobname")?);
        }
        let mut header_values = self.header_values.clone();
        header_values.insert("jobname".to_string(), job.jobname.to_string());
        for (field, template) in &self.header {
            header.push(render_template(template, &header_values, field)?);
        }
        let mut log_values = jobname_values.clone();
        log_values.insert("logdir".to_string(), self.logdir.clone());
        for line in &self.logfiles {
            header.push(render_template(line, &log_values, "scheduler.logfiles")?);
        }

        let mut environment = self.environment.clone();
        for (name, role) in &self.program.file_vars {
            environment.push(assignment(name, &self.scratch_name(job.jobname, role)?));
        }
        environment.push(assignment("jobname", job.jobname));
        environment.push(assignment("freeram", FREE_RAM));
        environment.push(assignment("totalram", TOTAL_RAM));
        environment.push(assignment("jobram", JOB_RAM));

        let mut imports = vec![];
        for role in job.present_inputs {
            let source = job.stagedir.join(dotted(job.staged_name, role));
            imports.push(self.sync.import_file(
                &source.display().to_string(),
                &self.scratch_path(&self.scratch_name(job.jobname, role)?),
                self.dispose_inputs,
            ));
        }
        for path in job.parameter_paths {
            if path.is_dir() {
                imports.push(
                    self.sync
                        .import_tree(&path.display().to_string(), &self.scratch_dir),
                );
            } else {
                let name = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default();
                imports.push(self.sync.import_file(
                    &path.display().to_string(),
                    &self.scratch_path(&name),
                    false,
                ));
            }
        }

        let mut exports = vec![];
        for role in self.catalog.output_roles() {
            exports.push(self.sync.export_file(
                &self.scratch_path(&self.scratch_name(job.jobname, role)?),
                &job.outdir.join(dotted(job.outputname, role)).display().to_string(),
            ));
        }

        Ok(ScriptDocument {
            header,
            setup: self.setup.clone(),
            environment,
            workdir: vec![self.sync.mkdir(&self.scratch_dir)],
            imports,
            chdir: vec![format!(r#"cd "{}""#, self.scratch_dir)],
            prescript: self.program.prescript.clone(),
            main: vec![self.main_command(job)?],
            postscript: self.program.postscript.clone(),
            exports,
            cleanup: vec![self.sync.rmdir(&self.scratch_dir)],
            offscript: self.offscript.clone(),
        })
    }
}
