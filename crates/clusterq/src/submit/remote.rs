//! Dispatch of jobs to another cluster over a multiplexed SSH connection.
//!
//! The remote host must export `JOBCOMMAND` (path of the remote `clusterq` command)
//! and `JOBSYNCDIR` (root under which submitted files are kept). Staged files are
//! synchronised into a scratch root and a home root under `JOBSYNCDIR`, and the remote
//! command is then invoked in raw mode on the synchronised copy.
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;

use anyhow::Context;
use bstr::ByteSlice;
use tokio::process::Command;

use crate::common::error::{ClusterqError, config_error};
use crate::common::fsutils::dotted;
use crate::common::placeholders::{TEMPLATE_DELIMITER, interpolate};
use crate::config::{FileCatalog, RemoteArgs};
use crate::submit::{JobDescriptor, JobOutcome};
use crate::Map;

pub const REMOTE_COMMAND_VAR: &str = "JOBCOMMAND";
pub const REMOTE_ROOT_VAR: &str = "JOBSYNCDIR";

/// Switches always passed to the remote invocation.
const FORCED_SWITCHES: [&str; 3] = ["raw", "job", "dispose"];

/// An established connection to a remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSession {
    pub host: String,
    pub socket: PathBuf,
    /// Path of the clusterq command on the remote host.
    pub command: String,
    pub root: String,
    /// Local environment variables forwarded to the remote command.
    pub environment: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyScope {
    /// Copy the files keeping their path relative to a `/./` marker.
    Full,
    /// Copy only the listed files, without directories, into the destination directory.
    TopLevelOnly,
}

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = crate::Result<T>> + 'a>>;

/// Boundary to the secure shell tools.
pub trait RemoteTransport {
    /// Opens (or reuses) the control connection for `host` at `socket`.
    fn open_control<'a>(&'a self, host: &'a str, socket: &'a Path) -> TransportFuture<'a, ()>;

    /// Returns the values of the remote environment variables that are set.
    fn query_env<'a>(
        &'a self,
        host: &'a str,
        socket: &'a Path,
        names: &'a [&'a str],
    ) -> TransportFuture<'a, Map<String, String>>;

    fn copy_files<'a>(
        &'a self,
        session: &'a RemoteSession,
        sources: &'a [PathBuf],
        destination: &'a str,
        scope: CopyScope,
    ) -> TransportFuture<'a, ()>;

    /// Runs `arguments` on the remote host and returns its exit code.
    fn exec<'a>(
        &'a self,
        session: &'a RemoteSession,
        arguments: &'a [String],
    ) -> TransportFuture<'a, i32>;
}

/// Transport based on the OpenSSH client and rsync.
#[derive(Default)]
pub struct SshTransport;

fn find_binary(name: &str) -> crate::Result<PathBuf> {
    which::which(name)
        .with_context(|| format!("Cannot find `{name}` binary"))
        .map_err(|error| ClusterqError::RemoteTransport(format!("{error:#}")))
}

fn socket_arg(socket: &Path) -> String {
    socket.display().to_string()
}

async fn run_checked(mut command: Command) -> crate::Result<std::process::Output> {
    log::debug!("Running remote command {command:?}");
    let output = command
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|error| ClusterqError::RemoteTransport(format!("Cannot start {command:?}: {error}")))?;
    log::trace!(
        "Remote command output\nStdout\n{}Stderr\n{}",
        output.stdout.to_str_lossy(),
        output.stderr.to_str_lossy()
    );
    if !output.status.success() {
        return Err(ClusterqError::RemoteTransport(
            output.stderr.to_str_lossy().trim().to_string(),
        ));
    }
    Ok(output)
}

impl RemoteTransport for SshTransport {
    fn open_control<'a>(&'a self, host: &'a str, socket: &'a Path) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let socket = socket_arg(socket);
            let mut command = Command::new(find_binary("ssh")?);
            command.args([
                "-o",
                "ControlMaster=auto",
                "-o",
                "ControlPersist=60",
                "-S",
                socket.as_str(),
                host,
                "true",
            ]);
            run_checked(command).await?;
            Ok(())
        })
    }

    fn query_env<'a>(
        &'a self,
        host: &'a str,
        socket: &'a Path,
        names: &'a [&'a str],
    ) -> TransportFuture<'a, Map<String, String>> {
        Box::pin(async move {
            let ssh = find_binary("ssh")?;
            let socket = socket_arg(socket);
            let mut values = Map::new();
            for &name in names {
                let mut command = Command::new(&ssh);
                command.args(["-S", socket.as_str(), host, "printenv", name]);
                log::debug!("Running remote command {command:?}");
                let output = command.stdin(Stdio::null()).output().await.map_err(|error| {
                    ClusterqError::RemoteTransport(format!("Cannot start ssh: {error}"))
                })?;
                match output.status.code() {
                    Some(0) => {
                        let value = output.stdout.to_str_lossy().trim().to_string();
                        values.insert(name.to_string(), value);
                    }
                    // printenv exits with 1 for an unset variable
                    Some(1) => {}
                    _ => {
                        return Err(ClusterqError::RemoteTransport(
                            output.stderr.to_str_lossy().trim().to_string(),
                        ));
                    }
                }
            }
            Ok(values)
        })
    }

    fn copy_files<'a>(
        &'a self,
        session: &'a RemoteSession,
        sources: &'a [PathBuf],
        destination: &'a str,
        scope: CopyScope,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let mut command = Command::new(find_binary("rsync")?);
            command
                .arg("-e")
                .arg(format!("ssh -S '{}'", socket_arg(&session.socket)));
            let target = match scope {
                CopyScope::Full => {
                    command.arg("-qRLtz");
                    format!("{}:{destination}", session.host)
                }
                CopyScope::TopLevelOnly => {
                    command.args(["-qLtz", "--mkpath", "--exclude=*/"]);
                    format!("{}:{destination}/", session.host)
                }
            };
            command.args(sources).arg(target);
            run_checked(command).await?;
            Ok(())
        })
    }

    fn exec<'a>(
        &'a self,
        session: &'a RemoteSession,
        arguments: &'a [String],
    ) -> TransportFuture<'a, i32> {
        Box::pin(async move {
            let socket = socket_arg(&session.socket);
            let mut command = Command::new(find_binary("ssh")?);
            command
                .args(["-qt", "-S", socket.as_str(), session.host.as_str()])
                .args(
                    session
                        .environment
                        .iter()
                        .map(|(name, value)| format!("{name}={}", shell_quote(value))),
                )
                .args(arguments);
            log::debug!("Running remote command {command:?}");
            let status = command.status().await.map_err(|error| {
                ClusterqError::RemoteTransport(format!("Cannot start ssh: {error}"))
            })?;
            Ok(status.code().unwrap_or(-1))
        })
    }
}

/// Quotes `value` for the remote shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Submits jobs through the clusterq command of a remote host.
pub struct RemoteDispatcher {
    transport: Box<dyn RemoteTransport>,
    host: String,
    local_home: PathBuf,
    /// `<user>.<host>` of the submitting machine.
    origin: String,
    program_key: String,
    forward_env: Vec<String>,
    base_args: RemoteArgs,
    parameter_keys: Map<String, String>,
    sessions: Map<String, RemoteSession>,
}

impl RemoteDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Box<dyn RemoteTransport>,
        host: String,
        local_home: PathBuf,
        origin: String,
        program_key: String,
        forward_env: Vec<String>,
        base_args: RemoteArgs,
        parameter_keys: Map<String, String>,
    ) -> Self {
        Self {
            transport,
            host,
            local_home,
            origin,
            program_key,
            forward_env,
            base_args,
            parameter_keys,
            sessions: Map::new(),
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.local_home
            .join(".ssh")
            .join(format!("{}.clusterq.sock", self.host))
    }

    /// Connects to the host and reads its configuration, once per run.
    pub async fn connect(&mut self) -> crate::Result<&RemoteSession> {
        if !self.sessions.contains_key(&self.host) {
            let session = self.open_session().await?;
            self.sessions.insert(self.host.clone(), session);
        }
        self.session()
    }

    fn session(&self) -> crate::Result<&RemoteSession> {
        self.sessions.get(&self.host).ok_or_else(|| {
            ClusterqError::RemoteTransport(format!("No connection to {}", self.host))
        })
    }

    async fn open_session(&self) -> crate::Result<RemoteSession> {
        let socket = self.socket_path();
        if let Some(parent) = socket.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.transport.open_control(&self.host, &socket).await?;
        let names = [REMOTE_COMMAND_VAR, REMOTE_ROOT_VAR];
        let mut values = self.transport.query_env(&self.host, &socket, &names).await?;
        let (command, root) = match (
            values.remove(REMOTE_COMMAND_VAR),
            values.remove(REMOTE_ROOT_VAR),
        ) {
            (Some(command), Some(root)) if !command.is_empty() && !root.is_empty() => {
                (command, root)
            }
            (None, None) => {
                return config_error(format!(
                    "The host {} is not configured to accept jobs",
                    self.host
                ));
            }
            _ => {
                return config_error(format!(
                    "The host {} is not correctly configured to accept jobs: both {REMOTE_COMMAND_VAR} and {REMOTE_ROOT_VAR} must be set",
                    self.host
                ));
            }
        };
        log::debug!("Remote command at {}: {command}, root: {root}", self.host);
        let environment = self
            .forward_env
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
            .collect();
        Ok(RemoteSession {
            host: self.host.clone(),
            socket,
            command,
            root,
            environment,
        })
    }

    pub fn home_root(&self, session: &RemoteSession) -> String {
        format!("{}/{}", session.root, self.origin)
    }

    pub fn scratch_root(&self, session: &RemoteSession) -> String {
        format!("{}/{}.temp", session.root, self.origin)
    }

    /// Argument vector of the remote invocation for `job`.
    pub fn remote_arguments(
        &self,
        session: &RemoteSession,
        job: &JobDescriptor,
        relative_outdir: &Path,
    ) -> crate::Result<Vec<String>> {
        let relative = relative_outdir.display();
        let mut args = self.base_args.clone();
        args.switches
            .extend(FORCED_SWITCHES.iter().map(|switch| switch.to_string()));
        args.constants.insert(
            "cwd".to_string(),
            format!("{}/{relative}", self.scratch_root(session)),
        );
        args.constants.insert(
            "out".to_string(),
            format!("{}/{relative}", self.home_root(session)),
        );
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
            args.lists
                .entry("key".to_string())
                .or_default()
                .push(format!("{key}={value}"));
        }

        let mut arguments = vec![session.command.clone(), self.program_key.clone()];
        arguments.extend(args.switches.iter().map(|switch| format!("--{switch}")));
        arguments.extend(
            args.constants
                .iter()
                .map(|(key, value)| format!("--{key}={}", shell_quote(value))),
        );
        for (key, values) in &args.lists {
            arguments.extend(
                values
                    .iter()
                    .map(|value| format!("--{key}={}", shell_quote(value))),
            );
        }
        arguments.push(job.jobname.clone());
        Ok(arguments)
    }

    /// Path of `outdir` relative to the home directory, which is mirrored on the host.
    pub fn relative_outdir<'p>(&self, outdir: &'p Path) -> crate::Result<&'p Path> {
        outdir.strip_prefix(&self.local_home).map_err(|_| {
            ClusterqError::Filesystem(format!(
                "The output directory {} must be inside the home directory {}",
                outdir.display(),
                self.local_home.display()
            ))
        })
    }

    /// Synchronises the staged files of `job` and runs the remote command.
    pub async fn dispatch(
        &self,
        catalog: &FileCatalog,
        job: &JobDescriptor,
        outdir: &Path,
        dry_run: bool,
    ) -> crate::Result<JobOutcome> {
        let session = self.session()?;
        let relative = self.relative_outdir(outdir)?;

        let files: Vec<PathBuf> = catalog
            .roles()
            .map(|(role, _)| dotted(&job.outputname, role))
            .filter(|name| outdir.join(name).is_file())
            .map(|name| self.local_home.join(".").join(relative).join(name))
            .collect();
        let top_level: Vec<PathBuf> = files
            .iter()
            .filter_map(|path| path.file_name().map(|name| outdir.join(name)))
            .collect();
        let arguments = self.remote_arguments(session, job, relative)?;

        if dry_run {
            log::info!(
                "Files: {}",
                files
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            );
            log::info!("Remote command: {}", arguments.join(" "));
            return Ok(JobOutcome::DryRun {
                jobname: job.jobname.clone(),
                path: outdir.to_path_buf(),
            });
        }

        self.transport
            .copy_files(session, &files, &self.scratch_root(session), CopyScope::Full)
            .await?;
        let home_destination = format!("{}/{}", self.home_root(session), relative.display());
        self.transport
            .copy_files(
                session,
                &top_level,
                &home_destination,
                CopyScope::TopLevelOnly,
            )
            .await?;

        let code = self.transport.exec(session, &arguments).await?;
        if code != 0 {
            return Err(ClusterqError::RemoteTransport(format!(
                "Remote submission of {} on {} exited with code {code}",
                job.jobname, session.host
            )));
        }
        Ok(JobOutcome::Dispatched {
            jobname: job.jobname.clone(),
            host: session.host.clone(),
        })
    }
}
