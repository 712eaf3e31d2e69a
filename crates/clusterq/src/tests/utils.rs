use std::cell::RefCell;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::rc::Rc;

use crate::common::error::ClusterqError;
use crate::common::parser2::CharParser;
use crate::config::{Config, ConfigFile, FileCatalog, Identity};
use crate::manager::state::StateTable;
use crate::manager::{QueryError, Scheduler};
use crate::submit::remote::{CopyScope, RemoteSession, RemoteTransport};
use crate::{Map, Set};

pub const TEST_CONFIG: &str = r##"
[program]
key = "orca"
name = "ORCA"
parallelization = "serial"
arguments = ["inp"]
stdout = "out"
file-vars = { gbwfile = "gbw" }
load = ["orca/5.0"]

[files.inp]
suffix = ".in"
input = true
interpolable = true

[files.xyz]
suffix = ".xyz"
input = true

[files.gbw]
suffix = ".gbw"
input = true

[files.out]
suffix = ".out"
output = true

[[conflicts]]
expression = "xyz and gbw"
message = "%file: the xyz and gbw files cannot be used together"

[versions."5.0"]
executable = "/opt/orca/5.0/orca"

[defaults]
version = "5.0"
queue = "batch"
scratch = "/scratch/%user"

[scheduler]
name = "pbs"
submit = ["qsub"]
status = ["qstat"]
job-id-pattern = 'Submitted job (\d+)'
blocking-states = { R = "Job %name (%id) is still running", Q = "Job %name (%id) is queued" }
ready-states = ["C"]
jobname = "#PBS -N %jobname"
environment = { jobid = "$PBS_JOBID" }
launchers = { mpi = "mpirun" }

[scheduler.headers]
serial = ["#PBS -q %queue", "#PBS -l nodes=1:ppn=1"]
serial-at = ["#PBS -q %queue", "#PBS -l nodes=%hosts:ppn=1"]
single-host = ["#PBS -q %queue", "#PBS -l nodes=1:ppn=%nproc"]
single-host-at = ["#PBS -q %queue", "#PBS -l nodes=%hosts:ppn=%nproc"]
multi-host = ["#PBS -q %queue", "#PBS -l nodes=%nodes:ppn=%nproc"]
multi-host-at = ["#PBS -q %queue", "#PBS -l nodes=%hosts:ppn=%nproc"]

[cluster]
name = "hpc"
"##;

pub fn expect_parser_error<T: std::fmt::Debug>(parser: impl CharParser<T>, input: &str) -> String {
    parser.parse_text(input).unwrap_err().to_string()
}

pub fn string_map(values: &[(&str, &str)]) -> Map<String, String> {
    values
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

pub fn test_config_file() -> ConfigFile {
    ConfigFile::parse(TEST_CONFIG).unwrap()
}

pub fn test_config() -> Config {
    test_config_file().validate().unwrap()
}

pub fn test_catalog() -> FileCatalog {
    test_config().catalog
}

pub fn test_state_table() -> StateTable {
    StateTable::new(
        string_map(&[
            ("R", "Job %name (%id) is still running"),
            ("Q", "Job %name (%id) is queued"),
        ]),
        Set::from(["C".to_string()]),
    )
    .unwrap()
}

pub fn test_identity(home: &Path) -> Identity {
    Identity {
        user: "ana".to_string(),
        host: "laptop".to_string(),
        home: home.to_path_buf(),
    }
}

#[derive(Default)]
struct MockSchedulerState {
    statuses: Map<String, String>,
    submit_error: Option<String>,
    next_id: u32,
    submitted: Vec<(PathBuf, String)>,
    status_queries: Vec<String>,
}

/// Scheduler that assigns increasing job ids (starting at 42) and records every call.
#[derive(Clone, Default)]
pub struct MockScheduler {
    state: Rc<RefCell<MockSchedulerState>>,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, job_id: &str, token: &str) {
        self.state
            .borrow_mut()
            .statuses
            .insert(job_id.to_string(), token.to_string());
    }

    pub fn fail_submissions(&self, message: &str) {
        self.state.borrow_mut().submit_error = Some(message.to_string());
    }

    /// Paths and contents of the submitted scripts.
    pub fn submitted(&self) -> Vec<(PathBuf, String)> {
        self.state.borrow().submitted.clone()
    }

    pub fn status_queries(&self) -> Vec<String> {
        self.state.borrow().status_queries.clone()
    }
}

impl Scheduler for MockScheduler {
    fn submit<'a>(
        &'a self,
        script: &'a Path,
    ) -> Pin<Box<dyn Future<Output = crate::Result<String>> + 'a>> {
        Box::pin(async move {
            let mut state = self.state.borrow_mut();
            if let Some(message) = &state.submit_error {
                return Err(ClusterqError::SchedulerSubmit(message.clone()));
            }
            let contents = std::fs::read_to_string(script).unwrap();
            state.submitted.push((script.to_path_buf(), contents));
            let job_id = (42 + state.next_id).to_string();
            state.next_id += 1;
            Ok(job_id)
        })
    }

    fn status<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, QueryError>> + 'a>> {
        Box::pin(async move {
            let mut state = self.state.borrow_mut();
            state.status_queries.push(job_id.to_string());
            state
                .statuses
                .get(job_id)
                .cloned()
                .ok_or_else(|| QueryError::Failed {
                    job_id: job_id.to_string(),
                    message: "Unknown Job Id".to_string(),
                })
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCopy {
    pub sources: Vec<PathBuf>,
    pub destination: String,
    pub scope: CopyScope,
}

#[derive(Default)]
struct MockTransportState {
    environment: Map<String, String>,
    exit_code: i32,
    opened: Vec<String>,
    env_queries: usize,
    copies: Vec<RecordedCopy>,
    executed: Vec<Vec<String>>,
}

/// Remote transport that answers environment queries from a fixed map.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Rc<RefCell<MockTransportState>>,
}

impl MockTransport {
    pub fn new(environment: &[(&str, &str)]) -> Self {
        let transport = Self::default();
        transport.state.borrow_mut().environment = string_map(environment);
        transport
    }

    pub fn set_exit_code(&self, code: i32) {
        self.state.borrow_mut().exit_code = code;
    }

    pub fn opened(&self) -> Vec<String> {
        self.state.borrow().opened.clone()
    }

    pub fn env_queries(&self) -> usize {
        self.state.borrow().env_queries
    }

    pub fn copies(&self) -> Vec<RecordedCopy> {
        self.state.borrow().copies.clone()
    }

    pub fn executed(&self) -> Vec<Vec<String>> {
        self.state.borrow().executed.clone()
    }
}

impl RemoteTransport for MockTransport {
    fn open_control<'a>(
        &'a self,
        host: &'a str,
        _socket: &'a Path,
    ) -> Pin<Box<dyn Future<Output = crate::Result<()>> + 'a>> {
        Box::pin(async move {
            self.state.borrow_mut().opened.push(host.to_string());
            Ok(())
        })
    }

    fn query_env<'a>(
        &'a self,
        _host: &'a str,
        _socket: &'a Path,
        names: &'a [&'a str],
    ) -> Pin<Box<dyn Future<Output = crate::Result<Map<String, String>>> + 'a>> {
        Box::pin(async move {
            let mut state = self.state.borrow_mut();
            state.env_queries += 1;
            Ok(names
                .iter()
                .filter_map(|name| {
                    state
                        .environment
                        .get(*name)
                        .map(|value| (name.to_string(), value.clone()))
                })
                .collect())
        })
    }

    fn copy_files<'a>(
        &'a self,
        _session: &'a RemoteSession,
        sources: &'a [PathBuf],
        destination: &'a str,
        scope: CopyScope,
    ) -> Pin<Box<dyn Future<Output = crate::Result<()>> + 'a>> {
        Box::pin(async move {
            self.state.borrow_mut().copies.push(RecordedCopy {
                sources: sources.to_vec(),
                destination: destination.to_string(),
                scope,
            });
            Ok(())
        })
    }

    fn exec<'a>(
        &'a self,
        _session: &'a RemoteSession,
        arguments: &'a [String],
    ) -> Pin<Box<dyn Future<Output = crate::Result<i32>> + 'a>> {
        Box::pin(async move {
            let mut state = self.state.borrow_mut();
            state.executed.push(arguments.to_vec());
            Ok(state.exit_code)
        })
    }
}
