//! Shell commands that move files between the staging area and the job scratch.
use crate::config::FileSyncMode;

/// Renders the file movement lines of a job script.
///
/// Paths are inserted inside double quotes so that scheduler variables such as
/// `$PBS_JOBID` are expanded by the job shell.
pub trait FileSync {
    fn mkdir(&self, path: &str) -> String;
    /// With `dispose`, `source` is removed once it reached the scratch.
    fn import_file(&self, source: &str, target: &str, dispose: bool) -> String;
    /// Copies the contents of the `source` directory into `target`.
    fn import_tree(&self, source: &str, target: &str) -> String;
    fn export_file(&self, source: &str, target: &str) -> String;
    fn rmdir(&self, path: &str) -> String;
}

/// Scratch is reachable through the local filesystem.
pub struct LocalSync;

impl FileSync for LocalSync {
    fn mkdir(&self, path: &str) -> String {
        format!(r#"mkdir -p -m 700 "{path}""#)
    }

    fn import_file(&self, source: &str, target: &str, dispose: bool) -> String {
        let command = if dispose { "mv" } else { "cp" };
        format!(r#"{command} "{source}" "{target}""#)
    }

    fn import_tree(&self, source: &str, target: &str) -> String {
        format!(r#"cp -r "{source}/." "{target}""#)
    }

    fn export_file(&self, source: &str, target: &str) -> String {
        format!(r#"cp "{source}" "{target}""#)
    }

    fn rmdir(&self, path: &str) -> String {
        format!(r#"rm -rf "{path}""#)
    }
}

/// Scratch lives on every allocated host (`$hostlist`) and the staged files on the
/// head node (`$headname`).
pub struct HostLoopSync {
    shell: &'static str,
    copy: &'static str,
}

impl HostLoopSync {
    fn for_each_host(&self, command: String) -> String {
        format!("for host in ${{hostlist[*]}}; do {command}; done")
    }
}

impl FileSync for HostLoopSync {
    fn mkdir(&self, path: &str) -> String {
        self.for_each_host(format!(r#"{} $host mkdir -p -m 700 "'{path}'""#, self.shell))
    }

    fn import_file(&self, source: &str, target: &str, dispose: bool) -> String {
        let mut command = format!(r#"{} $headname:"'{source}'" $host:"'{target}'""#, self.copy);
        if dispose {
            command.push_str(&format!(r#" && {} $headname rm "'{source}'""#, self.shell));
        }
        self.for_each_host(command)
    }

    fn import_tree(&self, source: &str, target: &str) -> String {
        self.for_each_host(format!(
            r#"{shell} $headname tar -cf- -C "'{source}'" . | {shell} $host tar -xf- -C "'{target}'""#,
            shell = self.shell
        ))
    }

    fn export_file(&self, source: &str, target: &str) -> String {
        format!(r#"{} "{source}" $headname:"'{target}'""#, self.copy)
    }

    fn rmdir(&self, path: &str) -> String {
        self.for_each_host(format!(r#"{} $host rm -rf "'{path}'""#, self.shell))
    }
}

pub fn create_file_sync(mode: FileSyncMode) -> Box<dyn FileSync> {
    match mode {
        FileSyncMode::Local => Box::new(LocalSync),
        FileSyncMode::RemotePlain => Box::new(HostLoopSync {
            shell: "rsh",
            copy: "rcp",
        }),
        FileSyncMode::RemoteSecure => Box::new(HostLoopSync {
            shell: "ssh",
            copy: "scp",
        }),
    }
}
