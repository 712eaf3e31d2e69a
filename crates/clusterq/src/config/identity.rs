use std::path::PathBuf;

use crate::Map;
use crate::common::error::config_error;

/// Who submits, from where and to which cluster.
///
/// These values are available to path templates as `%user`, `%host`, `%head`,
/// `%cluster`, `%program` and `%home`, and are exported to job scripts as
/// `<key>name` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub host: String,
    pub home: PathBuf,
}

impl Identity {
    pub fn detect() -> crate::Result<Self> {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .or_else(|_| config_error("Cannot determine the user name".to_string()))?;
        let host = gethostname::gethostname().to_string_lossy().into_owned();
        let Some(home) = dirs::home_dir() else {
            return config_error("Cannot determine the home directory".to_string());
        };
        Ok(Self { user, host, home })
    }

    /// Names exported to job scripts, keyed without the `name` suffix.
    pub fn names(&self, head: &str, cluster: &str, program: &str) -> Map<String, String> {
        [
            ("user", self.user.as_str()),
            ("host", self.host.as_str()),
            ("head", head),
            ("cluster", cluster),
            ("program", program),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
    }

    /// Values substituted into path templates: the exported names plus `home`.
    pub fn template_values(&self, head: &str, cluster: &str, program: &str) -> Map<String, String> {
        let mut values = self.names(head, cluster, program);
        values.insert("home".to_string(), self.home.display().to_string());
        values
    }
}
