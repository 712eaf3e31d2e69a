use serde::Deserialize;

use crate::Map;
use crate::common::error::config_error;

/// Properties of one file role of the configured program.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileKey {
    /// Suffix appended to the scratch file name, e.g. `.in`.
    pub suffix: String,
    #[serde(default)]
    pub input: bool,
    #[serde(default)]
    pub output: bool,
    #[serde(default)]
    pub interpolable: bool,
}

/// The set of file roles a program knows about, keyed by role name.
///
/// Input files are found on disk as `<inputname>.<role>`.
#[derive(Debug, Clone)]
pub struct FileCatalog {
    roles: Map<String, FileKey>,
}

impl FileCatalog {
    pub fn new(roles: Map<String, FileKey>) -> crate::Result<Self> {
        for (role, key) in &roles {
            if role.is_empty() || role.contains(['/', '.']) || role.contains(char::is_whitespace)
            {
                return config_error(format!("Invalid file role name `{role}`"));
            }
            if !key.input && !key.output {
                return config_error(format!(
                    "File role `{role}` must be an input, an output or both"
                ));
            }
            if key.interpolable && !key.input {
                return config_error(format!(
                    "File role `{role}` is interpolable but it is not an input"
                ));
            }
        }
        if !roles.values().any(|key| key.input) {
            return config_error("At least one input file role has to be defined".to_string());
        }
        Ok(Self { roles })
    }

    pub fn get(&self, role: &str) -> Option<&FileKey> {
        self.roles.get(role)
    }

    pub fn contains(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }

    pub fn roles(&self) -> impl Iterator<Item = (&str, &FileKey)> {
        self.roles.iter().map(|(role, key)| (role.as_str(), key))
    }

    pub fn input_roles(&self) -> impl Iterator<Item = &str> {
        self.roles().filter(|(_, key)| key.input).map(|(role, _)| role)
    }

    pub fn output_roles(&self) -> impl Iterator<Item = &str> {
        self.roles().filter(|(_, key)| key.output).map(|(role, _)| role)
    }

    /// Splits `filename` into its input name and input role, if its extension is one of
    /// the input roles.
    pub fn split_input_filename<'a>(&self, filename: &'a str) -> Option<(&'a str, &'a str)> {
        let (stem, role) = filename.rsplit_once('.')?;
        if stem.is_empty() {
            return None;
        }
        match self.roles.get(role) {
            Some(key) if key.input => Some((stem, role)),
            _ => None,
        }
    }
}
