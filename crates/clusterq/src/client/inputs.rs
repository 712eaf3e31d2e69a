use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use itertools::{EitherOrBoth, Itertools};
use regex::Regex;

use crate::common::error::{ClusterqError, config_error};
use crate::common::fsutils::absolute_path;
use crate::config::FileCatalog;
use crate::Set;
use crate::submit::{FilterGroups, JobInput};

/// Regular expression that has to match the whole input name.
#[derive(Debug)]
pub struct InputFilter {
    regex: Regex,
}

impl InputFilter {
    pub fn new(pattern: &str) -> crate::Result<Self> {
        match Regex::new(&format!("^(?:{pattern})$")) {
            Ok(regex) => Ok(Self { regex }),
            Err(error) => config_error(format!("Invalid filter `{pattern}`: {error}")),
        }
    }

    /// Returns the capture groups of `inputname`, or `None` when it does not match.
    ///
    /// Positional groups are indexed from zero; groups that did not participate in the
    /// match are empty.
    pub fn groups(&self, inputname: &str) -> Option<FilterGroups> {
        let captures = self.regex.captures(inputname)?;
        let positional = captures
            .iter()
            .skip(1)
            .map(|group| group.map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect();
        let named = self
            .regex
            .capture_names()
            .flatten()
            .filter_map(|name| {
                captures
                    .name(name)
                    .map(|m| (name.to_string(), m.as_str().to_string()))
            })
            .collect();
        Some(FilterGroups { positional, named })
    }
}

/// How command line arguments name the inputs.
pub enum InputMode {
    /// Paths of input files, `<dir>/<inputname>.<role>`.
    Files,
    /// Bare input names looked up in a directory.
    Names(PathBuf),
}

/// Resolves one command line argument into an input.
pub fn resolve_input(
    catalog: &FileCatalog,
    argument: &Path,
    mode: &InputMode,
    cwd: &Path,
) -> crate::Result<JobInput> {
    let name = || argument.display().to_string();
    match mode {
        InputMode::Names(directory) => {
            let inputname = name();
            if inputname.is_empty() || inputname.contains('/') {
                return Err(ClusterqError::Filesystem(format!(
                    "`{inputname}` is not a valid input name"
                )));
            }
            Ok(JobInput {
                workdir: absolute_path(directory.clone(), cwd),
                inputname,
                filter_groups: FilterGroups::default(),
            })
        }
        InputMode::Files => {
            let path = absolute_path(argument.to_path_buf(), cwd);
            if !path.is_file() {
                return Err(ClusterqError::Filesystem(format!(
                    "Input file {} does not exist",
                    name()
                )));
            }
            let filename = path
                .file_name()
                .map(|filename| filename.to_string_lossy().into_owned())
                .unwrap_or_default();
            let Some((inputname, _)) = catalog.split_input_filename(&filename) else {
                return Err(ClusterqError::Filesystem(format!(
                    "{} does not have the extension of an input file",
                    name()
                )));
            };
            let workdir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| cwd.to_path_buf());
            Ok(JobInput {
                workdir,
                inputname: inputname.to_string(),
                filter_groups: FilterGroups::default(),
            })
        }
    }
}

/// Resolves all arguments, dropping inputs rejected by `filter` and repeated inputs
/// (several files of the same input name).
pub fn collect_inputs(
    catalog: &FileCatalog,
    arguments: &[PathBuf],
    mode: &InputMode,
    cwd: &Path,
    filter: Option<&InputFilter>,
) -> Vec<crate::Result<JobInput>> {
    let mut seen = Set::new();
    let mut inputs = vec![];
    for argument in arguments {
        let mut input = match resolve_input(catalog, argument, mode, cwd) {
            Ok(input) => input,
            Err(error) => {
                inputs.push(Err(error));
                continue;
            }
        };
        if let Some(filter) = filter {
            let Some(groups) = filter.groups(&input.inputname) else {
                log::debug!("{} does not match the filter", input.inputname);
                continue;
            };
            input.filter_groups = groups;
        }
        if seen.insert((input.workdir.clone(), input.inputname.clone())) {
            inputs.push(Ok(input));
        }
    }
    inputs
}

fn natural_chunks(value: &str) -> Vec<&str> {
    let mut chunks = vec![];
    let mut start = 0;
    let mut digits = None;
    for (index, c) in value.char_indices() {
        let is_digit = c.is_ascii_digit();
        if digits.is_some_and(|digits| digits != is_digit) {
            chunks.push(&value[start..index]);
            start = index;
        }
        digits = Some(is_digit);
    }
    if start < value.len() {
        chunks.push(&value[start..]);
    }
    chunks
}

/// Compares strings so that digit runs are ordered by their numeric value
/// (`r2` < `r10`).
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    for pair in natural_chunks(a).into_iter().zip_longest(natural_chunks(b)) {
        let ordering = match pair {
            EitherOrBoth::Left(_) => Ordering::Greater,
            EitherOrBoth::Right(_) => Ordering::Less,
            EitherOrBoth::Both(left, right) => {
                if left.starts_with(|c: char| c.is_ascii_digit())
                    && right.starts_with(|c: char| c.is_ascii_digit())
                {
                    let left_value = left.trim_start_matches('0');
                    let right_value = right.trim_start_matches('0');
                    left_value
                        .len()
                        .cmp(&right_value.len())
                        .then_with(|| left_value.cmp(right_value))
                        .then_with(|| left.len().cmp(&right.len()))
                } else {
                    left.cmp(right)
                }
            }
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

pub fn sort_naturally(arguments: &mut [PathBuf], reverse: bool) {
    arguments.sort_by(|a, b| {
        let ordering = natural_cmp(&a.to_string_lossy(), &b.to_string_lossy());
        if reverse { ordering.reverse() } else { ordering }
    });
}
