//! Preparation of the output directory and staging of input files.
//!
//! Staging is split into planning, which reads inputs and interpolates them in memory,
//! and applying, which is the only step that writes. Every check that can reject a job
//! runs before anything is written.
use std::path::{Path, PathBuf};

use crate::common::error::{ClusterqError, fs_error};
use crate::common::fsutils::{absolute_path, dotted, remove_file_if_exists, write_atomic};
use crate::common::placeholders::{interpolate, interpolate_safe};
use crate::config::{FileCatalog, InterpolationOptions, StagingPolicy};
use crate::submit::JobDescriptor;
use crate::Map;

/// Directories used by one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLayout {
    pub outdir: PathBuf,
    /// Directory holding the files the job imports; the input directory in raw mode.
    pub stagedir: PathBuf,
    pub jobdir: PathBuf,
    /// File name stem of the input files inside `stagedir`.
    pub staged_name: String,
}

pub fn job_layout(
    job: &JobDescriptor,
    out: Option<&Path>,
    raw: bool,
    program_key: &str,
) -> crate::Result<JobLayout> {
    let outdir = match out {
        Some(out) => absolute_path(out.to_path_buf(), &job.workdir),
        None => job.workdir.join(&job.jobname),
    };
    let (stagedir, staged_name) = if raw {
        (job.workdir.clone(), job.inputname.clone())
    } else {
        if outdir == job.workdir {
            return fs_error(format!(
                "The output directory of {} must differ from its input directory {}",
                job.jobname,
                job.workdir.display()
            ));
        }
        (outdir.clone(), job.outputname.clone())
    };
    let jobdir = stagedir.join(format!("{}.{program_key}.job", job.jobname));
    Ok(JobLayout {
        outdir,
        stagedir,
        jobdir,
        staged_name,
    })
}

/// Which roles of the catalog have a file `<inputname>.<role>` in `workdir`.
pub fn presence_map(catalog: &FileCatalog, workdir: &Path, inputname: &str) -> Map<String, bool> {
    catalog
        .roles()
        .map(|(role, _)| {
            let present = workdir.join(dotted(inputname, role)).is_file();
            (role.to_string(), present)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedContent {
    Copy(PathBuf),
    Move(PathBuf),
    Write {
        contents: String,
        /// Source removed after writing when inputs are moved.
        remove: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub role: String,
    pub target: PathBuf,
    pub content: StagedContent,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StagingPlan {
    /// Input roles with an existing file, in catalog order.
    pub present_inputs: Vec<String>,
    pub files: Vec<StagedFile>,
}

/// Decides how each present input file reaches the stage directory.
///
/// In raw mode nothing is staged. Interpolable files are interpolated strictly when
/// interpolation variables were given. Otherwise they are interpolated in safe mode and
/// copied verbatim if they contain tokens that cannot be resolved.
pub fn plan_staging(
    catalog: &FileCatalog,
    job: &JobDescriptor,
    layout: &JobLayout,
    interpolation: &InterpolationOptions,
    policy: StagingPolicy,
    raw: bool,
) -> crate::Result<StagingPlan> {
    let mut plan = StagingPlan::default();
    for role in catalog.input_roles() {
        let filename = dotted(&job.inputname, role);
        let source = job.workdir.join(&filename);
        if !source.is_file() {
            continue;
        }
        plan.present_inputs.push(role.to_string());
        if raw {
            continue;
        }

        let target = layout.stagedir.join(dotted(&layout.staged_name, role));
        let verbatim = match policy {
            StagingPolicy::Copy => StagedContent::Copy(source.clone()),
            StagingPolicy::Move => StagedContent::Move(source.clone()),
        };
        let remove = (policy == StagingPolicy::Move).then(|| source.clone());

        let interpolable = catalog.get(role).is_some_and(|key| key.interpolable);
        let content = if !interpolable {
            verbatim
        } else {
            let text = std::fs::read_to_string(&source).map_err(|error| {
                ClusterqError::Filesystem(format!("Cannot read {}: {error}", source.display()))
            })?;
            if interpolation.requested() {
                let contents = interpolate(
                    &text,
                    &interpolation.delimiter,
                    &interpolation.positional,
                    &interpolation.named,
                )
                .map_err(|source| ClusterqError::Interpolation {
                    context: format!("input file {filename}"),
                    source,
                })?;
                StagedContent::Write { contents, remove }
            } else {
                let result = interpolate_safe(&text, &interpolation.delimiter, &[], &Map::new());
                if result.unresolved.is_empty() {
                    StagedContent::Write {
                        contents: result.text,
                        remove,
                    }
                } else {
                    log::warn!(
                        "{filename} seems to contain interpolation tokens ({}) but no interpolation variables were given, it is staged without changes",
                        result.unresolved.join(", ")
                    );
                    verbatim
                }
            }
        };
        plan.files.push(StagedFile {
            role: role.to_string(),
            target,
            content,
        });
    }
    Ok(plan)
}

impl StagingPlan {
    pub fn apply(&self) -> crate::Result<()> {
        for file in &self.files {
            let target = &file.target;
            let result = match &file.content {
                StagedContent::Copy(source) => std::fs::copy(source, target).map(|_| ()),
                StagedContent::Move(source) => move_file(source, target),
                StagedContent::Write { contents, remove } => {
                    write_atomic(target, contents.as_bytes(), None).and_then(|_| match remove {
                        Some(source) => std::fs::remove_file(source),
                        None => Ok(()),
                    })
                }
            };
            result.map_err(|error| {
                ClusterqError::Filesystem(format!("Cannot stage {}: {error}", target.display()))
            })?;
            log::debug!("Staged {}", target.display());
        }
        Ok(())
    }
}

fn move_file(source: &Path, target: &Path) -> std::io::Result<()> {
    if std::fs::rename(source, target).is_err() {
        std::fs::copy(source, target)?;
        std::fs::remove_file(source)?;
    }
    Ok(())
}

/// Makes the output directory ready for a new run of the job.
///
/// An existing directory has its previous output files removed, and its previously
/// staged inputs too unless it is the input directory itself. With `overwrite` unset,
/// existing output files make the job fail instead.
pub fn prepare_output_dir(
    catalog: &FileCatalog,
    job: &JobDescriptor,
    outdir: &Path,
    overwrite: bool,
) -> crate::Result<()> {
    if outdir.is_dir() {
        let outputs: Vec<PathBuf> = catalog
            .output_roles()
            .map(|role| outdir.join(dotted(&job.outputname, role)))
            .collect();
        if !overwrite && outputs.iter().any(|path| path.exists()) {
            return fs_error(format!(
                "Output files of {} already exist in {}",
                job.jobname,
                outdir.display()
            ));
        }
        let mut stale = outputs;
        if outdir != job.workdir {
            stale.extend(
                catalog
                    .input_roles()
                    .map(|role| outdir.join(dotted(&job.outputname, role))),
            );
        }
        for path in stale {
            remove_file_if_exists(&path).map_err(|error| {
                ClusterqError::Filesystem(format!("Cannot remove {}: {error}", path.display()))
            })?;
        }
        Ok(())
    } else if outdir.exists() {
        fs_error(format!(
            "Cannot create the output directory {} because a file with that name exists",
            outdir.display()
        ))
    } else {
        std::fs::create_dir_all(outdir).map_err(|error| {
            ClusterqError::Filesystem(format!("Cannot create {}: {error}", outdir.display()))
        })
    }
}
