//! Commit of a finished transcode.
//!
//! The transcoder writes into a temporary file next to the input. Once it
//! succeeds the temporary file is installed either beside the original
//! (keep-original) or in its place (replace-original).
//!
//! Replacing removes the original before renaming, so a failed rename leaves
//! the temporary file as the only copy. Errors never delete the temporary
//! file.

use crate::error::JobError;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// File system operations used by the commit
///
/// `StdFs` is the real implementation; tests substitute failing ones.
pub trait CommitFs {
    fn exists(&self, path: &Path) -> bool;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
}

/// `CommitFs` backed by `std::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFs;

impl CommitFs for StdFs {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }
}

/// Where the finished output goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitPlan {
    /// Install at `output`, leaving the input untouched
    KeepOriginal { output: PathBuf },
    /// Install at the input path
    ReplaceOriginal,
}

/// Output path of a keep-original job: `dir/<prefix><stem><suffix>.<ext>`
///
/// # Example
///
/// ```
/// use std::path::Path;
/// use increasevol::commit::output_path_for;
///
/// let out = output_path_for(Path::new("/media/film.mkv"), "", "_Vol-inc");
/// assert_eq!(out, Path::new("/media/film_Vol-inc.mkv"));
/// ```
pub fn output_path_for(input: &Path, prefix: &str, suffix: &str) -> PathBuf {
    let mut name = OsString::from(prefix);
    if let Some(stem) = input.file_stem() {
        name.push(stem);
    }
    name.push(suffix);
    if let Some(ext) = input.extension() {
        name.push(".");
        name.push(ext);
    }
    input.with_file_name(name)
}

/// Create an empty, uniquely named temporary file in the input's directory
///
/// The name is `<prefix><random><.ext>` so the transcoder infers the same
/// container format as the input. The file is kept on disk; the caller owns
/// its removal.
pub fn create_temp_output(input: &Path, prefix: &str) -> Result<PathBuf, JobError> {
    let dir = match input.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let suffix = input
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();

    let file = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(&suffix)
        .tempfile_in(dir)
        .map_err(|e| JobError::TempFileCreation(format!("in \"{}\": {}", dir.display(), e)))?;

    let path = file
        .into_temp_path()
        .keep()
        .map_err(|e| JobError::TempFileCreation(e.to_string()))?;

    debug!(path = %path.display(), "created temporary output");
    Ok(path)
}

/// Install `temp` according to `plan`, returning the final path
pub fn commit<F: CommitFs + ?Sized>(
    fs: &F,
    input: &Path,
    temp: &Path,
    plan: &CommitPlan,
) -> Result<PathBuf, JobError> {
    match plan {
        CommitPlan::KeepOriginal { output } => {
            if fs.exists(output) {
                return Err(JobError::OutputExists(output.clone()));
            }
            rename(fs, temp, output)?;
            info!(output = %output.display(), "output written");
            Ok(output.clone())
        }
        CommitPlan::ReplaceOriginal => {
            fs.remove_file(input)
                .map_err(|e| JobError::RemoveOriginal {
                    input: input.to_path_buf(),
                    temp: temp.to_path_buf(),
                    reason: e.to_string(),
                })?;
            debug!(input = %input.display(), "original removed");
            rename(fs, temp, input)?;
            info!(output = %input.display(), "original replaced");
            Ok(input.to_path_buf())
        }
    }
}

fn rename<F: CommitFs + ?Sized>(fs: &F, from: &Path, to: &Path) -> Result<(), JobError> {
    fs.rename(from, to).map_err(|e| JobError::Rename {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Remove a temporary output, ignoring failures
pub fn remove_temp_output(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed temporary output"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove temporary output"),
    }
}
