//! Errors raised while processing a single job.

use std::path::PathBuf;
use thiserror::Error;

/// Pipeline error of one job
///
/// These fail only the job that raised them. The message is kept on the job
/// row, so the type is `Clone` and holds rendered reasons instead of
/// `std::io::Error` values.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JobError {
    /// The external command could not be started
    #[error("Failed to start `{command}`: {reason}")]
    ProcessSpawn { command: String, reason: String },

    /// The probe output was not exactly one number of seconds
    #[error("Error reading probe output: {0}")]
    ProbeParse(String),

    /// The probe process failed or reported an unusable duration
    #[error("Error executing probe: {0}")]
    Probe(String),

    /// The transcode process failed
    #[error("Error executing transcoder: {0}")]
    Transcode(String),

    /// The temporary output file could not be created
    #[error("Error creating temporary file: {0}")]
    TempFileCreation(String),

    /// The output file of a keep-original job already exists
    #[error("Output file \"{}\" exists", .0.display())]
    OutputExists(PathBuf),

    /// The original file could not be removed before installing the result
    #[error(
        "Error removing \"{}\", preserving temporary output file \"{}\": {reason}",
        .input.display(),
        .temp.display()
    )]
    RemoveOriginal {
        input: PathBuf,
        temp: PathBuf,
        reason: String,
    },

    /// The job task ended without reporting an outcome
    #[error("Job task failed: {0}")]
    TaskFailed(String),

    /// The temporary output could not be renamed to its final path
    #[error("Error renaming \"{}\" to \"{}\": {reason}", .from.display(), .to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_paths() {
        let err = JobError::Rename {
            from: PathBuf::from("/v/ffmpeg_temp_1.mkv"),
            to: PathBuf::from("/v/film.mkv"),
            reason: "Permission denied".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/v/ffmpeg_temp_1.mkv"));
        assert!(msg.contains("/v/film.mkv"));
        assert!(msg.contains("Permission denied"));

        let err = JobError::OutputExists(PathBuf::from("/v/film_Vol-inc.mkv"));
        assert_eq!(err.to_string(), "Output file \"/v/film_Vol-inc.mkv\" exists");
    }
}
