//! Startup checks
//!
//! Verifies that the external tools named by the command templates can be
//! found before any job is submitted.

use crate::command::{CommandTemplate, ToolCommands};
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Error types for startup checks
#[derive(Debug, Error, PartialEq)]
pub enum StartupError {
    #[error("Required programs not found: {}", .0.join(", "))]
    MissingPrograms(Vec<String>),
}

/// Locate the program of `template`, if it names one
///
/// Templates whose program is itself a placeholder cannot be checked and
/// resolve to `Ok(None)`.
pub fn locate_program(template: &CommandTemplate) -> Result<Option<PathBuf>, String> {
    let Some(program) = template.program() else {
        return Ok(None);
    };
    // Names containing a separator are checked as given, others on PATH
    which::which(&program).map(Some).map_err(|_| program)
}

/// Check that both the probe and the transcode programs exist
pub fn check_prerequisites(tools: &ToolCommands) -> Result<(), StartupError> {
    let mut missing = Vec::new();
    for template in [&tools.probe, &tools.transcode] {
        match locate_program(template) {
            Ok(Some(path)) => debug!(program = %path.display(), "found program"),
            Ok(None) => debug!(template = template.source(), "program not checkable"),
            Err(program) => {
                if !missing.contains(&program) {
                    missing.push(program);
                }
            }
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(StartupError::MissingPrograms(missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{PROBE_PLACEHOLDERS, TRANSCODE_PLACEHOLDERS};

    fn tools(probe: &str, transcode: &str) -> ToolCommands {
        ToolCommands {
            probe: CommandTemplate::parse(probe, PROBE_PLACEHOLDERS).unwrap(),
            transcode: CommandTemplate::parse(transcode, TRANSCODE_PLACEHOLDERS).unwrap(),
        }
    }

    #[test]
    fn test_existing_programs_pass() {
        assert_eq!(check_prerequisites(&tools("sh {input}", "sh {output}")), Ok(()));
    }

    #[test]
    fn test_missing_programs_are_listed_once() {
        let result = check_prerequisites(&tools(
            "increasevol-no-such-probe {input}",
            "increasevol-no-such-probe {output}",
        ));
        assert_eq!(
            result,
            Err(StartupError::MissingPrograms(vec![
                "increasevol-no-such-probe".to_string()
            ]))
        );
    }

    #[test]
    fn test_explicit_path() {
        assert!(matches!(locate_program(&tools("/bin/sh", "sh").probe), Ok(Some(_))));
        assert_eq!(
            locate_program(&tools("/nonexistent/ffprobe", "sh").probe),
            Err("/nonexistent/ffprobe".to_string())
        );
    }

    #[test]
    fn test_error_message() {
        let err = StartupError::MissingPrograms(vec!["ffprobe".into(), "ffmpeg".into()]);
        assert_eq!(err.to_string(), "Required programs not found: ffprobe, ffmpeg");
    }
}
