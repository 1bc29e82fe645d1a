//! Duration probe
//!
//! Runs the probe command for one file and reads its duration in seconds from
//! the single line it prints.

use crate::command::{CommandLine, CommandTemplate};
use crate::error::JobError;
use crate::supervisor::{
    Completion, CompletionHandler, LineAction, LineHandler, ProcessControl, ProcessSupervisor,
};
use std::path::Path;
use tokio::sync::mpsc;

/// Build the probe command line for `input`
pub fn build_probe_command(template: &CommandTemplate, input: &Path) -> CommandLine {
    template.render(&[("input", input.as_os_str())])
}

/// Parse one probe output line as seconds
pub fn parse_duration_line(line: &str) -> Result<f64, String> {
    let value: f64 = line
        .trim()
        .parse()
        .map_err(|e| format!("could not read seconds from line {:?}: {}", line, e))?;
    if !value.is_finite() {
        return Err(format!("could not read seconds from line {:?}", line));
    }
    Ok(value)
}

/// Line and completion handler of the probe process
#[derive(Debug, Default)]
pub struct DurationProbe {
    lines: usize,
    duration: f64,
    parse_error: Option<String>,
}

impl DurationProbe {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LineHandler for DurationProbe {
    fn on_line(&mut self, line: &str) -> LineAction {
        self.lines += 1;
        let result = if self.lines > 1 {
            Err(format!(
                "expected exactly one line, got more than one line: {:?}",
                line
            ))
        } else {
            parse_duration_line(line).map(|duration| self.duration = duration)
        };
        match result {
            Ok(()) => LineAction::Continue,
            Err(message) => {
                self.parse_error = Some(message.clone());
                LineAction::Stop(message)
            }
        }
    }
}

impl CompletionHandler for DurationProbe {
    type Output = Result<Completion<f64>, JobError>;

    fn on_success(self) -> Self::Output {
        if self.lines == 0 {
            return Err(JobError::ProbeParse(
                "expected exactly one line, got none".to_string(),
            ));
        }
        Ok(Completion::Done(self.duration))
    }

    fn on_error(self, message: String) -> Self::Output {
        match self.parse_error {
            Some(parse_error) => Err(JobError::ProbeParse(parse_error)),
            None => Err(JobError::Probe(message)),
        }
    }

    fn on_terminated(self) -> Self::Output {
        Ok(Completion::Terminated)
    }
}

/// Probe the duration of `input`
///
/// A duration of 0 is returned as is; callers decide whether it is usable.
pub async fn probe_duration(
    template: &CommandTemplate,
    input: &Path,
    controls: &mut mpsc::UnboundedReceiver<ProcessControl>,
) -> Result<Completion<f64>, JobError> {
    let supervisor = ProcessSupervisor::spawn(build_probe_command(template, input))?;
    supervisor.run(DurationProbe::new(), controls).await
}
