//! Volume transcoder
//!
//! Runs the transcode command and turns its `frame=` progress lines into a
//! completion percentage.

use crate::command::{CommandLine, CommandTemplate};
use crate::error::JobError;
use crate::supervisor::{
    Completion, CompletionHandler, LineAction, LineHandler, ProcessControl, ProcessSupervisor,
};
use std::ffi::OsStr;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Prefix of the lines that carry progress
pub const PROGRESS_MARKER: &str = "frame=";

/// Argument substituted for `{remove_subtitles}` when subtitles are dropped
pub const REMOVE_SUBTITLES_FLAG: &str = "-sn";

/// Parameters of one transcode run
#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeParams {
    pub input: PathBuf,
    /// Temporary destination
    pub output: PathBuf,
    pub volume: f64,
    pub audio_encoder: String,
    pub audio_quality: f64,
    pub remove_subtitles: bool,
    /// Duration of the input in seconds, greater than 0
    pub duration: f64,
}

/// Build the transcode command line for `params`
pub fn build_transcode_command(template: &CommandTemplate, params: &TranscodeParams) -> CommandLine {
    let volume = params.volume.to_string();
    let quality = params.audio_quality.to_string();
    let remove_subtitles = if params.remove_subtitles {
        REMOVE_SUBTITLES_FLAG
    } else {
        ""
    };
    template.render(&[
        ("input", params.input.as_os_str()),
        ("output", params.output.as_os_str()),
        ("volume", OsStr::new(&volume)),
        ("audio_encoder", OsStr::new(&params.audio_encoder)),
        ("audio_quality", OsStr::new(&quality)),
        ("remove_subtitles", OsStr::new(remove_subtitles)),
    ])
}

/// Parse `HH:MM:SS.ss` into seconds
pub fn parse_timestamp(s: &str) -> Option<f64> {
    let mut parts = s.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let whole = hours.checked_mul(3600)?.checked_add(minutes.checked_mul(60)?)?;
    Some(whole as f64 + seconds)
}

/// Elapsed media time in seconds from a progress line
///
/// Returns `None` for lines without the progress marker and for progress
/// lines whose `time=` field is missing or unreadable (e.g. `time=N/A`).
pub fn parse_progress_line(line: &str) -> Option<f64> {
    if !line.starts_with(PROGRESS_MARKER) {
        return None;
    }
    let start = line.find(" time=")? + " time=".len();
    let rest = &line[start..];
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    parse_timestamp(&rest[..end])
}

/// Line and completion handler of the transcode process
///
/// Every progress line is reported to `on_progress` as a percentage of
/// `duration`, unclamped.
pub struct VolumeTranscoder<F> {
    duration: f64,
    on_progress: F,
}

impl<F: FnMut(f64)> VolumeTranscoder<F> {
    pub fn new(duration: f64, on_progress: F) -> Self {
        Self {
            duration,
            on_progress,
        }
    }
}

impl<F: FnMut(f64)> LineHandler for VolumeTranscoder<F> {
    fn on_line(&mut self, line: &str) -> LineAction {
        if let Some(elapsed) = parse_progress_line(line) {
            if self.duration > 0.0 {
                (self.on_progress)(elapsed * 100.0 / self.duration);
            }
        }
        LineAction::Continue
    }
}

impl<F> CompletionHandler for VolumeTranscoder<F> {
    type Output = Result<Completion<()>, JobError>;

    fn on_success(self) -> Self::Output {
        Ok(Completion::Done(()))
    }

    fn on_error(self, message: String) -> Self::Output {
        Err(JobError::Transcode(message))
    }

    fn on_terminated(self) -> Self::Output {
        Ok(Completion::Terminated)
    }
}

/// Run the transcoder for `params`, reporting progress percentages
pub async fn transcode<F: FnMut(f64)>(
    template: &CommandTemplate,
    params: &TranscodeParams,
    on_progress: F,
    controls: &mut mpsc::UnboundedReceiver<ProcessControl>,
) -> Result<Completion<()>, JobError> {
    let supervisor = ProcessSupervisor::spawn(build_transcode_command(template, params))?;
    supervisor
        .run(VolumeTranscoder::new(params.duration, on_progress), controls)
        .await
}
