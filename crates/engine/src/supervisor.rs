//! Process supervisor
//!
//! Runs one external command, streams its stdout and stderr line by line into
//! a handler and classifies how the process ended. The probe and the
//! transcoder are built on top of it.

use crate::command::CommandLine;
use crate::error::JobError;
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, trace, warn};

/// Exit code ffmpeg reports when it stops on SIGTERM
pub const TERMINATED_EXIT_CODE: i32 = 255;

/// How long output is still read after the process has exited
///
/// A child of the supervised process may inherit the pipes and keep them
/// open; reading stops after this grace period.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Longest output line passed to a handler, in bytes
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Splits process output on `\r` or `\n`
///
/// Empty lines are skipped. Lines longer than the maximum length are dropped
/// up to their next delimiter. A trailing fragment without a delimiter at end
/// of stream is discarded.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    /// Bytes at the front of the buffer already searched for a delimiter
    next_index: usize,
    /// Inside an overlong line
    discarding: bool,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn is_delimiter(b: &u8) -> bool {
    *b == b'\n' || *b == b'\r'
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        loop {
            let read_to = buf.len().min(self.max_length.saturating_add(1));
            let found = buf[self.next_index..read_to].iter().position(is_delimiter);

            match (self.discarding, found) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(end);
                    buf.advance(1);
                    if line.is_empty() {
                        continue;
                    }
                    return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                }
                (false, None) if buf.len() > self.max_length => {
                    trace!(max_length = self.max_length, "dropping overlong output line");
                    self.discarding = true;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if !buf.is_empty() {
            trace!(bytes = buf.len(), "discarding unterminated output fragment");
            buf.clear();
        }
        self.next_index = 0;
        self.discarding = false;
        Ok(None)
    }
}

/// What a line handler wants after seeing a line
#[derive(Debug, Clone, PartialEq)]
pub enum LineAction {
    Continue,
    /// Stop supervising and finish with this error message
    Stop(String),
}

/// Receives every output line, in order, before the next one is read
pub trait LineHandler {
    fn on_line(&mut self, line: &str) -> LineAction;
}

/// Turns the outcome of a supervised process into a result
///
/// Exactly one of the methods is called, once, per supervised process.
pub trait CompletionHandler {
    type Output;

    fn on_success(self) -> Self::Output;
    fn on_error(self, message: String) -> Self::Output;
    fn on_terminated(self) -> Self::Output;
}

/// Result of a supervised run that was not an error
#[derive(Debug, Clone, PartialEq)]
pub enum Completion<T> {
    Done(T),
    Terminated,
}

/// How a process ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    Error(String),
    Terminated,
}

/// Control requests delivered to a running supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessControl {
    /// Send SIGTERM and expect a termination exit
    Terminate,
    /// Send SIGKILL
    Kill,
}

/// Classify an exit status
///
/// Terminated requires both a termination request and an exit that reflects
/// it: killed by SIGTERM, or exit code 255.
pub fn classify_exit(status: ExitStatus, termination_requested: bool) -> Outcome {
    if status.success() {
        return Outcome::Success;
    }
    let termination_exit = status.signal() == Some(Signal::SIGTERM as i32)
        || status.code() == Some(TERMINATED_EXIT_CODE);
    if termination_requested && termination_exit {
        return Outcome::Terminated;
    }
    match (status.code(), status.signal()) {
        (Some(code), _) => Outcome::Error(format!("exited with code {}", code)),
        (None, Some(sig)) => Outcome::Error(format!("killed by signal {}", sig)),
        (None, None) => Outcome::Error(format!("exited with status {}", status)),
    }
}

/// Owner of one external process
pub struct ProcessSupervisor {
    command: CommandLine,
    child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

enum Step {
    Line(Option<io::Result<String>>),
    Exited(io::Result<ExitStatus>),
    Control(Option<ProcessControl>),
    DrainTimeout,
}

impl ProcessSupervisor {
    /// Launch `command` with stdout and stderr captured
    ///
    /// The process is killed if the supervisor is dropped before it exits.
    pub fn spawn(command: CommandLine) -> Result<Self, JobError> {
        let spawn_error = |reason: String| JobError::ProcessSpawn {
            command: command.to_string(),
            reason,
        };

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| spawn_error("stderr was not captured".to_string()))?;

        debug!(pid = ?child.id(), command = %command, "spawned process");

        Ok(Self {
            command,
            child,
            stdout,
            stderr,
        })
    }

    /// Supervise the process until it has exited and its output is drained
    ///
    /// `controls` delivers terminate/kill requests. Requests that arrive after
    /// the process has exited are left in the channel.
    pub async fn run<H>(
        self,
        mut handler: H,
        controls: &mut mpsc::UnboundedReceiver<ProcessControl>,
    ) -> H::Output
    where
        H: LineHandler + CompletionHandler,
    {
        let ProcessSupervisor {
            command,
            mut child,
            stdout,
            stderr,
        } = self;
        let pid = child.id();

        let mut lines = futures::stream::select(
            FramedRead::new(stdout, LineCodec::new()),
            FramedRead::new(stderr, LineCodec::new()),
        );

        let mut termination_requested = false;
        let mut exit_status: Option<ExitStatus> = None;
        let mut drain_deadline: Option<Instant> = None;
        let mut lines_done = false;
        let mut controls_open = true;

        let status = loop {
            if lines_done {
                if let Some(status) = exit_status {
                    break status;
                }
            }

            let step = tokio::select! {
                line = lines.next(), if !lines_done => Step::Line(line),
                status = child.wait(), if exit_status.is_none() => Step::Exited(status),
                control = controls.recv(), if controls_open && exit_status.is_none() => {
                    Step::Control(control)
                }
                _ = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)),
                    if drain_deadline.is_some() && !lines_done => Step::DrainTimeout,
            };

            match step {
                Step::Line(Some(Ok(line))) => {
                    trace!(pid = ?pid, line = %line, "process output");
                    if let LineAction::Stop(message) = handler.on_line(&line) {
                        debug!(pid = ?pid, "line handler stopped the process");
                        return handler.on_error(message);
                    }
                }
                Step::Line(Some(Err(e))) => {
                    return handler.on_error(format!(
                        "Error reading output of `{}`: {}",
                        command, e
                    ));
                }
                Step::Line(None) => lines_done = true,
                Step::Exited(Ok(status)) => {
                    exit_status = Some(status);
                    drain_deadline = Some(Instant::now() + EXIT_DRAIN_GRACE);
                }
                Step::Exited(Err(e)) => {
                    return handler.on_error(format!(
                        "Error waiting for `{}`: {}",
                        command, e
                    ));
                }
                Step::Control(Some(ProcessControl::Terminate)) => {
                    if !termination_requested {
                        termination_requested = true;
                        send_signal(pid, Signal::SIGTERM);
                    }
                }
                Step::Control(Some(ProcessControl::Kill)) => send_signal(pid, Signal::SIGKILL),
                Step::Control(None) => controls_open = false,
                Step::DrainTimeout => {
                    debug!(pid = ?pid, "output still open after exit, stop reading");
                    lines_done = true;
                }
            }
        };

        let outcome = classify_exit(status, termination_requested);
        debug!(pid = ?pid, status = %status, outcome = ?outcome, "process exited");

        match outcome {
            Outcome::Success => handler.on_success(),
            Outcome::Terminated => handler.on_terminated(),
            Outcome::Error(reason) => handler.on_error(format!("`{}` {}", command, reason)),
        }
    }
}

fn send_signal(pid: Option<u32>, sig: Signal) {
    let Some(pid) = pid else {
        return;
    };
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = signal::kill(Pid::from_raw(raw), sig) {
        warn!(pid, signal = ?sig, error = %e, "failed to signal process");
    }
}
