//! Job runner
//!
//! Drives one job through probe, transcode and commit as an async task and
//! reports every step to the scheduler as a `JobEvent`. The task never touches
//! the job row itself.

use crate::command::ToolCommands;
use crate::commit::{
    commit, create_temp_output, output_path_for, remove_temp_output, CommitFs, CommitPlan,
};
use crate::error::JobError;
use crate::job::{JobEvent, JobId, JobOptions};
use crate::probe::probe_duration;
use crate::supervisor::{Completion, ProcessControl};
use crate::transcode::{transcode, TranscodeParams};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

/// Event of one job, as received by the scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct JobMessage {
    pub id: JobId,
    pub event: JobEvent,
}

/// Everything a job task needs
pub struct JobContext {
    pub id: JobId,
    pub input_path: PathBuf,
    pub options: JobOptions,
    pub tools: Arc<ToolCommands>,
    pub fs: Arc<dyn CommitFs + Send + Sync>,
    pub events: mpsc::UnboundedSender<JobMessage>,
    pub controls: mpsc::UnboundedReceiver<ProcessControl>,
}

/// Run a job to its terminal event
///
/// Exactly one terminal event (`Finished`, `Failed` or `Terminated`) is sent,
/// always last.
pub async fn run_job(ctx: JobContext) {
    let JobContext {
        id,
        input_path,
        options,
        tools,
        fs,
        events,
        mut controls,
    } = ctx;

    let send = |event: JobEvent| {
        // The scheduler going away only means nobody is listening anymore
        let _ = events.send(JobMessage { id, event });
    };

    info!(job = %id, input = %input_path.display(), "job started");

    let terminal = process(
        id,
        &input_path,
        &options,
        &tools,
        fs.as_ref(),
        &send,
        &mut controls,
    )
    .await;

    match &terminal {
        JobEvent::Finished { output_path } => {
            info!(job = %id, output = %output_path.display(), "job finished")
        }
        JobEvent::Failed { error, .. } => warn!(job = %id, error = %error, "job failed"),
        JobEvent::Terminated { .. } => info!(job = %id, "job terminated"),
        _ => {}
    }
    send(terminal);
}

/// Run a job on its own task, reporting a panic of that task as `Failed`
///
/// The temporary output, if one was reported, is treated as left behind.
pub async fn run_job_guarded(ctx: JobContext) {
    let id = ctx.id;
    let events = ctx.events.clone();
    if let Err(e) = tokio::spawn(run_job(ctx)).await {
        let reason = join_error_reason(e);
        error!(job = %id, reason = %reason, "job task failed");
        let _ = events.send(JobMessage {
            id,
            event: JobEvent::Failed {
                error: JobError::TaskFailed(reason),
                temp_left: true,
            },
        });
    }
}

fn join_error_reason(e: JoinError) -> String {
    if !e.is_panic() {
        return e.to_string();
    }
    let payload = e.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panicked: {}", msg)
    } else {
        "panicked".to_string()
    }
}

async fn process<S: Fn(JobEvent)>(
    id: JobId,
    input: &Path,
    options: &JobOptions,
    tools: &ToolCommands,
    fs: &(dyn CommitFs + Send + Sync),
    send: &S,
    controls: &mut mpsc::UnboundedReceiver<ProcessControl>,
) -> JobEvent {
    let failed = |error: JobError, temp_left: bool| JobEvent::Failed { error, temp_left };

    let duration = match probe_duration(&tools.probe, input, controls).await {
        Ok(Completion::Done(duration)) => duration,
        Ok(Completion::Terminated) => return JobEvent::Terminated { temp_left: false },
        Err(e) => return failed(e, false),
    };
    debug!(job = %id, duration, "duration probed");
    send(JobEvent::DurationKnown(duration));

    if !(duration > 0.0) {
        return failed(
            JobError::Probe(format!(
                "reported a duration of {} seconds for \"{}\"",
                duration,
                input.display()
            )),
            false,
        );
    }

    let (plan, output_path) = if options.keep_original {
        let output = output_path_for(input, &options.output_prefix, &options.output_suffix);
        if fs.exists(&output) {
            return failed(JobError::OutputExists(output), false);
        }
        (
            CommitPlan::KeepOriginal {
                output: output.clone(),
            },
            output,
        )
    } else {
        (CommitPlan::ReplaceOriginal, input.to_path_buf())
    };

    let temp = match create_temp_output(input, &options.temp_file_prefix) {
        Ok(temp) => temp,
        Err(e) => return failed(e, false),
    };
    send(JobEvent::TranscodeStarted {
        temp_path: temp.clone(),
        output_path,
    });

    let params = TranscodeParams {
        input: input.to_path_buf(),
        output: temp.clone(),
        volume: options.volume,
        audio_encoder: options.audio_encoder.clone(),
        audio_quality: options.audio_quality,
        remove_subtitles: options.remove_subtitles,
        duration,
    };
    let progress = |percent: f64| send(JobEvent::Progress(percent));

    match transcode(&tools.transcode, &params, progress, controls).await {
        Ok(Completion::Done(())) => match commit(fs, input, &temp, &plan) {
            Ok(output_path) => JobEvent::Finished { output_path },
            Err(e) => failed(e, true),
        },
        Ok(Completion::Terminated) => JobEvent::Terminated { temp_left: true },
        Err(e) => {
            remove_temp_output(&temp);
            failed(e, false)
        }
    }
}
