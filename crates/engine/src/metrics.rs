//! Queue snapshots
//!
//! Serializable view of the job table, published by the scheduler through a
//! `watch` channel after every state change.

use crate::job::{Job, JobStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Per-job state as exposed to monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub id: u64,
    pub input_path: String,
    pub status: String,
    pub progress_percent: f64,
    pub est_remaining_secs: f64,
    pub duration_secs: f64,
    pub start_time_unix_ms: i64,
    pub end_time_unix_ms: i64,
    pub output_path: Option<String>,
    pub temp_output_path: Option<String>,
    pub error: Option<String>,
}

impl JobMetrics {
    pub fn from_job(job: &Job) -> Self {
        Self {
            id: job.id.0,
            input_path: job.input_path.to_string_lossy().into_owned(),
            status: job.status.as_str().to_string(),
            progress_percent: job.progress_percent,
            est_remaining_secs: job.estimated_remaining.as_secs_f64(),
            duration_secs: job.duration,
            start_time_unix_ms: job.start_time,
            end_time_unix_ms: job.end_time,
            output_path: job
                .output_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            temp_output_path: job
                .temp_output_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            error: job.error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Snapshot of the whole queue
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueSnapshot {
    pub timestamp_unix_ms: i64,
    pub max_concurrency: usize,
    pub queue_len: usize,
    pub running_jobs: usize,
    pub finished_jobs: usize,
    pub failed_jobs: usize,
    pub terminated_jobs: usize,
    pub jobs: Vec<JobMetrics>,
}

impl QueueSnapshot {
    /// Build a snapshot from the job table, in job id order
    pub fn from_jobs<'a>(
        jobs: impl IntoIterator<Item = &'a Job>,
        max_concurrency: usize,
        timestamp_unix_ms: i64,
    ) -> Self {
        let mut snapshot = QueueSnapshot {
            timestamp_unix_ms,
            max_concurrency,
            ..Default::default()
        };
        for job in jobs {
            match job.status {
                JobStatus::Queued => snapshot.queue_len += 1,
                JobStatus::Running => snapshot.running_jobs += 1,
                JobStatus::Finished => snapshot.finished_jobs += 1,
                JobStatus::Failed => snapshot.failed_jobs += 1,
                JobStatus::Terminated => snapshot.terminated_jobs += 1,
            }
            snapshot.jobs.push(JobMetrics::from_job(job));
        }
        snapshot
    }
}

/// Receiving side of published snapshots
pub type SnapshotReceiver = watch::Receiver<QueueSnapshot>;

/// Create a snapshot channel holding an empty snapshot
pub fn snapshot_channel() -> (watch::Sender<QueueSnapshot>, SnapshotReceiver) {
    watch::channel(QueueSnapshot::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use crate::job::{JobEvent, JobId, JobOptions};
    use std::path::PathBuf;

    #[test]
    fn test_snapshot_counts_by_status() {
        let queued = Job::new(JobId(0), PathBuf::from("/a.mkv"), JobOptions::default());
        let mut running = Job::new(JobId(1), PathBuf::from("/b.mkv"), JobOptions::default());
        running.start(10);
        let mut failed = Job::new(JobId(2), PathBuf::from("/c.mkv"), JobOptions::default());
        failed.start(10);
        failed.apply(
            JobEvent::Failed {
                error: JobError::Probe("boom".to_string()),
                temp_left: false,
            },
            20,
        );

        let snapshot = QueueSnapshot::from_jobs([&queued, &running, &failed], 2, 99);
        assert_eq!(snapshot.timestamp_unix_ms, 99);
        assert_eq!(snapshot.max_concurrency, 2);
        assert_eq!(snapshot.queue_len, 1);
        assert_eq!(snapshot.running_jobs, 1);
        assert_eq!(snapshot.failed_jobs, 1);
        assert_eq!(snapshot.finished_jobs, 0);
        assert_eq!(snapshot.jobs.len(), 3);
        assert_eq!(snapshot.jobs[2].status, "failed");
        assert_eq!(
            snapshot.jobs[2].error.as_deref(),
            Some("Error executing probe: boom")
        );
        assert_eq!(snapshot.jobs[1].start_time_unix_ms, 10);
    }

    #[test]
    fn test_job_metrics_json_fields() {
        let job = Job::new(JobId(4), PathBuf::from("/media/film.mkv"), JobOptions::default());
        let json = serde_json::to_value(JobMetrics::from_job(&job)).unwrap();
        assert_eq!(json["id"], 4);
        assert_eq!(json["input_path"], "/media/film.mkv");
        assert_eq!(json["status"], "queued");
        assert!(json["error"].is_null());
    }
}
