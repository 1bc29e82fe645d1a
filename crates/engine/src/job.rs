//! Job data model
//!
//! A job is one file's run through probe, transcode and commit. The scheduler
//! owns the job rows and mutates them only by applying the events its job
//! tasks send.

use crate::config::{Config, ConfigError};
use crate::error::JobError;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Job identifier, assigned in increasing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job status
///
/// Failed, Finished and Terminated are terminal: reached at most once and
/// never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Queued,
    Running,
    Failed,
    Finished,
    Terminated,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Failed | JobStatus::Finished | JobStatus::Terminated
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
            JobStatus::Finished => "finished",
            JobStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options a job runs with, captured when it is created
#[derive(Debug, Clone, PartialEq)]
pub struct JobOptions {
    pub volume: f64,
    pub audio_encoder: String,
    /// Resolved `-q:a` value of the encoder
    pub audio_quality: f64,
    pub remove_subtitles: bool,
    pub keep_original: bool,
    pub output_prefix: String,
    pub output_suffix: String,
    pub temp_file_prefix: String,
}

impl JobOptions {
    /// Capture options from a validated configuration
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let audio_quality = cfg.audio.encoder_quality().ok_or_else(|| {
            ConfigError::Invalid(format!(
                "no quality {} for encoder '{}'",
                cfg.audio.audio_quality, cfg.audio.audio_encoder
            ))
        })?;
        Ok(Self {
            volume: cfg.audio.volume_increase,
            audio_encoder: cfg.audio.audio_encoder.clone(),
            audio_quality,
            remove_subtitles: cfg.audio.remove_subtitles,
            keep_original: cfg.output.keep_original,
            output_prefix: cfg.output.output_prefix.clone(),
            output_suffix: cfg.output.output_suffix.clone(),
            temp_file_prefix: cfg.output.temp_file_prefix.clone(),
        })
    }
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            volume: 3.0,
            audio_encoder: "mp3".to_string(),
            audio_quality: 3.0,
            remove_subtitles: false,
            keep_original: false,
            output_prefix: String::new(),
            output_suffix: "_Vol-inc".to_string(),
            temp_file_prefix: "ffmpeg_temp_".to_string(),
        }
    }
}

/// Progress events a running job reports, in order
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    DurationKnown(f64),
    TranscodeStarted {
        temp_path: PathBuf,
        output_path: PathBuf,
    },
    /// Percentage as computed by the transcoder
    Progress(f64),
    Finished {
        output_path: PathBuf,
    },
    Failed {
        error: JobError,
        /// Whether the temporary output still exists
        temp_left: bool,
    },
    Terminated {
        temp_left: bool,
    },
}

/// One row of job state
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    /// Absolute path, the deduplication key
    pub input_path: PathBuf,
    pub status: JobStatus,
    /// Seconds, 0 until the probe succeeds
    pub duration: f64,
    /// 0 to 100
    pub progress_percent: f64,
    pub estimated_remaining: Duration,
    /// Unix milliseconds, 0 until set
    pub start_time: i64,
    /// Unix milliseconds, 0 until set
    pub end_time: i64,
    /// Present while the transcode is in progress or the commit left it behind
    pub temp_output_path: Option<PathBuf>,
    /// Final location of the result
    pub output_path: Option<PathBuf>,
    pub error: Option<JobError>,
    pub options: JobOptions,
}

impl Job {
    pub fn new(id: JobId, input_path: PathBuf, options: JobOptions) -> Self {
        Self {
            id,
            input_path,
            status: JobStatus::Queued,
            duration: 0.0,
            progress_percent: 0.0,
            estimated_remaining: Duration::ZERO,
            start_time: 0,
            end_time: 0,
            temp_output_path: None,
            output_path: None,
            error: None,
            options,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Queued -> Running
    pub fn start(&mut self, now_ms: i64) -> bool {
        if self.status != JobStatus::Queued {
            return false;
        }
        self.status = JobStatus::Running;
        self.start_time = now_ms;
        true
    }

    /// Apply an event, returning whether the row changed
    ///
    /// Events for jobs that are not running are ignored, which keeps
    /// terminal states immutable.
    pub fn apply(&mut self, event: JobEvent, now_ms: i64) -> bool {
        if self.status != JobStatus::Running {
            return false;
        }
        match event {
            JobEvent::DurationKnown(duration) => self.duration = duration,
            JobEvent::TranscodeStarted {
                temp_path,
                output_path,
            } => {
                self.temp_output_path = Some(temp_path);
                self.output_path = Some(output_path);
            }
            JobEvent::Progress(percent) => {
                let percent = percent.clamp(0.0, 100.0);
                if percent < self.progress_percent {
                    return false;
                }
                self.progress_percent = percent;
                self.estimated_remaining = estimated_remaining(self.elapsed(now_ms), percent);
            }
            JobEvent::Finished { output_path } => {
                self.status = JobStatus::Finished;
                self.progress_percent = 100.0;
                self.estimated_remaining = Duration::ZERO;
                self.temp_output_path = None;
                self.output_path = Some(output_path);
                self.end_time = now_ms;
            }
            JobEvent::Failed { error, temp_left } => {
                self.status = JobStatus::Failed;
                self.estimated_remaining = Duration::ZERO;
                if !temp_left {
                    self.temp_output_path = None;
                }
                self.error = Some(error);
                self.end_time = now_ms;
            }
            JobEvent::Terminated { temp_left } => {
                self.status = JobStatus::Terminated;
                self.estimated_remaining = Duration::ZERO;
                if !temp_left {
                    self.temp_output_path = None;
                }
                self.end_time = now_ms;
            }
        }
        true
    }

    /// Wall time since the job started, up to its end once terminal
    pub fn elapsed(&self, now_ms: i64) -> Duration {
        if self.start_time == 0 {
            return Duration::ZERO;
        }
        let end = if self.end_time != 0 { self.end_time } else { now_ms };
        Duration::from_millis(end.saturating_sub(self.start_time).max(0) as u64)
    }
}

/// Remaining time estimate: `elapsed * (100 - p) / p`, 0 when `p` is 0
///
/// Estimates too large for a `Duration` saturate at `Duration::MAX`.
pub fn estimated_remaining(elapsed: Duration, progress_percent: f64) -> Duration {
    if !(progress_percent > 0.0) {
        return Duration::ZERO;
    }
    let p = progress_percent.min(100.0);
    Duration::try_from_secs_f64(elapsed.as_secs_f64() * (100.0 - p) / p)
        .unwrap_or(Duration::MAX)
}

/// Render a duration as `HH:MM:SS`, or `HH:MM:SS.mmm` with milliseconds
pub fn format_hms(duration: Duration, show_millis: bool) -> String {
    let total = duration.as_secs();
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if show_millis {
        format!("{:02}:{:02}:{:02}.{:03}", h, m, s, duration.subsec_millis())
    } else {
        format!("{:02}:{:02}:{:02}", h, m, s)
    }
}

/// Get current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn running_job() -> Job {
        let mut job = Job::new(JobId(1), PathBuf::from("/media/film.mkv"), JobOptions::default());
        assert!(job.start(1_000));
        job
    }

    #[test]
    fn test_new_job_is_queued() {
        let job = Job::new(JobId(7), PathBuf::from("/a.mkv"), JobOptions::default());
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.duration, 0.0);
        assert_eq!(job.start_time, 0);
        assert_eq!(job.end_time, 0);
        assert!(job.error.is_none());
    }

    #[test]
    fn test_start_only_from_queued() {
        let mut job = running_job();
        assert!(!job.start(2_000));
        assert_eq!(job.start_time, 1_000);
    }

    #[test]
    fn test_events_in_order_finish_the_job() {
        let mut job = running_job();
        assert!(job.apply(JobEvent::DurationKnown(125.43), 1_100));
        assert!(job.apply(
            JobEvent::TranscodeStarted {
                temp_path: PathBuf::from("/media/ffmpeg_temp_1.mkv"),
                output_path: PathBuf::from("/media/film.mkv"),
            },
            1_200
        ));
        assert!(job.apply(JobEvent::Progress(50.0), 11_000));
        assert_eq!(job.estimated_remaining, Duration::from_secs(10));
        assert!(job.apply(
            JobEvent::Finished {
                output_path: PathBuf::from("/media/film.mkv")
            },
            21_000
        ));
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.progress_percent, 100.0);
        assert_eq!(job.temp_output_path, None);
        assert_eq!(job.end_time, 21_000);
        assert_eq!(job.elapsed(99_000), Duration::from_secs(20));
    }

    #[test]
    fn test_terminal_state_is_immutable() {
        let mut job = running_job();
        job.apply(
            JobEvent::Failed {
                error: JobError::Probe("boom".to_string()),
                temp_left: false,
            },
            2_000,
        );
        assert_eq!(job.status, JobStatus::Failed);

        assert!(!job.apply(JobEvent::Terminated { temp_left: false }, 3_000));
        assert!(!job.apply(JobEvent::Progress(10.0), 3_000));
        assert!(!job.start(3_000));
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.end_time, 2_000);
        assert_eq!(job.error, Some(JobError::Probe("boom".to_string())));
    }

    #[test]
    fn test_failed_with_temp_left_keeps_path() {
        let mut job = running_job();
        job.apply(
            JobEvent::TranscodeStarted {
                temp_path: PathBuf::from("/m/t.mkv"),
                output_path: PathBuf::from("/m/film.mkv"),
            },
            1_100,
        );
        job.apply(
            JobEvent::Failed {
                error: JobError::Rename {
                    from: PathBuf::from("/m/t.mkv"),
                    to: PathBuf::from("/m/film.mkv"),
                    reason: "denied".to_string(),
                },
                temp_left: true,
            },
            2_000,
        );
        assert_eq!(job.temp_output_path, Some(PathBuf::from("/m/t.mkv")));
    }

    #[test]
    fn test_terminated_keeps_end_time() {
        let mut job = running_job();
        job.apply(JobEvent::Terminated { temp_left: true }, 4_500);
        assert_eq!(job.status, JobStatus::Terminated);
        assert_eq!(job.end_time, 4_500);
        assert!(job.error.is_none());
    }

    #[test]
    fn test_progress_is_clamped() {
        let mut job = running_job();
        job.apply(JobEvent::Progress(-3.0), 1_500);
        assert_eq!(job.progress_percent, 0.0);
        job.apply(JobEvent::Progress(104.2), 1_600);
        assert_eq!(job.progress_percent, 100.0);
    }

    #[test]
    fn test_estimated_remaining() {
        assert_eq!(estimated_remaining(Duration::from_secs(30), 0.0), Duration::ZERO);
        assert_eq!(
            estimated_remaining(Duration::from_secs(30), 25.0),
            Duration::from_secs(90)
        );
        assert_eq!(estimated_remaining(Duration::from_secs(30), 100.0), Duration::ZERO);
    }

    #[test]
    fn test_tiny_progress_saturates_estimate() {
        assert_eq!(
            estimated_remaining(Duration::from_secs(30), 1e-298),
            Duration::MAX
        );

        // 1 second of a 1e300 second file
        let mut job = running_job();
        job.apply(JobEvent::DurationKnown(1e300), 1_100);
        assert!(job.apply(JobEvent::Progress(1e-298), 2_000));
        assert_eq!(job.progress_percent, 1e-298);
        assert_eq!(job.estimated_remaining, Duration::MAX);
        assert!(!format_hms(job.estimated_remaining, true).is_empty());
    }

    #[test]
    fn test_format_hms() {
        assert_eq!(format_hms(Duration::from_secs(0), false), "00:00:00");
        assert_eq!(format_hms(Duration::from_millis(3_723_042), false), "01:02:03");
        assert_eq!(format_hms(Duration::from_millis(3_723_042), true), "01:02:03.042");
        assert_eq!(format_hms(Duration::from_secs(100 * 3600), false), "100:00:00");
    }

    #[test]
    fn test_options_from_config() {
        let mut cfg = Config::default();
        cfg.audio.audio_encoder = "libvorbis".to_string();
        cfg.audio.audio_quality = 1;
        cfg.output.keep_original = true;
        let opts = JobOptions::from_config(&cfg).unwrap();
        assert_eq!(opts.audio_quality, 2.5);
        assert!(opts.keep_original);
        assert_eq!(
            opts,
            JobOptions {
                audio_encoder: "libvorbis".to_string(),
                audio_quality: 2.5,
                keep_original: true,
                ..JobOptions::default()
            }
        );

        cfg.audio.audio_encoder = "wav".to_string();
        assert!(JobOptions::from_config(&cfg).is_err());
    }

    // **Property: progress stays in range and never goes back**
    //
    // *For any* sequence of reported percentages, the row's progress is
    // within [0, 100] and non-decreasing.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_progress_bounded_and_monotonic(
            reports in prop::collection::vec(-50.0f64..150.0, 1..30),
        ) {
            let mut job = running_job();
            let mut last = 0.0;
            for (i, p) in reports.into_iter().enumerate() {
                job.apply(JobEvent::Progress(p), 2_000 + i as i64 * 100);
                prop_assert!(job.progress_percent >= 0.0 && job.progress_percent <= 100.0);
                prop_assert!(job.progress_percent >= last);
                last = job.progress_percent;
            }
        }
    }
}
