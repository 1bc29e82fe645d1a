//! increasevol
//!
//! Job pipeline that raises the audio volume of video files by running an
//! external probe and transcoder per file, with a bounded number of jobs in
//! flight.

pub mod command;
pub mod commit;
pub mod concurrency;
pub mod error;
pub mod job;
pub mod metrics;
pub mod metrics_server;
pub mod probe;
pub mod runner;
pub mod scan;
pub mod scheduler;
pub mod startup;
pub mod supervisor;
pub mod transcode;

pub use increasevol_config as config;
pub use increasevol_config::Config;
pub use command::{CommandLine, CommandTemplate, TemplateError, ToolCommands};
pub use commit::{commit, output_path_for, CommitFs, CommitPlan, StdFs};
pub use concurrency::max_concurrent_jobs;
pub use error::JobError;
pub use job::{format_hms, Job, JobEvent, JobId, JobOptions, JobStatus};
pub use metrics::{snapshot_channel, JobMetrics, QueueSnapshot, SnapshotReceiver};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use probe::{probe_duration, DurationProbe};
pub use scan::{collect_videos, ScanFilter};
pub use scheduler::{JobObserver, JobScheduler, JobUpdate, SchedulerError, SetupError};
pub use startup::{check_prerequisites, StartupError};
pub use supervisor::{Completion, Outcome, ProcessControl, ProcessSupervisor};
pub use transcode::{transcode, TranscodeParams, VolumeTranscoder};
