//! Job scheduler
//!
//! Owns the job table, admits jobs up to the concurrency bound in FIFO order
//! and turns the events of running job tasks into updates of the job rows.
//! It is driven from one task: the caller awaits `next_event` in a loop and
//! calls the control methods between events, so no locking is needed.

use crate::command::{TemplateError, ToolCommands};
use crate::commit::{CommitFs, StdFs};
use crate::concurrency::max_concurrent_jobs;
use crate::config::{Config, ConfigError};
use crate::error::JobError;
use crate::job::{current_timestamp_ms, Job, JobId, JobOptions, JobStatus};
use crate::metrics::QueueSnapshot;
use crate::runner::{run_job_guarded, JobContext, JobMessage};
use crate::supervisor::ProcessControl;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Errors returned synchronously by scheduler operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchedulerError {
    /// The path is already queued or running
    #[error("There is already a queued or running job for \"{}\"", .0.display())]
    DuplicateJob(PathBuf),

    #[error("Unknown job {0}")]
    UnknownJob(JobId),

    /// Running jobs can only be terminated
    #[error("Job {0} is running")]
    JobRunning(JobId),

    /// Only failed and terminated jobs can be launched again
    #[error("Job {id} is {status}, only failed or terminated jobs can be launched again")]
    NotRelaunchable { id: JobId, status: JobStatus },

    #[error("Invalid path \"{}\": {reason}", .path.display())]
    InvalidPath { path: PathBuf, reason: String },
}

/// Error building a scheduler from configuration
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Externally visible change of one job
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub id: JobId,
    pub status: JobStatus,
    pub progress_percent: f64,
    pub estimated_remaining: Duration,
    pub error: Option<JobError>,
}

impl JobUpdate {
    fn from_job(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            progress_percent: job.progress_percent,
            estimated_remaining: job.estimated_remaining,
            error: job.error.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Callbacks invoked as jobs change
///
/// `on_job_update` is called for every change, including the terminal one;
/// `on_job_terminal` once more when a job reaches its terminal state.
pub trait JobObserver {
    fn on_job_update(&mut self, _job: &Job) {}
    fn on_job_terminal(&mut self, _job: &Job) {}
}

/// Bounded-concurrency job queue
pub struct JobScheduler {
    tools: Arc<ToolCommands>,
    options: JobOptions,
    fs: Arc<dyn CommitFs + Send + Sync>,
    max_concurrency: usize,
    next_id: u64,
    jobs: BTreeMap<JobId, Job>,
    running: Vec<JobId>,
    backlog: VecDeque<JobId>,
    controls: HashMap<JobId, mpsc::UnboundedSender<ProcessControl>>,
    events_tx: mpsc::UnboundedSender<JobMessage>,
    events_rx: mpsc::UnboundedReceiver<JobMessage>,
    observers: Vec<Box<dyn JobObserver>>,
    snapshots: Option<watch::Sender<QueueSnapshot>>,
}

impl JobScheduler {
    /// Create a scheduler; `max_concurrency` is raised to at least 1
    pub fn new(tools: ToolCommands, options: JobOptions, max_concurrency: usize) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            tools: Arc::new(tools),
            options,
            fs: Arc::new(StdFs),
            max_concurrency: max_concurrency.max(1),
            next_id: 0,
            jobs: BTreeMap::new(),
            running: Vec::new(),
            backlog: VecDeque::new(),
            controls: HashMap::new(),
            events_tx,
            events_rx,
            observers: Vec::new(),
            snapshots: None,
        }
    }

    /// Create a scheduler with the tools, options and bound of `cfg`
    pub fn from_config(cfg: &Config) -> Result<Self, SetupError> {
        let tools = ToolCommands::from_config(&cfg.commands)?;
        let options = JobOptions::from_config(cfg)?;
        Ok(Self::new(tools, options, max_concurrent_jobs(&cfg.jobs)))
    }

    /// Use `fs` for the commit step of jobs launched from now on
    pub fn with_commit_fs(mut self, fs: Arc<dyn CommitFs + Send + Sync>) -> Self {
        self.fs = fs;
        self
    }

    /// Publish a `QueueSnapshot` to `tx` after every change
    pub fn with_snapshots(mut self, tx: watch::Sender<QueueSnapshot>) -> Self {
        self.snapshots = Some(tx);
        self.publish_snapshot();
        self
    }

    pub fn add_observer(&mut self, observer: Box<dyn JobObserver>) {
        self.observers.push(observer);
    }

    /// Options captured by jobs created from now on
    pub fn set_options(&mut self, options: JobOptions) {
        self.options = options;
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Change the bound; call `check_queue` to admit backlog jobs
    pub fn set_max_concurrency(&mut self, n: usize) {
        self.max_concurrency = n.max(1);
        debug!(max_concurrency = self.max_concurrency, "concurrency bound changed");
        self.publish_snapshot();
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    /// All jobs in id order
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.backlog.len()
    }

    /// Running job ids in admission order
    pub fn running_ids(&self) -> &[JobId] {
        &self.running
    }

    /// Backlog job ids in FIFO order
    pub fn queued_ids(&self) -> Vec<JobId> {
        self.backlog.iter().copied().collect()
    }

    /// Whether `path` is queued or running
    pub fn is_active(&self, path: &Path) -> bool {
        self.running
            .iter()
            .chain(self.backlog.iter())
            .filter_map(|id| self.jobs.get(id))
            .any(|job| job.input_path == path)
    }

    /// Add a job for `path`, launching it if there is capacity
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&mut self, path: impl AsRef<Path>) -> Result<JobId, SchedulerError> {
        let path = absolute_path(path.as_ref())?;
        if self.is_active(&path) {
            return Err(SchedulerError::DuplicateJob(path));
        }

        let id = JobId(self.next_id);
        self.next_id += 1;
        let job = Job::new(id, path, self.options.clone());
        info!(job = %id, input = %job.input_path.display(), "job added");
        self.jobs.insert(id, job);

        if self.running.len() < self.max_concurrency {
            self.launch(id);
        } else {
            self.backlog.push_back(id);
            debug!(job = %id, queued = self.backlog.len(), "job queued");
        }
        self.notify_update(id);
        self.publish_snapshot();
        Ok(id)
    }

    /// Admit backlog jobs while there is capacity
    pub fn check_queue(&mut self) {
        let mut launched = false;
        while self.running.len() < self.max_concurrency {
            let Some(id) = self.backlog.pop_front() else {
                break;
            };
            self.launch(id);
            self.notify_update(id);
            launched = true;
        }
        if launched {
            self.publish_snapshot();
        }
    }

    /// Launch queued jobs now, ignoring the concurrency bound
    ///
    /// Ids that are not queued are skipped. Returns the launched ids.
    pub fn force_launch(&mut self, ids: &[JobId]) -> Vec<JobId> {
        let mut launched = Vec::new();
        for &id in ids {
            let Some(pos) = self.backlog.iter().position(|queued| *queued == id) else {
                continue;
            };
            self.backlog.remove(pos);
            info!(job = %id, "job force-launched");
            self.launch(id);
            self.notify_update(id);
            launched.push(id);
        }
        if !launched.is_empty() {
            self.publish_snapshot();
        }
        launched
    }

    /// Submit failed or terminated jobs again as new jobs
    ///
    /// The old rows stay in the table. The new jobs capture the current options.
    pub fn relaunch(&mut self, ids: &[JobId]) -> Vec<Result<JobId, SchedulerError>> {
        ids.iter()
            .map(|&id| {
                let job = self.jobs.get(&id).ok_or(SchedulerError::UnknownJob(id))?;
                match job.status {
                    JobStatus::Failed | JobStatus::Terminated => {
                        let path = job.input_path.clone();
                        self.submit(path)
                    }
                    status => Err(SchedulerError::NotRelaunchable { id, status }),
                }
            })
            .collect()
    }

    /// Remove jobs from the table
    ///
    /// Queued jobs leave the backlog without running, terminal jobs are
    /// discarded and running jobs are rejected.
    pub fn remove(&mut self, ids: &[JobId]) -> Vec<Result<(), SchedulerError>> {
        let results: Vec<_> = ids.iter().map(|&id| self.remove_one(id)).collect();
        if results.iter().any(Result::is_ok) {
            self.publish_snapshot();
        }
        results
    }

    fn remove_one(&mut self, id: JobId) -> Result<(), SchedulerError> {
        let job = self.jobs.get(&id).ok_or(SchedulerError::UnknownJob(id))?;
        match job.status {
            JobStatus::Running => return Err(SchedulerError::JobRunning(id)),
            JobStatus::Queued => self.backlog.retain(|queued| *queued != id),
            JobStatus::Failed | JobStatus::Finished | JobStatus::Terminated => {}
        }
        self.jobs.remove(&id);
        debug!(job = %id, "job removed");
        Ok(())
    }

    /// Ask running jobs to stop; other ids are ignored
    ///
    /// A job becomes Terminated only once its process has exited.
    pub fn terminate(&mut self, ids: &[JobId]) -> usize {
        self.signal(ids, ProcessControl::Terminate)
    }

    /// Send SIGKILL to the processes of running jobs; other ids are ignored
    pub fn kill(&mut self, ids: &[JobId]) -> usize {
        self.signal(ids, ProcessControl::Kill)
    }

    /// Terminate every running job
    pub fn terminate_all(&mut self) -> usize {
        let ids = self.running.clone();
        self.terminate(&ids)
    }

    /// Kill every running job
    pub fn kill_all(&mut self) -> usize {
        let ids = self.running.clone();
        self.kill(&ids)
    }

    fn signal(&mut self, ids: &[JobId], control: ProcessControl) -> usize {
        let mut sent = 0;
        for id in ids {
            if !self.running.contains(id) {
                continue;
            }
            if let Some(tx) = self.controls.get(id) {
                if tx.send(control).is_ok() {
                    debug!(job = %id, ?control, "control request sent");
                    sent += 1;
                }
            }
        }
        sent
    }

    /// Wait for the next change of a running job
    ///
    /// Returns `None` once no job is running.
    pub async fn next_event(&mut self) -> Option<JobUpdate> {
        loop {
            if self.running.is_empty() {
                return None;
            }
            let message = self.events_rx.recv().await?;
            if let Some(update) = self.handle_message(message) {
                return Some(update);
            }
        }
    }

    /// Process events until no job is running or queued
    ///
    /// Returns the terminal updates in the order they happened.
    pub async fn run_until_idle(&mut self) -> Vec<JobUpdate> {
        let mut terminal = Vec::new();
        loop {
            self.check_queue();
            match self.next_event().await {
                Some(update) if update.is_terminal() => terminal.push(update),
                Some(_) => {}
                None => break,
            }
        }
        terminal
    }

    /// Current snapshot of the job table
    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot::from_jobs(self.jobs.values(), self.max_concurrency, current_timestamp_ms())
    }

    fn launch(&mut self, id: JobId) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        if !job.start(current_timestamp_ms()) {
            return;
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let ctx = JobContext {
            id,
            input_path: job.input_path.clone(),
            options: job.options.clone(),
            tools: Arc::clone(&self.tools),
            fs: Arc::clone(&self.fs),
            events: self.events_tx.clone(),
            controls: control_rx,
        };
        self.controls.insert(id, control_tx);
        self.running.push(id);
        debug!(job = %id, running = self.running.len(), "job launched");
        tokio::spawn(run_job_guarded(ctx));
    }

    fn handle_message(&mut self, message: JobMessage) -> Option<JobUpdate> {
        let JobMessage { id, event } = message;
        let job = self.jobs.get_mut(&id)?;
        if !job.apply(event, current_timestamp_ms()) {
            return None;
        }
        let update = JobUpdate::from_job(job);

        self.notify_update(id);
        if update.is_terminal() {
            self.on_job_terminal(id);
        }
        self.publish_snapshot();
        Some(update)
    }

    /// Bookkeeping once a job reached its terminal state
    fn on_job_terminal(&mut self, id: JobId) {
        self.running.retain(|running| *running != id);
        self.controls.remove(&id);
        if let Some(job) = self.jobs.get(&id) {
            for observer in self.observers.iter_mut() {
                observer.on_job_terminal(job);
            }
        }
        self.check_queue();
    }

    fn notify_update(&mut self, id: JobId) {
        if let Some(job) = self.jobs.get(&id) {
            for observer in self.observers.iter_mut() {
                observer.on_job_update(job);
            }
        }
    }

    fn publish_snapshot(&self) {
        if let Some(tx) = &self.snapshots {
            tx.send_replace(self.snapshot());
        }
    }
}

// Make `path` absolute without touching the file system beyond the
// current directory lookup
fn absolute_path(path: &Path) -> Result<PathBuf, SchedulerError> {
    if path.as_os_str().is_empty() {
        return Err(SchedulerError::InvalidPath {
            path: path.to_path_buf(),
            reason: "empty path".to_string(),
        });
    }
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| SchedulerError::InvalidPath {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(cwd.join(path))
}
