//! CLI entry point for increasevol
//!
//! Collects video files from the arguments, queues one job per file and
//! reports each job as it ends. The first Ctrl-C terminates running jobs,
//! the second kills them.

use clap::Parser;
use increasevol::job::current_timestamp_ms;
use increasevol::{
    check_prerequisites, collect_videos, format_hms, run_metrics_server, snapshot_channel,
    Config, Job, JobObserver, JobScheduler, JobStatus, ScanFilter, ToolCommands,
};
use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Raise the audio volume of video files
#[derive(Parser, Debug)]
#[command(name = "increasevol")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Video files or directories to process
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Path to the configuration file [default: <config dir>/increasevol/config.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum number of concurrent jobs (0 = one per CPU)
    #[arg(short, long)]
    jobs: Option<u32>,

    /// Volume multiplier
    #[arg(long)]
    volume: Option<f64>,

    /// Write the result next to the original instead of replacing it
    #[arg(short, long)]
    keep_original: bool,

    /// Drop subtitle streams
    #[arg(long)]
    remove_subtitles: bool,

    /// Serve queue snapshots on http://<addr>/metrics
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,

    /// Skip the check for the probe and transcode programs
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("increasevol").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(args: &Args) -> Result<Config, Box<dyn Error>> {
    let path = args.config.clone().unwrap_or_else(default_config_path);
    let mut cfg = Config::load_or_default(&path)?;
    debug!(path = %path.display(), "configuration loaded");

    if let Some(jobs) = args.jobs {
        cfg.jobs.max_jobs = jobs;
        cfg.jobs.use_all_cpus = false;
    }
    if let Some(volume) = args.volume {
        cfg.audio.volume_increase = volume;
    }
    if args.keep_original {
        cfg.output.keep_original = true;
    }
    if args.remove_subtitles {
        cfg.audio.remove_subtitles = true;
    }

    cfg.validate()?;
    Ok(cfg)
}

/// Logs progress of running jobs
struct ProgressLogger;

impl JobObserver for ProgressLogger {
    fn on_job_update(&mut self, job: &Job) {
        if job.status == JobStatus::Running && job.progress_percent > 0.0 {
            debug!(
                job = %job.id,
                progress = job.progress_percent,
                remaining = %format_hms(job.estimated_remaining, false),
                "progress"
            );
        }
    }
}

fn report(job: &Job, show_millis: bool) {
    let elapsed = format_hms(job.elapsed(current_timestamp_ms()), show_millis);
    match job.status {
        JobStatus::Finished => {
            let output = job.output_path.as_ref().unwrap_or(&job.input_path);
            println!("Finished {} ({})", output.display(), elapsed);
        }
        JobStatus::Failed => {
            let reason = job
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_default();
            eprintln!("Failed {}: {}", job.input_path.display(), reason);
            if let Some(temp) = &job.temp_output_path {
                eprintln!("  transcoded output left at {}", temp.display());
            }
        }
        JobStatus::Terminated => {
            println!("Terminated {} after {}", job.input_path.display(), elapsed)
        }
        JobStatus::Queued | JobStatus::Running => {}
    }
}

async fn run(args: Args) -> Result<ExitCode, Box<dyn Error>> {
    let cfg = load_config(&args)?;

    if args.skip_checks {
        warn!("skipping program checks (--skip-checks enabled)");
    } else {
        check_prerequisites(&ToolCommands::from_config(&cfg.commands)?)?;
    }

    let mut scheduler = JobScheduler::from_config(&cfg)?;
    scheduler.add_observer(Box::new(ProgressLogger));

    if let Some(addr) = args.metrics_addr {
        let (tx, rx) = snapshot_channel();
        scheduler = scheduler.with_snapshots(tx);
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, rx).await {
                error!(error = %e, "metrics server stopped");
            }
        });
    }

    let files = collect_videos(&args.paths, &ScanFilter::from_config(&cfg));
    if files.is_empty() {
        println!("No video files found");
        return Ok(ExitCode::SUCCESS);
    }

    for file in &files {
        if let Err(e) = scheduler.submit(file) {
            warn!(error = %e, "not queued");
        }
    }
    info!(
        jobs = scheduler.jobs().count(),
        max_concurrency = scheduler.max_concurrency(),
        "jobs queued"
    );

    let show_millis = cfg.display.show_milliseconds;
    let mut interrupts = 0u32;
    loop {
        tokio::select! {
            update = scheduler.next_event() => {
                let Some(update) = update else {
                    break;
                };
                if update.is_terminal() {
                    if let Some(job) = scheduler.job(update.id) {
                        report(job, show_millis);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                interrupts += 1;
                if interrupts == 1 {
                    warn!("interrupted, terminating running jobs (Ctrl-C again to kill)");
                    let queued = scheduler.queued_ids();
                    scheduler.remove(&queued);
                    scheduler.terminate_all();
                } else {
                    warn!("killing running jobs");
                    scheduler.kill_all();
                }
            }
        }
    }

    let snapshot = scheduler.snapshot();
    info!(
        finished = snapshot.finished_jobs,
        failed = snapshot.failed_jobs,
        terminated = snapshot.terminated_jobs,
        queued = snapshot.queue_len,
        "done"
    );

    if snapshot.failed_jobs > 0 || snapshot.terminated_jobs > 0 {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
