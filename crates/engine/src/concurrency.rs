//! Concurrency bound derivation
//!
//! Derives how many jobs may run at once from CPU core count and configuration.

use crate::config::JobsConfig;

/// Derive the maximum number of concurrent jobs
///
/// Uses the following rules:
/// - `use_all_cpus` runs one job per logical CPU (detected via num_cpus)
/// - otherwise an explicit non-zero `max_jobs` is used unchanged
/// - `max_jobs = 0` falls back to the logical CPU count
/// - the result is never below 1
pub fn max_concurrent_jobs(cfg: &JobsConfig) -> usize {
    derive_max_jobs(cfg, num_cpus::get())
}

fn derive_max_jobs(cfg: &JobsConfig, logical_cores: usize) -> usize {
    let jobs = if cfg.use_all_cpus || cfg.max_jobs == 0 {
        logical_cores
    } else {
        cfg.max_jobs as usize
    };
    jobs.max(1)
}
