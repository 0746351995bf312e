//! Runtime configuration read from `CC_*` environment variables.
//!
//! Grounded in `lumen-cli::build_script`'s
//! `env::var("NAME").ok().and_then(|v| v.parse().ok()).unwrap_or(default)`
//! idiom (also used by `lumen-lsp`'s `diag_latency_bench` for its
//! threshold knobs) rather than a config-file parser or a `config`-crate
//! layered source — the teacher never reaches for one of those for this
//! kind of small flat knob set, so neither do we.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeBackend {
    Executor,
    Poll,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub workers: usize,
    pub blocking_workers: usize,
    pub spawn_queue_cap: usize,
    pub blocking_queue_cap: usize,
    pub task_queue_size: usize,
    pub task_pool_size: usize,
    pub runtime_backend: RuntimeBackend,
    pub deadlock_detect: bool,
    pub deadlock_abort: bool,
    pub deadlock_timeout: Duration,
    pub spawn_timing: bool,
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name).ok().as_deref() {
        Some("1") => true,
        Some("0") => false,
        _ => default,
    }
}

/// Round up to the next power of two, the way `CC_TASK_QUEUE_SIZE` is
/// specified. `0` and `1` both map to `1`.
fn next_power_of_two(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let cpus = num_cpus::get().max(1);

        let workers = env_usize("CC_WORKERS", cpus);
        let blocking_workers = env_usize("CC_BLOCKING_WORKERS", cpus.max(4));
        let spawn_queue_cap = env_usize("CC_SPAWN_QUEUE_CAP", 4096);
        let blocking_queue_cap = env_usize("CC_BLOCKING_QUEUE_CAP", 4096);
        let task_queue_size = next_power_of_two(env_usize("CC_TASK_QUEUE_SIZE", 1024));
        let task_pool_size = env_usize("CC_TASK_POOL_SIZE", 256);

        let runtime_backend = match env::var("CC_RUNTIME_BACKEND").ok().as_deref() {
            Some("poll") => RuntimeBackend::Poll,
            _ => RuntimeBackend::Executor,
        };

        let deadlock_detect = env_bool("CC_DEADLOCK_DETECT", true);
        let deadlock_abort = env_bool("CC_DEADLOCK_ABORT", false);
        let deadlock_timeout_secs = env_usize("CC_DEADLOCK_TIMEOUT", 10);
        let spawn_timing = env_bool("CC_SPAWN_TIMING", false);

        Self {
            workers,
            blocking_workers,
            spawn_queue_cap,
            blocking_queue_cap,
            task_queue_size,
            task_pool_size,
            runtime_backend,
            deadlock_detect,
            deadlock_abort,
            deadlock_timeout: Duration::from_secs(deadlock_timeout_secs as u64),
            spawn_timing,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            blocking_workers: num_cpus::get().max(4),
            spawn_queue_cap: 4096,
            blocking_queue_cap: 4096,
            task_queue_size: 1024,
            task_pool_size: 256,
            runtime_backend: RuntimeBackend::Executor,
            deadlock_detect: true,
            deadlock_abort: false,
            deadlock_timeout: Duration::from_secs(10),
            spawn_timing: false,
        }
    }
}
