//! Scheduler-wide counters and the deadlock-heuristic watchdog.
//!
//! Generalizes the atomic bookkeeping already present in
//! `lumen-runtime::scheduler::Scheduler` (`completed_count`) and
//! `lumen-rt::services::sync_scheduler` (`completed_count`,
//! `pending_local_tasks`, `pending_injected_tasks`) into the single counter
//! set spec.md §4.4/§6 names: `active`, `sleeping`, `parked`, `queued`,
//! `pending`, `completed`. Sync channels and the nursery/task blocking
//! combinators report into `parked`/`pending` so `cc_sched_get_stats` and the
//! watchdog both see the same numbers (spec.md §8 scenario S5).

use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::warn;

/// Snapshot of scheduler-wide activity, returned by `cc_sched_get_stats`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SchedulerStats {
    pub active: i64,
    pub sleeping: i64,
    pub parked: i64,
    pub queued: i64,
    pub pending: i64,
    pub completed: u64,
}

/// Process-wide scheduler counters. One instance is shared by the fiber
/// scheduler, channels, and the task combinators.
#[derive(Default)]
pub struct Counters {
    pub active: AtomicI64,
    pub sleeping: AtomicI64,
    pub parked: AtomicI64,
    pub queued: AtomicI64,
    pub pending: AtomicI64,
    pub completed: AtomicU64,
}

impl Counters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            active: self.active.load(Ordering::Relaxed),
            sleeping: self.sleeping.load(Ordering::Relaxed),
            parked: self.parked.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }

    pub fn park(&self) {
        self.parked.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpark(&self) {
        self.parked.fetch_sub(1, Ordering::AcqRel);
    }

    /// RAII guard that increments `parked` on creation and decrements it on
    /// drop — used around every blocking suspension point so a panic or
    /// early return can't leave the counter stuck.
    pub fn parked_guard(self: &Arc<Self>) -> ParkedGuard {
        self.park();
        ParkedGuard {
            counters: Arc::clone(self),
        }
    }
}

/// Drop guard pairing a [`Counters::park`] with a guaranteed
/// [`Counters::unpark`].
pub struct ParkedGuard {
    counters: Arc<Counters>,
}

impl Drop for ParkedGuard {
    fn drop(&mut self) {
        self.counters.unpark();
    }
}

/// Per-thread block reason, used by the deadlock watchdog's structured
/// diagnostic dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlockReason {
    ChanSend,
    ChanRecv,
    TaskWait,
    Mutex,
}

/// Registry of which threads are currently blocked and why. The watchdog
/// reads this to name per-thread block reasons in its diagnostic.
pub struct BlockRegistry {
    inner: parking_lot::Mutex<std::collections::HashMap<std::thread::ThreadId, BlockReason>>,
}

impl BlockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: parking_lot::Mutex::new(std::collections::HashMap::new()),
        })
    }

    pub fn enter(&self, reason: BlockReason) {
        self.inner.lock().insert(thread::current().id(), reason);
    }

    pub fn exit(&self) {
        self.inner.lock().remove(&thread::current().id());
    }

    fn snapshot(&self) -> Vec<(std::thread::ThreadId, BlockReason)> {
        self.inner.lock().iter().map(|(k, v)| (*k, *v)).collect()
    }
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self {
            inner: parking_lot::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeadlockDiagnostic {
    pub stats: SchedulerStats,
    pub blocked_threads: Vec<String>,
}

/// Background watchdog implementing spec.md §4.7's deadlock heuristic:
/// fires when `parked > 0 && queued == 0 && active == 0` and the counters
/// haven't advanced for `timeout`.
pub struct Watchdog {
    handle: Option<JoinHandle<()>>,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
}

impl Watchdog {
    /// Spawn the watchdog thread. `abort` controls whether a detected
    /// deadlock terminates the process with exit code 124 (spec.md §6/§7) or
    /// only logs the diagnostic.
    pub fn spawn(
        counters: Arc<Counters>,
        registry: Arc<BlockRegistry>,
        timeout: Duration,
        abort: bool,
    ) -> Self {
        let shutdown = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let shutdown_clone = Arc::clone(&shutdown);

        let handle = thread::Builder::new()
            .name("ccrt-deadlock-watchdog".into())
            .spawn(move || {
                let mut last_completed = 0u64;
                let mut stalled_since: Option<Instant> = None;
                let mut already_reported = false;

                loop {
                    thread::sleep(Duration::from_millis(200));
                    if shutdown_clone.load(Ordering::Acquire) {
                        return;
                    }

                    let stats = counters.snapshot();
                    let suspicious = stats.parked > 0 && stats.queued == 0 && stats.active == 0;
                    let progressed = stats.completed != last_completed;
                    last_completed = stats.completed;

                    if progressed {
                        stalled_since = None;
                        already_reported = false;
                        continue;
                    }

                    if !suspicious {
                        stalled_since = None;
                        continue;
                    }

                    let since = *stalled_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= timeout && !already_reported {
                        let blocked = registry
                            .snapshot()
                            .into_iter()
                            .map(|(id, reason)| format!("{:?}: {:?}", id, reason))
                            .collect::<Vec<_>>();
                        let diagnostic = DeadlockDiagnostic {
                            stats,
                            blocked_threads: blocked,
                        };
                        warn!(diagnostic = ?serde_json::to_string(&diagnostic).unwrap_or_default(), "deadlock watchdog: no progress with parked waiters");
                        already_reported = true;
                        if abort {
                            std::process::exit(124);
                        }
                    }
                }
            })
            .expect("failed to spawn deadlock watchdog thread");

        Self {
            handle: Some(handle),
            shutdown,
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_snapshot_reflects_updates() {
        let counters = Counters::new();
        counters.active.fetch_add(2, Ordering::Relaxed);
        counters.park();
        counters.completed.fetch_add(5, Ordering::Relaxed);

        let snap = counters.snapshot();
        assert_eq!(snap.active, 2);
        assert_eq!(snap.parked, 1);
        assert_eq!(snap.completed, 5);
    }

    #[test]
    fn parked_guard_decrements_on_drop() {
        let counters = Counters::new();
        {
            let _g = counters.parked_guard();
            assert_eq!(counters.snapshot().parked, 1);
        }
        assert_eq!(counters.snapshot().parked, 0);
    }

    #[test]
    fn block_registry_tracks_current_thread() {
        let registry = BlockRegistry::new();
        registry.enter(BlockReason::ChanRecv);
        let snap = registry.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].1, BlockReason::ChanRecv);
        registry.exit();
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn watchdog_reports_on_stalled_parked_work() {
        let counters = Counters::new();
        let registry = BlockRegistry::new();
        counters.park();
        counters.park();
        registry.enter(BlockReason::ChanRecv);

        let _watchdog = Watchdog::spawn(
            Arc::clone(&counters),
            Arc::clone(&registry),
            Duration::from_millis(50),
            false,
        );

        std::thread::sleep(Duration::from_millis(400));
        // No panic / abort means the non-aborting path was exercised; the
        // diagnostic is asserted indirectly (log-based) since this test runs
        // without a tracing subscriber installed.
    }
}
