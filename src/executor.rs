//! Blocking worker-pool executor backing `Task::Spawn`'s synchronous
//! submission path.
//!
//! Where [`crate::fiber::Scheduler`] generalizes the teacher's
//! work-stealing `Scheduler`, this module is the simpler sibling: a fixed
//! pool of worker threads draining a single bounded [`crate::mpmc::Ring`],
//! with no per-worker local queues or stealing. It is grounded in
//! `lumen-rt::services::sync_scheduler::SyncScheduler`'s round-robin
//! dispatch and two-phase shutdown idea, re-expressed over the hand-rolled
//! ring instead of `VecDeque`s driven by an external `tick()` caller — this
//! executor runs its own threads rather than being stepped cooperatively,
//! matching spec.md §4.3's "blocking worker-pool executor" (as opposed to
//! §4.4's cooperative fiber scheduler).

use crate::observability::Counters;
use crate::panic_boundary::catch_panic;
use crate::wake::WakePrimitive;
use crate::mpmc::Ring;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorSubmitError {
    QueueFull,
    ShuttingDown,
}

/// A fixed-size pool of blocking worker threads draining a bounded MPMC
/// ring.
pub struct Executor {
    ring: Arc<Ring<Job>>,
    wake: Arc<WakePrimitive>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl Executor {
    pub fn new(num_workers: usize, queue_capacity: usize) -> Self {
        Self::with_counters(num_workers, queue_capacity, Counters::new())
    }

    pub fn with_counters(num_workers: usize, queue_capacity: usize, counters: Arc<Counters>) -> Self {
        let worker_count = if num_workers == 0 {
            num_cpus::get().max(1)
        } else {
            num_workers
        };
        let ring = Arc::new(Ring::new(queue_capacity.max(2)));
        let wake = Arc::new(WakePrimitive::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let ring = Arc::clone(&ring);
            let wake = Arc::clone(&wake);
            let shutdown = Arc::clone(&shutdown);
            let counters = Arc::clone(&counters);
            workers.push(
                thread::Builder::new()
                    .name(format!("ccrt-executor-worker-{idx}"))
                    .spawn(move || executor_worker_loop(ring, wake, shutdown, counters))
                    .expect("failed to spawn executor worker thread"),
            );
        }

        Self {
            ring,
            wake,
            shutdown,
            workers,
            counters,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    /// Submit a job for blocking execution on the pool. Returns
    /// `QueueFull` instead of blocking the caller when the ring is at
    /// capacity.
    pub fn submit<F>(&self, job: F) -> Result<(), ExecutorSubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ExecutorSubmitError::ShuttingDown);
        }
        match self.ring.try_push(Box::new(job)) {
            Ok(()) => {
                self.counters.pending.fetch_add(1, Ordering::Relaxed);
                self.wake.wake_one();
                Ok(())
            }
            Err(_) => Err(ExecutorSubmitError::QueueFull),
        }
    }

    pub fn shutdown(&mut self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wake.wake_all();
        for w in self.workers.drain(..) {
            let _ = w.join();
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn executor_worker_loop(
    ring: Arc<Ring<Job>>,
    wake: Arc<WakePrimitive>,
    shutdown: Arc<AtomicBool>,
    counters: Arc<Counters>,
) {
    loop {
        if let Some(job) = ring.try_pop() {
            counters.pending.fetch_sub(1, Ordering::Relaxed);
            counters.active.fetch_add(1, Ordering::Relaxed);
            let _ = catch_panic(std::panic::AssertUnwindSafe(job));
            counters.active.fetch_sub(1, Ordering::Relaxed);
            counters.completed.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        let seq = wake.sequence();
        if !ring.is_empty() {
            continue;
        }
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        wake.wait_until(seq, std::time::Instant::now() + std::time::Duration::from_millis(5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn submit_runs_job() {
        let executor = Executor::new(2, 16);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        executor.submit(move || {
            c.fetch_add(1, Ordering::Relaxed);
        }).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn submit_after_shutdown_rejected() {
        let mut executor = Executor::new(1, 16);
        executor.shutdown();
        assert_eq!(executor.submit(|| {}), Err(ExecutorSubmitError::ShuttingDown));
    }

    #[test]
    fn runs_many_jobs_across_workers() {
        let executor = Executor::new(4, 4096);
        let total = 500usize;
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..total {
            let c = Arc::clone(&counter);
            loop {
                if executor.submit(move || {
                    c.fetch_add(1, Ordering::Relaxed);
                }).is_ok() {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::Relaxed) < total && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::Relaxed), total);
    }

    #[test]
    fn queue_full_is_reported_when_ring_saturated() {
        let executor = Executor::new(0, 2);
        // Can't easily force true saturation deterministically without
        // pausing workers; verify the ring itself rejects beyond capacity.
        let ring: Ring<i32> = Ring::new(2);
        ring.try_push(1).unwrap();
        ring.try_push(2).unwrap();
        assert_eq!(ring.try_push(3), Err(3));
        drop(executor);
    }
}
