//! M:N fiber scheduler: N worker threads draining a bounded run-queue with
//! work-stealing.
//!
//! Generalizes `lumen-runtime::scheduler::Scheduler` (global
//! `crossbeam_deque::Injector` + per-worker `Worker`/`Stealer` + random-peer
//! stealing + `thread::park_timeout` backoff) from a fixed "process
//! scheduler" into the spec's fiber scheduler: submission now enforces a
//! configurable queue bound (spec.md's "bounded MPMC run-queue"; the
//! teacher's `Injector` is itself unbounded, so the bound is enforced at
//! `submit` time with a counter check — recorded in DESIGN.md), idle
//! workers park on a [`crate::wake::WakePrimitive`] instead of a fixed
//! `park_timeout`, and every transition updates
//! [`crate::observability::Counters`] so `cc_sched_get_stats` and the
//! deadlock watchdog see live numbers.

use crate::observability::Counters;
use crate::panic_boundary::catch_panic;
use crate::process::{ProcessControlBlock, ProcessId};
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::warn;

use crate::wake::WakePrimitive;

struct FiberTask {
    process_id: Option<ProcessId>,
    work: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl FiberTask {
    fn run(&mut self) -> bool {
        if let Some(work) = self.work.take() {
            let _ = catch_panic(std::panic::AssertUnwindSafe(work));
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// The bounded run-queue is at `CC_TASK_QUEUE_SIZE` capacity.
    QueueFull,
    /// The scheduler has been shut down and no longer accepts work.
    ShuttingDown,
}

struct WorkerHandle {
    _stealer: Stealer<FiberTask>,
    join_handle: JoinHandle<()>,
}

/// The M:N fiber scheduler. `spawn`/`spawn_fn` submit closures that run on
/// one of `worker_count` OS threads, cooperatively multiplexing many more
/// logical fibers than threads.
pub struct Scheduler {
    global_queue: Arc<Injector<FiberTask>>,
    workers: Vec<WorkerHandle>,
    shutdown: Arc<AtomicBool>,
    worker_count: usize,
    queue_capacity: usize,
    queued: Arc<AtomicUsize>,
    wake: Arc<WakePrimitive>,
    counters: Arc<Counters>,
    process_registry: Arc<Mutex<HashMap<ProcessId, Arc<ProcessControlBlock>>>>,
}

fn xorshift32(state: &mut u32) -> u32 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    *state = x;
    x
}

impl Scheduler {
    /// Create a scheduler with `num_workers` worker threads (defaults to
    /// `num_cpus::get().max(1)` when `0`) and a run-queue bounded at
    /// `queue_capacity` submitted-but-not-yet-taken tasks.
    pub fn new(num_workers: usize, queue_capacity: usize) -> Self {
        Self::with_counters(num_workers, queue_capacity, Counters::new())
    }

    pub fn with_counters(num_workers: usize, queue_capacity: usize, counters: Arc<Counters>) -> Self {
        let worker_count = if num_workers == 0 {
            num_cpus::get().max(1)
        } else {
            num_workers
        };

        let global_queue = Arc::new(Injector::<FiberTask>::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let queued = Arc::new(AtomicUsize::new(0));
        let wake = Arc::new(WakePrimitive::new());
        let process_registry = Arc::new(Mutex::new(HashMap::new()));

        let local_workers: Vec<Worker<FiberTask>> =
            (0..worker_count).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<FiberTask>> =
            local_workers.iter().map(|w| w.stealer()).collect();

        let mut workers = Vec::with_capacity(worker_count);
        for (idx, local) in local_workers.into_iter().enumerate() {
            let global = Arc::clone(&global_queue);
            let shutdown = Arc::clone(&shutdown);
            let queued = Arc::clone(&queued);
            let wake = Arc::clone(&wake);
            let counters = Arc::clone(&counters);
            let stealers = stealers.clone();
            let seed = (idx as u32).wrapping_mul(2654435761).wrapping_add(1);

            let join_handle = thread::Builder::new()
                .name(format!("ccrt-fiber-worker-{idx}"))
                .spawn(move || {
                    worker_loop(idx, local, global, stealers, shutdown, queued, wake, counters, seed);
                })
                .expect("failed to spawn fiber worker thread");

            workers.push(WorkerHandle {
                _stealer: stealers[idx].clone(),
                join_handle,
            });
        }

        Self {
            global_queue,
            workers,
            shutdown,
            worker_count,
            queue_capacity: queue_capacity.max(1),
            queued,
            wake,
            counters,
            process_registry,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn counters(&self) -> Arc<Counters> {
        Arc::clone(&self.counters)
    }

    pub fn stats(&self) -> crate::observability::SchedulerStats {
        let mut stats = self.counters.snapshot();
        stats.queued = self.queued.load(Ordering::Relaxed) as i64;
        stats
    }

    /// Submit a closure for execution. Returns `QueueFull` once `queued`
    /// reaches the configured `queue_capacity` — spec.md's Open Question on
    /// submit-failure policy is resolved as: surface via both a `tracing`
    /// warning and this return value, never silently drop.
    pub fn spawn_fn<F>(&self, work: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SubmitError::ShuttingDown);
        }
        if self.queued.load(Ordering::Relaxed) >= self.queue_capacity {
            warn!(capacity = self.queue_capacity, "fiber scheduler run-queue full, rejecting submit");
            self.counters.pending.fetch_add(1, Ordering::Relaxed);
            return Err(SubmitError::QueueFull);
        }
        self.queued.fetch_add(1, Ordering::Relaxed);
        self.global_queue.push(FiberTask {
            process_id: None,
            work: Some(Box::new(work)),
        });
        self.wake.wake_one();
        Ok(())
    }

    /// Spawn work tracked by a [`ProcessControlBlock`], transitioning it
    /// Ready -> Running -> Completed as it executes.
    pub fn spawn_process<F>(&self, priority: u8, name: Option<String>, work: F) -> Result<ProcessId, SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        let pcb = Arc::new(ProcessControlBlock::new(priority, name));
        let id = pcb.id();
        self.process_registry.lock().insert(id, Arc::clone(&pcb));

        let queued = Arc::clone(&self.queued);
        if self.shutdown.load(Ordering::Acquire) {
            return Err(SubmitError::ShuttingDown);
        }
        if self.queued.load(Ordering::Relaxed) >= self.queue_capacity {
            warn!(capacity = self.queue_capacity, "fiber scheduler run-queue full, rejecting spawn_process");
            self.counters.pending.fetch_add(1, Ordering::Relaxed);
            return Err(SubmitError::QueueFull);
        }
        self.queued.fetch_add(1, Ordering::Relaxed);

        // `active`/`completed` are tracked once, uniformly, in `worker_loop`
        // around every `FiberTask::run` — this wrapper only owns the PCB's
        // own status transitions so a `spawn_process` task isn't counted
        // twice against a `spawn_fn` task.
        let wrapped = move || {
            pcb.set_status(crate::process::ProcessStatus::Running);
            let result = catch_panic(std::panic::AssertUnwindSafe(|| work()));
            pcb.set_status(match result {
                Ok(()) => crate::process::ProcessStatus::Completed,
                Err(_) => crate::process::ProcessStatus::Failed,
            });
            let _ = queued; // keep capture alive for symmetry with spawn_fn's accounting
        };

        self.global_queue.push(FiberTask {
            process_id: Some(id),
            work: Some(Box::new(wrapped)),
        });
        self.wake.wake_one();
        Ok(id)
    }

    pub fn get_process(&self, id: ProcessId) -> Option<Arc<ProcessControlBlock>> {
        self.process_registry.lock().get(&id).cloned()
    }

    pub fn process_count(&self) -> usize {
        self.process_registry.lock().len()
    }

    /// Poll until `expected` processes reach a terminal status or `timeout`
    /// elapses. Returns `true` if `expected` was reached.
    pub fn wait_for_completion(&self, expected: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let done = self
                .process_registry
                .lock()
                .values()
                .filter(|pcb| {
                    matches!(
                        pcb.status(),
                        crate::process::ProcessStatus::Completed
                            | crate::process::ProcessStatus::Failed
                    )
                })
                .count();
            if done >= expected {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Two-phase shutdown: flip the stop flag, wake every parked worker, and
    /// join all worker threads.
    pub fn shutdown(&mut self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wake.wake_all();
        for w in self.workers.drain(..) {
            let _ = w.join_handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    idx: usize,
    local: Worker<FiberTask>,
    global: Arc<Injector<FiberTask>>,
    stealers: Vec<Stealer<FiberTask>>,
    shutdown: Arc<AtomicBool>,
    queued: Arc<AtomicUsize>,
    wake: Arc<WakePrimitive>,
    counters: Arc<Counters>,
    mut rng_state: u32,
) {
    if rng_state == 0 {
        rng_state = 0x9e3779b9;
    }

    loop {
        if let Some(mut task) = find_task(&local, &global, &stealers, idx, &mut rng_state) {
            queued.fetch_sub(1, Ordering::Relaxed);
            counters.active.fetch_add(1, Ordering::Relaxed);
            task.run();
            counters.active.fetch_sub(1, Ordering::Relaxed);
            counters.completed.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        if shutdown.load(Ordering::Acquire) {
            return;
        }

        let seq = wake.sequence();
        if find_task(&local, &global, &stealers, idx, &mut rng_state).is_some() {
            continue;
        }
        if shutdown.load(Ordering::Acquire) {
            return;
        }
        wake.wait_until(seq, Instant::now() + Duration::from_millis(5));
    }
}

fn find_task(
    local: &Worker<FiberTask>,
    global: &Injector<FiberTask>,
    stealers: &[Stealer<FiberTask>],
    idx: usize,
    rng_state: &mut u32,
) -> Option<FiberTask> {
    if let Some(task) = local.pop() {
        return Some(task);
    }

    loop {
        match global.steal_batch_and_pop(local) {
            Steal::Success(task) => return Some(task),
            Steal::Retry => continue,
            Steal::Empty => break,
        }
    }

    if !stealers.is_empty() {
        let start = xorshift32(rng_state) as usize % stealers.len();
        for offset in 0..stealers.len() {
            let peer = (start + offset) % stealers.len();
            if peer == idx {
                continue;
            }
            loop {
                match stealers[peer].steal_batch_and_pop(local) {
                    Steal::Success(task) => return Some(task),
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }
    }

    None
}
