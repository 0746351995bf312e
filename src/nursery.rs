//! Structured concurrency scope: spawn children, join them all, propagate
//! cancellation and deadlines, auto-close owned channels on exit.
//!
//! Generalizes `lumen-rt::services::nursery::Nursery` (`CancelToken` +
//! `Vec<NurseryTask>` + `thread::Builder::spawn` + `poll_all` round-robin +
//! drop-cancels-and-joins) by replacing the bare `Arc<AtomicBool>` cancel
//! flag with a full [`crate::deadline::Deadline`] (absolute time and
//! cancellation together) and adding a registry of channel closers so a
//! nursery that created channels for its children closes them on scope
//! exit, matching spec.md §4.7's auto-close requirement.
//!
//! Every child is packaged into a fiber-scheduler task bound to the
//! nursery (spec.md §4.7, §2's `nursery.spawn -> fiber scheduler run-queue
//! -> worker picks task` data flow) rather than given its own OS thread,
//! the same way `task.rs`'s `Task::Fiber` variant hands work to
//! [`crate::fiber::Scheduler`]: a nursery spawning thousands of children
//! multiplexes them over the scheduler's worker pool instead of spawning
//! thousands of threads.

use crate::deadline::Deadline;
use crate::fiber::Scheduler;
use crate::panic_boundary::catch_panic;
use crate::process::ProcessId;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NurseryError {
    #[error("task {task_id} failed: {error}")]
    TaskFailed { task_id: ProcessId, error: String },
    #[error("nursery cancelled")]
    Cancelled,
    #[error("nursery deadline expired before all tasks completed")]
    Timeout,
    #[error("task {task_id} panicked: {message}")]
    TaskPanicked { task_id: ProcessId, message: String },
}

/// The outcome a spawned child reports back over its done-channel, carrying
/// enough detail for `poll_all` to distinguish an ordinary failure from a
/// caught panic without resorting to a string-sentinel convention.
enum ChildResult {
    Ok,
    Failed(String),
    Panicked(String),
}

struct NurseryTask {
    id: ProcessId,
    rx: Option<crate::channel::Receiver<ChildResult>>,
}

/// A closer registered by a child so the nursery can close a channel the
/// child owns when the scope exits, whether the child finished, failed, or
/// was cancelled.
type ChannelCloser = Box<dyn Fn() + Send + 'static>;

/// A structured concurrency scope. Every task spawned through it is joined
/// (or cancelled) before the nursery itself finishes; dropping a nursery
/// early cancels and joins whatever is still outstanding.
pub struct Nursery {
    scheduler: Arc<Scheduler>,
    tasks: Vec<NurseryTask>,
    deadline: Deadline,
    closers: Vec<ChannelCloser>,
}

impl Nursery {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            tasks: Vec::new(),
            deadline: Deadline::none(),
            closers: Vec::new(),
        }
    }

    /// A nursery whose deadline is the intersection (earlier expiry, shared
    /// cancellation) of the caller's deadline and its own.
    pub fn with_deadline(scheduler: Arc<Scheduler>, deadline: Deadline) -> Self {
        Self {
            scheduler,
            tasks: Vec::new(),
            deadline,
            closers: Vec::new(),
        }
    }

    /// The deadline children should observe cooperatively: snapshot it to
    /// hand to spawned work or child nurseries.
    pub fn as_deadline(&self) -> Deadline {
        self.deadline.cancel_only_snapshot()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Register a closer to run when the nursery scope exits (success,
    /// failure, cancellation, or drop) — used to auto-close a channel this
    /// nursery's children share.
    pub fn on_close<F: Fn() + Send + 'static>(&mut self, closer: F) {
        self.closers.push(Box::new(closer));
    }

    /// Spawn a child. `f` receives a deadline that shares this nursery's
    /// cancellation flag. The call is packaged as a fiber-scheduler task
    /// bound to this nursery rather than a dedicated OS thread.
    pub fn spawn<F>(&mut self, f: F) -> ProcessId
    where
        F: FnOnce(Deadline) -> Result<(), String> + Send + 'static,
    {
        let id = ProcessId::next();
        let deadline = self.as_deadline();
        let (tx, rx) = crate::channel::pair_create::<ChildResult>(
            0,
            crate::channel::OverflowMode::Block,
            crate::channel::Topology::OneToOne,
        );
        let report = tx.clone();
        let submitted = self.scheduler.spawn_fn(move || {
            let outcome = match catch_panic(std::panic::AssertUnwindSafe(|| f(deadline))) {
                Ok(Ok(())) => ChildResult::Ok,
                Ok(Err(message)) => ChildResult::Failed(message),
                Err(err) => ChildResult::Panicked(err.message().to_string()),
            };
            let _ = tx.send(outcome, &Deadline::none());
        });
        if let Err(err) = submitted {
            let _ = report.send(
                ChildResult::Failed(format!("fiber scheduler rejected spawn: {err:?}")),
                &Deadline::none(),
            );
        }

        self.tasks.push(NurseryTask { id, rx: Some(rx) });
        id
    }

    pub fn cancel_all(&self) {
        self.deadline.cancel();
    }

    /// Join every outstanding task, canceling and joining the rest as soon
    /// as one fails (spec.md §4.7: "first failure cancels siblings").
    pub fn wait_all(&mut self) -> Result<(), NurseryError> {
        self.poll_all(None)
    }

    pub fn wait_all_timeout(&mut self, timeout: Duration) -> Result<(), NurseryError> {
        self.poll_all(Some(Instant::now() + timeout))
    }

    fn poll_all(&mut self, deadline: Option<Instant>) -> Result<(), NurseryError> {
        loop {
            let mut progressed = false;
            for i in 0..self.tasks.len() {
                let Some(rx) = self.tasks[i].rx.as_ref() else {
                    continue;
                };
                let task_id = self.tasks[i].id;
                match rx.try_recv() {
                    Err(crate::channel::TryRecvError::Empty) => continue,
                    Ok(ChildResult::Ok) => {
                        progressed = true;
                        self.tasks[i].rx = None;
                    }
                    Ok(ChildResult::Failed(error)) => {
                        self.tasks[i].rx = None;
                        self.cancel_all();
                        self.join_remaining();
                        self.run_closers();
                        return Err(NurseryError::TaskFailed { task_id, error });
                    }
                    Ok(ChildResult::Panicked(message)) => {
                        self.tasks[i].rx = None;
                        self.cancel_all();
                        self.join_remaining();
                        self.run_closers();
                        return Err(NurseryError::TaskPanicked { task_id, message });
                    }
                    Err(crate::channel::TryRecvError::Closed) => {
                        self.tasks[i].rx = None;
                        self.cancel_all();
                        self.join_remaining();
                        self.run_closers();
                        return Err(NurseryError::TaskPanicked {
                            task_id,
                            message: "nursery task channel closed without a result".into(),
                        });
                    }
                }
            }

            self.tasks.retain(|t| t.rx.is_some());
            if self.tasks.is_empty() {
                self.run_closers();
                return Ok(());
            }

            if self.deadline.is_cancelled() {
                self.join_remaining();
                self.run_closers();
                return Err(NurseryError::Cancelled);
            }
            if let Some(dl) = deadline {
                if Instant::now() >= dl {
                    self.cancel_all();
                    self.join_remaining();
                    self.run_closers();
                    return Err(NurseryError::Timeout);
                }
            }
            if !progressed {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn join_remaining(&mut self) {
        for task in &mut self.tasks {
            if let Some(rx) = task.rx.take() {
                let _ = rx.recv(&Deadline::none());
            }
        }
        self.tasks.clear();
    }

    fn run_closers(&mut self) {
        for closer in self.closers.drain(..) {
            closer();
        }
    }
}

impl Drop for Nursery {
    fn drop(&mut self) {
        self.cancel_all();
        self.join_remaining();
        self.run_closers();
    }
}

impl std::fmt::Debug for Nursery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nursery")
            .field("task_count", &self.tasks.len())
            .field("cancelled", &self.deadline.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_scheduler() -> Arc<Scheduler> {
        Arc::new(Scheduler::new(4, 256))
    }

    #[test]
    fn basic_spawn_and_wait() {
        let mut nursery = Nursery::new(test_scheduler());
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = Arc::clone(&counter);
            nursery.spawn(move |_| {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(())
            });
        }
        assert!(nursery.wait_all().is_ok());
        assert_eq!(counter.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn failure_cancels_siblings() {
        let mut nursery = Nursery::new(test_scheduler());
        let observed_cancel = Arc::new(AtomicUsize::new(0));
        nursery.spawn(|_| Err("boom".to_string()));
        let o = Arc::clone(&observed_cancel);
        nursery.spawn(move |deadline| {
            for _ in 0..200 {
                if deadline.is_cancelled() {
                    o.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        });
        let result = nursery.wait_all();
        assert!(result.is_err());
        assert_eq!(observed_cancel.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn panic_is_converted_to_task_panicked() {
        let mut nursery = Nursery::new(test_scheduler());
        nursery.spawn(|_| panic!("oops"));
        match nursery.wait_all() {
            Err(NurseryError::TaskPanicked { .. }) => {}
            other => panic!("expected TaskPanicked, got {other:?}"),
        }
    }

    #[test]
    fn explicit_cancel_all_propagates_to_deadline() {
        let mut nursery = Nursery::new(test_scheduler());
        let saw_cancel = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&saw_cancel);
        nursery.spawn(move |deadline| {
            for _ in 0..200 {
                if deadline.is_cancelled() {
                    s.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        });
        thread::sleep(Duration::from_millis(20));
        nursery.cancel_all();
        assert!(nursery.wait_all().is_ok());
        assert_eq!(saw_cancel.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn empty_nursery_waits_immediately() {
        let mut nursery = Nursery::new(test_scheduler());
        assert!(nursery.wait_all().is_ok());
    }

    #[test]
    fn drop_cancels_and_joins_outstanding_tasks() {
        let flag = Arc::new(AtomicUsize::new(0));
        {
            let mut nursery = Nursery::new(test_scheduler());
            let f = Arc::clone(&flag);
            nursery.spawn(move |deadline| {
                for _ in 0..200 {
                    if deadline.is_cancelled() {
                        f.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            });
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(flag.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn wait_all_timeout_cancels_on_expiry() {
        let mut nursery = Nursery::new(test_scheduler());
        nursery.spawn(|deadline| {
            while !deadline.is_cancelled() {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(())
        });
        let result = nursery.wait_all_timeout(Duration::from_millis(30));
        assert!(matches!(result, Err(NurseryError::Timeout)));
    }

    #[test]
    fn on_close_runs_exactly_once_on_success() {
        let mut nursery = Nursery::new(test_scheduler());
        let closed = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&closed);
        nursery.on_close(move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        nursery.spawn(|_| Ok(()));
        nursery.wait_all().unwrap();
        assert_eq!(closed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn on_close_runs_on_failure_path_too() {
        let mut nursery = Nursery::new(test_scheduler());
        let closed = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&closed);
        nursery.on_close(move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        nursery.spawn(|_| Err("fail".to_string()));
        let _ = nursery.wait_all();
        assert_eq!(closed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn as_deadline_shares_cancellation_not_absolute_time() {
        let nursery = Nursery::with_deadline(test_scheduler(), Deadline::after_ms(50_000));
        let child_deadline = nursery.as_deadline();
        assert!(!child_deadline.expired());
        nursery.cancel_all();
        assert!(child_deadline.is_cancelled());
    }

    #[test]
    fn unique_process_ids_per_spawn() {
        let mut nursery = Nursery::new(test_scheduler());
        let a = nursery.spawn(|_| Ok(()));
        let b = nursery.spawn(|_| Ok(()));
        assert_ne!(a, b);
        nursery.wait_all().unwrap();
    }

    #[test]
    fn debug_format_reports_task_count() {
        let mut nursery = Nursery::new(test_scheduler());
        nursery.spawn(|_| Ok(()));
        let dbg = format!("{:?}", nursery);
        assert!(dbg.contains("task_count"));
        nursery.wait_all().unwrap();
    }

    #[test]
    fn many_children_share_the_scheduler_worker_pool() {
        let scheduler = Arc::new(Scheduler::new(2, 4096));
        let mut nursery = Nursery::new(Arc::clone(&scheduler));
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..500 {
            let c = Arc::clone(&counter);
            nursery.spawn(move |_| {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(())
            });
        }
        assert!(nursery.wait_all().is_ok());
        assert_eq!(counter.load(Ordering::Relaxed), 500);
    }
}
