//! The unified `Task` value and its blocking combinators.
//!
//! spec.md §4.9 asks for one tagged value covering four ways work can be
//! represented — an eagerly-driven future-style thunk, a pollable, a
//! pool-submitted job, and a cooperatively-scheduled fiber body — plus
//! uniform combinators (`block`, `block_all`, `block_race`, `block_any`,
//! `cancel`) that work the same regardless of which variant a `Task` holds.
//!
//! The completion signal for `Spawn`/`Fiber` tasks is a rendezvous
//! `crate::channel` pair (one value, then closed) rather than a bespoke
//! oneshot type — this is the same "per-call slot" idea `nursery.rs` and
//! `channel.rs` already use, reused instead of inventing a fourth. The
//! fan-out combinators (`block_all`/`block_race`/`block_any`) spawn one OS
//! thread per subtask, mirroring `lumen-rt::services::nursery`'s
//! spawn-a-thread-per-child shape, but collect into an indexed result
//! buffer instead of delegating to `Nursery::wait_all` — the combinators
//! need ordered/partial results and differing success rules per spec.md §9
//! Open Questions, which `Nursery`'s fail-fast join doesn't expose.

use crate::deadline::Deadline;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum TaskError {
    #[error("task cancelled")]
    Cancelled,
    #[error("task deadline expired")]
    Timeout,
    #[error("task panicked: {0}")]
    Panicked(String),
    #[error("task failed: {0}")]
    Failed(String),
}

/// A unit of work in one of four shapes. All four resolve to
/// `Result<T, TaskError>` through [`Task::block`].
pub enum Task<T: Send + 'static> {
    /// Runs synchronously on the calling thread the moment it is blocked
    /// on, given the deadline to observe.
    Future(Box<dyn FnOnce(&Deadline) -> Result<T, TaskError> + Send>),
    /// Polled repeatedly (with a short backoff) until it reports done.
    Poll(Box<dyn FnMut(&Deadline) -> Option<Result<T, TaskError>> + Send>),
    /// Submitted to a blocking worker-pool executor; `block` waits for the
    /// pool to run it.
    Spawn(Arc<crate::executor::Executor>, SpawnBody<T>),
    /// Submitted to the cooperative fiber scheduler.
    Fiber(Arc<crate::fiber::Scheduler>, SpawnBody<T>),
}

pub type SpawnBody<T> = Box<dyn FnOnce() -> Result<T, TaskError> + Send>;

impl<T: Send + 'static> Task<T> {
    pub fn future<F>(f: F) -> Self
    where
        F: FnOnce(&Deadline) -> Result<T, TaskError> + Send + 'static,
    {
        Task::Future(Box::new(f))
    }

    pub fn poll<F>(f: F) -> Self
    where
        F: FnMut(&Deadline) -> Option<Result<T, TaskError>> + Send + 'static,
    {
        Task::Poll(Box::new(f))
    }

    pub fn spawn<F>(executor: Arc<crate::executor::Executor>, f: F) -> Self
    where
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    {
        Task::Spawn(executor, Box::new(f))
    }

    pub fn fiber<F>(scheduler: Arc<crate::fiber::Scheduler>, f: F) -> Self
    where
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    {
        Task::Fiber(scheduler, Box::new(f))
    }

    /// Block the calling thread until this task resolves, is cancelled via
    /// `deadline`, or `deadline` expires.
    pub fn block(self, deadline: &Deadline) -> Result<T, TaskError> {
        match self {
            Task::Future(f) => f(deadline),
            Task::Poll(mut f) => loop {
                if deadline.is_cancelled() {
                    return Err(TaskError::Cancelled);
                }
                if deadline.expired() {
                    return Err(TaskError::Timeout);
                }
                if let Some(result) = f(deadline) {
                    return result;
                }
                thread::sleep(Duration::from_millis(1));
            },
            Task::Spawn(executor, work) => block_via_channel(
                |done| {
                    let _ = executor.submit(move || {
                        let _ = done(work());
                    });
                },
                deadline,
            ),
            Task::Fiber(scheduler, work) => block_via_channel(
                |done| {
                    let _ = scheduler.spawn_fn(move || {
                        let _ = done(work());
                    });
                },
                deadline,
            ),
        }
    }
}

fn block_via_channel<T, S>(submit: S, deadline: &Deadline) -> Result<T, TaskError>
where
    T: Send + 'static,
    S: FnOnce(Box<dyn FnOnce(Result<T, TaskError>) + Send>),
{
    let (tx, rx) = crate::channel::pair_create::<Result<T, TaskError>>(
        0,
        crate::channel::OverflowMode::Block,
        crate::channel::Topology::OneToOne,
    );
    submit(Box::new(move |result| {
        let _ = tx.send(result, &Deadline::none());
    }));
    match rx.recv(deadline) {
        Ok(result) => result,
        Err(crate::channel::RecvError::Cancelled) => Err(TaskError::Cancelled),
        Err(crate::channel::RecvError::Timeout) => Err(TaskError::Timeout),
        Err(crate::channel::RecvError::Closed) => {
            Err(TaskError::Failed("task channel closed with no result".into()))
        }
    }
}

/// Block on every task, cancelling the rest the moment one fails. Returns
/// results in input order.
pub fn block_all<T: Send + 'static>(
    tasks: Vec<Task<T>>,
    deadline: &Deadline,
) -> Result<Vec<T>, TaskError> {
    let n = tasks.len();
    let results: Arc<Mutex<Vec<Option<Result<T, TaskError>>>>> =
        Arc::new(Mutex::new((0..n).map(|_| None).collect()));
    let shared_deadline = deadline.cancel_only_snapshot();

    let handles: Vec<_> = tasks
        .into_iter()
        .enumerate()
        .map(|(idx, task)| {
            let results = Arc::clone(&results);
            let per_task_deadline = shared_deadline.cancel_only_snapshot();
            thread::spawn(move || {
                let result = task.block(&per_task_deadline);
                let failed = result.is_err();
                results.lock().unwrap()[idx] = Some(result);
                failed
            })
        })
        .collect();

    for h in handles {
        if h.join().unwrap_or(true) {
            shared_deadline.cancel();
        }
    }

    let mut out = Vec::with_capacity(n);
    let mut first_err = None;
    for slot in Arc::try_unwrap(results).unwrap().into_inner().unwrap() {
        match slot {
            Some(Ok(v)) => out.push(v),
            Some(Err(e)) => {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
            None => {
                if first_err.is_none() {
                    first_err = Some(TaskError::Cancelled);
                }
            }
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(out),
    }
}

/// Block until the first task resolves (success or failure), cancelling
/// the rest.
pub fn block_race<T: Send + 'static>(tasks: Vec<Task<T>>, deadline: &Deadline) -> Result<T, TaskError> {
    let (tx, rx) = crate::channel::pair_create::<Result<T, TaskError>>(
        tasks.len().max(1),
        crate::channel::OverflowMode::Block,
        crate::channel::Topology::ManyToOne,
    );
    let shared_deadline = deadline.cancel_only_snapshot();

    let handles: Vec<_> = tasks
        .into_iter()
        .map(|task| {
            let tx = tx.clone();
            let per_task_deadline = shared_deadline.cancel_only_snapshot();
            thread::spawn(move || {
                let result = task.block(&per_task_deadline);
                let _ = tx.send(result, &Deadline::none());
            })
        })
        .collect();
    drop(tx);

    let first = rx.recv(deadline);
    shared_deadline.cancel();
    for h in handles {
        let _ = h.join();
    }

    match first {
        Ok(result) => result,
        Err(crate::channel::RecvError::Cancelled) => Err(TaskError::Cancelled),
        Err(crate::channel::RecvError::Timeout) => Err(TaskError::Timeout),
        Err(crate::channel::RecvError::Closed) => {
            Err(TaskError::Failed("no task reported a result".into()))
        }
    }
}

/// Block until the first task *succeeds*. Resolves to `Cancelled` only
/// once every task has failed (Open Question resolution, recorded in
/// DESIGN.md) — a single failing task among still-running siblings is not
/// itself an error.
pub fn block_any<T: Send + 'static>(tasks: Vec<Task<T>>, deadline: &Deadline) -> Result<T, TaskError> {
    let n = tasks.len();
    if n == 0 {
        return Err(TaskError::Cancelled);
    }
    let (tx, rx) = crate::channel::pair_create::<Result<T, TaskError>>(
        n,
        crate::channel::OverflowMode::Block,
        crate::channel::Topology::ManyToOne,
    );
    let shared_deadline = deadline.cancel_only_snapshot();

    let handles: Vec<_> = tasks
        .into_iter()
        .map(|task| {
            let tx = tx.clone();
            let per_task_deadline = shared_deadline.cancel_only_snapshot();
            thread::spawn(move || {
                let result = task.block(&per_task_deadline);
                let _ = tx.send(result, &Deadline::none());
            })
        })
        .collect();
    drop(tx);

    let mut failures = 0;
    let mut last_error = TaskError::Cancelled;
    let outcome = loop {
        match rx.recv(deadline) {
            Ok(Ok(value)) => break Ok(value),
            Ok(Err(e)) => {
                failures += 1;
                last_error = e;
                if failures >= n {
                    break Err(last_error.clone());
                }
            }
            Err(_) => break Err(last_error),
        }
    };

    shared_deadline.cancel();
    for h in handles {
        let _ = h.join();
    }
    outcome
}

/// Cancel a task tree sharing `deadline` — a thin alias for
/// `Deadline::cancel`, kept as a named combinator so call sites read
/// `task::cancel(&deadline)` alongside the `block_*` family.
pub fn cancel(deadline: &Deadline) {
    deadline.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn future_task_runs_synchronously_on_block() {
        let task: Task<i32> = Task::future(|_| Ok(42));
        assert_eq!(task.block(&Deadline::none()).unwrap(), 42);
    }

    #[test]
    fn poll_task_resolves_once_ready() {
        let mut calls = 0;
        let task: Task<i32> = Task::poll(move |_| {
            calls += 1;
            if calls >= 3 {
                Some(Ok(7))
            } else {
                None
            }
        });
        assert_eq!(task.block(&Deadline::none()).unwrap(), 7);
    }

    #[test]
    fn spawn_task_runs_on_executor() {
        let executor = Arc::new(crate::executor::Executor::new(2, 16));
        let task: Task<i32> = Task::spawn(Arc::clone(&executor), || Ok(10));
        assert_eq!(task.block(&Deadline::none()).unwrap(), 10);
    }

    #[test]
    fn fiber_task_runs_on_scheduler() {
        let scheduler = Arc::new(crate::fiber::Scheduler::new(2, 64));
        let task: Task<i32> = Task::fiber(Arc::clone(&scheduler), || Ok(11));
        assert_eq!(task.block(&Deadline::none()).unwrap(), 11);
    }

    #[test]
    fn block_all_collects_results_in_order() {
        let tasks: Vec<Task<i32>> = (0..5).map(|i| Task::future(move |_| Ok(i))).collect();
        let results = block_all(tasks, &Deadline::none()).unwrap();
        assert_eq!(results, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn block_all_fails_on_first_failure() {
        let tasks: Vec<Task<i32>> = vec![
            Task::future(|_| Ok(1)),
            Task::future(|_| Err(TaskError::Failed("nope".into()))),
            Task::poll(|deadline| {
                if deadline.is_cancelled() {
                    Some(Ok(99))
                } else {
                    None
                }
            }),
        ];
        let result = block_all(tasks, &Deadline::none());
        assert!(result.is_err());
    }

    #[test]
    fn block_race_returns_first_completion() {
        let tasks: Vec<Task<i32>> = vec![
            Task::future(|_| {
                thread::sleep(Duration::from_millis(50));
                Ok(1)
            }),
            Task::future(|_| Ok(2)),
        ];
        let result = block_race(tasks, &Deadline::none()).unwrap();
        assert_eq!(result, 2);
    }

    #[test]
    fn block_any_succeeds_despite_some_failures() {
        let tasks: Vec<Task<i32>> = vec![
            Task::future(|_| Err(TaskError::Failed("a".into()))),
            Task::future(|_| {
                thread::sleep(Duration::from_millis(10));
                Ok(5)
            }),
        ];
        let result = block_any(tasks, &Deadline::none()).unwrap();
        assert_eq!(result, 5);
    }

    #[test]
    fn block_any_fails_only_when_all_fail() {
        let tasks: Vec<Task<i32>> = vec![
            Task::future(|_| Err(TaskError::Failed("a".into()))),
            Task::future(|_| Err(TaskError::Failed("b".into()))),
        ];
        let result = block_any(tasks, &Deadline::none());
        assert!(result.is_err());
    }

    #[test]
    fn cancel_marks_deadline_cancelled() {
        let deadline = Deadline::none();
        cancel(&deadline);
        assert!(deadline.is_cancelled());
    }

    #[test]
    fn block_honors_pre_cancelled_deadline_for_poll_tasks() {
        let deadline = Deadline::none();
        deadline.cancel();
        let task: Task<i32> = Task::poll(|_| None);
        assert!(matches!(task.block(&deadline), Err(TaskError::Cancelled)));
    }
}
