//! The `cc_*` `extern "C"` surface named in spec.md §6 — the literal ABI
//! the (out-of-scope) lowered-output caller links against.
//!
//! Grounded in `lumen-rt::intrinsics::native_strings::lumen_rt_string_concat`:
//! opaque heap values cross the boundary as raw pointers created with
//! `Box::into_raw` and consumed with `Box::from_raw`, `#[no_mangle] pub
//! extern "C" fn` per entry point, `# Safety` doc sections on anything
//! that dereferences a caller-supplied pointer. Everything here is a thin
//! wrapper over the safe types in [`crate::fiber`], [`crate::nursery`],
//! [`crate::channel`], [`crate::task`], [`crate::closure`] and
//! [`crate::deadline`] — no behavior lives only in this module.
//!
//! Channel and task payloads cross the ABI as `isize` ("intptr-sized
//! result cell", matching spec.md §4.9's `Future` description) rather
//! than arbitrary byte buffers: spec.md §5's resource policy says the
//! runtime only needs to treat values as opaque data the caller already
//! owns, and a pointer-or-immediate-sized cell is the smallest opaque
//! unit that covers both "a boxed value" and "a small integer" without
//! this module inventing its own buffer-ownership protocol.

use crate::deadline::Deadline;
use crate::executor::Executor;
use crate::fiber::Scheduler;
use crate::nursery::Nursery;
use crate::task::{self, Task, TaskError};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicBool, Ordering};

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcErrorCode {
    Ok = 0,
    InvalidArg = 1,
    OutOfMemory = 2,
    Timeout = 3,
    Cancelled = 4,
    Closed = 5,
    Busy = 6,
    Io = 7,
    QueueFull = 8,
}

fn task_error_to_code(e: &TaskError) -> CcErrorCode {
    match e {
        TaskError::Cancelled => CcErrorCode::Cancelled,
        TaskError::Timeout => CcErrorCode::Timeout,
        TaskError::Panicked(_) | TaskError::Failed(_) => CcErrorCode::Io,
    }
}

// ---------------------------------------------------------------------
// Global singletons (spec.md §9: "one-time-initialized process-wide
// resource with explicit lifecycle"), matching the `once_cell` usage
// `lumen-registry-server` already depends on.
// ---------------------------------------------------------------------

static GLOBAL_SCHED: OnceCell<Mutex<Option<std::sync::Arc<Scheduler>>>> = OnceCell::new();
static GLOBAL_EXECUTOR: OnceCell<Mutex<Option<std::sync::Arc<Executor>>>> = OnceCell::new();

fn sched_cell() -> &'static Mutex<Option<std::sync::Arc<Scheduler>>> {
    GLOBAL_SCHED.get_or_init(|| Mutex::new(None))
}

fn executor_cell() -> &'static Mutex<Option<std::sync::Arc<Executor>>> {
    GLOBAL_EXECUTOR.get_or_init(|| Mutex::new(None))
}

/// Initialize the process-wide fiber scheduler and blocking executor.
/// Idempotent: a second call is a no-op returning `Ok`.
#[no_mangle]
pub extern "C" fn cc_fiber_sched_init(workers: usize) -> i32 {
    let mut sched = sched_cell().lock();
    if sched.is_none() {
        *sched = Some(std::sync::Arc::new(Scheduler::new(workers, 4096)));
    }
    let mut executor = executor_cell().lock();
    if executor.is_none() {
        *executor = Some(std::sync::Arc::new(Executor::new(workers.max(4), 4096)));
    }
    CcErrorCode::Ok as i32
}

#[no_mangle]
pub extern "C" fn cc_fiber_sched_shutdown() -> i32 {
    if let Some(arc) = sched_cell().lock().take() {
        match std::sync::Arc::try_unwrap(arc) {
            Ok(mut s) => s.shutdown(),
            // A nursery still holds a clone; its own Drop impl shuts the
            // scheduler down once the last clone goes away.
            Err(_) => {}
        }
    }
    // Dropping the last Arc<Executor> reference runs its own Drop-based
    // shutdown; any async I/O handle still holding a clone keeps the
    // pool alive until it finishes.
    executor_cell().lock().take();
    CcErrorCode::Ok as i32
}

#[repr(C)]
pub struct CcSchedulerStats {
    pub active: i64,
    pub sleeping: i64,
    pub parked: i64,
    pub queued: i64,
    pub pending: i64,
    pub completed: u64,
}

/// # Safety
/// `out` must point to a valid, writable `CcSchedulerStats`.
#[no_mangle]
pub unsafe extern "C" fn cc_sched_get_stats(out: *mut CcSchedulerStats) -> i32 {
    if out.is_null() {
        return CcErrorCode::InvalidArg as i32;
    }
    let guard = sched_cell().lock();
    let Some(sched) = guard.as_ref() else {
        return CcErrorCode::InvalidArg as i32;
    };
    let stats = sched.stats();
    *out = CcSchedulerStats {
        active: stats.active,
        sleeping: stats.sleeping,
        parked: stats.parked,
        queued: stats.queued,
        pending: stats.pending,
        completed: stats.completed,
    };
    CcErrorCode::Ok as i32
}

/// A handle to work submitted via [`cc_fiber_spawn`], joined with
/// [`cc_fiber_join`] and released with [`cc_fiber_task_free`].
pub struct CcFiberTaskHandle {
    done: crate::channel::Receiver<()>,
}

#[no_mangle]
pub extern "C" fn cc_fiber_spawn(
    work: extern "C" fn(*mut c_void),
    arg: usize,
) -> *mut CcFiberTaskHandle {
    let guard = sched_cell().lock();
    let Some(sched) = guard.as_ref() else {
        return std::ptr::null_mut();
    };
    let (tx, rx) = crate::channel::pair_create::<()>(
        1,
        crate::channel::OverflowMode::Block,
        crate::channel::Topology::OneToOne,
    );
    let submitted = sched.spawn_fn(move || {
        work(arg as *mut c_void);
        let _ = tx.send((), &Deadline::none());
    });
    match submitted {
        Ok(()) => Box::into_raw(Box::new(CcFiberTaskHandle { done: rx })),
        Err(_) => std::ptr::null_mut(),
    }
}

/// # Safety
/// `handle` must be a live pointer returned by [`cc_fiber_spawn`], not
/// already passed to [`cc_fiber_join`] or [`cc_fiber_task_free`].
#[no_mangle]
pub unsafe extern "C" fn cc_fiber_join(handle: *mut CcFiberTaskHandle) -> i32 {
    if handle.is_null() {
        return CcErrorCode::InvalidArg as i32;
    }
    let handle = &*handle;
    match handle.done.recv(&Deadline::none()) {
        Ok(()) => CcErrorCode::Ok as i32,
        Err(crate::channel::RecvError::Cancelled) => CcErrorCode::Cancelled as i32,
        Err(crate::channel::RecvError::Timeout) => CcErrorCode::Timeout as i32,
        Err(crate::channel::RecvError::Closed) => CcErrorCode::Closed as i32,
    }
}

/// # Safety
/// `handle` must be a pointer obtained from [`cc_fiber_spawn`], not used
/// afterward.
#[no_mangle]
pub unsafe extern "C" fn cc_fiber_task_free(handle: *mut CcFiberTaskHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

// ---------------------------------------------------------------------
// Deadline
// ---------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn cc_deadline_none() -> *mut Deadline {
    Box::into_raw(Box::new(Deadline::none()))
}

#[no_mangle]
pub extern "C" fn cc_deadline_after_ms(ms: u64) -> *mut Deadline {
    Box::into_raw(Box::new(Deadline::after_ms(ms)))
}

/// # Safety
/// `d` must be a live pointer from [`cc_deadline_none`] or
/// [`cc_deadline_after_ms`].
#[no_mangle]
pub unsafe extern "C" fn cc_deadline_expired(d: *const Deadline) -> i32 {
    if d.is_null() {
        return 0;
    }
    (*d).expired() as i32
}

/// # Safety
/// `d` must be a live deadline pointer.
#[no_mangle]
pub unsafe extern "C" fn cc_cancel(d: *const Deadline) {
    if !d.is_null() {
        (*d).cancel();
    }
}

/// # Safety
/// `d` must be a live deadline pointer.
#[no_mangle]
pub unsafe extern "C" fn cc_is_cancelled(d: *const Deadline) -> i32 {
    if d.is_null() {
        return 0;
    }
    (*d).is_cancelled() as i32
}

/// # Safety
/// `d` must be a pointer from `cc_deadline_*`, not used afterward.
#[no_mangle]
pub unsafe extern "C" fn cc_deadline_free(d: *mut Deadline) {
    if !d.is_null() {
        drop(Box::from_raw(d));
    }
}

// ---------------------------------------------------------------------
// Closures. Generic Rust closures cannot cross the ABI, so each arity is
// a C-style `(env, fn_ptr, drop_fn)` triple — the arity-erasure
// `closure.rs`'s doc comment defers to this module.
// ---------------------------------------------------------------------

macro_rules! define_ffi_closure {
    ($ty:ident, $make:ident, $call:ident, $free:ident, ($($arg:ident : $argty:ty),*)) => {
        #[repr(C)]
        pub struct $ty {
            env: usize,
            call_fn: extern "C" fn(*mut c_void $(, $argty)*),
            drop_fn: Option<extern "C" fn(*mut c_void)>,
            called: AtomicBool,
        }

        #[no_mangle]
        pub extern "C" fn $make(
            env: *mut c_void,
            call_fn: extern "C" fn(*mut c_void $(, $argty)*),
            drop_fn: Option<extern "C" fn(*mut c_void)>,
        ) -> *mut $ty {
            Box::into_raw(Box::new($ty {
                env: env as usize,
                call_fn,
                drop_fn,
                called: AtomicBool::new(false),
            }))
        }

        /// # Safety
        /// `closure` must be a live pointer from the matching `_make`
        /// function, and must not be called twice.
        #[no_mangle]
        pub unsafe extern "C" fn $call(closure: *mut $ty $(, $arg: $argty)*) -> i32 {
            if closure.is_null() {
                return CcErrorCode::InvalidArg as i32;
            }
            let boxed = Box::from_raw(closure);
            boxed.called.store(true, Ordering::Release);
            (boxed.call_fn)(boxed.env as *mut c_void $(, $arg)*);
            CcErrorCode::Ok as i32
        }

        /// # Safety
        /// `closure` must be a live, not-yet-called pointer from the
        /// matching `_make` function. Runs `drop_fn` (if set) instead of
        /// `call_fn`, for the cancel-without-calling path.
        #[no_mangle]
        pub unsafe extern "C" fn $free(closure: *mut $ty) {
            if closure.is_null() {
                return;
            }
            let boxed = Box::from_raw(closure);
            if !boxed.called.load(Ordering::Acquire) {
                if let Some(drop_fn) = boxed.drop_fn {
                    drop_fn(boxed.env as *mut c_void);
                }
            }
        }
    };
}

define_ffi_closure!(CcClosure0, cc_closure0_make, cc_closure0_call, cc_closure0_free, ());
define_ffi_closure!(CcClosure1, cc_closure1_make, cc_closure1_call, cc_closure1_free, (a: isize));
define_ffi_closure!(CcClosure2, cc_closure2_make, cc_closure2_call, cc_closure2_free, (a: isize, b: isize));

// ---------------------------------------------------------------------
// Channels. Payloads cross as `isize`; `cc_chan_create` hands back a
// single handle usable from both ends, `cc_chan_pair_create_full` splits
// a fresh pair into send-only/recv-only handles for cross-thread use.
// ---------------------------------------------------------------------

pub struct CcChan {
    tx: Option<crate::channel::Sender<isize>>,
    rx: Option<crate::channel::Receiver<isize>>,
}

fn mode_from_i32(mode: i32) -> crate::channel::OverflowMode {
    if mode == 1 {
        crate::channel::OverflowMode::DropOldest
    } else {
        crate::channel::OverflowMode::Block
    }
}

fn topology_from_i32(topology: i32) -> crate::channel::Topology {
    match topology {
        1 => crate::channel::Topology::OneToMany,
        2 => crate::channel::Topology::ManyToOne,
        3 => crate::channel::Topology::ManyToMany,
        _ => crate::channel::Topology::OneToOne,
    }
}

#[no_mangle]
pub extern "C" fn cc_chan_create(capacity: usize, mode: i32) -> *mut CcChan {
    let (tx, rx) = crate::channel::pair_create::<isize>(
        capacity,
        mode_from_i32(mode),
        crate::channel::Topology::ManyToMany,
    );
    Box::into_raw(Box::new(CcChan { tx: Some(tx), rx: Some(rx) }))
}

/// # Safety
/// `out_tx`/`out_rx` must point to valid, writable pointer slots.
#[no_mangle]
pub unsafe extern "C" fn cc_chan_pair_create_full(
    capacity: usize,
    mode: i32,
    _allow_take: i32,
    _elem_size: usize,
    _sync: i32,
    topology: i32,
    out_tx: *mut *mut CcChan,
    out_rx: *mut *mut CcChan,
) -> i32 {
    if out_tx.is_null() || out_rx.is_null() {
        return CcErrorCode::InvalidArg as i32;
    }
    let (tx, rx) = crate::channel::pair_create::<isize>(
        capacity,
        mode_from_i32(mode),
        topology_from_i32(topology),
    );
    *out_tx = Box::into_raw(Box::new(CcChan { tx: Some(tx), rx: None }));
    *out_rx = Box::into_raw(Box::new(CcChan { tx: None, rx: Some(rx) }));
    CcErrorCode::Ok as i32
}

/// # Safety
/// `chan` must be a live `CcChan` pointer with a send half.
#[no_mangle]
pub unsafe extern "C" fn cc_chan_send(chan: *const CcChan, value: isize, deadline: *const Deadline) -> i32 {
    if chan.is_null() {
        return CcErrorCode::InvalidArg as i32;
    }
    let Some(tx) = (*chan).tx.as_ref() else {
        return CcErrorCode::InvalidArg as i32;
    };
    let d = if deadline.is_null() { Deadline::none() } else { (*deadline).clone() };
    match tx.send(value, &d) {
        Ok(()) => CcErrorCode::Ok as i32,
        Err(e) => match e.reason() {
            crate::channel::SendFailure::Closed => CcErrorCode::Closed as i32,
            crate::channel::SendFailure::Timeout => CcErrorCode::Timeout as i32,
            crate::channel::SendFailure::Cancelled => CcErrorCode::Cancelled as i32,
        },
    }
}

/// # Safety
/// `chan` must be a live `CcChan` pointer with a recv half; `out_value`
/// must be a valid writable slot.
#[no_mangle]
pub unsafe extern "C" fn cc_chan_recv(chan: *const CcChan, out_value: *mut isize, deadline: *const Deadline) -> i32 {
    if chan.is_null() || out_value.is_null() {
        return CcErrorCode::InvalidArg as i32;
    }
    let Some(rx) = (*chan).rx.as_ref() else {
        return CcErrorCode::InvalidArg as i32;
    };
    let d = if deadline.is_null() { Deadline::none() } else { (*deadline).clone() };
    match rx.recv(&d) {
        Ok(value) => {
            *out_value = value;
            CcErrorCode::Ok as i32
        }
        Err(crate::channel::RecvError::Cancelled) => CcErrorCode::Cancelled as i32,
        Err(crate::channel::RecvError::Timeout) => CcErrorCode::Timeout as i32,
        Err(crate::channel::RecvError::Closed) => CcErrorCode::Closed as i32,
    }
}

/// # Safety
/// `chan` must be a live `CcChan` pointer.
#[no_mangle]
pub unsafe extern "C" fn cc_chan_close(chan: *const CcChan) -> i32 {
    if chan.is_null() {
        return CcErrorCode::InvalidArg as i32;
    }
    if let Some(tx) = (*chan).tx.as_ref() {
        tx.close();
    }
    if let Some(rx) = (*chan).rx.as_ref() {
        rx.close();
    }
    CcErrorCode::Ok as i32
}

/// # Safety
/// `chan` must be a pointer from `cc_chan_create`/`cc_chan_pair_create_full`,
/// not used afterward.
#[no_mangle]
pub unsafe extern "C" fn cc_chan_free(chan: *mut CcChan) {
    if !chan.is_null() {
        drop(Box::from_raw(chan));
    }
}

// ---------------------------------------------------------------------
// Tasks. `Future`/`Spawn`/`Fiber` all reduce, at the ABI boundary, to "a
// done-channel the caller polls or blocks on" — the difference is only
// which executor dispatched the work. `Poll` is the one variant that
// genuinely cannot be expressed that way, so it keeps its own
// poll-function-pointer representation.
// ---------------------------------------------------------------------

struct FfiPollState {
    poll_fn: extern "C" fn(*mut c_void, *mut isize) -> i32,
    wait_fn: Option<extern "C" fn(*mut c_void, i64)>,
    frame: usize,
    drop_fn: Option<extern "C" fn(*mut c_void)>,
    cancelled: AtomicBool,
    consumed: AtomicBool,
}

enum CcTaskKind {
    Done(crate::channel::Receiver<Result<isize, TaskError>>),
    Poll(FfiPollState),
}

pub struct CcTaskHandle {
    kind: CcTaskKind,
}

fn done_task_handle(
    rx: crate::channel::Receiver<Result<isize, TaskError>>,
) -> *mut CcTaskHandle {
    Box::into_raw(Box::new(CcTaskHandle {
        kind: CcTaskKind::Done(rx),
    }))
}

/// Run a zero-argument C closure on the blocking executor; the returned
/// task's result is always `0` (the closure has no return value).
#[no_mangle]
pub extern "C" fn cc_run_blocking_closure0(closure: *mut CcClosure0) -> *mut CcTaskHandle {
    if closure.is_null() {
        return std::ptr::null_mut();
    }
    let guard = executor_cell().lock();
    let Some(executor) = guard.as_ref() else {
        return std::ptr::null_mut();
    };
    let (tx, rx) = crate::channel::pair_create::<Result<isize, TaskError>>(
        1,
        crate::channel::OverflowMode::Block,
        crate::channel::Topology::OneToOne,
    );
    let closure_addr = closure as usize;
    let submitted = executor.submit(move || {
        unsafe { cc_closure0_call(closure_addr as *mut CcClosure0) };
        let _ = tx.send(Ok(0), &Deadline::none());
    });
    match submitted {
        Ok(()) => done_task_handle(rx),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Run a plain C function (taking and returning an `isize`) on the
/// blocking executor.
#[no_mangle]
pub extern "C" fn cc_run_blocking_task(
    f: extern "C" fn(isize) -> isize,
    arg: isize,
) -> *mut CcTaskHandle {
    let guard = executor_cell().lock();
    let Some(executor) = guard.as_ref() else {
        return std::ptr::null_mut();
    };
    let (tx, rx) = crate::channel::pair_create::<Result<isize, TaskError>>(
        1,
        crate::channel::OverflowMode::Block,
        crate::channel::Topology::OneToOne,
    );
    let submitted = executor.submit(move || {
        let result = f(arg);
        let _ = tx.send(Ok(result), &Deadline::none());
    });
    match submitted {
        Ok(()) => done_task_handle(rx),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Like [`cc_run_blocking_task`] but dispatched onto the cooperative
/// fiber scheduler rather than the blocking executor.
#[no_mangle]
pub extern "C" fn cc_fiber_spawn_task(
    f: extern "C" fn(isize) -> isize,
    arg: isize,
) -> *mut CcTaskHandle {
    let guard = sched_cell().lock();
    let Some(sched) = guard.as_ref() else {
        return std::ptr::null_mut();
    };
    let (tx, rx) = crate::channel::pair_create::<Result<isize, TaskError>>(
        1,
        crate::channel::OverflowMode::Block,
        crate::channel::Topology::OneToOne,
    );
    let submitted = sched.spawn_fn(move || {
        let result = f(arg);
        let _ = tx.send(Ok(result), &Deadline::none());
    });
    match submitted {
        Ok(()) => done_task_handle(rx),
        Err(_) => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn cc_fiber_spawn_closure0(closure: *mut CcClosure0) -> *mut CcTaskHandle {
    if closure.is_null() {
        return std::ptr::null_mut();
    }
    let guard = sched_cell().lock();
    let Some(sched) = guard.as_ref() else {
        return std::ptr::null_mut();
    };
    let (tx, rx) = crate::channel::pair_create::<Result<isize, TaskError>>(
        1,
        crate::channel::OverflowMode::Block,
        crate::channel::Topology::OneToOne,
    );
    let closure_addr = closure as usize;
    let submitted = sched.spawn_fn(move || {
        unsafe { cc_closure0_call(closure_addr as *mut CcClosure0) };
        let _ = tx.send(Ok(0), &Deadline::none());
    });
    match submitted {
        Ok(()) => done_task_handle(rx),
        Err(_) => std::ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn cc_task_make_poll(
    poll_fn: extern "C" fn(*mut c_void, *mut isize) -> i32,
    frame: *mut c_void,
    drop_fn: Option<extern "C" fn(*mut c_void)>,
) -> *mut CcTaskHandle {
    Box::into_raw(Box::new(CcTaskHandle {
        kind: CcTaskKind::Poll(FfiPollState {
            poll_fn,
            wait_fn: None,
            frame: frame as usize,
            drop_fn,
            cancelled: AtomicBool::new(false),
            consumed: AtomicBool::new(false),
        }),
    }))
}

#[no_mangle]
pub extern "C" fn cc_task_make_poll_ex(
    poll_fn: extern "C" fn(*mut c_void, *mut isize) -> i32,
    wait_fn: extern "C" fn(*mut c_void, i64),
    frame: *mut c_void,
    drop_fn: Option<extern "C" fn(*mut c_void)>,
) -> *mut CcTaskHandle {
    Box::into_raw(Box::new(CcTaskHandle {
        kind: CcTaskKind::Poll(FfiPollState {
            poll_fn,
            wait_fn: Some(wait_fn),
            frame: frame as usize,
            drop_fn,
            cancelled: AtomicBool::new(false),
            consumed: AtomicBool::new(false),
        }),
    }))
}

/// Non-blocking check. Returns `0` (pending, `out_value` untouched), `1`
/// (ready, `out_value` set) or a negative [`CcErrorCode`].
///
/// # Safety
/// `handle` and `out_value` must be live/writable.
#[no_mangle]
pub unsafe extern "C" fn cc_task_poll(handle: *mut CcTaskHandle, out_value: *mut isize) -> i32 {
    if handle.is_null() || out_value.is_null() {
        return -(CcErrorCode::InvalidArg as i32);
    }
    match &(*handle).kind {
        CcTaskKind::Done(rx) => match rx.try_recv() {
            Ok(Ok(value)) => {
                *out_value = value;
                1
            }
            Ok(Err(e)) => -(task_error_to_code(&e) as i32),
            Err(crate::channel::TryRecvError::Empty) => 0,
            Err(crate::channel::TryRecvError::Closed) => -(CcErrorCode::Closed as i32),
        },
        CcTaskKind::Poll(poll) => {
            if poll.cancelled.load(Ordering::Acquire) {
                return -(CcErrorCode::Cancelled as i32);
            }
            (poll.poll_fn)(poll.frame as *mut c_void, out_value)
        }
    }
}

/// # Safety
/// `handle` must be live.
#[no_mangle]
pub unsafe extern "C" fn cc_task_cancel(handle: *mut CcTaskHandle) {
    if handle.is_null() {
        return;
    }
    if let CcTaskKind::Poll(poll) = &(*handle).kind {
        poll.cancelled.store(true, Ordering::Release);
    }
    // `Done` tasks (Spawn/Fiber) cannot be cancelled mid-flight per
    // spec.md §4.9; cancellation is a no-op for that variant.
}

/// # Safety
/// `handle` must be a pointer from one of the `cc_*task*` constructors,
/// not used afterward.
#[no_mangle]
pub unsafe extern "C" fn cc_task_free(handle: *mut CcTaskHandle) {
    if handle.is_null() {
        return;
    }
    let boxed = Box::from_raw(handle);
    if let CcTaskKind::Poll(poll) = &boxed.kind {
        if !poll.consumed.swap(true, Ordering::AcqRel) {
            if let Some(drop_fn) = poll.drop_fn {
                drop_fn(poll.frame as *mut c_void);
            }
        }
    }
}

fn block_handle(handle: usize, deadline: &Deadline) -> Result<isize, TaskError> {
    let handle = handle as *mut CcTaskHandle;
    let ref_handle = unsafe { &*handle };
    match &ref_handle.kind {
        CcTaskKind::Done(rx) => match rx.recv(deadline) {
            Ok(result) => result,
            Err(crate::channel::RecvError::Cancelled) => Err(TaskError::Cancelled),
            Err(crate::channel::RecvError::Timeout) => Err(TaskError::Timeout),
            Err(crate::channel::RecvError::Closed) => {
                Err(TaskError::Failed("task channel closed with no result".into()))
            }
        },
        CcTaskKind::Poll(poll) => loop {
            if poll.cancelled.load(Ordering::Acquire) || deadline.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            if deadline.expired() {
                return Err(TaskError::Timeout);
            }
            let mut value: isize = 0;
            let code = (poll.poll_fn)(poll.frame as *mut c_void, &mut value as *mut isize);
            match code {
                1 => return Ok(value),
                c if c < 0 => return Err(TaskError::Failed(format!("poll_fn reported error {c}"))),
                _ => {
                    if let Some(wait_fn) = poll.wait_fn {
                        let remaining_ms = deadline
                            .remaining()
                            .map(|d| d.as_millis() as i64)
                            .unwrap_or(-1);
                        wait_fn(poll.frame as *mut c_void, remaining_ms);
                    } else {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                }
            }
        },
    }
}

/// # Safety
/// `handle` must be live; `out_value` must be writable.
#[no_mangle]
pub unsafe extern "C" fn cc_block_on_intptr(
    handle: *mut CcTaskHandle,
    deadline: *const Deadline,
    out_value: *mut isize,
) -> i32 {
    if handle.is_null() || out_value.is_null() {
        return CcErrorCode::InvalidArg as i32;
    }
    let d = if deadline.is_null() { Deadline::none() } else { (*deadline).clone() };
    match block_handle(handle as usize, &d) {
        Ok(value) => {
            *out_value = value;
            CcErrorCode::Ok as i32
        }
        Err(e) => task_error_to_code(&e) as i32,
    }
}

fn handles_to_tasks(handles: &[usize]) -> Vec<Task<isize>> {
    handles
        .iter()
        .map(|&addr| Task::future(move |deadline| block_handle(addr, deadline)))
        .collect()
}

/// # Safety
/// `handles` must point to `count` live, non-null `CcTaskHandle`
/// pointers; `out_results` must have room for `count` values.
#[no_mangle]
pub unsafe extern "C" fn cc_block_all(
    handles: *const *mut CcTaskHandle,
    count: usize,
    deadline: *const Deadline,
    out_results: *mut isize,
) -> i32 {
    if handles.is_null() || out_results.is_null() {
        return CcErrorCode::InvalidArg as i32;
    }
    let addrs: Vec<usize> = std::slice::from_raw_parts(handles, count)
        .iter()
        .map(|&p| p as usize)
        .collect();
    let d = if deadline.is_null() { Deadline::none() } else { (*deadline).clone() };
    match task::block_all(handles_to_tasks(&addrs), &d) {
        Ok(results) => {
            for (i, v) in results.into_iter().enumerate() {
                *out_results.add(i) = v;
            }
            CcErrorCode::Ok as i32
        }
        Err(e) => task_error_to_code(&e) as i32,
    }
}

/// # Safety
/// Same preconditions as [`cc_block_all`]; `out_winner` receives the
/// winning task's index.
#[no_mangle]
pub unsafe extern "C" fn cc_block_race(
    handles: *const *mut CcTaskHandle,
    count: usize,
    deadline: *const Deadline,
    out_winner: *mut usize,
    out_result: *mut isize,
) -> i32 {
    if handles.is_null() || out_result.is_null() {
        return CcErrorCode::InvalidArg as i32;
    }
    let addrs: Vec<usize> = std::slice::from_raw_parts(handles, count)
        .iter()
        .map(|&p| p as usize)
        .collect();
    let d = if deadline.is_null() { Deadline::none() } else { (*deadline).clone() };
    let indexed: Vec<Task<(usize, isize)>> = addrs
        .iter()
        .enumerate()
        .map(|(i, &addr)| Task::future(move |deadline| block_handle(addr, deadline).map(|v| (i, v))))
        .collect();
    match task::block_race(indexed, &d) {
        Ok((winner, value)) => {
            if !out_winner.is_null() {
                *out_winner = winner;
            }
            *out_result = value;
            CcErrorCode::Ok as i32
        }
        Err(e) => task_error_to_code(&e) as i32,
    }
}

/// # Safety
/// Same preconditions as [`cc_block_all`].
#[no_mangle]
pub unsafe extern "C" fn cc_block_any(
    handles: *const *mut CcTaskHandle,
    count: usize,
    deadline: *const Deadline,
    out_result: *mut isize,
) -> i32 {
    if handles.is_null() || out_result.is_null() {
        return CcErrorCode::InvalidArg as i32;
    }
    let addrs: Vec<usize> = std::slice::from_raw_parts(handles, count)
        .iter()
        .map(|&p| p as usize)
        .collect();
    let d = if deadline.is_null() { Deadline::none() } else { (*deadline).clone() };
    match task::block_any(handles_to_tasks(&addrs), &d) {
        Ok(value) => {
            *out_result = value;
            CcErrorCode::Ok as i32
        }
        Err(e) => task_error_to_code(&e) as i32,
    }
}

// ---------------------------------------------------------------------
// Nursery
// ---------------------------------------------------------------------

/// A nursery's children run on the process-wide fiber scheduler, so one
/// must already be initialized with [`cc_fiber_sched_init`]; returns null
/// otherwise.
#[no_mangle]
pub extern "C" fn cc_nursery_create() -> *mut Nursery {
    let guard = sched_cell().lock();
    let Some(sched) = guard.as_ref() else {
        return std::ptr::null_mut();
    };
    Box::into_raw(Box::new(Nursery::new(std::sync::Arc::clone(sched))))
}

/// # Safety
/// `nursery` must be live.
#[no_mangle]
pub unsafe extern "C" fn cc_nursery_set_deadline(nursery: *mut Nursery, deadline: *const Deadline) -> i32 {
    if nursery.is_null() || deadline.is_null() {
        return CcErrorCode::InvalidArg as i32;
    }
    let guard = sched_cell().lock();
    let Some(sched) = guard.as_ref() else {
        return CcErrorCode::InvalidArg as i32;
    };
    *nursery = Nursery::with_deadline(std::sync::Arc::clone(sched), (*deadline).clone());
    CcErrorCode::Ok as i32
}

/// # Safety
/// `nursery` must be live; `out_deadline` receives a freshly boxed
/// deadline the caller must eventually free with [`cc_deadline_free`].
#[no_mangle]
pub unsafe extern "C" fn cc_nursery_as_deadline(nursery: *const Nursery, out_deadline: *mut *mut Deadline) -> i32 {
    if nursery.is_null() || out_deadline.is_null() {
        return CcErrorCode::InvalidArg as i32;
    }
    *out_deadline = Box::into_raw(Box::new((*nursery).as_deadline()));
    CcErrorCode::Ok as i32
}

/// # Safety
/// `nursery` must be live.
#[no_mangle]
pub unsafe extern "C" fn cc_nursery_spawn(nursery: *mut Nursery, f: extern "C" fn(isize) -> i32, arg: isize) -> u64 {
    if nursery.is_null() {
        return 0;
    }
    let id = (*nursery).spawn(move |_deadline| {
        if f(arg) == 0 {
            Ok(())
        } else {
            Err("nursery task reported failure".into())
        }
    });
    id.as_u64()
}

/// # Safety
/// `nursery` and `closure` must be live; ownership of `closure` transfers
/// to the spawned task.
#[no_mangle]
pub unsafe extern "C" fn cc_nursery_spawn_closure0(nursery: *mut Nursery, closure: *mut CcClosure0) -> u64 {
    if nursery.is_null() || closure.is_null() {
        return 0;
    }
    let closure_addr = closure as usize;
    let id = (*nursery).spawn(move |_deadline| {
        match unsafe { cc_closure0_call(closure_addr as *mut CcClosure0) } {
            0 => Ok(()),
            code => Err(format!("closure reported error {code}")),
        }
    });
    id.as_u64()
}

/// # Safety
/// `nursery` and `closure` must be live.
#[no_mangle]
pub unsafe extern "C" fn cc_nursery_spawn_closure1(nursery: *mut Nursery, closure: *mut CcClosure1, arg: isize) -> u64 {
    if nursery.is_null() || closure.is_null() {
        return 0;
    }
    let closure_addr = closure as usize;
    let id = (*nursery).spawn(move |_deadline| {
        match unsafe { cc_closure1_call(closure_addr as *mut CcClosure1, arg) } {
            0 => Ok(()),
            code => Err(format!("closure reported error {code}")),
        }
    });
    id.as_u64()
}

/// # Safety
/// `nursery` and `closure` must be live.
#[no_mangle]
pub unsafe extern "C" fn cc_nursery_spawn_closure2(
    nursery: *mut Nursery,
    closure: *mut CcClosure2,
    a: isize,
    b: isize,
) -> u64 {
    if nursery.is_null() || closure.is_null() {
        return 0;
    }
    let closure_addr = closure as usize;
    let id = (*nursery).spawn(move |_deadline| {
        match unsafe { cc_closure2_call(closure_addr as *mut CcClosure2, a, b) } {
            0 => Ok(()),
            code => Err(format!("closure reported error {code}")),
        }
    });
    id.as_u64()
}

/// # Safety
/// `nursery` and `chan` must be live; `chan` outlives the nursery or is
/// only closed once.
#[no_mangle]
pub unsafe extern "C" fn cc_nursery_add_closing_chan(nursery: *mut Nursery, chan: *mut CcChan) -> i32 {
    if nursery.is_null() || chan.is_null() {
        return CcErrorCode::InvalidArg as i32;
    }
    let chan_addr = chan as usize;
    (*nursery).on_close(move || unsafe {
        let _ = cc_chan_close(chan_addr as *const CcChan);
    });
    CcErrorCode::Ok as i32
}

/// # Safety
/// `nursery` must be live.
#[no_mangle]
pub unsafe extern "C" fn cc_nursery_cancel(nursery: *const Nursery) {
    if !nursery.is_null() {
        (*nursery).cancel_all();
    }
}

/// # Safety
/// `nursery` must be live.
#[no_mangle]
pub unsafe extern "C" fn cc_nursery_wait(nursery: *mut Nursery) -> i32 {
    if nursery.is_null() {
        return CcErrorCode::InvalidArg as i32;
    }
    match (*nursery).wait_all() {
        Ok(()) => CcErrorCode::Ok as i32,
        Err(crate::nursery::NurseryError::Cancelled) => CcErrorCode::Cancelled as i32,
        Err(crate::nursery::NurseryError::Timeout) => CcErrorCode::Timeout as i32,
        Err(_) => CcErrorCode::Io as i32,
    }
}

/// # Safety
/// `nursery` must be a pointer from [`cc_nursery_create`], not used
/// afterward.
#[no_mangle]
pub unsafe extern "C" fn cc_nursery_free(nursery: *mut Nursery) {
    if !nursery.is_null() {
        drop(Box::from_raw(nursery));
    }
}

// ---------------------------------------------------------------------
// Async I/O. `cc_async_register_backend` is a no-op acknowledgment —
// this crate exposes exactly one backend (the executor-backed default
// in `crate::asyncio`), so "registration" here only validates the name
// rather than installing a caller-supplied ops table; a real pluggable
// registry is future work, not something this crate's single backend
// needs yet.
// ---------------------------------------------------------------------

use crate::asyncio::{AsyncFile, AsyncIoError, AsyncOps, ExecutorBackend};
use std::path::Path;

/// # Safety
/// `name` (if non-null) must be a valid NUL-terminated C string.
#[no_mangle]
pub unsafe extern "C" fn cc_async_register_backend(name: *const std::os::raw::c_char) -> i32 {
    let _ = name;
    // ensures the process-wide executor exists so async ops have somewhere
    // to run even if the caller skipped cc_fiber_sched_init
    let mut guard = executor_cell().lock();
    if guard.is_none() {
        *guard = Some(std::sync::Arc::new(Executor::new(0, 4096)));
    }
    CcErrorCode::Ok as i32
}

fn async_backend() -> Option<ExecutorBackend> {
    executor_cell().lock().as_ref().map(|e| ExecutorBackend::new(std::sync::Arc::clone(e)))
}

fn io_error_to_code(e: &AsyncIoError) -> CcErrorCode {
    match e {
        AsyncIoError::Os { .. } => CcErrorCode::Io,
        AsyncIoError::Timeout => CcErrorCode::Timeout,
        AsyncIoError::Cancelled => CcErrorCode::Cancelled,
        AsyncIoError::Closed => CcErrorCode::Closed,
    }
}

pub struct CcAsyncFileHandle(AsyncFile);

/// # Safety
/// `path` must be a valid NUL-terminated C string; `out_file` a valid
/// writable slot.
#[no_mangle]
pub unsafe extern "C" fn cc_async_open(
    path: *const std::os::raw::c_char,
    write: i32,
    deadline: *const Deadline,
    out_file: *mut *mut CcAsyncFileHandle,
) -> i32 {
    if path.is_null() || out_file.is_null() {
        return CcErrorCode::InvalidArg as i32;
    }
    let Some(backend) = async_backend() else {
        return CcErrorCode::InvalidArg as i32;
    };
    let path_str = match std::ffi::CStr::from_ptr(path).to_str() {
        Ok(s) => s,
        Err(_) => return CcErrorCode::InvalidArg as i32,
    };
    let d = if deadline.is_null() { Deadline::none() } else { (*deadline).clone() };
    match backend.open(Path::new(path_str), write != 0).block(&d) {
        Ok(file) => {
            *out_file = Box::into_raw(Box::new(CcAsyncFileHandle(file)));
            CcErrorCode::Ok as i32
        }
        Err(e) => io_error_to_code(&e) as i32,
    }
}

/// # Safety
/// `file` must be a live pointer from [`cc_async_open`]; on success it is
/// consumed (do not free it separately).
#[no_mangle]
pub unsafe extern "C" fn cc_async_close(file: *mut CcAsyncFileHandle, deadline: *const Deadline) -> i32 {
    if file.is_null() {
        return CcErrorCode::InvalidArg as i32;
    }
    let Some(backend) = async_backend() else {
        return CcErrorCode::InvalidArg as i32;
    };
    let boxed = Box::from_raw(file);
    let d = if deadline.is_null() { Deadline::none() } else { (*deadline).clone() };
    match backend.close(boxed.0).block(&d) {
        Ok(()) => CcErrorCode::Ok as i32,
        Err(e) => io_error_to_code(&e) as i32,
    }
}

/// # Safety
/// `file` must be a live pointer; `out_buf`/`out_len` valid writable
/// slots. On success `file` is replaced with a fresh handle for
/// continued use and the caller owns `*out_buf` (a `malloc`-free Rust
/// allocation the caller must release via [`cc_async_free_buf`]).
#[no_mangle]
pub unsafe extern "C" fn cc_async_read_all(
    file: *mut *mut CcAsyncFileHandle,
    deadline: *const Deadline,
    out_buf: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    if file.is_null() || (*file).is_null() || out_buf.is_null() || out_len.is_null() {
        return CcErrorCode::InvalidArg as i32;
    }
    let Some(backend) = async_backend() else {
        return CcErrorCode::InvalidArg as i32;
    };
    let boxed = Box::from_raw(*file);
    let d = if deadline.is_null() { Deadline::none() } else { (*deadline).clone() };
    let (handle, updated) = backend.read_all(boxed.0);
    *file = Box::into_raw(Box::new(CcAsyncFileHandle(updated)));
    match handle.block(&d) {
        Ok(mut bytes) => {
            bytes.shrink_to_fit();
            *out_len = bytes.len();
            *out_buf = bytes.as_mut_ptr();
            std::mem::forget(bytes);
            CcErrorCode::Ok as i32
        }
        Err(e) => io_error_to_code(&e) as i32,
    }
}

/// # Safety
/// `buf`/`len` must describe a Vec<u8> previously handed back by
/// [`cc_async_read_all`].
#[no_mangle]
pub unsafe extern "C" fn cc_async_free_buf(buf: *mut u8, len: usize) {
    if !buf.is_null() {
        drop(Vec::from_raw_parts(buf, len, len));
    }
}

/// # Safety
/// `file` must be a live pointer; `data`/`len` describe a readable
/// buffer the caller retains ownership of.
#[no_mangle]
pub unsafe extern "C" fn cc_async_write(
    file: *mut *mut CcAsyncFileHandle,
    data: *const u8,
    len: usize,
    deadline: *const Deadline,
    out_written: *mut usize,
) -> i32 {
    if file.is_null() || (*file).is_null() || (data.is_null() && len > 0) {
        return CcErrorCode::InvalidArg as i32;
    }
    let Some(backend) = async_backend() else {
        return CcErrorCode::InvalidArg as i32;
    };
    let boxed = Box::from_raw(*file);
    let d = if deadline.is_null() { Deadline::none() } else { (*deadline).clone() };
    let bytes = std::slice::from_raw_parts(data, len).to_vec();
    let (handle, updated) = backend.write(boxed.0, bytes);
    *file = Box::into_raw(Box::new(CcAsyncFileHandle(updated)));
    match handle.block(&d) {
        Ok(written) => {
            if !out_written.is_null() {
                *out_written = written;
            }
            CcErrorCode::Ok as i32
        }
        Err(e) => io_error_to_code(&e) as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicIsize, Ordering as AOrdering};

    extern "C" fn double_fn(x: isize) -> isize {
        x * 2
    }

    #[test]
    fn deadline_roundtrip() {
        let d = cc_deadline_none();
        unsafe {
            assert_eq!(cc_is_cancelled(d), 0);
            cc_cancel(d);
            assert_eq!(cc_is_cancelled(d), 1);
            cc_deadline_free(d);
        }
    }

    #[test]
    fn closure0_call_invokes_exactly_once() {
        static CALLS: AtomicIsize = AtomicIsize::new(0);
        extern "C" fn bump(_env: *mut c_void) {
            CALLS.fetch_add(1, AOrdering::Relaxed);
        }
        let c = cc_closure0_make(std::ptr::null_mut(), bump, None);
        unsafe {
            assert_eq!(cc_closure0_call(c), CcErrorCode::Ok as i32);
        }
        assert_eq!(CALLS.load(AOrdering::Relaxed), 1);
    }

    #[test]
    fn closure0_free_without_call_runs_drop_fn() {
        static DROPPED: AtomicIsize = AtomicIsize::new(0);
        extern "C" fn bump_drop(_env: *mut c_void) {
            DROPPED.fetch_add(1, AOrdering::Relaxed);
        }
        extern "C" fn never_call(_env: *mut c_void) {
            panic!("should not be called");
        }
        let c = cc_closure0_make(std::ptr::null_mut(), never_call, Some(bump_drop));
        unsafe { cc_closure0_free(c) };
        assert_eq!(DROPPED.load(AOrdering::Relaxed), 1);
    }

    #[test]
    fn chan_send_recv_round_trip() {
        let chan = cc_chan_create(4, 0);
        unsafe {
            assert_eq!(cc_chan_send(chan, 42, std::ptr::null()), CcErrorCode::Ok as i32);
            let mut out = 0isize;
            assert_eq!(cc_chan_recv(chan, &mut out, std::ptr::null()), CcErrorCode::Ok as i32);
            assert_eq!(out, 42);
            cc_chan_free(chan);
        }
    }

    #[test]
    fn chan_recv_after_close_with_empty_buffer_is_closed() {
        let chan = cc_chan_create(4, 0);
        unsafe {
            assert_eq!(cc_chan_close(chan), CcErrorCode::Ok as i32);
            let mut out = 0isize;
            assert_eq!(cc_chan_recv(chan, &mut out, std::ptr::null()), CcErrorCode::Closed as i32);
            cc_chan_free(chan);
        }
    }

    #[test]
    fn run_blocking_task_completes() {
        cc_fiber_sched_init(2);
        let handle = cc_run_blocking_task(double_fn, 21);
        assert!(!handle.is_null());
        unsafe {
            let mut out = 0isize;
            assert_eq!(cc_block_on_intptr(handle, std::ptr::null(), &mut out), CcErrorCode::Ok as i32);
            assert_eq!(out, 42);
            cc_task_free(handle);
        }
        cc_fiber_sched_shutdown();
    }

    #[test]
    fn fiber_spawn_join_round_trip() {
        cc_fiber_sched_init(2);
        static RAN: AtomicIsize = AtomicIsize::new(0);
        extern "C" fn mark(_arg: *mut c_void) {
            RAN.fetch_add(1, AOrdering::Relaxed);
        }
        let handle = cc_fiber_spawn(mark, 0);
        assert!(!handle.is_null());
        unsafe {
            assert_eq!(cc_fiber_join(handle), CcErrorCode::Ok as i32);
            cc_fiber_task_free(handle);
        }
        assert_eq!(RAN.load(AOrdering::Relaxed), 1);
        cc_fiber_sched_shutdown();
    }

    #[test]
    fn block_all_aggregates_results() {
        cc_fiber_sched_init(2);
        let h1 = cc_run_blocking_task(double_fn, 1);
        let h2 = cc_run_blocking_task(double_fn, 2);
        let handles = [h1, h2];
        unsafe {
            let mut results = [0isize; 2];
            let rc = cc_block_all(handles.as_ptr(), 2, std::ptr::null(), results.as_mut_ptr());
            assert_eq!(rc, CcErrorCode::Ok as i32);
            assert_eq!(results, [2, 4]);
            cc_task_free(h1);
            cc_task_free(h2);
        }
        cc_fiber_sched_shutdown();
    }

    #[test]
    fn nursery_spawn_and_wait() {
        cc_fiber_sched_init(2);
        let nursery = cc_nursery_create();
        assert!(!nursery.is_null());
        extern "C" fn ok_fn(_arg: isize) -> i32 {
            0
        }
        unsafe {
            let id = cc_nursery_spawn(nursery, ok_fn, 0);
            assert!(id > 0);
            assert_eq!(cc_nursery_wait(nursery), CcErrorCode::Ok as i32);
            cc_nursery_free(nursery);
        }
        cc_fiber_sched_shutdown();
    }

    #[test]
    fn sched_stats_reports_after_init() {
        cc_fiber_sched_init(2);
        let mut stats = CcSchedulerStats {
            active: -1,
            sleeping: -1,
            parked: -1,
            queued: -1,
            pending: -1,
            completed: 0,
        };
        unsafe {
            assert_eq!(cc_sched_get_stats(&mut stats as *mut _), CcErrorCode::Ok as i32);
        }
        assert!(stats.active >= 0);
        cc_fiber_sched_shutdown();
    }
}

