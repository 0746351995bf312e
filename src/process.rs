//! Process Control Block (PCB) backing each fiber the scheduler runs.
//!
//! Every [`crate::task::Task`] that runs as a fiber is represented by a
//! [`ProcessControlBlock`]. It tracks identity, scheduling state, priority,
//! an optional human-readable name, and a simple mailbox for inter-fiber
//! messaging distinct from the typed channels in [`crate::channel`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

// ---------------------------------------------------------------------------
// ProcessId
// ---------------------------------------------------------------------------

/// Monotonically increasing counter used to mint unique [`ProcessId`]s.
static NEXT_PROCESS_ID: AtomicU64 = AtomicU64::new(1);

/// A unique, opaque identifier for a runtime process.
///
/// Process IDs are assigned sequentially from a global atomic counter and are
/// guaranteed to be unique for the lifetime of the program.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(u64);

impl ProcessId {
    /// Allocate the next unique process ID.
    pub fn next() -> Self {
        Self(NEXT_PROCESS_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Return the raw numeric value (useful for logging / tracing).
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessId({})", self.0)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ProcessStatus
// ---------------------------------------------------------------------------

/// The lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Eligible to be scheduled on a worker.
    Ready,
    /// Currently executing on a worker thread.
    Running,
    /// Voluntarily yielded or waiting on I/O / a message.
    Suspended,
    /// Finished successfully.
    Completed,
    /// Terminated with an error.
    Failed,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Ready => write!(f, "Ready"),
            ProcessStatus::Running => write!(f, "Running"),
            ProcessStatus::Suspended => write!(f, "Suspended"),
            ProcessStatus::Completed => write!(f, "Completed"),
            ProcessStatus::Failed => write!(f, "Failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A simple message type for inter-process communication.
///
/// For now this wraps an opaque JSON value; future iterations will use a
/// zero-copy representation aligned with the VM's `Value` type.
#[derive(Debug, Clone)]
pub struct Message {
    pub payload: serde_json::Value,
}

impl Message {
    pub fn new(payload: serde_json::Value) -> Self {
        Self { payload }
    }
}

// ---------------------------------------------------------------------------
// ProcessControlBlock
// ---------------------------------------------------------------------------

/// Internal mutable state protected by a [`Mutex`].
struct ProcessInner {
    status: ProcessStatus,
    mailbox: VecDeque<Message>,
}

/// The Process Control Block tracks identity, scheduling metadata, and a
/// mailbox for a single lightweight process.
///
/// Interior mutability is provided via `std::sync::Mutex` so that the PCB
/// can be shared across worker threads without external synchronization.
pub struct ProcessControlBlock {
    /// Unique process identifier.
    id: ProcessId,
    /// Scheduling priority (0 = highest, 255 = lowest).
    priority: u8,
    /// Optional human-readable label for debugging.
    name: Option<String>,
    /// Timestamp of process creation (monotonic).
    created_at: Instant,
    /// Mutable state guarded by a mutex.
    inner: Mutex<ProcessInner>,
}

impl ProcessControlBlock {
    /// Create a new PCB in the [`Ready`](ProcessStatus::Ready) state.
    ///
    /// `priority` follows the convention 0 = highest priority, 255 = lowest.
    pub fn new(priority: u8, name: Option<String>) -> Self {
        Self {
            id: ProcessId::next(),
            priority,
            name,
            created_at: Instant::now(),
            inner: Mutex::new(ProcessInner {
                status: ProcessStatus::Ready,
                mailbox: VecDeque::new(),
            }),
        }
    }

    /// Return this process's unique ID.
    pub fn id(&self) -> ProcessId {
        self.id
    }

    /// Return the scheduling priority.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Return the optional human-readable name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Return the creation timestamp.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    // -- status -----------------------------------------------------------

    /// Read the current status.
    pub fn status(&self) -> ProcessStatus {
        self.inner.lock().unwrap().status
    }

    /// Transition to a new status.
    pub fn set_status(&self, status: ProcessStatus) {
        self.inner.lock().unwrap().status = status;
    }

    // -- mailbox ----------------------------------------------------------

    /// Enqueue a message into this process's mailbox.
    pub fn send_message(&self, msg: Message) {
        self.inner.lock().unwrap().mailbox.push_back(msg);
    }

    /// Dequeue the oldest message, if any.
    pub fn receive_message(&self) -> Option<Message> {
        self.inner.lock().unwrap().mailbox.pop_front()
    }

    /// Number of pending messages in the mailbox.
    pub fn mailbox_len(&self) -> usize {
        self.inner.lock().unwrap().mailbox.len()
    }
}

impl fmt::Debug for ProcessControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("ProcessControlBlock")
            .field("id", &self.id)
            .field("status", &inner.status)
            .field("priority", &self.priority)
            .field("name", &self.name)
            .field("mailbox_len", &inner.mailbox.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
