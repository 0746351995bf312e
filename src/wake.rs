//! Single-word wake primitive shared by the scheduler, channels, and nursery.
//!
//! A [`WakePrimitive`] decouples "something changed" from any particular
//! lock: a waiter reads a sequence counter, checks its condition, and only
//! parks if nothing has changed since. `wake_one`/`wake_all` bump the
//! sequence first (release) and only pay for an OS wake if someone is
//! actually parked.
//!
//! This has no direct counterpart in the teacher crate — `lumen-runtime`
//! blocks via `crossbeam_channel`'s internal parking and
//! `other_examples/.../worker_pool-native.rs`'s per-entry `Condvar`. This
//! module generalizes that Condvar-per-entry idea into the bare
//! `{sequence, waiters}` primitive so `channel.rs` and `nursery.rs` can share
//! one parking strategy instead of inventing one per blocking op.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// A futex-style wake primitive: a monotonically increasing sequence number
/// plus a parking list. Waiters re-check their condition on every wake —
/// spurious wakes are expected and harmless.
pub struct WakePrimitive {
    sequence: AtomicU32,
    waiters: AtomicU32,
    gate: Mutex<()>,
    condvar: Condvar,
}

/// Outcome of a timed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// The sequence changed (or a spurious wake occurred) before the
    /// deadline. The caller must re-check its condition.
    Woken,
    /// The deadline elapsed with no signal observed.
    TimedOut,
}

impl WakePrimitive {
    pub fn new() -> Self {
        Self {
            sequence: AtomicU32::new(0),
            waiters: AtomicU32::new(0),
            gate: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Snapshot the current sequence number. Callers should read this,
    /// check their condition, and pass the snapshot to [`wait`](Self::wait)
    /// if they decide to block.
    pub fn sequence(&self) -> u32 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Block until the sequence differs from `expected`, or a spurious
    /// wake occurs. Callers must re-check their condition after returning —
    /// this may return without any real change.
    pub fn wait(&self, expected: u32) {
        if self.sequence.load(Ordering::Acquire) != expected {
            return;
        }
        self.waiters.fetch_add(1, Ordering::AcqRel);
        {
            let mut guard = self.gate.lock();
            if self.sequence.load(Ordering::Acquire) == expected {
                self.condvar.wait(&mut guard);
            }
        }
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }

    /// Like [`wait`](Self::wait), but returns [`WaitResult::TimedOut`] if
    /// `deadline` elapses first.
    pub fn wait_until(&self, expected: u32, deadline: Instant) -> WaitResult {
        if self.sequence.load(Ordering::Acquire) != expected {
            return WaitResult::Woken;
        }
        let now = Instant::now();
        if now >= deadline {
            return WaitResult::TimedOut;
        }
        self.waiters.fetch_add(1, Ordering::AcqRel);
        let result = {
            let mut guard = self.gate.lock();
            if self.sequence.load(Ordering::Acquire) == expected {
                let timeout = deadline.saturating_duration_since(Instant::now());
                let wait_result = self.condvar.wait_for(&mut guard, timeout);
                if wait_result.timed_out() {
                    WaitResult::TimedOut
                } else {
                    WaitResult::Woken
                }
            } else {
                WaitResult::Woken
            }
        };
        self.waiters.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// Bump the sequence and wake exactly one parked waiter, if any.
    pub fn wake_one(&self) {
        self.sequence.fetch_add(1, Ordering::Release);
        if self.waiters.load(Ordering::Acquire) > 0 {
            let _guard = self.gate.lock();
            self.condvar.notify_one();
        }
    }

    /// Bump the sequence and wake every parked waiter.
    pub fn wake_all(&self) {
        self.sequence.fetch_add(1, Ordering::Release);
        if self.waiters.load(Ordering::Acquire) > 0 {
            let _guard = self.gate.lock();
            self.condvar.notify_all();
        }
    }

    /// Current number of parked waiters. Used by the deadlock watchdog.
    pub fn parked_count(&self) -> u32 {
        self.waiters.load(Ordering::Acquire)
    }
}

impl Default for WakePrimitive {
    fn default() -> Self {
        Self::new()
    }
}

/// Block the current thread for up to `timeout`, busy-spinning briefly
/// first. Used by suspension points that want a short low-latency path
/// before committing to an OS wait — mirrors the multi-phase strategy in
/// spec.md's wake primitive section.
pub fn spin_then_park<F: Fn() -> bool>(wake: &WakePrimitive, mut condition: F, timeout: Option<Duration>) -> bool {
    const SPIN_ITERS: u32 = 64;
    for _ in 0..SPIN_ITERS {
        if condition() {
            return true;
        }
        std::hint::spin_loop();
    }
    let deadline = timeout.map(|d| Instant::now() + d);
    loop {
        if condition() {
            return true;
        }
        let seq = wake.sequence();
        if condition() {
            return true;
        }
        match deadline {
            Some(dl) => {
                if wake.wait_until(seq, dl) == WaitResult::TimedOut {
                    return condition();
                }
            }
            None => wake.wait(seq),
        }
    }
}
