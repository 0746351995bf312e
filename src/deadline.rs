//! Absolute-time deadline plus a cooperative cancellation flag.
//!
//! Grounded in `lumen-rt::services::nursery::CancelToken` (an `Arc<AtomicBool>`
//! shared cooperative signal) — `Deadline` adds the absolute-time half of
//! spec.md §3's `{ absolute_time, cancelled_flag }` data model on top of
//! that same shared-flag shape.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// An absolute deadline plus a cancel flag, shared by value — clones observe
/// the same cancellation but each carries its own absolute time (matching
/// spec.md §3: "Deadlines are values; copies share no [other] state").
#[derive(Clone)]
pub struct Deadline {
    /// Milliseconds since `UNIX_EPOCH`. Zero means "no deadline".
    absolute_ms: u64,
    cancelled: Arc<AtomicBool>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Deadline {
    /// A deadline that never expires on its own (still cancellable).
    pub fn none() -> Self {
        Self {
            absolute_ms: 0,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A deadline `ms` milliseconds from now. `after_ms(0)` is immediately
    /// expired (spec.md §8 property 11).
    pub fn after_ms(ms: u64) -> Self {
        Self {
            absolute_ms: now_ms() + ms,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A deadline at an explicit absolute millisecond timestamp.
    pub fn at_ms(absolute_ms: u64) -> Self {
        Self {
            absolute_ms,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// `true` once cancelled or once `now >= absolute_time` (and the
    /// deadline isn't `none()`). Monotonic: once true, always true
    /// (spec.md §8 property 6).
    pub fn expired(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        self.absolute_ms != 0 && now_ms() >= self.absolute_ms
    }

    /// Set the cancel flag. Idempotent (spec.md §8 property 10).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// `true` iff [`cancel`](Self::cancel) was called on this deadline or any
    /// clone of it.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Remaining time until expiry, or `None` if there is no deadline (or it
    /// has already expired — callers should check [`expired`](Self::expired)
    /// first).
    pub fn remaining(&self) -> Option<Duration> {
        if self.absolute_ms == 0 {
            return None;
        }
        let now = now_ms();
        if now >= self.absolute_ms {
            Some(Duration::ZERO)
        } else {
            Some(Duration::from_millis(self.absolute_ms - now))
        }
    }

    /// Convert to an `Instant` deadline for use with OS wait primitives.
    /// Returns `None` for `none()` deadlines.
    pub fn as_instant(&self) -> Option<Instant> {
        self.remaining().map(|remaining| Instant::now() + remaining)
    }

    /// A snapshot sharing this deadline's cancel flag but no absolute time
    /// of its own — used by `Nursery::as_deadline` to propagate cancellation
    /// without also importing the nursery's own (possibly unset) deadline.
    pub fn cancel_only_snapshot(&self) -> Self {
        Self {
            absolute_ms: 0,
            cancelled: Arc::clone(&self.cancelled),
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

impl std::fmt::Debug for Deadline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deadline")
            .field("absolute_ms", &self.absolute_ms)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn none_never_expires_on_its_own() {
        let d = Deadline::none();
        assert!(!d.expired());
    }

    #[test]
    fn after_ms_zero_is_immediately_expired() {
        let d = Deadline::after_ms(0);
        thread::sleep(Duration::from_millis(1));
        assert!(d.expired());
    }

    #[test]
    fn expiry_is_monotonic_once_true() {
        let d = Deadline::after_ms(10);
        thread::sleep(Duration::from_millis(20));
        assert!(d.expired());
        thread::sleep(Duration::from_millis(5));
        assert!(d.expired());
    }

    #[test]
    fn cancel_is_idempotent() {
        let d = Deadline::none();
        d.cancel();
        d.cancel();
        assert!(d.is_cancelled());
        assert!(d.expired());
    }

    #[test]
    fn clones_share_cancellation_not_absolute_time() {
        let d = Deadline::after_ms(10_000);
        let snap = d.cancel_only_snapshot();
        assert!(!snap.expired());
        d.cancel();
        assert!(snap.is_cancelled());
    }

    #[test]
    fn remaining_reports_none_for_no_deadline() {
        let d = Deadline::none();
        assert!(d.remaining().is_none());
    }

    #[test]
    fn remaining_reports_zero_after_expiry() {
        let d = Deadline::after_ms(0);
        thread::sleep(Duration::from_millis(5));
        assert_eq!(d.remaining(), Some(Duration::ZERO));
    }
}
