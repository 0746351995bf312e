//! Typed channels: rendezvous and buffered, blocking and drop-oldest,
//! closable with drain-before-closed semantics.
//!
//! Keeps `lumen-runtime::channel`'s `Sender`/`Receiver` surface shape and
//! error enum names, but replaces the `crossbeam_channel` backing. The
//! teacher's own `Sender::close` doc comment admits the gap this module
//! fills: "crossbeam channels don't expose an explicit close... the
//! idiomatic close is `drop(sender)`." A real idempotent `close()` with
//! drain-before-closed, true rendezvous (capacity 0), and a drop-oldest
//! mode are needed, none of which `crossbeam_channel` supports, so the
//! backing store here is a hand-rolled buffer guarded by
//! `parking_lot::Mutex` and woken via [`crate::wake::WakePrimitive`].
//!
//! Capacity 0 ("rendezvous") does a direct handoff: a send only completes
//! once a receiver has taken the value (or vice versa), implemented as a
//! pair of parking queues of per-call slot cells — grounded in the
//! Mutex+Condvar "result slot" pattern from
//! `other_examples/.../worker_pool-native.rs`, generalized to two
//! directions instead of one.

use crate::deadline::Deadline;
use crate::observability::{BlockReason, BlockRegistry, Counters};
use crate::wake::WakePrimitive;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Advisory topology tag. Unchecked at runtime (Open Question, recorded in
/// DESIGN.md): a channel created `OneToOne` does not reject a second
/// sender, it simply falls back to the safe N:N mutex+condvar path, which
/// is correct for every topology anyway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

/// Behavior when a buffered channel is full and a sender has not asked for
/// a deadline to wait out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowMode {
    /// `send` blocks until space is available or the channel closes.
    Block,
    /// `send` evicts the oldest buffered value to make room.
    DropOldest,
}

/// Why a [`Sender::send`] failed. Mirrors [`RecvError`]'s three-way split so
/// a caller can tell "closed" apart from "would have blocked forever".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    Closed,
    Timeout,
    Cancelled,
}

#[derive(Clone, PartialEq, Eq)]
pub struct SendError<T>(pub T, pub SendFailure);

impl<T> SendError<T> {
    pub fn reason(&self) -> SendFailure {
        self.1
    }
}

impl<T> std::fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.1 {
            SendFailure::Closed => write!(f, "send on closed channel"),
            SendFailure::Timeout => write!(f, "send timed out before a receiver or space arrived"),
            SendFailure::Cancelled => write!(f, "send cancelled via deadline cancellation"),
        }
    }
}

impl<T> std::fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SendError").field(&self.1).finish()
    }
}

impl<T> std::error::Error for SendError<T> {}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    #[error("channel closed with no remaining buffered values")]
    Closed,
    #[error("recv timed out before a value or close was observed")]
    Timeout,
    #[error("recv cancelled via deadline cancellation")]
    Cancelled,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TrySendError {
    #[error("channel is full")]
    Full,
    #[error("channel is closed")]
    Closed,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    #[error("channel is empty")]
    Empty,
    #[error("channel is closed with no remaining buffered values")]
    Closed,
}

enum SlotState<T> {
    Pending,
    Filled(T),
    Taken,
    ChannelClosed,
}

/// A single parked sender or receiver's handoff cell, used only by
/// rendezvous (capacity 0) channels.
struct Slot<T> {
    state: Mutex<SlotState<T>>,
    condvar: Condvar,
}

impl<T> Slot<T> {
    fn new(initial: SlotState<T>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(initial),
            condvar: Condvar::new(),
        })
    }
}

struct Inner<T> {
    buffer: VecDeque<T>,
    closed: bool,
    sender_count: usize,
    receiver_count: usize,
    /// Rendezvous-only: receivers waiting for a value, in arrival order.
    waiting_receivers: VecDeque<Arc<Slot<T>>>,
    /// Rendezvous-only: senders waiting for a taker, in arrival order.
    waiting_senders: VecDeque<Arc<Slot<T>>>,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    not_full: WakePrimitive,
    not_empty: WakePrimitive,
    capacity: usize,
    mode: OverflowMode,
    topology: Topology,
    counters: Option<Arc<Counters>>,
    blocks: Option<Arc<BlockRegistry>>,
}

impl<T> Shared<T> {
    fn is_rendezvous(&self) -> bool {
        self.capacity == 0
    }
}

/// The sending half of a channel. Cloning increments an internal sender
/// count; the channel auto-closes when the last clone is dropped, matching
/// `crossbeam_channel`'s drop-to-close idiom while still exposing an
/// explicit, idempotent [`close`](Sender::close).
pub struct Sender<T> {
    shared: Arc<Shared<T>>,
}

/// The receiving half of a channel.
pub struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

/// Build a channel pair. `capacity` of `0` is a rendezvous channel; `mode`
/// only matters for buffered (`capacity > 0`) channels. `topology` is
/// advisory metadata only (see [`Topology`]).
pub fn pair_create<T>(
    capacity: usize,
    mode: OverflowMode,
    topology: Topology,
) -> (Sender<T>, Receiver<T>) {
    pair_create_with_observability(capacity, mode, topology, None, None)
}

/// Like [`pair_create`], but wires blocking sends/recvs into the scheduler's
/// `parked` counter and block-reason registry (spec.md §8 scenario S5).
pub fn pair_create_with_observability<T>(
    capacity: usize,
    mode: OverflowMode,
    topology: Topology,
    counters: Option<Arc<Counters>>,
    blocks: Option<Arc<BlockRegistry>>,
) -> (Sender<T>, Receiver<T>) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            buffer: VecDeque::new(),
            closed: false,
            sender_count: 1,
            receiver_count: 1,
            waiting_receivers: VecDeque::new(),
            waiting_senders: VecDeque::new(),
        }),
        not_full: WakePrimitive::new(),
        not_empty: WakePrimitive::new(),
        capacity,
        mode,
        topology,
        counters,
        blocks,
    });
    (
        Sender {
            shared: Arc::clone(&shared),
        },
        Receiver { shared },
    )
}

fn parked_span(counters: &Option<Arc<Counters>>) -> Option<crate::observability::ParkedGuard> {
    counters.as_ref().map(|c| c.parked_guard())
}

struct BlockSpan {
    registry: Arc<BlockRegistry>,
}

impl Drop for BlockSpan {
    fn drop(&mut self) {
        self.registry.exit();
    }
}

fn block_span(blocks: &Option<Arc<BlockRegistry>>, reason: BlockReason) -> Option<BlockSpan> {
    blocks.as_ref().map(|registry| {
        registry.enter(reason);
        BlockSpan {
            registry: Arc::clone(registry),
        }
    })
}

impl<T> Sender<T> {
    pub fn topology(&self) -> Topology {
        self.shared.topology
    }

    /// Non-blocking send. Succeeds immediately on a buffered channel with
    /// room, or on a rendezvous channel with a receiver already waiting;
    /// otherwise returns `Full` without blocking.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError> {
        if self.shared.is_rendezvous() {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(TrySendError::Closed);
            }
            if let Some(slot) = inner.waiting_receivers.pop_front() {
                drop(inner);
                let mut state = slot.state.lock();
                *state = SlotState::Filled(value);
                slot.condvar.notify_all();
                return Ok(());
            }
            Err(TrySendError::Full)
        } else {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(TrySendError::Closed);
            }
            if inner.buffer.len() < self.shared.capacity {
                inner.buffer.push_back(value);
                drop(inner);
                self.shared.not_empty.wake_one();
                Ok(())
            } else {
                Err(TrySendError::Full)
            }
        }
    }

    /// Send `value`, blocking until delivered, the channel closes, or
    /// `deadline` expires. `DropOldest` buffered channels never block: a
    /// full buffer simply loses its oldest entry.
    pub fn send(&self, value: T, deadline: &Deadline) -> Result<(), SendError<T>> {
        if self.shared.is_rendezvous() {
            self.send_rendezvous(value, deadline)
        } else {
            self.send_buffered(value, deadline)
        }
    }

    fn send_buffered(&self, value: T, deadline: &Deadline) -> Result<(), SendError<T>> {
        loop {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                return Err(SendError(value, SendFailure::Closed));
            }
            if inner.buffer.len() < self.shared.capacity {
                inner.buffer.push_back(value);
                drop(inner);
                self.shared.not_empty.wake_one();
                return Ok(());
            }
            if self.shared.mode == OverflowMode::DropOldest {
                inner.buffer.pop_front();
                inner.buffer.push_back(value);
                drop(inner);
                self.shared.not_empty.wake_one();
                return Ok(());
            }
            if deadline.is_cancelled() {
                return Err(SendError(value, SendFailure::Cancelled));
            }
            if deadline.expired() {
                return Err(SendError(value, SendFailure::Timeout));
            }
            let seq = self.shared.not_full.sequence();
            drop(inner);

            let _parked = parked_span(&self.shared.counters);
            let _blocked = block_span(&self.shared.blocks, BlockReason::ChanSend);
            match deadline.as_instant() {
                Some(until) => {
                    self.shared.not_full.wait_until(seq, until);
                }
                None => self.shared.not_full.wait(seq),
            }
        }
    }

    fn send_rendezvous(&self, value: T, deadline: &Deadline) -> Result<(), SendError<T>> {
        let mut inner = self.shared.inner.lock();
        if inner.closed {
            return Err(SendError(value, SendFailure::Closed));
        }
        if let Some(slot) = inner.waiting_receivers.pop_front() {
            drop(inner);
            let mut state = slot.state.lock();
            *state = SlotState::Filled(value);
            slot.condvar.notify_all();
            return Ok(());
        }

        let slot = Slot::new(SlotState::Filled(value));
        inner.waiting_senders.push_back(Arc::clone(&slot));
        drop(inner);

        let _parked = parked_span(&self.shared.counters);
        let _blocked = block_span(&self.shared.blocks, BlockReason::ChanSend);
        let mut state = slot.state.lock();
        loop {
            match &*state {
                SlotState::Taken => return Ok(()),
                SlotState::Filled(_) => {}
                SlotState::Pending | SlotState::ChannelClosed => {
                    unreachable!("sender slot only ever transitions Filled -> Taken")
                }
            }

            let cancelled = deadline.is_cancelled();
            let expired = !cancelled && deadline.expired();
            let closed_now = !cancelled && !expired && self.shared.inner.lock().closed;
            if cancelled || expired || closed_now {
                // Abandon: remove our own slot from the queue before
                // reporting failure, so a later recv never dequeues a
                // stale, already-abandoned slot (Testable Property 5).
                drop(state);
                let mut inner = self.shared.inner.lock();
                let position = inner
                    .waiting_senders
                    .iter()
                    .position(|s| Arc::ptr_eq(s, &slot));
                if let Some(idx) = position {
                    inner.waiting_senders.remove(idx);
                    drop(inner);
                    let reason = if cancelled {
                        SendFailure::Cancelled
                    } else if expired {
                        SendFailure::Timeout
                    } else {
                        SendFailure::Closed
                    };
                    let mut state = slot.state.lock();
                    return match std::mem::replace(&mut *state, SlotState::Taken) {
                        SlotState::Filled(v) => Err(SendError(v, reason)),
                        SlotState::Taken => Ok(()),
                        _ => unreachable!(),
                    };
                }
                drop(inner);
                // Not in the queue anymore: either a receiver already
                // claimed us (Taken), or `close_shared` drained us as part
                // of closing the channel (still Filled, nobody will ever
                // read it). Resolve from the slot's actual terminal state
                // rather than the reason we happened to observe first.
                let mut state = slot.state.lock();
                return match std::mem::replace(&mut *state, SlotState::Taken) {
                    SlotState::Taken => Ok(()),
                    SlotState::Filled(v) => Err(SendError(v, SendFailure::Closed)),
                    _ => unreachable!(),
                };
            }

            match deadline.as_instant() {
                Some(until) => {
                    let timeout = until.saturating_duration_since(Instant::now());
                    let _ = slot.condvar.wait_for(&mut state, timeout);
                }
                None => slot.condvar.wait(&mut state),
            }
        }
    }

    /// Idempotent close: buffered values are still observable via
    /// [`Receiver::recv`] until the buffer empties, after which `recv`
    /// returns `Closed`. Any parked rendezvous senders/receivers are woken
    /// with `Closed`.
    pub fn close(&self) {
        close_shared(&self.shared);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed
    }
}

fn close_shared<T>(shared: &Arc<Shared<T>>) {
    let mut inner = shared.inner.lock();
    if inner.closed {
        return;
    }
    inner.closed = true;
    let receivers: Vec<_> = inner.waiting_receivers.drain(..).collect();
    let senders: Vec<_> = inner.waiting_senders.drain(..).collect();
    drop(inner);

    for slot in receivers {
        let mut state = slot.state.lock();
        *state = SlotState::ChannelClosed;
        slot.condvar.notify_all();
    }
    for slot in senders {
        // Sender slots are always created `Filled` and only ever move to
        // `Taken`; draining them here just wakes a blocked sender so it can
        // observe `inner.closed` itself and abandon (see `send_rendezvous`).
        slot.condvar.notify_all();
    }
    shared.not_empty.wake_all();
    shared.not_full.wake_all();
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.inner.lock().sender_count += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let should_close = {
            let mut inner = self.shared.inner.lock();
            inner.sender_count -= 1;
            inner.sender_count == 0
        };
        if should_close {
            close_shared(&self.shared);
        }
    }
}

impl<T> Receiver<T> {
    pub fn topology(&self) -> Topology {
        self.shared.topology
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        if self.shared.is_rendezvous() {
            let mut inner = self.shared.inner.lock();
            if let Some(slot) = inner.waiting_senders.pop_front() {
                drop(inner);
                let mut state = slot.state.lock();
                return match std::mem::replace(&mut *state, SlotState::Taken) {
                    SlotState::Filled(v) => {
                        slot.condvar.notify_all();
                        Ok(v)
                    }
                    other => {
                        *state = other;
                        Err(TryRecvError::Empty)
                    }
                };
            }
            if inner.closed {
                return Err(TryRecvError::Closed);
            }
            Err(TryRecvError::Empty)
        } else {
            let mut inner = self.shared.inner.lock();
            if let Some(value) = inner.buffer.pop_front() {
                drop(inner);
                self.shared.not_full.wake_one();
                Ok(value)
            } else if inner.closed {
                Err(TryRecvError::Closed)
            } else {
                Err(TryRecvError::Empty)
            }
        }
    }

    /// Receive, blocking until a value arrives, the channel closes (and
    /// drains), or `deadline` expires.
    pub fn recv(&self, deadline: &Deadline) -> Result<T, RecvError> {
        if self.shared.is_rendezvous() {
            self.recv_rendezvous(deadline)
        } else {
            self.recv_buffered(deadline)
        }
    }

    fn recv_buffered(&self, deadline: &Deadline) -> Result<T, RecvError> {
        loop {
            let mut inner = self.shared.inner.lock();
            if let Some(value) = inner.buffer.pop_front() {
                drop(inner);
                self.shared.not_full.wake_one();
                return Ok(value);
            }
            if inner.closed {
                return Err(RecvError::Closed);
            }
            if deadline.is_cancelled() {
                return Err(RecvError::Cancelled);
            }
            if deadline.expired() {
                return Err(RecvError::Timeout);
            }
            let seq = self.shared.not_empty.sequence();
            drop(inner);

            let _parked = parked_span(&self.shared.counters);
            let _blocked = block_span(&self.shared.blocks, BlockReason::ChanRecv);
            match deadline.as_instant() {
                Some(until) => {
                    self.shared.not_empty.wait_until(seq, until);
                }
                None => self.shared.not_empty.wait(seq),
            }
        }
    }

    fn recv_rendezvous(&self, deadline: &Deadline) -> Result<T, RecvError> {
        let mut inner = self.shared.inner.lock();
        if let Some(slot) = inner.waiting_senders.pop_front() {
            drop(inner);
            let mut state = slot.state.lock();
            let value = match std::mem::replace(&mut *state, SlotState::Taken) {
                SlotState::Filled(v) => v,
                _ => unreachable!("sender slot must be Filled when queued"),
            };
            slot.condvar.notify_all();
            return Ok(value);
        }
        if inner.closed {
            return Err(RecvError::Closed);
        }

        let slot: Arc<Slot<T>> = Slot::new(SlotState::Pending);
        inner.waiting_receivers.push_back(Arc::clone(&slot));
        drop(inner);

        let _parked = parked_span(&self.shared.counters);
        let _blocked = block_span(&self.shared.blocks, BlockReason::ChanRecv);
        let mut state = slot.state.lock();
        loop {
            match &mut *state {
                SlotState::Filled(_) => {
                    let value = match std::mem::replace(&mut *state, SlotState::Taken) {
                        SlotState::Filled(v) => v,
                        _ => unreachable!(),
                    };
                    return Ok(value);
                }
                SlotState::ChannelClosed => return Err(RecvError::Closed),
                SlotState::Taken => unreachable!("receiver slot cannot be pre-taken"),
                SlotState::Pending => {}
            }
            let cancelled = deadline.is_cancelled();
            let expired = !cancelled && deadline.expired();
            if cancelled || expired {
                // Abandon: remove our own slot from the queue before
                // reporting failure, so a later send never hands its value
                // to a receiver that already gave up (Testable Property 5).
                drop(state);
                let mut inner = self.shared.inner.lock();
                let position = inner
                    .waiting_receivers
                    .iter()
                    .position(|s| Arc::ptr_eq(s, &slot));
                if let Some(idx) = position {
                    inner.waiting_receivers.remove(idx);
                    drop(inner);
                    return Err(if cancelled { RecvError::Cancelled } else { RecvError::Timeout });
                }
                drop(inner);
                // A sender already claimed our slot between our expiry
                // check and now: honor the successful handoff instead.
                state = slot.state.lock();
                match std::mem::replace(&mut *state, SlotState::Taken) {
                    SlotState::Filled(v) => return Ok(v),
                    SlotState::ChannelClosed => return Err(RecvError::Closed),
                    _ => unreachable!(),
                }
            }
            match deadline.as_instant() {
                Some(until) => {
                    let timeout = until.saturating_duration_since(Instant::now());
                    let _ = slot.condvar.wait_for(&mut state, timeout);
                }
                None => slot.condvar.wait(&mut state),
            }
        }
    }

    /// Drain every value currently buffered, without blocking. Useful when
    /// a nursery auto-closes a channel on scope exit and wants to surface
    /// whatever was left unread.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.shared.inner.lock();
        inner.buffer.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.shared.inner.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed
    }

    pub fn close(&self) {
        close_shared(&self.shared);
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.shared.inner.lock().receiver_count += 1;
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let should_close = {
            let mut inner = self.shared.inner.lock();
            inner.receiver_count -= 1;
            inner.receiver_count == 0
        };
        if should_close {
            close_shared(&self.shared);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn buffered_send_recv_fifo() {
        let (tx, rx) = pair_create::<i32>(4, OverflowMode::Block, Topology::ManyToMany);
        tx.send(1, &Deadline::none()).unwrap();
        tx.send(2, &Deadline::none()).unwrap();
        assert_eq!(rx.recv(&Deadline::none()), Ok(1));
        assert_eq!(rx.recv(&Deadline::none()), Ok(2));
    }

    #[test]
    fn buffered_try_send_fails_when_full() {
        let (tx, _rx) = pair_create::<i32>(1, OverflowMode::Block, Topology::ManyToMany);
        tx.try_send(1).unwrap();
        assert_eq!(tx.try_send(2), Err(TrySendError::Full));
    }

    #[test]
    fn drop_oldest_evicts_front_on_overflow() {
        let (tx, rx) = pair_create::<i32>(2, OverflowMode::DropOldest, Topology::ManyToMany);
        tx.send(1, &Deadline::none()).unwrap();
        tx.send(2, &Deadline::none()).unwrap();
        tx.send(3, &Deadline::none()).unwrap();
        assert_eq!(rx.recv(&Deadline::none()), Ok(2));
        assert_eq!(rx.recv(&Deadline::none()), Ok(3));
    }

    #[test]
    fn close_drains_buffer_before_reporting_closed() {
        let (tx, rx) = pair_create::<i32>(4, OverflowMode::Block, Topology::ManyToMany);
        tx.send(1, &Deadline::none()).unwrap();
        tx.close();
        assert_eq!(rx.recv(&Deadline::none()), Ok(1));
        assert_eq!(rx.recv(&Deadline::none()), Err(RecvError::Closed));
    }

    #[test]
    fn close_is_idempotent() {
        let (tx, _rx) = pair_create::<i32>(1, OverflowMode::Block, Topology::ManyToMany);
        tx.close();
        tx.close();
        assert!(tx.is_closed());
    }

    #[test]
    fn dropping_last_sender_closes_channel() {
        let (tx, rx) = pair_create::<i32>(1, OverflowMode::Block, Topology::ManyToMany);
        drop(tx);
        assert_eq!(rx.recv(&Deadline::none()), Err(RecvError::Closed));
    }

    #[test]
    fn rendezvous_send_blocks_until_receiver_arrives() {
        let (tx, rx) = pair_create::<i32>(0, OverflowMode::Block, Topology::OneToOne);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(15));
            rx.recv(&Deadline::none())
        });
        tx.send(42, &Deadline::none()).unwrap();
        assert_eq!(handle.join().unwrap(), Ok(42));
    }

    #[test]
    fn rendezvous_recv_blocks_until_sender_arrives() {
        let (tx, rx) = pair_create::<i32>(0, OverflowMode::Block, Topology::OneToOne);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(15));
            tx.send(7, &Deadline::none())
        });
        assert_eq!(rx.recv(&Deadline::none()), Ok(7));
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn rendezvous_close_wakes_parked_receiver() {
        let (tx, rx) = pair_create::<i32>(0, OverflowMode::Block, Topology::OneToOne);
        let handle = thread::spawn(move || rx.recv(&Deadline::none()));
        thread::sleep(Duration::from_millis(15));
        tx.close();
        assert_eq!(handle.join().unwrap(), Err(RecvError::Closed));
    }

    #[test]
    fn rendezvous_try_send_and_try_recv_never_block() {
        let (tx, rx) = pair_create::<i32>(0, OverflowMode::Block, Topology::OneToOne);
        assert_eq!(tx.try_send(1), Err(TrySendError::Full));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn send_honors_expired_deadline_on_full_blocking_channel() {
        let (tx, _rx) = pair_create::<i32>(1, OverflowMode::Block, Topology::ManyToMany);
        tx.send(1, &Deadline::none()).unwrap();
        let deadline = Deadline::after_ms(10);
        let result = tx.send(2, &deadline);
        assert_eq!(result, Err(SendError(2, SendFailure::Timeout)));
    }

    #[test]
    fn send_on_closed_channel_reports_closed_not_timeout() {
        let (tx, rx) = pair_create::<i32>(1, OverflowMode::Block, Topology::ManyToMany);
        rx.close();
        let result = tx.send(1, &Deadline::none());
        assert_eq!(result, Err(SendError(1, SendFailure::Closed)));
    }

    #[test]
    fn rendezvous_send_abandons_cleanly_on_timeout_without_panicking_later_recv() {
        let (tx, rx) = pair_create::<i32>(0, OverflowMode::Block, Topology::OneToOne);
        let deadline = Deadline::after_ms(10);
        let result = tx.send(1, &deadline);
        assert_eq!(result, Err(SendError(1, SendFailure::Timeout)));
        // The abandoned slot must not still be queued: a later recv with no
        // sender waiting just reports Timeout, it never panics.
        assert_eq!(rx.recv(&Deadline::after_ms(10)), Err(RecvError::Timeout));
    }

    #[test]
    fn rendezvous_recv_abandons_cleanly_so_later_send_is_not_silently_dropped() {
        let (tx, rx) = pair_create::<i32>(0, OverflowMode::Block, Topology::OneToOne);
        let deadline = Deadline::after_ms(10);
        assert_eq!(rx.recv(&deadline), Err(RecvError::Timeout));
        // The abandoned receiver slot must not still be queued: this send
        // should rendezvous-block (no live receiver), not silently succeed.
        let send_deadline = Deadline::after_ms(10);
        assert_eq!(tx.send(7, &send_deadline), Err(SendError(7, SendFailure::Timeout)));
    }

    #[test]
    fn recv_honors_cancellation() {
        let (_tx, rx) = pair_create::<i32>(1, OverflowMode::Block, Topology::ManyToMany);
        let deadline = Deadline::none();
        deadline.cancel();
        assert_eq!(rx.recv(&deadline), Err(RecvError::Cancelled));
    }

    #[test]
    fn mpmc_buffered_fan_out_fan_in_delivers_every_item() {
        let (tx, rx) = pair_create::<usize>(16, OverflowMode::Block, Topology::ManyToMany);
        let total = 500usize;
        let mut producers = Vec::new();
        for p in 0..4 {
            let tx = tx.clone();
            producers.push(thread::spawn(move || {
                for i in 0..(total / 4) {
                    tx.send(p * (total / 4) + i, &Deadline::none()).unwrap();
                }
            }));
        }
        drop(tx);

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let rx = rx.clone();
            consumers.push(thread::spawn(move || {
                let mut count = 0usize;
                loop {
                    match rx.recv(&Deadline::none()) {
                        Ok(_) => count += 1,
                        Err(_) => break,
                    }
                }
                count
            }));
        }
        drop(rx);

        for p in producers {
            p.join().unwrap();
        }
        let received: usize = consumers.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(received, total);
    }

    #[test]
    fn len_and_is_empty_track_buffered_contents() {
        let (tx, rx) = pair_create::<i32>(4, OverflowMode::Block, Topology::ManyToMany);
        assert!(rx.is_empty());
        tx.send(1, &Deadline::none()).unwrap();
        assert_eq!(rx.len(), 1);
        assert!(!rx.is_empty());
    }

    #[test]
    fn drain_returns_buffered_values_without_blocking() {
        let (tx, rx) = pair_create::<i32>(4, OverflowMode::Block, Topology::ManyToMany);
        tx.send(1, &Deadline::none()).unwrap();
        tx.send(2, &Deadline::none()).unwrap();
        assert_eq!(rx.drain(), vec![1, 2]);
    }
}
