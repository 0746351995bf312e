//! ccrt: a cooperative concurrency runtime.
//!
//! Combines a bounded M:N fiber scheduler with work-stealing
//! ([`fiber`]), a blocking worker-pool executor ([`executor`]), typed
//! rendezvous/buffered channels ([`channel`]), structured-concurrency
//! nurseries ([`nursery`]), a unified [`task`] abstraction over futures,
//! polls, spawned jobs and fiber bodies, deadline-based cancellation
//! ([`deadline`]), Erlang/OTP-style supervision ([`supervisor`]), and the
//! observability plumbing ([`observability`]) a deadlock watchdog needs.

pub mod asyncio;
pub mod channel;
pub mod closure;
pub mod config;
pub mod deadline;
pub mod executor;
pub mod ffi;
pub mod fiber;
pub mod mpmc;
pub mod nursery;
pub mod observability;
pub mod panic_boundary;
pub mod process;
pub mod supervisor;
pub mod task;
pub mod wake;
