//! Concurrency primitives shared by every crate in the workspace: a
//! cooperative [`CancellationToken`], a bounded FIFO [`ExecutionQueue`], and
//! a [`Clock`] abstraction so timer-driven logic (pruning, back-off) can be
//! tested without real sleeps.
//!
//! This crate deliberately does not provide its own thread pool: the "two
//! cooperating pools" (non-blocking I/O vs. general/blocking work) map
//! directly onto `tokio`'s own scheduler and `spawn_blocking`, so callers
//! use those directly and reserve [`ExecutionQueue`] for FIFO-with-a-cap
//! scheduling above them (e.g. the async storage adapter's per-operation
//! queue).

mod cancellation;
mod clock;
mod queue;

pub use cancellation::CancellationToken;
pub use clock::Clock;
pub use queue::{ExecutionQueue, QueueEvent};

/// In-memory fakes for use in other crates' tests, mirroring the teacher's
/// `test_utils`/`testonly` modules.
pub mod testonly {
    use std::time::Instant;

    use super::clock::FakeClockHandle;
    use super::Clock;

    /// Returns a [`Clock`] pinned at `Instant::now()` plus a handle that can
    /// advance it deterministically, for testing timer-driven logic (pruning
    /// intervals, reconnect back-off) without real sleeps.
    pub fn fake_clock() -> (Clock, FakeClockHandle) {
        Clock::fake(Instant::now())
    }
}
