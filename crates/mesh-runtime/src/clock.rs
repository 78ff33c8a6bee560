use std::time::{Duration, Instant};

/// Abstracts wall-clock time so pruning/back-off/timer logic can be tested
/// without sleeping for real. Production code uses [`Clock::real`]; tests use
/// [`FakeClock`] (see [`crate::testonly`]).
#[derive(Clone)]
pub struct Clock(Inner);

#[derive(Clone)]
enum Inner {
    Real,
    Fake(std::sync::Arc<parking_lot::Mutex<Instant>>),
}

impl Clock {
    pub fn real() -> Self {
        Self(Inner::Real)
    }

    pub fn now(&self) -> Instant {
        match &self.0 {
            Inner::Real => Instant::now(),
            Inner::Fake(now) => *now.lock(),
        }
    }

    pub(crate) fn fake(start: Instant) -> (Self, FakeClockHandle) {
        let shared = std::sync::Arc::new(parking_lot::Mutex::new(start));
        (Self(Inner::Fake(shared.clone())), FakeClockHandle(shared))
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::real()
    }
}

/// Advances a [`Clock`] created via [`crate::testonly::fake_clock`].
pub struct FakeClockHandle(std::sync::Arc<parking_lot::Mutex<Instant>>);

impl FakeClockHandle {
    pub fn advance(&self, by: Duration) {
        let mut guard = self.0.lock();
        *guard += by;
    }
}
