use std::time::Duration;

use rustix::time::{clock_gettime, ClockId};

use crate::{Error, Result};

/// Clock an absolute [`Deadline`] is measured with
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    Realtime,
    #[default]
    Monotonic,
}

impl Clock {
    pub fn now(self) -> Duration {
        let id = match self {
            Clock::Realtime => ClockId::Realtime,
            Clock::Monotonic => ClockId::Monotonic,
        };
        let ts = clock_gettime(id);
        Duration::new(ts.tv_sec.max(0) as u64, ts.tv_nsec as u32)
    }
}

/// Absolute point in time on a [`Clock`] after which a timed operation fails
/// with [`Error::TimedOut`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    clock: Clock,
    at: Duration,
}

impl Deadline {
    pub fn at(clock: Clock, at: Duration) -> Self {
        Self { clock, at }
    }

    pub fn after(clock: Clock, timeout: Duration) -> Self {
        Self::at(clock, clock.now() + timeout)
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Time left before the deadline, measured now
    ///
    /// Fails with [`Error::TimedOut`] once nothing is left, so a blocking step
    /// is never started with an empty budget.
    pub fn remaining(&self) -> Result<Duration> {
        match self.at.checked_sub(self.clock.now()) {
            Some(left) if !left.is_zero() => Ok(left),
            _ => Err(Error::TimedOut),
        }
    }
}
