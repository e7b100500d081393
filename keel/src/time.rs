//! Tick-based time types.
//!
//! The kernel clock is a `u32` tick counter that is allowed to wrap.
//! [`Instant`] comparisons therefore go through signed-difference
//! arithmetic: `a` is at-or-after `b` iff `(a - b) as i32 >= 0`. This is
//! correct as long as compared instants are less than half the counter
//! range apart, which the timeout queue guarantees by clamping delays.
use crate::config::TICK_HZ;
use keel_khal::Ticks;

/// Longest representable relative delay. Delays beyond this are clamped so
/// that wrap-safe comparisons stay unambiguous.
pub const MAX_DELAY_TICKS: Ticks = i32::MAX as Ticks;

/// A span of kernel ticks.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Duration {
    ticks: Ticks,
}

impl Duration {
    pub const ZERO: Duration = Duration { ticks: 0 };

    pub const fn from_ticks(ticks: Ticks) -> Duration {
        Duration { ticks }
    }

    pub const fn from_millis(millis: u32) -> Duration {
        Duration {
            ticks: (millis as u64 * TICK_HZ as u64 / 1000) as Ticks,
        }
    }

    pub const fn from_secs(secs: u32) -> Duration {
        Duration {
            ticks: (secs as u64 * TICK_HZ as u64) as Ticks,
        }
    }

    pub const fn as_ticks(self) -> Ticks {
        self.ticks
    }

    pub const fn is_zero(self) -> bool {
        self.ticks == 0
    }
}

/// A point on the wrapping kernel clock.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Instant {
    tick: Ticks,
}

impl Instant {
    pub const fn from_ticks(tick: Ticks) -> Instant {
        Instant { tick }
    }

    pub const fn ticks(self) -> Ticks {
        self.tick
    }

    pub const fn wrapping_add(self, duration: Duration) -> Instant {
        Instant {
            tick: self.tick.wrapping_add(duration.ticks),
        }
    }

    /// Wrap-safe ordering: true iff `self` is at or after `other`.
    pub const fn is_at_or_after(self, other: Instant) -> bool {
        self.tick.wrapping_sub(other.tick) as i32 >= 0
    }

    /// Ticks from `earlier` to `self`, assuming `self` is the later one.
    pub const fn since(self, earlier: Instant) -> Duration {
        Duration {
            ticks: self.tick.wrapping_sub(earlier.tick),
        }
    }
}

/// How long a blocking operation may pend.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Timeout {
    /// Fail immediately instead of pending.
    NoWait,
    /// Pend for at most this many ticks.
    Ticks(Ticks),
    /// Pend until the resource arrives.
    Forever,
}

impl Timeout {
    pub const fn from_duration(duration: Duration) -> Timeout {
        if duration.is_zero() {
            Timeout::NoWait
        } else {
            Timeout::Ticks(duration.as_ticks())
        }
    }

    pub const fn is_no_wait(self) -> bool {
        matches!(self, Timeout::NoWait) || matches!(self, Timeout::Ticks(0))
    }
}
