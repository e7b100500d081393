//! Thread priority levels.
//!
//! Lower level number means more urgent, level 0 is the most urgent in the
//! system. The derived `Ord` therefore sorts most-urgent-first, and
//! `a.min(b)` picks the more urgent of two priorities.
use crate::config::PRIORITY_LEVELS;
use crate::kernel::fault::{fatal, Fault};

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Priority(u8);

impl Priority {
    pub const MOST_URGENT: Priority = Priority(0);
    pub const LEAST_URGENT: Priority = Priority((PRIORITY_LEVELS - 1) as u8);

    /// A level outside the configured range is a caller defect and goes
    /// through the fatal path like every other contract violation.
    pub fn new(level: u8) -> Priority {
        if level as usize >= PRIORITY_LEVELS {
            fatal(Fault::PriorityOutOfRange);
        }
        Priority(level)
    }

    pub const fn level(self) -> usize {
        self.0 as usize
    }

    pub const fn is_more_urgent_than(self, other: Priority) -> bool {
        self.0 < other.0
    }

    pub fn most_urgent_of(a: Priority, b: Priority) -> Priority {
        a.min(b)
    }
}

impl core::fmt::Display for Priority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "P{}", self.0)
    }
}
