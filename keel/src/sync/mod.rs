//! Blocking synchronization primitives: counting semaphore, recursive
//! priority-inheritance mutex, condition variable.
//!
//! The primitives live in fixed arenas inside the kernel state and are
//! addressed by copyable handles. Wakeups hand the resource directly to the
//! most urgent waiter before it is scheduled; there is no
//! release-then-race-to-acquire window.
pub mod condvar;
pub mod mutex;
pub mod semaphore;

/// Runtime failures of blocking operations. Contract violations (wrong
/// owner, blocking in interrupt context, …) are fatal instead.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SyncError {
    /// `NoWait` was requested and the resource is unavailable.
    WouldBlock,
    /// The timeout expired before the resource arrived.
    TimedOut,
}

impl core::fmt::Display for SyncError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SyncError::WouldBlock => write!(f, "resource unavailable"),
            SyncError::TimedOut => write!(f, "timed out"),
        }
    }
}
