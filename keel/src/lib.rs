//! Preemptive fixed-priority scheduler core with priority-inheritance
//! synchronization.
//!
//! The kernel is a deterministic state machine ([`kernel::Kernel`] wraps it
//! behind one SMP spinlock) over fixed arenas: a thread table, a ready queue
//! in one of two disciplines, per-resource wait queues, and a sorted timeout
//! list driven by an external tick source through [`kernel::Kernel::announce`].
//! All hardware specifics live behind the [`Port`] trait from `keel-khal`;
//! `keel-khal-sim` provides a host simulator port for tests.
//!
//! Threads never run "inside" the kernel: blocking calls update kernel state
//! under the lock and then suspend through the port, outside the lock. Wakers
//! hand resources directly to the most urgent waiter before scheduling it, so
//! a woken thread always returns from its blocking call with the resource
//! already owned.
#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod kernel;
pub mod printk;
pub mod sync;
pub mod thread;
pub mod time;
pub mod timer;

pub use keel_khal::{Fault, Port, ThreadId, Ticks};

pub use kernel::fault::set_fatal_hook;
pub use kernel::priority::Priority;
pub use kernel::{ExecutionContext, Kernel, KernelConfig, QueueDiscipline, ThreadToken};
pub use sync::condvar::CondvarId;
pub use sync::mutex::MutexId;
pub use sync::semaphore::SemId;
pub use sync::SyncError;
pub use thread::{CreateError, StackRegion, ThreadConfig, ThreadExecutionState, ThreadInfo};
pub use time::{Duration, Instant, Timeout};
pub use timer::{TimerCallback, TimerId};
