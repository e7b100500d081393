//! Hardware abstraction layer contract for the keel kernel core.
//!
//! The kernel is deliberately ignorant of the CPU it runs on: everything
//! architecture-specific is reached through the [`Port`] trait. A port is the
//! glue a target (or a host simulator) supplies: context switching,
//! interrupt context queries, alarm programming, and the optional policy
//! hooks (idle, fatal, tracing). Optional hooks default to no-ops so a port
//! only implements what it cares about.
#![no_std]

/// Kernel tick counter type. Fixed width and allowed to wrap; all deadline
/// comparisons in the kernel use signed-difference arithmetic.
pub type Ticks = u32;

/// Handle to a thread control block slot in the kernel's thread table.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ThreadId(u16);

impl ThreadId {
    pub const fn new(index: u16) -> ThreadId {
        ThreadId(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Contract violations detected by the kernel.
///
/// These are programming defects in the caller, not runtime conditions; they
/// are funneled through [`Port::fatal`] and never returned as error codes.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Fault {
    /// A blocking operation was attempted from interrupt context.
    BlockingInInterrupt,

    /// A blocking operation was attempted while the caller held the
    /// scheduler (preemption) lock.
    BlockingWhileSchedulerLocked,

    /// `sched_unlock` without a matching `sched_lock`.
    SchedulerLockUnderflow,

    /// Attempt to release a lock from a thread that does not own it.
    LockOwnerViolation,

    /// Recursive mutex lock count overflowed.
    LockCountOverflow,

    /// A `ThreadToken` was requested for, or used by, a thread that is not
    /// the currently running one.
    NotCurrentThread,

    /// `start` on a thread that is not in the created state.
    ThreadNotStartable,

    /// A thread was inserted into a queue it is already a member of, or is
    /// otherwise in a state that forbids the transition.
    StateViolation,

    /// An operation referenced a handle that was never created, or was
    /// already reaped.
    InvalidHandle,

    /// A priority level outside the configured range.
    PriorityOutOfRange,
}

impl core::fmt::Display for Fault {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Fault::BlockingInInterrupt => write!(f, "blocking call in interrupt context"),
            Fault::BlockingWhileSchedulerLocked => {
                write!(f, "blocking call while scheduler is locked")
            }
            Fault::SchedulerLockUnderflow => write!(f, "scheduler lock underflow"),
            Fault::LockOwnerViolation => write!(f, "lock released by non-owner"),
            Fault::LockCountOverflow => write!(f, "recursive lock count overflow"),
            Fault::NotCurrentThread => write!(f, "operation requires the running thread"),
            Fault::ThreadNotStartable => write!(f, "thread is not startable"),
            Fault::StateViolation => write!(f, "thread state machine violation"),
            Fault::InvalidHandle => write!(f, "invalid kernel object handle"),
            Fault::PriorityOutOfRange => write!(f, "priority level out of range"),
        }
    }
}

/// The port every target supplies to the kernel.
///
/// `context_switch` is the only mandatory operation. It is always invoked
/// outside the kernel critical section, on the execution context of `from`
/// when `from` is a thread; control returns to the caller when `from` is
/// next scheduled in. `to == None` parks the CPU in its idle state until the
/// kernel switches a thread in again.
pub trait Port: Sync {
    /// Identifies the CPU executing the caller. Single-core ports return 0.
    fn current_cpu(&self) -> usize {
        0
    }

    /// True while the caller executes in interrupt context. Gate for the
    /// blocking-call contract.
    fn in_interrupt(&self) -> bool {
        false
    }

    /// Perform the context switch decided by the scheduler.
    fn context_switch(&self, from: Option<ThreadId>, to: Option<ThreadId>);

    /// Like `context_switch`, but `from` has terminated and must never be
    /// resumed. Called on `from`'s execution context.
    fn thread_exited(&self, from: ThreadId, to: Option<ThreadId>) {
        let _ = from;
        self.context_switch(None, to);
    }

    /// Thread is about to run on `cpu`.
    fn on_thread_run(&self, cpu: usize, thread: ThreadId) {
        let _ = (cpu, thread);
    }

    /// Thread just stopped running on `cpu`.
    fn on_thread_stop(&self, cpu: usize, thread: ThreadId) {
        let _ = (cpu, thread);
    }

    /// The scheduler found nothing to run. `next_deadline` is the absolute
    /// tick of the nearest pending timeout, for tickless-idle ports.
    fn on_idle(&self, cpu: usize, next_deadline: Option<Ticks>) {
        let _ = (cpu, next_deadline);
    }

    /// Program the system alarm to fire at the given absolute tick, or
    /// disable it. Called whenever the nearest pending timeout changes.
    fn set_alarm(&self, deadline: Option<Ticks>) {
        let _ = deadline;
    }

    /// Ask another CPU to run its reschedule point. SMP ports implement
    /// this with an inter-processor interrupt.
    fn ipi_reschedule(&self, cpu: usize) {
        let _ = cpu;
    }

    /// Terminal handler for contract violations. Must not return.
    fn fatal(&self, fault: Fault) -> ! {
        panic!("fatal kernel fault: {}", fault);
    }
}
