//! Thread control blocks and the fixed thread table.
//!
//! Threads live in a fixed arena; every queue in the kernel links them by
//! `u16` slot index with `NIL` as the end-of-list sentinel. A thread is a
//! member of at most one ready structure and at most one wait queue at a
//! time, tracked by the link fields and the wait record in its own slot.
use crate::config::MAX_THREADS;
use crate::kernel::fault::{fatal, Fault};
use crate::kernel::priority::Priority;
use crate::kernel::wait_queue::WaitQueue;
use keel_khal::ThreadId;

pub(crate) const NIL: u16 = u16::MAX;

/// Lifecycle of a thread slot.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ThreadExecutionState {
    /// Created but not yet started; invisible to the scheduler.
    Created,
    /// Runnable, queued in the ready structure.
    Ready,
    /// Currently executing on some CPU.
    Running,
    /// Pending on a wait queue.
    Blocked,
    /// Waiting for a timeout only.
    Sleeping,
    /// Terminated; the slot stays allocated until reaped.
    Dead,
}

/// What a blocked thread is pending on. Also identifies the wait queue the
/// thread must be unlinked from on wakeup or timeout.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum WaitObject {
    Semaphore(u16),
    Mutex(u16),
    Condvar(u16),
    /// Joining the death of the thread at this slot index.
    Join(u16),
}

/// Why a pending thread was made ready again. Written by the waker under the
/// kernel lock, read back by the woken thread when its blocking call resumes.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum WaitOutcome {
    Pending,
    /// The resource was handed over (or the event delivered).
    Delivered,
    /// The timeout expired first.
    TimedOut,
}

/// Caller-provided stack descriptor. The kernel never touches the memory;
/// it only passes the region to the port and reports it in thread info.
#[derive(Copy, Clone, Debug)]
pub struct StackRegion {
    addr: usize,
    size: usize,
}

impl StackRegion {
    pub const fn new(addr: usize, size: usize) -> StackRegion {
        StackRegion { addr, size }
    }

    pub const fn empty() -> StackRegion {
        StackRegion { addr: 0, size: 0 }
    }

    pub const fn addr(self) -> usize {
        self.addr
    }

    pub const fn size(self) -> usize {
        self.size
    }
}

/// Creation-time thread parameters.
#[derive(Copy, Clone)]
pub struct ThreadConfig {
    pub(crate) name: &'static str,
    pub(crate) priority: Priority,
    pub(crate) stack: StackRegion,
    pub(crate) entry: Option<fn(usize)>,
    pub(crate) entry_arg: usize,
}

impl ThreadConfig {
    pub const fn new(name: &'static str, priority: Priority) -> ThreadConfig {
        ThreadConfig {
            name,
            priority,
            stack: StackRegion::empty(),
            entry: None,
            entry_arg: 0,
        }
    }

    pub const fn stack(mut self, stack: StackRegion) -> ThreadConfig {
        self.stack = stack;
        self
    }

    pub const fn entry(mut self, entry: fn(usize), arg: usize) -> ThreadConfig {
        self.entry = Some(entry);
        self.entry_arg = arg;
        self
    }
}

/// Errors reported at object creation. Exhaustion is the only runtime
/// failure the fixed-arena design can produce.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CreateError {
    /// Every slot in the relevant table is in use.
    NoFreeSlot,
    /// A creation parameter is out of range.
    InvalidArgument,
}

impl core::fmt::Display for CreateError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CreateError::NoFreeSlot => write!(f, "object table exhausted"),
            CreateError::InvalidArgument => write!(f, "invalid creation parameter"),
        }
    }
}

/// Point-in-time snapshot of one thread, for diagnostics.
#[derive(Copy, Clone, Debug)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub name: &'static str,
    pub state: ThreadExecutionState,
    pub base_priority: Priority,
    pub active_priority: Priority,
    pub stack: StackRegion,
}

/// One thread table slot.
pub(crate) struct RawThread {
    pub in_use: bool,
    pub name: &'static str,
    pub state: ThreadExecutionState,
    pub base_priority: Priority,
    /// Effective priority: `most_urgent(base, inheritance floor)`. All
    /// queue ordering uses this, never the base.
    pub active_priority: Priority,
    pub stack: StackRegion,
    pub entry: Option<fn(usize)>,
    pub entry_arg: usize,

    // Ready-structure membership. The links alone cannot express it: a
    // sole member of a priority level has NIL in both directions.
    pub queued_ready: bool,
    // Multi-level ready queue links.
    pub run_next: u16,
    pub run_prev: u16,
    // Ordered ready queue back-index.
    pub heap_pos: u16,
    /// Arrival order within a priority level; preemption re-enqueues with
    /// the old value so a preempted thread keeps its standing among equals.
    pub ready_seq: u64,

    // Wait record.
    pub wait_object: Option<WaitObject>,
    pub wait_next: u16,
    pub wait_prev: u16,
    pub wait_seq: u64,
    pub outcome: WaitOutcome,

    /// Head of the list of mutexes this thread owns, linked through
    /// `RawMutex::held_next`. Source of the inheritance floor.
    pub held_head: u16,

    /// Threads pending on this thread's death.
    pub joiners: WaitQueue,

    /// CPU slot while `Running`.
    pub cpu: u8,
}

impl RawThread {
    pub(crate) const VACANT: RawThread = RawThread {
        in_use: false,
        name: "",
        state: ThreadExecutionState::Created,
        base_priority: Priority::LEAST_URGENT,
        active_priority: Priority::LEAST_URGENT,
        stack: StackRegion::empty(),
        entry: None,
        entry_arg: 0,
        queued_ready: false,
        run_next: NIL,
        run_prev: NIL,
        heap_pos: NIL,
        ready_seq: 0,
        wait_object: None,
        wait_next: NIL,
        wait_prev: NIL,
        wait_seq: 0,
        outcome: WaitOutcome::Pending,
        held_head: NIL,
        joiners: WaitQueue::EMPTY,
        cpu: 0,
    };

    pub(crate) fn is_queued_ready(&self) -> bool {
        self.queued_ready
    }
}

pub(crate) struct ThreadTable {
    slots: [RawThread; MAX_THREADS],
}

impl ThreadTable {
    pub fn new() -> ThreadTable {
        ThreadTable {
            slots: [RawThread::VACANT; MAX_THREADS],
        }
    }

    pub fn alloc(&mut self, config: ThreadConfig) -> Result<ThreadId, CreateError> {
        let slot = self
            .slots
            .iter()
            .position(|t| !t.in_use)
            .ok_or(CreateError::NoFreeSlot)?;
        self.slots[slot] = RawThread {
            in_use: true,
            name: config.name,
            base_priority: config.priority,
            active_priority: config.priority,
            stack: config.stack,
            entry: config.entry,
            entry_arg: config.entry_arg,
            ..RawThread::VACANT
        };
        Ok(ThreadId::new(slot as u16))
    }

    pub fn free(&mut self, tid: ThreadId) {
        self.slots[tid.index()] = RawThread::VACANT;
    }

    /// Access by handle; a stale or never-created handle is a caller defect.
    pub fn slot(&self, tid: ThreadId) -> &RawThread {
        let slot = &self.slots[tid.index()];
        if !slot.in_use {
            fatal(Fault::InvalidHandle);
        }
        slot
    }

    pub fn slot_mut(&mut self, tid: ThreadId) -> &mut RawThread {
        let slot = &mut self.slots[tid.index()];
        if !slot.in_use {
            fatal(Fault::InvalidHandle);
        }
        slot
    }

    /// Raw index access for queue link manipulation.
    pub fn at(&self, index: u16) -> &RawThread {
        &self.slots[index as usize]
    }

    pub fn at_mut(&mut self, index: u16) -> &mut RawThread {
        &mut self.slots[index as usize]
    }

    pub fn is_live(&self, tid: ThreadId) -> bool {
        tid.index() < MAX_THREADS && self.slots[tid.index()].in_use
    }

    pub fn info(&self, tid: ThreadId) -> ThreadInfo {
        let slot = self.slot(tid);
        ThreadInfo {
            id: tid,
            name: slot.name,
            state: slot.state,
            base_priority: slot.base_priority,
            active_priority: slot.active_priority,
            stack: slot.stack,
        }
    }

    pub fn iter_live(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.in_use)
            .map(|(index, _)| ThreadId::new(index as u16))
    }
}
