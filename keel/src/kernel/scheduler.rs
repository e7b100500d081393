//! The kernel state machine.
//!
//! `KernelState` owns every arena (threads, ready queue, timeouts, sync
//! objects, timers, per-CPU slots) and is only ever touched under the kernel
//! spinlock. Its methods update logical state and *describe* the context
//! switch to perform as a [`SwitchOp`]; the facade executes the switch
//! through the port after the lock is released. No user callback and no port
//! call ever runs under the lock.
//!
//! Scheduling rules:
//! * the most urgent ready thread preempts a strictly less urgent running
//!   one; equal priority never preempts (yield is the only rotation),
//! * a preempted thread keeps its standing among equals, a yielding or
//!   newly woken thread goes behind them,
//! * wakeups from interrupt context (or from a context that is not the
//!   running thread) never switch synchronously while a thread is current:
//!   they raise the CPU's pending-reschedule flag, consumed at that
//!   thread's next kernel entry,
//! * while the scheduler lock is held, preemption is deferred the same way
//!   and blocking is a contract violation.
use crate::config::{MAX_CPUS, MAX_THREADS};
use crate::kernel::fault::{fatal, Fault};
use crate::kernel::priority::Priority;
use crate::kernel::ready_queue::{Placement, QueueDiscipline, ReadyQueue};
use crate::kernel::timeout::{TimeoutAction, TimeoutQueue};
use crate::kernel::wait_queue::WaitQueue;
use crate::sync::condvar::RawCondvar;
use crate::sync::mutex::RawMutex;
use crate::sync::semaphore::RawSemaphore;
use crate::sync::SyncError;
use crate::thread::{
    CreateError, ThreadConfig, ThreadExecutionState, ThreadTable, WaitObject, WaitOutcome, NIL,
};
use crate::time::Timeout;
use crate::timer::{RawTimer, TimerFires, TimerId};
use keel_khal::{ThreadId, Ticks};

/// Who is calling into the kernel: the CPU the call executes on and whether
/// the caller is the thread currently scheduled on it (as opposed to an
/// interrupt handler or startup code). Only a thread-context caller may be
/// switched out synchronously.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Caller {
    pub cpu: usize,
    pub in_thread: bool,
}

/// A context switch decided under the lock, executed by the facade after
/// releasing it. `from == None` means the CPU was idle; `to == None` parks
/// it. When `from` is a thread, the op must be executed on that thread's
/// own execution context.
#[derive(Copy, Clone, Debug)]
pub(crate) struct SwitchOp {
    pub cpu: usize,
    pub from: Option<ThreadId>,
    pub to: Option<ThreadId>,
    pub from_exited: bool,
    /// Nearest pending deadline when the CPU goes idle.
    pub idle_deadline: Option<Ticks>,
}

/// Result of the state-machine half of a blocking operation.
pub(crate) enum BlockStep {
    /// Resolved without pending (fast path or `NoWait`).
    Done(Result<(), SyncError>),
    /// The caller was switched out; execute the op, then read the outcome.
    Block(SwitchOp),
}

/// Side effects accumulated during one locked section, drained by the
/// facade after the lock is released.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Effects {
    pub ipi_mask: u32,
    /// `Some(deadline)` when the nearest pending timeout changed.
    pub alarm: Option<Option<Ticks>>,
}

#[derive(Copy, Clone)]
pub(crate) struct PerCpu {
    pub current: Option<ThreadId>,
    pub sched_lock: u32,
    pub pending_resched: bool,
}

impl PerCpu {
    const IDLE: PerCpu = PerCpu {
        current: None,
        sched_lock: 0,
        pending_resched: false,
    };
}

pub(crate) struct KernelState {
    pub threads: ThreadTable,
    pub run_queue: ReadyQueue,
    pub timeouts: TimeoutQueue,
    pub semaphores: [RawSemaphore; crate::config::MAX_SEMAPHORES],
    pub mutexes: [RawMutex; crate::config::MAX_MUTEXES],
    pub condvars: [RawCondvar; crate::config::MAX_CONDVARS],
    pub timers: [RawTimer; crate::config::MAX_TIMERS],
    pub cpus: [PerCpu; MAX_CPUS],
    pub num_cpus: usize,
    seq: u64,
    ipi_mask: u32,
    alarm_dirty: bool,
}

impl KernelState {
    pub fn new(num_cpus: usize, discipline: QueueDiscipline) -> KernelState {
        assert!(num_cpus >= 1 && num_cpus <= MAX_CPUS);
        KernelState {
            threads: ThreadTable::new(),
            run_queue: ReadyQueue::new(discipline),
            timeouts: TimeoutQueue::new(),
            semaphores: [RawSemaphore::VACANT; crate::config::MAX_SEMAPHORES],
            mutexes: [RawMutex::VACANT; crate::config::MAX_MUTEXES],
            condvars: [RawCondvar::VACANT; crate::config::MAX_CONDVARS],
            timers: [RawTimer::VACANT; crate::config::MAX_TIMERS],
            cpus: [PerCpu::IDLE; MAX_CPUS],
            num_cpus,
            seq: 0,
            ipi_mask: 0,
            alarm_dirty: false,
        }
    }

    pub fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    pub fn current(&self, cpu: usize) -> Option<ThreadId> {
        self.cpus[cpu].current
    }

    pub fn drain_effects(&mut self) -> Effects {
        let ipi_mask = core::mem::take(&mut self.ipi_mask);
        let alarm = if core::mem::take(&mut self.alarm_dirty) {
            Some(self.timeouts.next_deadline())
        } else {
            None
        };
        Effects { ipi_mask, alarm }
    }

    pub fn mark_alarm_dirty(&mut self) {
        self.alarm_dirty = true;
    }

    // ----- thread lifecycle ------------------------------------------------

    pub fn spawn(&mut self, config: ThreadConfig) -> Result<ThreadId, CreateError> {
        let tid = self.threads.alloc(config)?;
        self.timeouts.set_action(
            tid.index() as u16,
            TimeoutAction::WakeThread(tid.index() as u16),
        );
        Ok(tid)
    }

    pub fn start(&mut self, tid: ThreadId, caller: Caller) -> Option<SwitchOp> {
        if self.threads.slot(tid).state != ThreadExecutionState::Created {
            fatal(Fault::ThreadNotStartable);
        }
        self.make_ready(tid);
        self.finish_wakeups(caller)
    }

    /// Free a dead thread's slot for reuse.
    pub fn reap(&mut self, tid: ThreadId) {
        if self.threads.slot(tid).state != ThreadExecutionState::Dead {
            fatal(Fault::StateViolation);
        }
        self.timeouts
            .set_action(tid.index() as u16, TimeoutAction::None);
        self.threads.free(tid);
    }

    pub fn exit_current(&mut self, caller: Caller) -> SwitchOp {
        let Some(current) = self.cpus[caller.cpu].current else {
            fatal(Fault::NotCurrentThread);
        };
        self.wake_joiners(current);
        self.block_current(caller.cpu, ThreadExecutionState::Dead)
    }

    /// Terminate a thread that is not currently running anywhere. A running
    /// thread can only terminate itself through `exit`.
    pub fn abort(&mut self, tid: ThreadId, caller: Caller) -> Option<SwitchOp> {
        match self.threads.slot(tid).state {
            ThreadExecutionState::Created => {}
            ThreadExecutionState::Ready => {
                self.run_queue.remove(&mut self.threads, tid);
            }
            ThreadExecutionState::Blocked => {
                self.detach_waiter(tid);
            }
            ThreadExecutionState::Sleeping => {
                if self.timeouts.cancel(tid.index() as u16) {
                    self.alarm_dirty = true;
                }
            }
            ThreadExecutionState::Dead => return None,
            ThreadExecutionState::Running => fatal(Fault::StateViolation),
        }
        self.threads.slot_mut(tid).state = ThreadExecutionState::Dead;
        self.wake_joiners(tid);
        self.finish_wakeups(caller)
    }

    fn wake_joiners(&mut self, tid: ThreadId) {
        let mut queue =
            core::mem::replace(&mut self.threads.slot_mut(tid).joiners, WaitQueue::EMPTY);
        while let Some(joiner) = queue.pop(&mut self.threads) {
            self.complete_wait(joiner, WaitOutcome::Delivered);
        }
    }

    pub fn join_step(&mut self, caller: Caller, target: ThreadId, timeout: Timeout) -> BlockStep {
        if !self.threads.is_live(target) {
            fatal(Fault::InvalidHandle);
        }
        if self.cpus[caller.cpu].current == Some(target) {
            fatal(Fault::StateViolation);
        }
        if self.threads.slot(target).state == ThreadExecutionState::Dead {
            return BlockStep::Done(Ok(()));
        }
        if timeout.is_no_wait() {
            return BlockStep::Done(Err(SyncError::WouldBlock));
        }
        self.prepare_pend(caller, WaitObject::Join(target.index() as u16), timeout);
        BlockStep::Block(self.block_current(caller.cpu, ThreadExecutionState::Blocked))
    }

    // ----- ready management ------------------------------------------------

    /// Transition to `Ready` and enqueue behind priority equals.
    pub fn make_ready(&mut self, tid: ThreadId) {
        let seq = self.next_seq();
        let slot = self.threads.slot_mut(tid);
        match slot.state {
            ThreadExecutionState::Created
            | ThreadExecutionState::Blocked
            | ThreadExecutionState::Sleeping => {}
            _ => fatal(Fault::StateViolation),
        }
        slot.state = ThreadExecutionState::Ready;
        slot.ready_seq = seq;
        self.run_queue
            .enqueue(&mut self.threads, tid, Placement::Back);
    }

    /// Switch out the current thread of `cpu` into `new_state` and schedule
    /// the most urgent ready thread (or idle).
    pub fn block_current(&mut self, cpu: usize, new_state: ThreadExecutionState) -> SwitchOp {
        if self.cpus[cpu].sched_lock > 0 {
            fatal(Fault::BlockingWhileSchedulerLocked);
        }
        let Some(from) = self.cpus[cpu].current else {
            fatal(Fault::NotCurrentThread);
        };
        self.threads.slot_mut(from).state = new_state;
        let to = self.schedule_in(cpu);
        SwitchOp {
            cpu,
            from: Some(from),
            to,
            from_exited: new_state == ThreadExecutionState::Dead,
            idle_deadline: if to.is_none() {
                self.timeouts.next_deadline()
            } else {
                None
            },
        }
    }

    fn schedule_in(&mut self, cpu: usize) -> Option<ThreadId> {
        let to = self.run_queue.dequeue(&mut self.threads);
        if let Some(next) = to {
            let slot = self.threads.slot_mut(next);
            slot.state = ThreadExecutionState::Running;
            slot.cpu = cpu as u8;
        }
        self.cpus[cpu].current = to;
        to
    }

    // ----- scheduling decisions -------------------------------------------

    fn head_beats_current(&self, cpu: usize) -> bool {
        let Some(head) = self.run_queue.peek() else {
            return false;
        };
        match self.cpus[cpu].current {
            None => true,
            Some(current) => self
                .threads
                .slot(head)
                .active_priority
                .is_more_urgent_than(self.threads.slot(current).active_priority),
        }
    }

    /// Local preemption decision after one or more threads became ready.
    fn local_decision(&mut self, caller: Caller) -> Option<SwitchOp> {
        let cpu = caller.cpu;
        if self.cpus[cpu].sched_lock > 0 {
            if self.head_beats_current(cpu) {
                self.cpus[cpu].pending_resched = true;
            }
            return None;
        }
        match self.cpus[cpu].current {
            None => {
                let to = self.schedule_in(cpu)?;
                Some(SwitchOp {
                    cpu,
                    from: None,
                    to: Some(to),
                    from_exited: false,
                    idle_deadline: None,
                })
            }
            Some(current) => {
                if !self.head_beats_current(cpu) {
                    return None;
                }
                if !caller.in_thread {
                    // Interrupt wakeups never suspend the interrupted
                    // thread mid-flight; it reschedules at its next kernel
                    // entry (or the port's interrupt-exit hook).
                    self.cpus[cpu].pending_resched = true;
                    return None;
                }
                self.threads.slot_mut(current).state = ThreadExecutionState::Ready;
                self.run_queue
                    .enqueue(&mut self.threads, current, Placement::Front);
                let to = self.schedule_in(cpu);
                Some(SwitchOp {
                    cpu,
                    from: Some(current),
                    to,
                    from_exited: false,
                    idle_deadline: None,
                })
            }
        }
    }

    /// Flag (and IPI) other CPUs that should pick up queued work. One
    /// wakeup pass can ready several threads at once, so one flag is spent
    /// per queued thread; a CPU flagged for work that is gone by the time
    /// it reschedules simply clears its flag.
    fn route_remote(&mut self, exec_cpu: usize) {
        if self.num_cpus <= 1 {
            return;
        }
        let Some(head) = self.run_queue.peek() else {
            return;
        };
        let head_priority = self.threads.slot(head).active_priority;
        let mut surplus = self
            .threads
            .iter_live()
            .filter(|&tid| self.threads.slot(tid).is_queued_ready())
            .count();
        for cpu in 0..self.num_cpus {
            if surplus == 0 {
                return;
            }
            if cpu == exec_cpu {
                continue;
            }
            if self.cpus[cpu].pending_resched {
                surplus -= 1;
                continue;
            }
            let takes = match self.cpus[cpu].current {
                None => true,
                Some(current) => {
                    head_priority.is_more_urgent_than(self.threads.slot(current).active_priority)
                }
            };
            if takes {
                self.cpus[cpu].pending_resched = true;
                if self.cpus[cpu].sched_lock == 0 {
                    self.ipi_mask |= 1 << cpu;
                }
                surplus -= 1;
            }
        }
    }

    /// Decision pass after wakeups: local preemption plus remote routing.
    pub fn finish_wakeups(&mut self, caller: Caller) -> Option<SwitchOp> {
        let op = self.local_decision(caller);
        self.route_remote(caller.cpu);
        op
    }

    /// Consume this CPU's pending-reschedule flag.
    pub fn service_pending(&mut self, caller: Caller) -> Option<SwitchOp> {
        let cpu = caller.cpu;
        if !self.cpus[cpu].pending_resched || self.cpus[cpu].sched_lock > 0 {
            return None;
        }
        self.cpus[cpu].pending_resched = false;
        self.local_decision(caller)
    }

    pub fn has_pending(&self, cpu: usize) -> bool {
        self.cpus[cpu].pending_resched
    }

    /// Voluntary rotation: hand the CPU to an equal-or-more-urgent ready
    /// thread and go behind priority equals. No-op while the scheduler is
    /// locked or when only less urgent work is queued.
    pub fn yield_current(&mut self, caller: Caller) -> Option<SwitchOp> {
        let cpu = caller.cpu;
        if self.cpus[cpu].sched_lock > 0 {
            return None;
        }
        let Some(current) = self.cpus[cpu].current else {
            fatal(Fault::NotCurrentThread);
        };
        let head = self.run_queue.peek()?;
        let current_priority = self.threads.slot(current).active_priority;
        if current_priority.is_more_urgent_than(self.threads.slot(head).active_priority) {
            return None;
        }
        let seq = self.next_seq();
        let slot = self.threads.slot_mut(current);
        slot.state = ThreadExecutionState::Ready;
        slot.ready_seq = seq;
        self.run_queue
            .enqueue(&mut self.threads, current, Placement::Back);
        let to = self.schedule_in(cpu);
        Some(SwitchOp {
            cpu,
            from: Some(current),
            to,
            from_exited: false,
            idle_deadline: None,
        })
    }

    // ----- scheduler (preemption) lock ------------------------------------

    pub fn sched_lock(&mut self, caller: Caller) {
        self.cpus[caller.cpu].sched_lock += 1;
    }

    pub fn sched_unlock(&mut self, caller: Caller) -> Option<SwitchOp> {
        let cpu = caller.cpu;
        if self.cpus[cpu].sched_lock == 0 {
            fatal(Fault::SchedulerLockUnderflow);
        }
        self.cpus[cpu].sched_lock -= 1;
        if self.cpus[cpu].sched_lock == 0 && self.cpus[cpu].pending_resched {
            self.cpus[cpu].pending_resched = false;
            self.local_decision(caller)
        } else {
            None
        }
    }

    // ----- pend / wake ----------------------------------------------------

    /// Link the current thread into a wait queue and arm its timeout. Does
    /// not switch; the caller decides when (after e.g. priority
    /// propagation) via `block_current`.
    pub fn prepare_pend(&mut self, caller: Caller, object: WaitObject, timeout: Timeout) {
        if self.cpus[caller.cpu].sched_lock > 0 {
            fatal(Fault::BlockingWhileSchedulerLocked);
        }
        let Some(current) = self.cpus[caller.cpu].current else {
            fatal(Fault::NotCurrentThread);
        };
        let seq = self.next_seq();
        {
            let slot = self.threads.slot_mut(current);
            slot.outcome = WaitOutcome::Pending;
            slot.wait_object = Some(object);
            slot.wait_seq = seq;
        }
        let mut queue = self.wait_queue(object);
        queue.insert(&mut self.threads, current);
        self.set_wait_queue(object, queue);
        match timeout {
            Timeout::Ticks(ticks) => {
                if self.timeouts.schedule(current.index() as u16, ticks) {
                    self.alarm_dirty = true;
                }
            }
            Timeout::Forever => {}
            Timeout::NoWait => fatal(Fault::StateViolation),
        }
    }

    pub fn pend_current(
        &mut self,
        caller: Caller,
        object: WaitObject,
        timeout: Timeout,
    ) -> SwitchOp {
        self.prepare_pend(caller, object, timeout);
        self.block_current(caller.cpu, ThreadExecutionState::Blocked)
    }

    /// Finish a wait for a thread already unlinked from its wait queue:
    /// cancel the timeout, record the outcome, make it ready. The
    /// single-owner rule lives here: between unlink and this call the
    /// thread belongs exclusively to the waker.
    pub fn complete_wait(&mut self, tid: ThreadId, outcome: WaitOutcome) {
        if self.timeouts.cancel(tid.index() as u16) {
            self.alarm_dirty = true;
        }
        let slot = self.threads.slot_mut(tid);
        slot.outcome = outcome;
        slot.wait_object = None;
        self.make_ready(tid);
    }

    /// Unlink a blocked thread from whatever it pends on, canceling its
    /// timeout. Refreshes the inheritance floor of a mutex owner that loses
    /// a waiter.
    pub fn detach_waiter(&mut self, tid: ThreadId) {
        let Some(object) = self.threads.slot(tid).wait_object else {
            fatal(Fault::StateViolation);
        };
        let mut queue = self.wait_queue(object);
        queue.remove(&mut self.threads, tid);
        self.set_wait_queue(object, queue);
        if self.timeouts.cancel(tid.index() as u16) {
            self.alarm_dirty = true;
        }
        self.threads.slot_mut(tid).wait_object = None;
        if let WaitObject::Mutex(mutex) = object {
            if let Some(owner) = self.mutexes[mutex as usize].owner {
                self.refresh_active(owner);
            }
        }
    }

    pub fn wait_queue(&self, object: WaitObject) -> WaitQueue {
        match object {
            WaitObject::Semaphore(index) => self.semaphores[index as usize].waiters,
            WaitObject::Mutex(index) => self.mutexes[index as usize].waiters,
            WaitObject::Condvar(index) => self.condvars[index as usize].waiters,
            WaitObject::Join(index) => self.threads.at(index).joiners,
        }
    }

    pub fn set_wait_queue(&mut self, object: WaitObject, queue: WaitQueue) {
        match object {
            WaitObject::Semaphore(index) => self.semaphores[index as usize].waiters = queue,
            WaitObject::Mutex(index) => self.mutexes[index as usize].waiters = queue,
            WaitObject::Condvar(index) => self.condvars[index as usize].waiters = queue,
            WaitObject::Join(index) => self.threads.at_mut(index).joiners = queue,
        }
    }

    // ----- priority -------------------------------------------------------

    /// Effective priority from base and the inheritance floor of owned
    /// mutexes.
    pub fn effective_priority(&self, tid: ThreadId) -> Priority {
        let base = self.threads.slot(tid).base_priority;
        match self.priority_floor(tid) {
            Some(floor) => Priority::most_urgent_of(base, floor),
            None => base,
        }
    }

    /// Recompute and apply a thread's effective priority.
    pub fn refresh_active(&mut self, tid: ThreadId) {
        let new = self.effective_priority(tid);
        self.update_active(tid, new);
    }

    /// Apply a new effective priority: re-queue a ready thread (fresh
    /// arrival among its new equals), re-sort a waiter and propagate the
    /// change down a mutex ownership chain.
    fn update_active(&mut self, tid: ThreadId, new: Priority) {
        if self.threads.slot(tid).active_priority == new {
            return;
        }
        match self.threads.slot(tid).state {
            ThreadExecutionState::Ready => {
                self.run_queue.remove(&mut self.threads, tid);
                let seq = self.next_seq();
                let slot = self.threads.slot_mut(tid);
                slot.active_priority = new;
                slot.ready_seq = seq;
                self.run_queue
                    .enqueue(&mut self.threads, tid, Placement::Back);
            }
            ThreadExecutionState::Blocked => {
                let object = self.threads.slot(tid).wait_object;
                self.threads.slot_mut(tid).active_priority = new;
                if let Some(object) = object {
                    let mut queue = self.wait_queue(object);
                    queue.resort(&mut self.threads, tid);
                    self.set_wait_queue(object, queue);
                    if let WaitObject::Mutex(mutex) = object {
                        self.propagate_floor(mutex);
                    }
                }
            }
            _ => {
                self.threads.slot_mut(tid).active_priority = new;
            }
        }
    }

    /// Walk a chain of mutex owners, refreshing each owner's effective
    /// priority from its current floor. Bounded by the thread count so a
    /// (deadlocked) ownership cycle cannot spin forever.
    pub fn propagate_floor(&mut self, mutex: u16) {
        let mut mutex = mutex;
        for _ in 0..MAX_THREADS {
            let Some(owner) = self.mutexes[mutex as usize].owner else {
                return;
            };
            let new = self.effective_priority(owner);
            if self.threads.slot(owner).active_priority == new {
                return;
            }
            if self.threads.slot(owner).state != ThreadExecutionState::Blocked {
                self.update_active(owner, new);
                return;
            }
            let object = self.threads.slot(owner).wait_object;
            self.threads.slot_mut(owner).active_priority = new;
            let Some(object) = object else {
                return;
            };
            let mut queue = self.wait_queue(object);
            queue.resort(&mut self.threads, owner);
            self.set_wait_queue(object, queue);
            match object {
                WaitObject::Mutex(next) => mutex = next,
                _ => return,
            }
        }
    }

    /// Change a thread's base priority. The effective priority follows
    /// unless an inheritance floor keeps it boosted.
    pub fn set_base_priority(
        &mut self,
        tid: ThreadId,
        priority: Priority,
        caller: Caller,
    ) -> Option<SwitchOp> {
        self.threads.slot_mut(tid).base_priority = priority;
        self.refresh_active(tid);
        self.finish_wakeups(caller)
    }

    pub fn base_priority(&self, tid: ThreadId) -> Priority {
        self.threads.slot(tid).base_priority
    }

    fn priority_floor(&self, tid: ThreadId) -> Option<Priority> {
        let mut floor: Option<Priority> = None;
        let mut cursor = self.threads.slot(tid).held_head;
        while cursor != NIL {
            let held = &self.mutexes[cursor as usize];
            if let Some(head) = held.waiters.peek() {
                let waiter_priority = self.threads.slot(head).active_priority;
                floor = Some(match floor {
                    Some(current) => Priority::most_urgent_of(current, waiter_priority),
                    None => waiter_priority,
                });
            }
            cursor = held.held_next;
        }
        floor
    }

    // ----- time -----------------------------------------------------------

    pub fn sleep_step(&mut self, caller: Caller, ticks: Ticks) -> SwitchOp {
        let Some(current) = self.cpus[caller.cpu].current else {
            fatal(Fault::NotCurrentThread);
        };
        self.threads.slot_mut(current).outcome = WaitOutcome::Pending;
        if self.timeouts.schedule(current.index() as u16, ticks) {
            self.alarm_dirty = true;
        }
        self.block_current(caller.cpu, ThreadExecutionState::Sleeping)
    }

    /// Advance the kernel clock. Expired thread timeouts wake their
    /// threads; expired user timers are re-armed (if periodic) and
    /// collected into `fires` for the facade to invoke outside the lock.
    /// Returns the local switch decision and the ticks until the next
    /// deadline.
    pub fn announce(
        &mut self,
        elapsed: Ticks,
        fires: &mut TimerFires,
        caller: Caller,
    ) -> (Option<SwitchOp>, Option<Ticks>) {
        self.timeouts.advance(elapsed);
        while let Some((index, action, deadline)) = self.timeouts.pop_expired() {
            self.alarm_dirty = true;
            match action {
                TimeoutAction::WakeThread(thread_index) => {
                    self.wake_on_timeout(ThreadId::new(thread_index));
                }
                TimeoutAction::FireTimer(timer_index) => {
                    self.fire_timer(index, timer_index, deadline, fires);
                }
                TimeoutAction::None => {}
            }
        }
        let delta = self.timeouts.ticks_to_next();
        (self.finish_wakeups(caller), delta)
    }

    fn wake_on_timeout(&mut self, tid: ThreadId) {
        match self.threads.slot(tid).state {
            ThreadExecutionState::Blocked => {
                self.detach_waiter(tid);
                self.threads.slot_mut(tid).outcome = WaitOutcome::TimedOut;
                self.make_ready(tid);
            }
            ThreadExecutionState::Sleeping => {
                self.threads.slot_mut(tid).outcome = WaitOutcome::Delivered;
                self.make_ready(tid);
            }
            // Raced with a wakeup that already consumed the thread.
            _ => {}
        }
    }

    fn fire_timer(
        &mut self,
        slot_index: u16,
        timer_index: u16,
        deadline: Ticks,
        fires: &mut TimerFires,
    ) {
        let (in_use, running, callback, period) = {
            let timer = &self.timers[timer_index as usize];
            (timer.in_use, timer.running, timer.callback, timer.period)
        };
        if !in_use || !running {
            return;
        }
        match period {
            Some(period) => {
                // Drift-free re-arm from the nominal deadline; the timeout
                // queue pushes an already-expired target into the future.
                let next = deadline.wrapping_add(period.get());
                self.timeouts.schedule_at(slot_index, next);
            }
            None => self.timers[timer_index as usize].running = false,
        }
        if let Some(callback) = callback {
            fires.push(TimerId::new(timer_index), callback);
        }
    }

    pub fn take_outcome(&self, tid: ThreadId) -> WaitOutcome {
        self.threads.slot(tid).outcome
    }
}
