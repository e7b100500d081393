//! Counting semaphore.
//!
//! `give` with waiters present hands the count directly to the most urgent
//! waiter instead of incrementing; the woken thread returns from `take`
//! already holding the unit. Without waiters the count saturates at the
//! creation-time maximum. `give` and `try_take` are interrupt-safe.
use crate::kernel::fault::{fatal, Fault};
use crate::kernel::scheduler::{BlockStep, Caller, KernelState, SwitchOp};
use crate::kernel::wait_queue::WaitQueue;
use crate::kernel::{Kernel, ThreadToken};
use crate::sync::SyncError;
use crate::thread::{CreateError, WaitObject, WaitOutcome};
use crate::time::Timeout;
use keel_khal::Port;

/// Handle to a semaphore slot.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SemId(u16);

impl SemId {
    pub(crate) const fn new(index: u16) -> SemId {
        SemId(index)
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

pub(crate) struct RawSemaphore {
    pub in_use: bool,
    pub count: u32,
    pub max: u32,
    pub waiters: WaitQueue,
}

impl RawSemaphore {
    pub(crate) const VACANT: RawSemaphore = RawSemaphore {
        in_use: false,
        count: 0,
        max: 0,
        waiters: WaitQueue::EMPTY,
    };
}

impl KernelState {
    pub fn sem_create(&mut self, initial: u32, max: u32) -> Result<SemId, CreateError> {
        if max == 0 || initial > max {
            return Err(CreateError::InvalidArgument);
        }
        let index = self
            .semaphores
            .iter()
            .position(|s| !s.in_use)
            .ok_or(CreateError::NoFreeSlot)?;
        self.semaphores[index] = RawSemaphore {
            in_use: true,
            count: initial,
            max,
            waiters: WaitQueue::EMPTY,
        };
        Ok(SemId::new(index as u16))
    }

    fn semaphore(&self, id: SemId) -> &RawSemaphore {
        match self.semaphores.get(id.index()) {
            Some(sem) if sem.in_use => sem,
            _ => fatal(Fault::InvalidHandle),
        }
    }

    pub fn sem_take_step(&mut self, caller: Caller, id: SemId, timeout: Timeout) -> BlockStep {
        self.semaphore(id);
        if self.semaphores[id.index()].count > 0 {
            self.semaphores[id.index()].count -= 1;
            return BlockStep::Done(Ok(()));
        }
        if timeout.is_no_wait() {
            return BlockStep::Done(Err(SyncError::WouldBlock));
        }
        BlockStep::Block(self.pend_current(caller, WaitObject::Semaphore(id.0), timeout))
    }

    /// Non-blocking take; interrupt-safe.
    pub fn sem_try_take(&mut self, id: SemId) -> Result<(), SyncError> {
        self.semaphore(id);
        if self.semaphores[id.index()].count > 0 {
            self.semaphores[id.index()].count -= 1;
            Ok(())
        } else {
            Err(SyncError::WouldBlock)
        }
    }

    pub fn sem_give_step(&mut self, id: SemId, caller: Caller) -> Option<SwitchOp> {
        self.semaphore(id);
        let mut waiters = self.semaphores[id.index()].waiters;
        if let Some(waiter) = waiters.pop(&mut self.threads) {
            self.semaphores[id.index()].waiters = waiters;
            // Direct hand-off: the count never becomes observable.
            self.complete_wait(waiter, WaitOutcome::Delivered);
            self.finish_wakeups(caller)
        } else {
            let sem = &mut self.semaphores[id.index()];
            sem.count = (sem.count + 1).min(sem.max);
            None
        }
    }

    pub fn sem_count(&self, id: SemId) -> u32 {
        self.semaphore(id).count
    }
}

impl<P: Port> Kernel<P> {
    pub fn sem_create(&self, initial: u32, max: u32) -> Result<SemId, CreateError> {
        self.locked(|state| state.sem_create(initial, max))
    }

    /// Take one unit, pending up to `timeout` when none is available.
    pub fn sem_take(
        &self,
        token: &ThreadToken,
        id: SemId,
        timeout: Timeout,
    ) -> Result<(), SyncError> {
        let caller = self.thread_entry(token);
        let step = self.locked(|state| state.sem_take_step(caller, id, timeout));
        match step {
            BlockStep::Done(result) => result,
            BlockStep::Block(op) => self.block_result(token, op),
        }
    }

    /// Take without pending. Callable from any context.
    pub fn sem_try_take(&self, id: SemId) -> Result<(), SyncError> {
        self.locked(|state| state.sem_try_take(id))
    }

    /// Release one unit. Callable from any context.
    pub fn sem_give(&self, id: SemId) {
        let caller = self.caller();
        self.run_op(|state| state.sem_give_step(id, caller));
    }

    pub fn sem_count(&self, id: SemId) -> u32 {
        self.locked(|state| state.sem_count(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_SEMAPHORES;
    use crate::kernel::scheduler::tests::{boot, kernel, INTERRUPT, THREAD};
    use crate::thread::ThreadExecutionState;
    use crate::timer::TimerFires;

    #[test]
    fn take_and_give_move_the_count() {
        let mut state = kernel();
        let sem = state.sem_create(2, 4).unwrap();
        boot(&mut state, &[("t", 5)]);

        assert!(matches!(
            state.sem_take_step(THREAD, sem, Timeout::Forever),
            BlockStep::Done(Ok(()))
        ));
        assert_eq!(state.sem_count(sem), 1);
        state.sem_give_step(sem, THREAD);
        state.sem_give_step(sem, THREAD);
        assert_eq!(state.sem_count(sem), 3);
    }

    #[test]
    fn count_saturates_at_max() {
        let mut state = kernel();
        let sem = state.sem_create(0, 2).unwrap();
        boot(&mut state, &[("t", 5)]);
        for _ in 0..5 {
            state.sem_give_step(sem, THREAD);
        }
        assert_eq!(state.sem_count(sem), 2);
    }

    #[test]
    fn create_validates_arguments() {
        let mut state = kernel();
        assert_eq!(state.sem_create(1, 0), Err(CreateError::InvalidArgument));
        assert_eq!(state.sem_create(3, 2), Err(CreateError::InvalidArgument));
        for _ in 0..MAX_SEMAPHORES {
            state.sem_create(0, 1).unwrap();
        }
        assert_eq!(state.sem_create(0, 1), Err(CreateError::NoFreeSlot));
    }

    #[test]
    fn no_wait_reports_would_block() {
        let mut state = kernel();
        let sem = state.sem_create(0, 1).unwrap();
        boot(&mut state, &[("t", 5)]);
        assert!(matches!(
            state.sem_take_step(THREAD, sem, Timeout::NoWait),
            BlockStep::Done(Err(SyncError::WouldBlock))
        ));
        assert_eq!(state.sem_try_take(sem), Err(SyncError::WouldBlock));
    }

    #[test]
    fn give_hands_off_to_waiter_without_counting() {
        let mut state = kernel();
        let sem = state.sem_create(0, 1).unwrap();
        let ids = boot(&mut state, &[("taker", 3), ("giver", 5)]);

        // Taker pends; giver runs.
        let BlockStep::Block(op) = state.sem_take_step(THREAD, sem, Timeout::Forever) else {
            panic!("take must pend");
        };
        assert_eq!(op.from, Some(ids[0]));
        assert_eq!(op.to, Some(ids[1]));

        // Giver releases: the more urgent taker gets the unit and the CPU.
        let op = state.sem_give_step(sem, THREAD).expect("taker preempts");
        assert_eq!(op.from, Some(ids[1]));
        assert_eq!(op.to, Some(ids[0]));
        assert_eq!(state.take_outcome(ids[0]), WaitOutcome::Delivered);
        assert_eq!(state.sem_count(sem), 0);
    }

    #[test]
    fn waiters_wake_by_priority_then_fifo() {
        let mut state = kernel();
        let sem = state.sem_create(0, 1).unwrap();
        // Most urgent first: a2 runs, pends; then b5, c5, d1 in turn.
        let ids = boot(&mut state, &[("a", 2), ("b", 5), ("c", 5), ("d", 7)]);

        state.sem_take_step(THREAD, sem, Timeout::Forever); // a pends, b runs
        state.sem_take_step(THREAD, sem, Timeout::Forever); // b pends, c runs
        state.sem_take_step(THREAD, sem, Timeout::Forever); // c pends, d runs
        state.sem_take_step(THREAD, sem, Timeout::Forever); // d pends, idle

        // Wake order: a (most urgent), then b before c (FIFO), then d.
        for expected in [ids[0], ids[1], ids[2], ids[3]] {
            let op = state.sem_give_step(sem, INTERRUPT).expect("waiter wakes");
            assert_eq!(op.to, Some(expected));
            // Park it again so the next give schedules the next waiter.
            state.sleep_step(THREAD, 1000);
        }
    }

    #[test]
    fn take_times_out_and_reports_it() {
        let mut state = kernel();
        let sem = state.sem_create(0, 1).unwrap();
        let ids = boot(&mut state, &[("taker", 5)]);

        let BlockStep::Block(op) = state.sem_take_step(THREAD, sem, Timeout::Ticks(20)) else {
            panic!("take must pend");
        };
        assert_eq!(op.to, None);
        assert_eq!(op.idle_deadline, Some(20));

        let mut fires = TimerFires::new();
        let (op, _) = state.announce(20, &mut fires, INTERRUPT);
        assert_eq!(op.expect("taker wakes").to, Some(ids[0]));
        assert_eq!(state.take_outcome(ids[0]), WaitOutcome::TimedOut);
        assert!(state.semaphores[sem.index()].waiters.is_empty());
    }

    #[test]
    fn give_beats_timeout_at_the_same_tick() {
        // The single-owner rule: whoever dequeues the thread first decides
        // the outcome; a later timeout expiry finds nothing to wake.
        let mut state = kernel();
        let sem = state.sem_create(0, 1).unwrap();
        let ids = boot(&mut state, &[("taker", 5)]);

        state.sem_take_step(THREAD, sem, Timeout::Ticks(10));
        let op = state.sem_give_step(sem, INTERRUPT).expect("taker wakes");
        assert_eq!(op.to, Some(ids[0]));
        assert_eq!(state.take_outcome(ids[0]), WaitOutcome::Delivered);

        // The timeout entry was canceled by the hand-off.
        let mut fires = TimerFires::new();
        let (op, _) = state.announce(10, &mut fires, INTERRUPT);
        assert!(op.is_none());
        assert_eq!(state.threads.slot(ids[0]).state, ThreadExecutionState::Running);
    }

    #[test]
    fn interrupt_give_defers_preemption() {
        let mut state = kernel();
        let sem = state.sem_create(0, 1).unwrap();
        let ids = boot(&mut state, &[("urgent", 2), ("background", 8)]);

        // Urgent pends on the semaphore, background runs.
        let BlockStep::Block(op) = state.sem_take_step(THREAD, sem, Timeout::Forever) else {
            panic!("take must pend");
        };
        assert_eq!(op.to, Some(ids[1]));

        // An interrupt gives: no synchronous switch, pending flag instead.
        assert!(state.sem_give_step(sem, INTERRUPT).is_none());
        assert!(state.has_pending(0));
        let op = state.service_pending(THREAD).expect("urgent preempts");
        assert_eq!(op.from, Some(ids[1]));
        assert_eq!(op.to, Some(ids[0]));
    }

    #[test]
    fn stale_handle_is_fatal() {
        let result = std::panic::catch_unwind(|| {
            let mut state = kernel();
            state.sem_count(SemId::new(7));
        });
        assert!(result.is_err());
    }
}
