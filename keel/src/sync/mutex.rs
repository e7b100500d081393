//! Recursive mutex with priority inheritance.
//!
//! The owner's effective priority is floored at the priority of the most
//! urgent waiter across *all* mutexes it owns, recomputed whenever a waiter
//! arrives, leaves, or changes priority, and propagated transitively when
//! the owner is itself blocked on another mutex. There is no saved
//! "original priority": unlock recomputes the floor from the remaining
//! owned mutexes, which handles overlapping critical sections correctly.
//!
//! Unlock transfers ownership to the most urgent waiter before that waiter
//! is scheduled, so a woken `lock` returns already holding the mutex.
use crate::kernel::fault::{fatal, Fault};
use crate::kernel::scheduler::{BlockStep, Caller, KernelState, SwitchOp};
use crate::kernel::wait_queue::WaitQueue;
use crate::kernel::{Kernel, ThreadToken};
use crate::sync::SyncError;
use crate::thread::{CreateError, ThreadExecutionState, WaitObject, WaitOutcome, NIL};
use crate::time::Timeout;
use keel_khal::{Port, ThreadId};

/// Handle to a mutex slot.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct MutexId(u16);

impl MutexId {
    pub(crate) const fn new(index: u16) -> MutexId {
        MutexId(index)
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

pub(crate) struct RawMutex {
    pub in_use: bool,
    pub owner: Option<ThreadId>,
    /// Recursion depth while owned.
    pub count: u32,
    pub waiters: WaitQueue,
    /// Next mutex in the owner's held list.
    pub held_next: u16,
}

impl RawMutex {
    pub(crate) const VACANT: RawMutex = RawMutex {
        in_use: false,
        owner: None,
        count: 0,
        waiters: WaitQueue::EMPTY,
        held_next: NIL,
    };
}

impl KernelState {
    pub fn mutex_create(&mut self) -> Result<MutexId, CreateError> {
        let index = self
            .mutexes
            .iter()
            .position(|m| !m.in_use)
            .ok_or(CreateError::NoFreeSlot)?;
        self.mutexes[index] = RawMutex {
            in_use: true,
            ..RawMutex::VACANT
        };
        Ok(MutexId::new(index as u16))
    }

    fn mutex(&self, id: MutexId) -> &RawMutex {
        match self.mutexes.get(id.index()) {
            Some(mutex) if mutex.in_use => mutex,
            _ => fatal(Fault::InvalidHandle),
        }
    }

    /// Grant first ownership to `tid` and link the mutex into its held
    /// list.
    fn mutex_acquire(&mut self, index: u16, tid: ThreadId) {
        let head = self.threads.slot(tid).held_head;
        {
            let mutex = &mut self.mutexes[index as usize];
            mutex.owner = Some(tid);
            mutex.count = 1;
            mutex.held_next = head;
        }
        self.threads.slot_mut(tid).held_head = index;
    }

    fn held_remove(&mut self, tid: ThreadId, index: u16) {
        let mut cursor = self.threads.slot(tid).held_head;
        if cursor == index {
            self.threads.slot_mut(tid).held_head = self.mutexes[index as usize].held_next;
        } else {
            while cursor != NIL {
                let next = self.mutexes[cursor as usize].held_next;
                if next == index {
                    self.mutexes[cursor as usize].held_next =
                        self.mutexes[index as usize].held_next;
                    break;
                }
                cursor = next;
            }
        }
        self.mutexes[index as usize].held_next = NIL;
    }

    /// Drop ownership entirely: unlink from the held list, hand off to the
    /// most urgent waiter (if any) and let the previous owner's priority
    /// deflate to its remaining floor.
    pub(crate) fn mutex_release(&mut self, index: u16, tid: ThreadId) {
        self.held_remove(tid, index);
        {
            let mutex = &mut self.mutexes[index as usize];
            mutex.owner = None;
            mutex.count = 0;
        }
        let mut waiters = self.mutexes[index as usize].waiters;
        if let Some(next_owner) = waiters.pop(&mut self.threads) {
            self.mutexes[index as usize].waiters = waiters;
            self.mutex_acquire(index, next_owner);
            self.complete_wait(next_owner, WaitOutcome::Delivered);
        }
        self.refresh_active(tid);
    }

    pub fn mutex_lock_step(&mut self, caller: Caller, id: MutexId, timeout: Timeout) -> BlockStep {
        self.mutex(id);
        let Some(current) = self.cpus[caller.cpu].current else {
            fatal(Fault::NotCurrentThread);
        };
        match self.mutexes[id.index()].owner {
            None => {
                self.mutex_acquire(id.0, current);
                BlockStep::Done(Ok(()))
            }
            Some(owner) if owner == current => {
                let mutex = &mut self.mutexes[id.index()];
                mutex.count = match mutex.count.checked_add(1) {
                    Some(count) => count,
                    None => fatal(Fault::LockCountOverflow),
                };
                BlockStep::Done(Ok(()))
            }
            Some(_) => {
                if timeout.is_no_wait() {
                    return BlockStep::Done(Err(SyncError::WouldBlock));
                }
                self.prepare_pend(caller, WaitObject::Mutex(id.0), timeout);
                // The new waiter may raise the owner's floor, transitively.
                self.propagate_floor(id.0);
                BlockStep::Block(self.block_current(caller.cpu, ThreadExecutionState::Blocked))
            }
        }
    }

    pub fn mutex_unlock_step(
        &mut self,
        tid: ThreadId,
        caller: Caller,
        id: MutexId,
    ) -> Option<SwitchOp> {
        self.mutex(id);
        if self.mutexes[id.index()].owner != Some(tid) {
            fatal(Fault::LockOwnerViolation);
        }
        if self.mutexes[id.index()].count > 1 {
            self.mutexes[id.index()].count -= 1;
            return None;
        }
        self.mutex_release(id.0, tid);
        self.finish_wakeups(caller)
    }

    /// Restore the recursion depth after a condition-variable re-acquire.
    pub fn mutex_restore_count(&mut self, tid: ThreadId, id: MutexId, count: u32) {
        self.mutex(id);
        if self.mutexes[id.index()].owner != Some(tid) {
            fatal(Fault::LockOwnerViolation);
        }
        self.mutexes[id.index()].count = count;
    }

    pub fn mutex_owner(&self, id: MutexId) -> Option<ThreadId> {
        self.mutex(id).owner
    }
}

impl<P: Port> Kernel<P> {
    pub fn mutex_create(&self) -> Result<MutexId, CreateError> {
        self.locked(|state| state.mutex_create())
    }

    /// Acquire the mutex, pending up to `timeout` while another thread owns
    /// it. Recursive acquisition by the owner always succeeds.
    pub fn mutex_lock(
        &self,
        token: &ThreadToken,
        id: MutexId,
        timeout: Timeout,
    ) -> Result<(), SyncError> {
        let caller = self.thread_entry(token);
        let step = self.locked(|state| state.mutex_lock_step(caller, id, timeout));
        match step {
            BlockStep::Done(result) => result,
            BlockStep::Block(op) => self.block_result(token, op),
        }
    }

    /// Release one level of ownership. Releasing a mutex the caller does
    /// not own is a contract violation.
    pub fn mutex_unlock(&self, token: &ThreadToken, id: MutexId) {
        let caller = self.thread_entry(token);
        self.run_op(|state| state.mutex_unlock_step(token.id(), caller, id));
    }

    pub fn mutex_owner(&self, id: MutexId) -> Option<ThreadId> {
        self.locked(|state| state.mutex_owner(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_MUTEXES;
    use crate::kernel::priority::Priority;
    use crate::kernel::scheduler::tests::{boot, kernel, INTERRUPT, THREAD};
    use crate::timer::TimerFires;

    fn active(state: &KernelState, tid: ThreadId) -> Priority {
        state.threads.slot(tid).active_priority
    }

    #[test]
    fn uncontested_lock_and_unlock() {
        let mut state = kernel();
        let mutex = state.mutex_create().unwrap();
        let ids = boot(&mut state, &[("t", 5)]);

        assert!(matches!(
            state.mutex_lock_step(THREAD, mutex, Timeout::Forever),
            BlockStep::Done(Ok(()))
        ));
        assert_eq!(state.mutex_owner(mutex), Some(ids[0]));
        assert!(state.mutex_unlock_step(ids[0], THREAD, mutex).is_none());
        assert_eq!(state.mutex_owner(mutex), None);
    }

    #[test]
    fn recursive_lock_counts_and_releases_at_outermost() {
        let mut state = kernel();
        let mutex = state.mutex_create().unwrap();
        let ids = boot(&mut state, &[("t", 5)]);

        for _ in 0..3 {
            assert!(matches!(
                state.mutex_lock_step(THREAD, mutex, Timeout::Forever),
                BlockStep::Done(Ok(()))
            ));
        }
        assert!(state.mutex_unlock_step(ids[0], THREAD, mutex).is_none());
        assert!(state.mutex_unlock_step(ids[0], THREAD, mutex).is_none());
        assert_eq!(state.mutex_owner(mutex), Some(ids[0]));
        state.mutex_unlock_step(ids[0], THREAD, mutex);
        assert_eq!(state.mutex_owner(mutex), None);
    }

    #[test]
    fn unlock_by_non_owner_is_fatal() {
        let result = std::panic::catch_unwind(|| {
            let mut state = kernel();
            let mutex = state.mutex_create().unwrap();
            let ids = boot(&mut state, &[("a", 2), ("b", 5)]);
            state.mutex_lock_step(THREAD, mutex, Timeout::Forever);
            state.mutex_unlock_step(ids[1], THREAD, mutex);
        });
        assert!(result.is_err());
    }

    #[test]
    fn contested_lock_boosts_owner_and_hands_off() {
        let mut state = kernel();
        let mutex = state.mutex_create().unwrap();
        // urgent runs first, parks; low takes the mutex; urgent wakes and
        // contends.
        let ids = boot(&mut state, &[("urgent", 2), ("low", 8)]);
        let (urgent, low) = (ids[0], ids[1]);

        let op = state.sleep_step(THREAD, 50);
        assert_eq!(op.to, Some(low));
        state.mutex_lock_step(THREAD, mutex, Timeout::Forever);

        let mut fires = TimerFires::new();
        let (op, _) = state.announce(50, &mut fires, INTERRUPT);
        assert_eq!(op.expect("urgent resumes").to, Some(urgent));

        // Urgent contends: owner inherits its priority.
        let BlockStep::Block(op) = state.mutex_lock_step(THREAD, mutex, Timeout::Forever) else {
            panic!("lock must pend");
        };
        assert_eq!(op.from, Some(urgent));
        assert_eq!(op.to, Some(low));
        assert_eq!(active(&state, low), Priority::new(2));

        // Unlock: ownership moves to urgent before it runs, owner deflates.
        let op = state
            .mutex_unlock_step(low, THREAD, mutex)
            .expect("urgent preempts");
        assert_eq!(op.from, Some(low));
        assert_eq!(op.to, Some(urgent));
        assert_eq!(state.mutex_owner(mutex), Some(urgent));
        assert_eq!(active(&state, low), Priority::new(8));
        assert_eq!(state.take_outcome(urgent), WaitOutcome::Delivered);
    }

    #[test]
    fn middle_priority_cannot_starve_boosted_owner() {
        // The classic three-thread inversion: low owns the mutex, high
        // contends, middle becomes ready. With inheritance, low runs at
        // high's priority and middle must wait.
        let mut state = kernel();
        let mutex = state.mutex_create().unwrap();
        let ids = boot(&mut state, &[("high", 1), ("middle", 4), ("low", 8)]);
        let (high, middle, low) = (ids[0], ids[1], ids[2]);

        // Park high and middle so low can take the mutex.
        state.sleep_step(THREAD, 10); // high sleeps, middle runs
        state.sleep_step(THREAD, 50); // middle sleeps, low runs
        state.mutex_lock_step(THREAD, mutex, Timeout::Forever);

        // High wakes and contends.
        let mut fires = TimerFires::new();
        let (op, _) = state.announce(10, &mut fires, INTERRUPT);
        assert_eq!(op.expect("high resumes").to, Some(high));
        state.mutex_lock_step(THREAD, mutex, Timeout::Forever);
        assert_eq!(state.current(0), Some(low));
        assert_eq!(active(&state, low), Priority::new(1));

        // Middle wakes: it must not preempt the boosted owner.
        let (op, _) = state.announce(40, &mut fires, INTERRUPT);
        assert!(op.is_none());
        assert_eq!(state.current(0), Some(low));

        // Owner releases: high runs next, middle after it.
        let op = state.mutex_unlock_step(low, THREAD, mutex).expect("high preempts");
        assert_eq!(op.to, Some(high));
        assert_eq!(active(&state, low), Priority::new(8));
        let op = state.sleep_step(THREAD, 100);
        assert_eq!(op.to, Some(middle));
    }

    #[test]
    fn boost_propagates_through_ownership_chain() {
        // a owns m1 and pends on m2, which b owns. A high-priority waiter
        // on m1 must boost both a and b.
        let mut state = kernel();
        let m1 = state.mutex_create().unwrap();
        let m2 = state.mutex_create().unwrap();
        let ids = boot(&mut state, &[("high", 1), ("a", 6), ("b", 8)]);
        let (high, a, b) = (ids[0], ids[1], ids[2]);

        state.sleep_step(THREAD, 100); // high sleeps, a runs
        state.mutex_lock_step(THREAD, m1, Timeout::Forever); // a owns m1
        let op = state.sleep_step(THREAD, 50); // a sleeps briefly, b runs
        assert_eq!(op.to, Some(b));
        state.mutex_lock_step(THREAD, m2, Timeout::Forever); // b owns m2
        let mut fires = TimerFires::new();
        let (op, _) = state.announce(50, &mut fires, INTERRUPT);
        assert_eq!(op.expect("a resumes").to, Some(a));
        // a contends on m2 and blocks behind b.
        let BlockStep::Block(op) = state.mutex_lock_step(THREAD, m2, Timeout::Forever) else {
            panic!("lock must pend");
        };
        assert_eq!(op.to, Some(b));
        assert_eq!(active(&state, b), Priority::new(6));

        // high wakes and contends on m1: the boost rides the chain.
        let (op, _) = state.announce(50, &mut fires, INTERRUPT);
        assert_eq!(op.expect("high resumes").to, Some(high));
        state.mutex_lock_step(THREAD, m1, Timeout::Forever);
        assert_eq!(active(&state, a), Priority::new(1));
        assert_eq!(active(&state, b), Priority::new(1));

        // b releases m2: a gets it, b deflates fully.
        let op = state.mutex_unlock_step(b, THREAD, m2).expect("a preempts");
        assert_eq!(op.to, Some(a));
        assert_eq!(active(&state, b), Priority::new(8));
        assert_eq!(active(&state, a), Priority::new(1));

        // a releases m1 to high and deflates.
        let op = state.mutex_unlock_step(a, THREAD, m1).expect("high preempts");
        assert_eq!(op.to, Some(high));
        assert_eq!(active(&state, a), Priority::new(6));
    }

    #[test]
    fn waiter_timeout_deflates_the_owner() {
        let mut state = kernel();
        let mutex = state.mutex_create().unwrap();
        let ids = boot(&mut state, &[("urgent", 2), ("low", 8)]);
        let (urgent, low) = (ids[0], ids[1]);

        state.sleep_step(THREAD, 10);
        state.mutex_lock_step(THREAD, mutex, Timeout::Forever);
        let mut fires = TimerFires::new();
        let (op, _) = state.announce(10, &mut fires, INTERRUPT);
        assert_eq!(op.expect("urgent resumes").to, Some(urgent));

        state.mutex_lock_step(THREAD, mutex, Timeout::Ticks(30));
        assert_eq!(active(&state, low), Priority::new(2));

        let (op, _) = state.announce(30, &mut fires, INTERRUPT);
        assert_eq!(op.expect("urgent wakes empty-handed").to, Some(urgent));
        assert_eq!(state.take_outcome(urgent), WaitOutcome::TimedOut);
        assert_eq!(state.mutex_owner(mutex), Some(low));
        assert_eq!(active(&state, low), Priority::new(8));
    }

    #[test]
    fn floor_spans_all_owned_mutexes() {
        let mut state = kernel();
        let m1 = state.mutex_create().unwrap();
        let m2 = state.mutex_create().unwrap();
        let ids = boot(&mut state, &[("w1", 2), ("w2", 4), ("owner", 8)]);
        let (w1, w2, owner) = (ids[0], ids[1], ids[2]);

        // Park the waiters, let the owner take both mutexes.
        state.sleep_step(THREAD, 10); // w1
        state.sleep_step(THREAD, 20); // w2
        state.mutex_lock_step(THREAD, m1, Timeout::Forever);
        state.mutex_lock_step(THREAD, m2, Timeout::Forever);

        let mut fires = TimerFires::new();
        let (op, _) = state.announce(10, &mut fires, INTERRUPT);
        assert_eq!(op.expect("w1 resumes").to, Some(w1));
        state.mutex_lock_step(THREAD, m1, Timeout::Forever); // w1 pends on m1
        let (op, _) = state.announce(10, &mut fires, INTERRUPT);
        assert_eq!(op.expect("w2 resumes").to, Some(w2));
        state.mutex_lock_step(THREAD, m2, Timeout::Forever); // w2 pends on m2
        assert_eq!(active(&state, owner), Priority::new(2));

        // Releasing m1 hands it to w1 but the m2 floor keeps the owner at 4.
        let op = state.mutex_unlock_step(owner, THREAD, m1).expect("w1 preempts");
        assert_eq!(op.to, Some(w1));
        assert_eq!(active(&state, owner), Priority::new(4));
    }

    #[test]
    fn lowering_base_while_boosted_keeps_the_floor() {
        let mut state = kernel();
        let mutex = state.mutex_create().unwrap();
        let ids = boot(&mut state, &[("urgent", 2), ("low", 6)]);
        let (urgent, low) = (ids[0], ids[1]);

        state.sleep_step(THREAD, 10);
        state.mutex_lock_step(THREAD, mutex, Timeout::Forever);
        let mut fires = TimerFires::new();
        let (op, _) = state.announce(10, &mut fires, INTERRUPT);
        assert_eq!(op.expect("urgent resumes").to, Some(urgent));
        state.mutex_lock_step(THREAD, mutex, Timeout::Forever);
        assert_eq!(active(&state, low), Priority::new(2));

        // Raising the level number (lowering urgency) cannot strip the
        // inherited floor; the base change sticks for later.
        state.set_base_priority(low, Priority::new(9), INTERRUPT);
        assert_eq!(active(&state, low), Priority::new(2));
        state.mutex_unlock_step(low, THREAD, mutex);
        assert_eq!(active(&state, low), Priority::new(9));
    }

    #[test]
    fn no_wait_on_contested_mutex() {
        let mut state = kernel();
        let mutex = state.mutex_create().unwrap();
        let ids = boot(&mut state, &[("a", 2), ("b", 5)]);

        state.sleep_step(THREAD, 10);
        state.mutex_lock_step(THREAD, mutex, Timeout::Forever); // b owns
        let mut fires = TimerFires::new();
        let (op, _) = state.announce(10, &mut fires, INTERRUPT);
        assert_eq!(op.expect("a resumes").to, Some(ids[0]));
        assert!(matches!(
            state.mutex_lock_step(THREAD, mutex, Timeout::NoWait),
            BlockStep::Done(Err(SyncError::WouldBlock))
        ));
        // No boost happened.
        assert_eq!(active(&state, ids[1]), Priority::new(5));
    }

    #[test]
    fn mutex_table_exhaustion() {
        let mut state = kernel();
        for _ in 0..MAX_MUTEXES {
            state.mutex_create().unwrap();
        }
        assert_eq!(state.mutex_create(), Err(CreateError::NoFreeSlot));
    }
}
