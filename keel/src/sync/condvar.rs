//! Condition variable, always used with a mutex.
//!
//! `wait` releases the mutex completely, including any recursion depth,
//! pends on the condition, and re-acquires the mutex with the depth
//! restored before returning. A timed-out wait therefore still returns
//! holding the mutex; only the return value distinguishes the cases.
use crate::kernel::fault::{fatal, Fault};
use crate::kernel::scheduler::{BlockStep, Caller, KernelState, SwitchOp};
use crate::kernel::wait_queue::WaitQueue;
use crate::kernel::{Kernel, ThreadToken};
use crate::sync::mutex::MutexId;
use crate::sync::SyncError;
use crate::thread::{CreateError, ThreadExecutionState, WaitObject, WaitOutcome};
use crate::time::Timeout;
use keel_khal::Port;

/// Handle to a condition-variable slot.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct CondvarId(u16);

impl CondvarId {
    pub(crate) const fn new(index: u16) -> CondvarId {
        CondvarId(index)
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

pub(crate) struct RawCondvar {
    pub in_use: bool,
    pub waiters: WaitQueue,
}

impl RawCondvar {
    pub(crate) const VACANT: RawCondvar = RawCondvar {
        in_use: false,
        waiters: WaitQueue::EMPTY,
    };
}

impl KernelState {
    pub fn condvar_create(&mut self) -> Result<CondvarId, CreateError> {
        let index = self
            .condvars
            .iter()
            .position(|cv| !cv.in_use)
            .ok_or(CreateError::NoFreeSlot)?;
        self.condvars[index] = RawCondvar {
            in_use: true,
            waiters: WaitQueue::EMPTY,
        };
        Ok(CondvarId::new(index as u16))
    }

    fn condvar(&self, id: CondvarId) -> &RawCondvar {
        match self.condvars.get(id.index()) {
            Some(cv) if cv.in_use => cv,
            _ => fatal(Fault::InvalidHandle),
        }
    }

    /// First half of `wait`: release the mutex and pend on the condition.
    /// Returns the saved recursion depth for the re-acquire.
    pub fn condvar_wait_step(
        &mut self,
        caller: Caller,
        id: CondvarId,
        mutex: MutexId,
        timeout: Timeout,
    ) -> (BlockStep, u32) {
        self.condvar(id);
        let Some(current) = self.cpus[caller.cpu].current else {
            fatal(Fault::NotCurrentThread);
        };
        if self.mutex_owner(mutex) != Some(current) {
            fatal(Fault::LockOwnerViolation);
        }
        if timeout.is_no_wait() {
            // Nothing was released; the caller still owns the mutex.
            return (BlockStep::Done(Err(SyncError::WouldBlock)), 0);
        }
        let saved = self.mutexes[mutex.index()].count;
        // Release may hand the mutex to a waiter; that thread becomes ready
        // and competes normally once we block below.
        self.mutex_release(mutex.index() as u16, current);
        self.prepare_pend(caller, WaitObject::Condvar(id.0), timeout);
        let op = self.block_current(caller.cpu, ThreadExecutionState::Blocked);
        (BlockStep::Block(op), saved)
    }

    /// Wake the most urgent waiter, if any. Interrupt-safe.
    pub fn condvar_signal_step(&mut self, id: CondvarId, caller: Caller) -> Option<SwitchOp> {
        self.condvar(id);
        let mut waiters = self.condvars[id.index()].waiters;
        let woken = waiters.pop(&mut self.threads);
        self.condvars[id.index()].waiters = waiters;
        let waiter = woken?;
        self.complete_wait(waiter, WaitOutcome::Delivered);
        self.finish_wakeups(caller)
    }

    /// Wake every waiter. Interrupt-safe.
    pub fn condvar_broadcast_step(&mut self, id: CondvarId, caller: Caller) -> Option<SwitchOp> {
        self.condvar(id);
        let mut woke_any = false;
        loop {
            let mut waiters = self.condvars[id.index()].waiters;
            let Some(waiter) = waiters.pop(&mut self.threads) else {
                break;
            };
            self.condvars[id.index()].waiters = waiters;
            self.complete_wait(waiter, WaitOutcome::Delivered);
            woke_any = true;
        }
        if woke_any {
            self.finish_wakeups(caller)
        } else {
            None
        }
    }
}

impl<P: Port> Kernel<P> {
    pub fn condvar_create(&self) -> Result<CondvarId, CreateError> {
        self.locked(|state| state.condvar_create())
    }

    /// Atomically release `mutex` and pend on the condition, then
    /// re-acquire the mutex before returning. The caller must own the
    /// mutex. On timeout the mutex is still re-acquired; the error only
    /// reports that no signal arrived in time.
    pub fn condvar_wait(
        &self,
        token: &ThreadToken,
        id: CondvarId,
        mutex: MutexId,
        timeout: Timeout,
    ) -> Result<(), SyncError> {
        let caller = self.thread_entry(token);
        let (step, saved) =
            self.locked(|state| state.condvar_wait_step(caller, id, mutex, timeout));
        let result = match step {
            BlockStep::Done(result) => return result,
            BlockStep::Block(op) => self.block_result(token, op),
        };
        if self.mutex_lock(token, mutex, Timeout::Forever).is_err() {
            fatal(Fault::StateViolation);
        }
        if saved > 1 {
            self.locked(|state| state.mutex_restore_count(token.id(), mutex, saved));
        }
        result
    }

    /// Wake the most urgent waiter. Callable from any context.
    pub fn condvar_signal(&self, id: CondvarId) {
        let caller = self.caller();
        self.run_op(|state| state.condvar_signal_step(id, caller));
    }

    /// Wake all waiters. Callable from any context.
    pub fn condvar_broadcast(&self, id: CondvarId) {
        let caller = self.caller();
        self.run_op(|state| state.condvar_broadcast_step(id, caller));
    }
}
