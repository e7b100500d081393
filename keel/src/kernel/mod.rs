//! The kernel facade: public API over the locked state machine.
//!
//! [`Kernel`] pairs the port with the spinlocked [`KernelState`]. Every
//! entry point follows the same shape: take the lock, run the state-machine
//! step, drain side effects (IPIs, alarm reprogramming), release the lock,
//! then execute the decided context switch through the port. A blocking
//! call therefore suspends *after* the lock is released, on the caller's
//! own execution context, and reads its wait outcome when the port resumes
//! it.
//!
//! Operations that may switch out the caller require a [`ThreadToken`],
//! obtained once per thread via [`Kernel::adopt`]; wakeup-side operations
//! (`sem_give`, `announce`, `start`, …) are callable from any context,
//! including interrupt handlers.
pub mod fault;
pub mod priority;
pub(crate) mod ready_queue;
pub(crate) mod scheduler;
pub(crate) mod spinlock;
pub(crate) mod timeout;
pub(crate) mod wait_queue;

use core::marker::PhantomData;

use crate::config::MAX_THREADS;
use crate::kernel::fault::{fatal, Fault};
use crate::kernel::priority::Priority;
use crate::kernel::scheduler::{Caller, KernelState, SwitchOp};
use crate::kernel::spinlock::SpinLock;
use crate::sync::SyncError;
use crate::thread::{
    CreateError, ThreadConfig, ThreadExecutionState, ThreadInfo, WaitOutcome,
};
use crate::time::{Duration, Instant, Timeout};
use crate::timer::TimerFires;
use keel_khal::{Port, ThreadId, Ticks};

pub use ready_queue::QueueDiscipline;

/// Construction-time kernel parameters.
#[derive(Copy, Clone, Debug)]
pub struct KernelConfig {
    pub num_cpus: usize,
    pub discipline: QueueDiscipline,
}

impl Default for KernelConfig {
    fn default() -> KernelConfig {
        KernelConfig {
            num_cpus: 1,
            discipline: QueueDiscipline::MultiLevel,
        }
    }
}

/// Where the caller currently executes.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ExecutionContext {
    Thread(ThreadId),
    Interrupt,
    /// Before any thread was switched in on this CPU.
    Startup,
}

/// Capability proving the holder executes as a specific kernel thread.
/// Required by every operation that may switch its caller out. Not `Send`:
/// a token never leaves the thread it was adopted on.
pub struct ThreadToken {
    tid: ThreadId,
    _not_send: PhantomData<*const ()>,
}

impl ThreadToken {
    pub fn id(&self) -> ThreadId {
        self.tid
    }
}

pub struct Kernel<P: Port> {
    pub(crate) port: P,
    pub(crate) state: SpinLock<KernelState>,
}

impl<P: Port> Kernel<P> {
    pub fn new(port: P, config: KernelConfig) -> Kernel<P> {
        Kernel {
            port,
            state: SpinLock::new(KernelState::new(config.num_cpus, config.discipline)),
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    // ----- internal plumbing ----------------------------------------------

    pub(crate) fn caller(&self) -> Caller {
        Caller {
            cpu: self.port.current_cpu(),
            in_thread: !self.port.in_interrupt(),
        }
    }

    /// Run a state-machine step under the lock, then deliver the
    /// accumulated side effects (IPIs, alarm reprogramming) to the port.
    pub(crate) fn locked<R>(&self, f: impl FnOnce(&mut KernelState) -> R) -> R {
        let (result, effects) = self.state.with(|state| {
            let result = f(state);
            (result, state.drain_effects())
        });
        let mut mask = effects.ipi_mask;
        while mask != 0 {
            let cpu = mask.trailing_zeros() as usize;
            mask &= mask - 1;
            self.port.ipi_reschedule(cpu);
        }
        if let Some(deadline) = effects.alarm {
            self.port.set_alarm(deadline);
        }
        result
    }

    /// Execute a context switch decided under the lock.
    pub(crate) fn apply(&self, op: SwitchOp) {
        if let Some(from) = op.from {
            self.port.on_thread_stop(op.cpu, from);
        }
        if let Some(to) = op.to {
            self.port.on_thread_run(op.cpu, to);
        } else {
            self.port.on_idle(op.cpu, op.idle_deadline);
        }
        match (op.from_exited, op.from) {
            (true, Some(from)) => self.port.thread_exited(from, op.to),
            _ => self.port.context_switch(op.from, op.to),
        }
    }

    /// Run a step that produces at most one switch and execute it.
    pub(crate) fn run_op(&self, f: impl FnOnce(&mut KernelState) -> Option<SwitchOp>) {
        if let Some(op) = self.locked(f) {
            self.apply(op);
        }
    }

    /// Kernel entry for token-holding (thread-context) operations: refuse
    /// interrupt context, service any deferred preemption, and verify the
    /// token still names the running thread.
    pub(crate) fn thread_entry(&self, token: &ThreadToken) -> Caller {
        if self.port.in_interrupt() {
            self.port.fatal(Fault::BlockingInInterrupt);
        }
        let caller = Caller {
            cpu: self.port.current_cpu(),
            in_thread: true,
        };
        loop {
            let op = self.locked(|state| {
                if state.current(caller.cpu) != Some(token.tid) {
                    fatal(Fault::NotCurrentThread);
                }
                state.service_pending(caller)
            });
            match op {
                Some(op) => self.apply(op),
                None => return caller,
            }
        }
    }

    /// Second half of a blocking call: execute the switch-out, then read
    /// why the thread was made ready again.
    pub(crate) fn block_result(&self, token: &ThreadToken, op: SwitchOp) -> Result<(), SyncError> {
        self.apply(op);
        let outcome = self.locked(|state| state.take_outcome(token.tid));
        match outcome {
            WaitOutcome::Delivered => Ok(()),
            WaitOutcome::TimedOut => Err(SyncError::TimedOut),
            WaitOutcome::Pending => fatal(Fault::StateViolation),
        }
    }

    // ----- thread lifecycle -----------------------------------------------

    pub fn spawn(&self, config: ThreadConfig) -> Result<ThreadId, CreateError> {
        self.locked(|state| state.spawn(config))
    }

    /// Make a created thread runnable. Callable from any context.
    pub fn start(&self, tid: ThreadId) {
        let caller = self.caller();
        self.run_op(|state| state.start(tid, caller));
    }

    /// Claim the token for the running thread. Called once by each thread
    /// when it begins executing.
    pub fn adopt(&self, tid: ThreadId) -> ThreadToken {
        if self.port.in_interrupt() {
            self.port.fatal(Fault::NotCurrentThread);
        }
        let cpu = self.port.current_cpu();
        self.locked(|state| {
            if state.current(cpu) != Some(tid) {
                fatal(Fault::NotCurrentThread);
            }
        });
        ThreadToken {
            tid,
            _not_send: PhantomData,
        }
    }

    /// Terminate the calling thread, waking its joiners. On hardware ports
    /// this never returns; the simulator port returns so the host thread
    /// can unwind.
    pub fn exit(&self, token: ThreadToken) {
        let caller = self.thread_entry(&token);
        let op = self.locked(|state| state.exit_current(caller));
        self.apply(op);
    }

    /// Terminate a thread that is not currently running. Aborting the
    /// caller's own thread is a contract violation; use [`Kernel::exit`].
    pub fn abort(&self, tid: ThreadId) {
        let caller = self.caller();
        self.run_op(|state| state.abort(tid, caller));
    }

    /// Block until `target` terminates.
    pub fn join(&self, token: &ThreadToken, target: ThreadId, timeout: Timeout) -> Result<(), SyncError> {
        let caller = self.thread_entry(token);
        let step = self.locked(|state| state.join_step(caller, target, timeout));
        match step {
            scheduler::BlockStep::Done(result) => result,
            scheduler::BlockStep::Block(op) => self.block_result(token, op),
        }
    }

    /// Release a dead thread's slot for reuse.
    pub fn reap(&self, tid: ThreadId) {
        self.locked(|state| state.reap(tid));
    }

    // ----- scheduling -----------------------------------------------------

    /// Offer the CPU to an equal-or-more-urgent ready thread.
    pub fn yield_now(&self, token: &ThreadToken) {
        let caller = self.thread_entry(token);
        self.run_op(|state| state.yield_current(caller));
    }

    /// Reschedule point: consume a deferred preemption, if one is flagged.
    pub fn preempt_point(&self, token: &ThreadToken) {
        self.thread_entry(token);
    }

    pub fn sleep(&self, token: &ThreadToken, duration: Duration) {
        if duration.is_zero() {
            return self.yield_now(token);
        }
        let caller = self.thread_entry(token);
        let op = self.locked(|state| state.sleep_step(caller, duration.as_ticks()));
        self.apply(op);
    }

    /// Disable preemption of the calling thread. Nests; blocking while
    /// locked is a contract violation.
    pub fn sched_lock(&self, token: &ThreadToken) {
        let caller = self.thread_entry(token);
        self.locked(|state| state.sched_lock(caller));
    }

    /// Undo one `sched_lock`; the outermost unlock delivers any preemption
    /// deferred while locked.
    pub fn sched_unlock(&self, token: &ThreadToken) {
        let caller = self.thread_entry(token);
        self.run_op(|state| state.sched_unlock(caller));
    }

    pub fn set_priority(&self, tid: ThreadId, priority: Priority) {
        let caller = self.caller();
        self.run_op(|state| state.set_base_priority(tid, priority, caller));
    }

    pub fn get_priority(&self, tid: ThreadId) -> Priority {
        self.locked(|state| state.base_priority(tid))
    }

    // ----- time -----------------------------------------------------------

    /// Advance the kernel clock by `elapsed` ticks. Normally called from
    /// the port's tick or alarm interrupt. Fired user-timer callbacks run
    /// in the announcing context, outside the kernel lock. Returns the
    /// ticks until the nearest remaining deadline, for tickless ports.
    pub fn announce(&self, elapsed: Ticks) -> Option<Ticks> {
        let caller = self.caller();
        let mut fires = TimerFires::new();
        let (op, delta) = self.locked(|state| state.announce(elapsed, &mut fires, caller));
        if let Some(op) = op {
            self.apply(op);
        }
        fires.invoke();
        delta
    }

    pub fn uptime(&self) -> Instant {
        self.locked(|state| Instant::from_ticks(state.timeouts.now()))
    }

    // ----- introspection --------------------------------------------------

    pub fn execution_context(&self) -> ExecutionContext {
        if self.port.in_interrupt() {
            return ExecutionContext::Interrupt;
        }
        let cpu = self.port.current_cpu();
        match self.locked(|state| state.current(cpu)) {
            Some(tid) => ExecutionContext::Thread(tid),
            None => ExecutionContext::Startup,
        }
    }

    pub fn current_thread(&self) -> Option<ThreadId> {
        let cpu = self.port.current_cpu();
        self.locked(|state| state.current(cpu))
    }

    pub fn thread_info(&self, tid: ThreadId) -> ThreadInfo {
        self.locked(|state| state.threads.info(tid))
    }

    pub fn thread_state(&self, tid: ThreadId) -> ThreadExecutionState {
        self.locked(|state| state.threads.slot(tid).state)
    }

    /// Dump the thread table through printk. The snapshot is taken under
    /// the lock, the printing happens outside it.
    pub fn print_threads(&self) {
        let mut snapshot: [Option<ThreadInfo>; MAX_THREADS] = [None; MAX_THREADS];
        self.locked(|state| {
            for tid in state.threads.iter_live() {
                snapshot[tid.index()] = Some(state.threads.info(tid));
            }
        });
        crate::printkln!("{:>4} {:16} {:>5} {:>6} {:>6}", "id", "name", "state", "base", "active");
        for info in snapshot.iter().flatten() {
            crate::printkln!(
                "{:>4} {:16} {:>5?} {:>6} {:>6}",
                info.id,
                info.name,
                info.state,
                info.base_priority,
                info.active_priority
            );
        }
    }
}
