//! Software timers driven by the kernel clock.
//!
//! A timer occupies a fixed slot and owns one entry in the timeout queue.
//! Callbacks run in the context that called [`crate::Kernel::announce`],
//! outside the kernel lock; they may call wakeup-side kernel operations
//! (`sem_give`, `condvar_signal`, `start`) but must not block. Periodic
//! timers re-arm from the nominal deadline, so a late `announce` does not
//! accumulate drift.
use core::num::NonZeroU32;

use crate::config::MAX_TIMERS;
use crate::kernel::fault::{fatal, Fault};
use crate::kernel::scheduler::KernelState;
use crate::kernel::timeout::{timer_slot, TimeoutAction};
use crate::kernel::Kernel;
use crate::thread::CreateError;
use crate::time::Duration;
use keel_khal::{Port, Ticks};

/// Handle to a timer slot.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct TimerId(u16);

impl TimerId {
    pub(crate) const fn new(index: u16) -> TimerId {
        TimerId(index)
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Called when a timer expires, with the fired timer's handle.
pub type TimerCallback = fn(TimerId);

pub(crate) struct RawTimer {
    pub in_use: bool,
    pub running: bool,
    pub callback: Option<TimerCallback>,
    pub period: Option<NonZeroU32>,
}

impl RawTimer {
    pub(crate) const VACANT: RawTimer = RawTimer {
        in_use: false,
        running: false,
        callback: None,
        period: None,
    };
}

/// Expired-timer callbacks collected under the lock, invoked outside it.
/// A timer expires at most once per `announce`, so the capacity is exact.
pub(crate) struct TimerFires {
    items: [Option<(TimerId, TimerCallback)>; MAX_TIMERS],
    len: usize,
}

impl TimerFires {
    pub fn new() -> TimerFires {
        TimerFires {
            items: [None; MAX_TIMERS],
            len: 0,
        }
    }

    pub fn push(&mut self, id: TimerId, callback: TimerCallback) {
        self.items[self.len] = Some((id, callback));
        self.len += 1;
    }

    pub fn invoke(&self) {
        for (id, callback) in self.items[..self.len].iter().flatten() {
            callback(*id);
        }
    }
}

impl KernelState {
    pub fn timer_create(&mut self, callback: TimerCallback) -> Result<TimerId, CreateError> {
        let index = self
            .timers
            .iter()
            .position(|t| !t.in_use)
            .ok_or(CreateError::NoFreeSlot)?;
        self.timers[index] = RawTimer {
            in_use: true,
            running: false,
            callback: Some(callback),
            period: None,
        };
        let index = index as u16;
        self.timeouts
            .set_action(timer_slot(index), TimeoutAction::FireTimer(index));
        Ok(TimerId::new(index))
    }

    fn timer(&self, id: TimerId) -> &RawTimer {
        match self.timers.get(id.index()) {
            Some(timer) if timer.in_use => timer,
            _ => fatal(Fault::InvalidHandle),
        }
    }

    /// (Re)start the timer: first expiry after `delay`, then every `period`
    /// ticks if periodic. Restarting a running timer reschedules it.
    pub fn timer_start(&mut self, id: TimerId, delay: Ticks, period: Option<NonZeroU32>) {
        self.timer(id);
        let slot = timer_slot(id.0);
        if self.timeouts.cancel(slot) {
            self.mark_alarm_dirty();
        }
        self.timers[id.index()].period = period;
        self.timers[id.index()].running = true;
        if self.timeouts.schedule(slot, delay) {
            self.mark_alarm_dirty();
        }
    }

    /// Stop the timer. Idempotent; a stop that races an expiry in the same
    /// tick suppresses the callback.
    pub fn timer_stop(&mut self, id: TimerId) {
        self.timer(id);
        if self.timeouts.cancel(timer_slot(id.0)) {
            self.mark_alarm_dirty();
        }
        self.timers[id.index()].running = false;
    }

    pub fn timer_is_running(&self, id: TimerId) -> bool {
        self.timer(id).running
    }
}

impl<P: Port> Kernel<P> {
    pub fn timer_create(&self, callback: TimerCallback) -> Result<TimerId, CreateError> {
        self.locked(|state| state.timer_create(callback))
    }

    /// Start the timer: one-shot after `delay` when `period` is `None` or
    /// zero, periodic otherwise. Callable from any context.
    pub fn timer_start(&self, id: TimerId, delay: Duration, period: Option<Duration>) {
        let period = period.and_then(|p| NonZeroU32::new(p.as_ticks()));
        self.locked(|state| state.timer_start(id, delay.as_ticks(), period));
    }

    /// Stop the timer without releasing its slot. Callable from any context.
    pub fn timer_stop(&self, id: TimerId) {
        self.locked(|state| state.timer_stop(id));
    }

    pub fn timer_is_running(&self, id: TimerId) -> bool {
        self.locked(|state| state.timer_is_running(id))
    }
}
