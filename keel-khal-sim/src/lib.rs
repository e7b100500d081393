//! Simulator port: kernel threads mapped onto host threads.
//!
//! Each kernel thread is backed by one host thread parked on a private
//! gate. `context_switch` opens the gate of the incoming thread and, when
//! called on a kernel thread's own context, parks the outgoing one. The
//! gate holds a level, not an edge: a resume that arrives before the
//! matching suspend is not lost, which covers the window between the
//! kernel releasing its lock and the outgoing thread reaching the park.
//!
//! Host threads that never attached (the test driver, timer callbacks run
//! from `announce`) report interrupt context, so the kernel's
//! blocking-call contract is enforced naturally: drivers may start, give
//! and announce, but not take or sleep.
use critical_section as _;

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use keel_khal::{Port, ThreadId, Ticks};

thread_local! {
    static CURRENT: Cell<Option<ThreadId>> = const { Cell::new(None) };
    static IN_IRQ: Cell<bool> = const { Cell::new(false) };
}

/// One thread's run gate. `resume` leaves the gate open until the owner
/// consumes it in `suspend`.
#[derive(Default)]
struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    fn resume(&self) {
        let mut open = self.open.lock().unwrap();
        *open = true;
        self.cond.notify_one();
    }

    fn suspend(&self) {
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
        *open = false;
    }
}

#[derive(Default)]
struct Idle {
    parked: Mutex<bool>,
    cond: Condvar,
}

/// A [`Port`] that runs each kernel thread on a dedicated host thread.
///
/// The driving test thread spawns host threads which call [`SimPort::attach`]
/// and block until the kernel schedules them in; the driver itself acts as
/// the interrupt layer, feeding `announce` and wakeup-side calls.
#[derive(Default)]
pub struct SimPort {
    gates: Mutex<HashMap<ThreadId, Arc<Gate>>>,
    idle: Idle,
    alarm: Mutex<Option<Ticks>>,
}

impl SimPort {
    pub fn new() -> SimPort {
        SimPort::default()
    }

    fn gate(&self, tid: ThreadId) -> Arc<Gate> {
        let mut gates = self.gates.lock().unwrap();
        gates.entry(tid).or_default().clone()
    }

    /// Bind the calling host thread to kernel thread `tid` and park until
    /// the kernel schedules it in for the first time. Call before adopting
    /// the kernel token.
    pub fn attach(&self, tid: ThreadId) {
        CURRENT.with(|current| current.set(Some(tid)));
        self.gate(tid).suspend();
    }

    /// Run `f` as if from an interrupt handler on the calling thread.
    pub fn interrupt<R>(&self, f: impl FnOnce() -> R) -> R {
        IN_IRQ.with(|flag| flag.set(true));
        let result = f();
        IN_IRQ.with(|flag| flag.set(false));
        result
    }

    /// Block the calling (driver) thread until every kernel thread is
    /// switched out and the simulated CPU idles.
    pub fn wait_idle(&self) {
        let mut parked = self.idle.parked.lock().unwrap();
        while !*parked {
            parked = self.idle.cond.wait(parked).unwrap();
        }
    }

    /// Last alarm deadline programmed by the kernel, for assertions.
    pub fn alarm(&self) -> Option<Ticks> {
        *self.alarm.lock().unwrap()
    }

    fn switch_in(&self, to: Option<ThreadId>) {
        match to {
            Some(to) => {
                *self.idle.parked.lock().unwrap() = false;
                self.gate(to).resume();
            }
            None => {
                *self.idle.parked.lock().unwrap() = true;
                self.idle.cond.notify_all();
            }
        }
    }
}

impl Port for SimPort {
    fn in_interrupt(&self) -> bool {
        IN_IRQ.with(|flag| flag.get()) || CURRENT.with(|current| current.get()).is_none()
    }

    fn context_switch(&self, from: Option<ThreadId>, to: Option<ThreadId>) {
        self.switch_in(to);
        // Only the outgoing thread itself parks; a switch decided from the
        // driver or a timer callback has nothing to park.
        if let Some(from) = from {
            if CURRENT.with(|current| current.get()) == Some(from) {
                self.gate(from).suspend();
            }
        }
    }

    fn thread_exited(&self, from: ThreadId, to: Option<ThreadId>) {
        self.switch_in(to);
        self.gates.lock().unwrap().remove(&from);
        // The host thread keeps running so it can unwind and be joined.
        CURRENT.with(|current| current.set(None));
    }

    fn set_alarm(&self, deadline: Option<Ticks>) {
        *self.alarm.lock().unwrap() = deadline;
    }
}
