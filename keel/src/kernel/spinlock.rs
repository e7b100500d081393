//! The SMP lock guarding the kernel state machine.
//!
//! Interrupts are masked through `critical_section` before the CAS spin, so
//! a CPU can never deadlock against its own interrupt handler. On a
//! uniprocessor the CAS never spins and the whole thing degenerates to the
//! bare critical section.
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

pub(crate) struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> SpinLock<T> {
        SpinLock {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Run `f` with exclusive access to the protected value.
    ///
    /// Not re-entrant; kernel code never calls back into `with` while
    /// holding the lock.
    ///
    /// An unwind out of `f` (a `fatal` with the default panic hook, on a
    /// host build) leaves `locked` set and the process-wide critical
    /// section held, so every later kernel call spins forever. Tests that
    /// provoke a fault must raise it before any locked section, or drive
    /// the state machine directly without this lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        critical_section::with(|_| {
            while self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                core::hint::spin_loop();
            }
            // Safety: the flag above is the exclusion; interrupts are masked.
            let result = f(unsafe { &mut *self.value.get() });
            self.locked.store(false, Ordering::Release);
            result
        })
    }
}
