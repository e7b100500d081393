//! The single fatal-error path.
//!
//! Contract violations are never returned as error codes; they land here,
//! get reported through printk, and terminate through the installed hook.
//! Without a hook the default is `panic!`, which on the simulator port makes
//! the violation observable to `#[should_panic]` tests; embedded ports
//! install a hook that resets or halts the board.
use core::cell::Cell;

use critical_section::Mutex;

pub use keel_khal::Fault;

type FatalHook = fn(Fault) -> !;

static FATAL_HOOK: Mutex<Cell<Option<FatalHook>>> = Mutex::new(Cell::new(None));

/// Install the terminal handler for contract violations. The hook must not
/// return; it typically resets the system after recording the fault.
pub fn set_fatal_hook(hook: FatalHook) {
    critical_section::with(|cs| FATAL_HOOK.borrow(cs).set(Some(hook)));
}

/// Report and terminate. Never returns.
#[cold]
pub fn fatal(fault: Fault) -> ! {
    crate::printkln!("[keel] fatal: {}", fault);
    let hook = critical_section::with(|cs| FATAL_HOOK.borrow(cs).get());
    match hook {
        Some(hook) => hook(fault),
        None => panic!("fatal kernel fault: {}", fault),
    }
}

#[macro_export]
macro_rules! fatal_error {
    ($fault:expr) => {
        $crate::kernel::fault::fatal($fault)
    };
}
