//! Kernel diagnostics output.
//!
//! `printk!`/`printkln!` format into an installable sink so the kernel can
//! report without knowing where bytes go. Boards install a UART sink at
//! startup; host tests install one that forwards to stdout. With no sink
//! installed the macros are no-ops.
use core::cell::Cell;
use core::fmt::{self, Write};

use critical_section::Mutex;

type Sink = fn(&str);

static SINK: Mutex<Cell<Option<Sink>>> = Mutex::new(Cell::new(None));

pub fn set_printk_sink(sink: Sink) {
    critical_section::with(|cs| SINK.borrow(cs).set(Some(sink)));
}

struct Printk;

impl Write for Printk {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let sink = critical_section::with(|cs| SINK.borrow(cs).get());
        if let Some(sink) = sink {
            sink(s);
        }
        Ok(())
    }
}

#[doc(hidden)]
pub fn printk_args(args: fmt::Arguments<'_>) {
    let _ = Printk.write_fmt(args);
}

#[macro_export]
macro_rules! printk {
    ($($args:tt)*) => {
        $crate::printk::printk_args(format_args!($($args)*))
    };
}

#[macro_export]
macro_rules! printkln {
    () => {
        $crate::printk!("\r\n")
    };
    ($fmt:expr) => {
        $crate::printk!(concat!($fmt, "\r\n"))
    };
    ($fmt:expr, $($args:tt)*) => {
        $crate::printk!(concat!($fmt, "\r\n"), $($args)*)
    };
}
