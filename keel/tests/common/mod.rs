//! Simulator-backed test harness.
//!
//! Each kernel thread runs on a dedicated host thread that attaches to the
//! simulator port and parks until the kernel schedules it. The `#[test]`
//! function acts as the interrupt layer: it starts threads, gives
//! semaphores, feeds `announce`, and synchronizes on `wait_idle` between
//! steps so the scenarios are deterministic.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use keel::{
    Kernel, KernelConfig, Priority, QueueDiscipline, ThreadConfig, ThreadId, ThreadToken,
};
use keel_khal_sim::SimPort;

pub type SimKernel = Kernel<SimPort>;

pub fn kernel() -> Arc<SimKernel> {
    kernel_with(QueueDiscipline::MultiLevel)
}

pub fn kernel_with(discipline: QueueDiscipline) -> Arc<SimKernel> {
    keel::printk::set_printk_sink(stdout_sink);
    Arc::new(Kernel::new(
        SimPort::new(),
        KernelConfig {
            num_cpus: 1,
            discipline,
        },
    ))
}

fn stdout_sink(s: &str) {
    print!("{s}");
}

/// Spawn a kernel thread backed by a host thread. The thread is created but
/// not started; it runs `body` once started and scheduled in, then exits.
pub fn spawn(
    kernel: &Arc<SimKernel>,
    name: &'static str,
    priority: u8,
    body: impl FnOnce(&SimKernel, &ThreadToken) + Send + 'static,
) -> (ThreadId, JoinHandle<()>) {
    let tid = kernel
        .spawn(ThreadConfig::new(name, Priority::new(priority)))
        .expect("thread table full");
    let kernel = Arc::clone(kernel);
    let handle = std::thread::spawn(move || {
        kernel.port().attach(tid);
        let token = kernel.adopt(tid);
        body(&kernel, &token);
        kernel.exit(token);
    });
    (tid, handle)
}

/// Execution-order recorder shared between kernel threads and the driver.
#[derive(Clone, Default)]
pub struct Log {
    entries: Arc<Mutex<Vec<&'static str>>>,
}

impl Log {
    pub fn new() -> Log {
        Log::default()
    }

    pub fn push(&self, entry: &'static str) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<&'static str> {
        self.entries.lock().unwrap().clone()
    }
}
