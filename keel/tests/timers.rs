//! Software-timer behavior through the public API.
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use common::SimKernel;
use keel::{Duration, SemId, TimerId, Timeout};

static PERIODIC_FIRES: AtomicUsize = AtomicUsize::new(0);

fn count_periodic(_: TimerId) {
    PERIODIC_FIRES.fetch_add(1, Ordering::Relaxed);
}

#[test]
fn periodic_timer_fires_each_period_until_stopped() {
    let kernel = common::kernel();
    let timer = kernel.timer_create(count_periodic).unwrap();

    kernel.timer_start(timer, Duration::from_ticks(10), Some(Duration::from_ticks(10)));
    assert!(kernel.timer_is_running(timer));
    assert_eq!(kernel.port().alarm(), Some(10));

    for _ in 0..3 {
        kernel.announce(10);
    }
    assert_eq!(PERIODIC_FIRES.load(Ordering::Relaxed), 3);

    kernel.timer_stop(timer);
    assert!(!kernel.timer_is_running(timer));
    kernel.announce(100);
    assert_eq!(PERIODIC_FIRES.load(Ordering::Relaxed), 3);
}

static ONE_SHOT_FIRES: AtomicUsize = AtomicUsize::new(0);

fn count_one_shot(_: TimerId) {
    ONE_SHOT_FIRES.fetch_add(1, Ordering::Relaxed);
}

#[test]
fn one_shot_timer_fires_once() {
    let kernel = common::kernel();
    let timer = kernel.timer_create(count_one_shot).unwrap();

    kernel.timer_start(timer, Duration::from_ticks(25), None);
    assert_eq!(kernel.announce(20), Some(5));
    assert_eq!(ONE_SHOT_FIRES.load(Ordering::Relaxed), 0);
    kernel.announce(5);
    assert_eq!(ONE_SHOT_FIRES.load(Ordering::Relaxed), 1);
    assert!(!kernel.timer_is_running(timer));

    kernel.announce(1000);
    assert_eq!(ONE_SHOT_FIRES.load(Ordering::Relaxed), 1);
}

static WAKE: OnceLock<(Arc<SimKernel>, SemId)> = OnceLock::new();

fn give_wake(_: TimerId) {
    let (kernel, sem) = WAKE.get().unwrap();
    kernel.sem_give(*sem);
}

#[test]
fn timer_callback_wakes_a_pending_thread() {
    let kernel = common::kernel();
    let sem = kernel.sem_create(0, 1).unwrap();
    WAKE.set((Arc::clone(&kernel), sem)).ok();

    let (waiter, handle) = common::spawn(&kernel, "waiter", 3, move |k, token| {
        k.sem_take(token, sem, Timeout::Forever).unwrap();
    });
    kernel.start(waiter);
    kernel.port().wait_idle();

    let timer = kernel.timer_create(give_wake).unwrap();
    kernel.timer_start(timer, Duration::from_ticks(5), None);
    kernel.announce(5);
    handle.join().unwrap();
}
