//! Compile-time kernel capacities.
//!
//! Every table in the kernel is sized here; nothing is allocated after
//! construction and exhaustion is reported only at object-creation time.
//! Override with environment variables at build time, e.g.
//! `KEEL_MAX_THREADS=64 cargo build`.
use const_env::from_env;

#[from_env("KEEL_MAX_THREADS")]
pub const MAX_THREADS: usize = 32;

/// Number of distinct priority levels. Level 0 is the most urgent.
#[from_env("KEEL_PRIORITY_LEVELS")]
pub const PRIORITY_LEVELS: usize = 32;

#[from_env("KEEL_MAX_CPUS")]
pub const MAX_CPUS: usize = 4;

#[from_env("KEEL_MAX_SEMAPHORES")]
pub const MAX_SEMAPHORES: usize = 16;

#[from_env("KEEL_MAX_MUTEXES")]
pub const MAX_MUTEXES: usize = 16;

#[from_env("KEEL_MAX_CONDVARS")]
pub const MAX_CONDVARS: usize = 8;

#[from_env("KEEL_MAX_TIMERS")]
pub const MAX_TIMERS: usize = 16;

/// Tick frequency of the system clock, for Duration conversions.
#[from_env("KEEL_TICK_HZ")]
pub const TICK_HZ: u32 = 1000;

/// One timeout slot per thread plus one per user timer.
pub const MAX_TIMEOUTS: usize = MAX_THREADS + MAX_TIMERS;

// The level bitmap of the multi-level ready queue is a single u64.
const _: () = assert!(PRIORITY_LEVELS >= 1 && PRIORITY_LEVELS <= 64);
// u16 index links with u16::MAX as the nil sentinel.
const _: () = assert!(MAX_TIMEOUTS < u16::MAX as usize);
const _: () = assert!(MAX_CPUS >= 1 && MAX_CPUS <= 32);
