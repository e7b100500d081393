//! The pending-timeout queue.
//!
//! A sorted doubly linked list over a fixed arena with one slot per thread
//! (slot index == thread index) and one per user timer. The tick counter
//! wraps; expiry uses the signed difference `(now - deadline) as i32 >= 0`
//! and all scheduled deadlines stay within half the counter range of `now`
//! (delays are clamped to [`MAX_DELAY_TICKS`]), so the unsigned delta
//! `deadline - now` orders pending entries correctly.
//!
//! `advance` moves logical time and `pop_expired` hands expired entries back
//! one at a time; callers re-arm periodic entries during the drain, which is
//! safe because a re-armed deadline is forced into the future.
use crate::config::{MAX_THREADS, MAX_TIMEOUTS};
use crate::kernel::fault::{fatal, Fault};
use crate::thread::NIL;
use crate::time::MAX_DELAY_TICKS;
use keel_khal::Ticks;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum TimeoutAction {
    None,
    /// Wake the pending or sleeping thread at this slot index.
    WakeThread(u16),
    /// Fire the user timer at this timer-table index.
    FireTimer(u16),
}

#[derive(Copy, Clone)]
struct TimeoutSlot {
    scheduled: bool,
    deadline: Ticks,
    next: u16,
    prev: u16,
    action: TimeoutAction,
}

impl TimeoutSlot {
    const VACANT: TimeoutSlot = TimeoutSlot {
        scheduled: false,
        deadline: 0,
        next: NIL,
        prev: NIL,
        action: TimeoutAction::None,
    };
}

pub(crate) struct TimeoutQueue {
    slots: [TimeoutSlot; MAX_TIMEOUTS],
    head: u16,
    now: Ticks,
}

/// Slot index for a user timer's timeout entry.
pub(crate) fn timer_slot(timer_index: u16) -> u16 {
    MAX_THREADS as u16 + timer_index
}

impl TimeoutQueue {
    pub fn new() -> TimeoutQueue {
        TimeoutQueue {
            slots: [TimeoutSlot::VACANT; MAX_TIMEOUTS],
            head: NIL,
            now: 0,
        }
    }

    pub fn now(&self) -> Ticks {
        self.now
    }

    pub fn set_action(&mut self, index: u16, action: TimeoutAction) {
        self.slots[index as usize].action = action;
    }

    fn expired(&self, deadline: Ticks) -> bool {
        self.now.wrapping_sub(deadline) as i32 >= 0
    }

    /// Schedule `index` to expire `delay` ticks from now. Returns true when
    /// the entry became the new nearest deadline (the alarm must be
    /// reprogrammed). Double-scheduling a slot is a kernel defect.
    pub fn schedule(&mut self, index: u16, delay: Ticks) -> bool {
        let delay = delay.min(MAX_DELAY_TICKS);
        self.schedule_at(index, self.now.wrapping_add(delay))
    }

    /// Schedule at an absolute tick; used for drift-free periodic re-arm.
    /// A deadline at or before `now` is pushed one tick into the future.
    pub fn schedule_at(&mut self, index: u16, deadline: Ticks) -> bool {
        if self.slots[index as usize].scheduled {
            fatal(Fault::StateViolation);
        }
        let deadline = if self.expired(deadline) {
            self.now.wrapping_add(1)
        } else {
            deadline
        };
        let my_delta = deadline.wrapping_sub(self.now);

        let mut prev = NIL;
        let mut cursor = self.head;
        while cursor != NIL {
            let other = &self.slots[cursor as usize];
            if other.deadline.wrapping_sub(self.now) > my_delta {
                break;
            }
            prev = cursor;
            cursor = other.next;
        }

        {
            let slot = &mut self.slots[index as usize];
            slot.scheduled = true;
            slot.deadline = deadline;
            slot.prev = prev;
            slot.next = cursor;
        }
        if prev == NIL {
            self.head = index;
        } else {
            self.slots[prev as usize].next = index;
        }
        if cursor != NIL {
            self.slots[cursor as usize].prev = index;
        }
        prev == NIL
    }

    /// Remove a pending entry. Idempotent: canceling an entry that already
    /// expired or was never scheduled is a no-op. Returns true when the
    /// nearest deadline changed.
    pub fn cancel(&mut self, index: u16) -> bool {
        if !self.slots[index as usize].scheduled {
            return false;
        }
        let was_head = self.head == index;
        self.unlink(index);
        was_head
    }

    fn unlink(&mut self, index: u16) {
        let (prev, next) = {
            let slot = &self.slots[index as usize];
            (slot.prev, slot.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.slots[prev as usize].next = next;
        }
        if next != NIL {
            self.slots[next as usize].prev = prev;
        }
        let slot = &mut self.slots[index as usize];
        slot.scheduled = false;
        slot.next = NIL;
        slot.prev = NIL;
    }

    /// Advance logical time by `elapsed` ticks.
    pub fn advance(&mut self, elapsed: Ticks) {
        self.now = self.now.wrapping_add(elapsed);
    }

    /// Pop the nearest entry if it has expired. Returns the slot index, its
    /// action and the deadline it was scheduled for.
    pub fn pop_expired(&mut self) -> Option<(u16, TimeoutAction, Ticks)> {
        if self.head == NIL {
            return None;
        }
        let index = self.head;
        let slot = self.slots[index as usize];
        if !self.expired(slot.deadline) {
            return None;
        }
        self.unlink(index);
        Some((index, slot.action, slot.deadline))
    }

    /// Absolute tick of the nearest pending deadline.
    pub fn next_deadline(&self) -> Option<Ticks> {
        if self.head == NIL {
            None
        } else {
            Some(self.slots[self.head as usize].deadline)
        }
    }

    /// Ticks until the nearest pending deadline; zero when overdue.
    pub fn ticks_to_next(&self) -> Option<Ticks> {
        self.next_deadline().map(|deadline| {
            if self.expired(deadline) {
                0
            } else {
                deadline.wrapping_sub(self.now)
            }
        })
    }
}
