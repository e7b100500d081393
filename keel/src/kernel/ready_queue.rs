//! The ready structure, in one of two disciplines selected at kernel
//! construction.
//!
//! Both disciplines order runnable threads by `(effective priority, arrival
//! sequence)` and are observably identical; they differ only in their cost
//! profile:
//!
//! * [`MultiLevelQueue`]: one FIFO per priority level plus a level bitmap.
//!   Enqueue, dequeue and remove are O(1); memory grows with the number of
//!   priority levels.
//! * [`OrderedQueue`]: a single arena-backed binary heap keyed by
//!   `(priority, seq)` with a back-index in each thread slot, O(log n) per
//!   operation and no per-level storage.
//!
//! The thread's `active_priority` and `ready_seq` must be final when it is
//! enqueued, and must not change while it is a member; the scheduler removes
//! first, updates, then re-enqueues.
use bit_field::BitField;

use crate::config::{MAX_THREADS, PRIORITY_LEVELS};
use crate::kernel::fault::{fatal, Fault};
use crate::thread::{ThreadTable, NIL};
use keel_khal::ThreadId;

/// Where a newly runnable thread lands within its priority level.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum Placement {
    /// New arrivals and yielders go behind their equals.
    Back,
    /// A preempted thread keeps its standing among equals.
    Front,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum QueueDiscipline {
    /// Bitmap-indexed per-level FIFOs, O(1).
    MultiLevel,
    /// Single ordered arena heap, O(log n).
    Ordered,
}

pub(crate) enum ReadyQueue {
    MultiLevel(MultiLevelQueue),
    Ordered(OrderedQueue),
}

impl ReadyQueue {
    pub fn new(discipline: QueueDiscipline) -> ReadyQueue {
        match discipline {
            QueueDiscipline::MultiLevel => ReadyQueue::MultiLevel(MultiLevelQueue::new()),
            QueueDiscipline::Ordered => ReadyQueue::Ordered(OrderedQueue::new()),
        }
    }

    pub fn enqueue(&mut self, threads: &mut ThreadTable, tid: ThreadId, placement: Placement) {
        if threads.at(tid.index() as u16).is_queued_ready() {
            fatal(Fault::StateViolation);
        }
        threads.at_mut(tid.index() as u16).queued_ready = true;
        match self {
            ReadyQueue::MultiLevel(q) => q.enqueue(threads, tid, placement),
            ReadyQueue::Ordered(q) => q.enqueue(threads, tid),
        }
    }

    /// Pop the most urgent runnable thread.
    pub fn dequeue(&mut self, threads: &mut ThreadTable) -> Option<ThreadId> {
        let tid = match self {
            ReadyQueue::MultiLevel(q) => q.dequeue(threads),
            ReadyQueue::Ordered(q) => q.dequeue(threads),
        }?;
        threads.at_mut(tid.index() as u16).queued_ready = false;
        Some(tid)
    }

    pub fn peek(&self) -> Option<ThreadId> {
        match self {
            ReadyQueue::MultiLevel(q) => q.peek(),
            ReadyQueue::Ordered(q) => q.peek(),
        }
    }

    /// Remove a specific member, wherever it is.
    pub fn remove(&mut self, threads: &mut ThreadTable, tid: ThreadId) {
        match self {
            ReadyQueue::MultiLevel(q) => q.remove(threads, tid),
            ReadyQueue::Ordered(q) => q.remove(threads, tid),
        }
        threads.at_mut(tid.index() as u16).queued_ready = false;
    }

    pub fn is_empty(&self) -> bool {
        self.peek().is_none()
    }
}

pub(crate) struct MultiLevelQueue {
    /// Bit `n` set iff level `n` has at least one queued thread.
    bitmap: u64,
    head: [u16; PRIORITY_LEVELS],
    tail: [u16; PRIORITY_LEVELS],
}

impl MultiLevelQueue {
    fn new() -> MultiLevelQueue {
        MultiLevelQueue {
            bitmap: 0,
            head: [NIL; PRIORITY_LEVELS],
            tail: [NIL; PRIORITY_LEVELS],
        }
    }

    fn enqueue(&mut self, threads: &mut ThreadTable, tid: ThreadId, placement: Placement) {
        let index = tid.index() as u16;
        let level = threads.at(index).active_priority.level();
        match placement {
            Placement::Back => {
                let old_tail = self.tail[level];
                threads.at_mut(index).run_prev = old_tail;
                if old_tail == NIL {
                    self.head[level] = index;
                } else {
                    threads.at_mut(old_tail).run_next = index;
                }
                self.tail[level] = index;
            }
            Placement::Front => {
                let old_head = self.head[level];
                threads.at_mut(index).run_next = old_head;
                if old_head == NIL {
                    self.tail[level] = index;
                } else {
                    threads.at_mut(old_head).run_prev = index;
                }
                self.head[level] = index;
            }
        }
        self.bitmap.set_bit(level, true);
    }

    fn peek(&self) -> Option<ThreadId> {
        if self.bitmap == 0 {
            return None;
        }
        let level = self.bitmap.trailing_zeros() as usize;
        Some(ThreadId::new(self.head[level]))
    }

    fn dequeue(&mut self, threads: &mut ThreadTable) -> Option<ThreadId> {
        let tid = self.peek()?;
        self.remove(threads, tid);
        Some(tid)
    }

    fn remove(&mut self, threads: &mut ThreadTable, tid: ThreadId) {
        let index = tid.index() as u16;
        let level = threads.at(index).active_priority.level();
        let (prev, next) = {
            let slot = threads.at(index);
            (slot.run_prev, slot.run_next)
        };
        if prev == NIL {
            self.head[level] = next;
        } else {
            threads.at_mut(prev).run_next = next;
        }
        if next == NIL {
            self.tail[level] = prev;
        } else {
            threads.at_mut(next).run_prev = prev;
        }
        if self.head[level] == NIL {
            self.bitmap.set_bit(level, false);
        }
        let slot = threads.at_mut(index);
        slot.run_next = NIL;
        slot.run_prev = NIL;
    }
}

#[derive(Copy, Clone)]
struct HeapEntry {
    level: u8,
    seq: u64,
    tid: u16,
}

impl HeapEntry {
    const VACANT: HeapEntry = HeapEntry {
        level: 0,
        seq: 0,
        tid: NIL,
    };

    fn key(&self) -> (u8, u64) {
        (self.level, self.seq)
    }
}

pub(crate) struct OrderedQueue {
    entries: [HeapEntry; MAX_THREADS],
    len: usize,
}

impl OrderedQueue {
    fn new() -> OrderedQueue {
        OrderedQueue {
            entries: [HeapEntry::VACANT; MAX_THREADS],
            len: 0,
        }
    }

    fn enqueue(&mut self, threads: &mut ThreadTable, tid: ThreadId) {
        let index = tid.index() as u16;
        let slot = threads.at(index);
        let entry = HeapEntry {
            level: slot.active_priority.level() as u8,
            seq: slot.ready_seq,
            tid: index,
        };
        let pos = self.len;
        self.entries[pos] = entry;
        self.len += 1;
        threads.at_mut(index).heap_pos = pos as u16;
        self.sift_up(threads, pos);
    }

    fn peek(&self) -> Option<ThreadId> {
        if self.len == 0 {
            None
        } else {
            Some(ThreadId::new(self.entries[0].tid))
        }
    }

    fn dequeue(&mut self, threads: &mut ThreadTable) -> Option<ThreadId> {
        let tid = self.peek()?;
        self.remove(threads, tid);
        Some(tid)
    }

    fn remove(&mut self, threads: &mut ThreadTable, tid: ThreadId) {
        let index = tid.index() as u16;
        let pos = threads.at(index).heap_pos;
        if pos == NIL || pos as usize >= self.len || self.entries[pos as usize].tid != index {
            fatal(Fault::StateViolation);
        }
        let pos = pos as usize;
        threads.at_mut(index).heap_pos = NIL;
        self.len -= 1;
        if pos < self.len {
            self.entries[pos] = self.entries[self.len];
            threads.at_mut(self.entries[pos].tid).heap_pos = pos as u16;
            self.sift_down(threads, pos);
            self.sift_up(threads, pos);
        }
    }

    fn swap(&mut self, threads: &mut ThreadTable, a: usize, b: usize) {
        self.entries.swap(a, b);
        threads.at_mut(self.entries[a].tid).heap_pos = a as u16;
        threads.at_mut(self.entries[b].tid).heap_pos = b as u16;
    }

    fn sift_up(&mut self, threads: &mut ThreadTable, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.entries[pos].key() < self.entries[parent].key() {
                self.swap(threads, pos, parent);
                pos = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, threads: &mut ThreadTable, mut pos: usize) {
        loop {
            let left = 2 * pos + 1;
            let right = 2 * pos + 2;
            let mut least = pos;
            if left < self.len && self.entries[left].key() < self.entries[least].key() {
                least = left;
            }
            if right < self.len && self.entries[right].key() < self.entries[least].key() {
                least = right;
            }
            if least == pos {
                break;
            }
            self.swap(threads, pos, least);
            pos = least;
        }
    }
}
