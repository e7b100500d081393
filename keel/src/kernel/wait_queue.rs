//! Per-resource waiter queues.
//!
//! A wait queue is a doubly linked list of thread slots ordered by
//! `(effective priority, arrival sequence)`: the most urgent waiter is at
//! the head, equal priorities in FIFO order. The queue itself is a single
//! head index; the links live in the thread slots, so membership is at most
//! one queue per thread and removal is O(1) given the thread.
use crate::thread::{RawThread, ThreadTable, NIL};
use keel_khal::ThreadId;

#[derive(Copy, Clone, Debug)]
pub(crate) struct WaitQueue {
    head: u16,
}

fn key(slot: &RawThread) -> (u8, u64) {
    (slot.active_priority.level() as u8, slot.wait_seq)
}

impl WaitQueue {
    pub const EMPTY: WaitQueue = WaitQueue { head: NIL };

    pub fn is_empty(self) -> bool {
        self.head == NIL
    }

    /// Most urgent waiter, if any.
    pub fn peek(self) -> Option<ThreadId> {
        if self.head == NIL {
            None
        } else {
            Some(ThreadId::new(self.head))
        }
    }

    /// Insert in priority order, after existing waiters with the same key
    /// prefix. The thread's `active_priority` and `wait_seq` must be final
    /// before insertion.
    pub fn insert(&mut self, threads: &mut ThreadTable, tid: ThreadId) {
        let index = tid.index() as u16;
        let my_key = key(threads.at(index));

        let mut prev = NIL;
        let mut cursor = self.head;
        while cursor != NIL && key(threads.at(cursor)) <= my_key {
            prev = cursor;
            cursor = threads.at(cursor).wait_next;
        }

        {
            let slot = threads.at_mut(index);
            slot.wait_prev = prev;
            slot.wait_next = cursor;
        }
        if prev == NIL {
            self.head = index;
        } else {
            threads.at_mut(prev).wait_next = index;
        }
        if cursor != NIL {
            threads.at_mut(cursor).wait_prev = index;
        }
    }

    /// Unlink a waiter from anywhere in the queue.
    pub fn remove(&mut self, threads: &mut ThreadTable, tid: ThreadId) {
        let index = tid.index() as u16;
        let (prev, next) = {
            let slot = threads.at(index);
            (slot.wait_prev, slot.wait_next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            threads.at_mut(prev).wait_next = next;
        }
        if next != NIL {
            threads.at_mut(next).wait_prev = prev;
        }
        let slot = threads.at_mut(index);
        slot.wait_next = NIL;
        slot.wait_prev = NIL;
    }

    pub fn pop(&mut self, threads: &mut ThreadTable) -> Option<ThreadId> {
        let head = self.peek()?;
        self.remove(threads, head);
        Some(head)
    }

    /// Reposition a waiter whose effective priority changed. Keeps the
    /// original arrival sequence so FIFO standing among equals is retained.
    pub fn resort(&mut self, threads: &mut ThreadTable, tid: ThreadId) {
        self.remove(threads, tid);
        self.insert(threads, tid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::priority::Priority;
    use crate::thread::ThreadConfig;

    fn setup(priorities: &[u8]) -> (ThreadTable, Vec<ThreadId>) {
        let mut table = ThreadTable::new();
        let mut ids = Vec::new();
        for (n, &p) in priorities.iter().enumerate() {
            let tid = table
                .alloc(ThreadConfig::new("w", Priority::new(p)))
                .unwrap();
            table.slot_mut(tid).wait_seq = n as u64;
            ids.push(tid);
        }
        (table, ids)
    }

    fn drain(queue: &mut WaitQueue, threads: &mut ThreadTable) -> Vec<usize> {
        let mut order = Vec::new();
        while let Some(tid) = queue.pop(threads) {
            order.push(tid.index());
        }
        order
    }

    #[test]
    fn orders_by_priority_then_arrival() {
        let (mut threads, ids) = setup(&[5, 3, 5, 1, 3]);
        let mut queue = WaitQueue::EMPTY;
        for &tid in &ids {
            queue.insert(&mut threads, tid);
        }
        assert_eq!(drain(&mut queue, &mut threads), vec![3, 1, 4, 0, 2]);
    }

    #[test]
    fn remove_from_middle_keeps_links() {
        let (mut threads, ids) = setup(&[2, 2, 2]);
        let mut queue = WaitQueue::EMPTY;
        for &tid in &ids {
            queue.insert(&mut threads, tid);
        }
        queue.remove(&mut threads, ids[1]);
        assert_eq!(drain(&mut queue, &mut threads), vec![0, 2]);
    }

    #[test]
    fn resort_moves_boosted_waiter_ahead() {
        let (mut threads, ids) = setup(&[4, 4, 4]);
        let mut queue = WaitQueue::EMPTY;
        for &tid in &ids {
            queue.insert(&mut threads, tid);
        }
        // Boost the last arrival above the others.
        threads.slot_mut(ids[2]).active_priority = Priority::new(1);
        queue.resort(&mut threads, ids[2]);
        assert_eq!(queue.peek(), Some(ids[2]));
        assert_eq!(drain(&mut queue, &mut threads), vec![2, 0, 1]);
    }

    #[test]
    fn fifo_among_equals_after_resort_back_down() {
        let (mut threads, ids) = setup(&[4, 4]);
        let mut queue = WaitQueue::EMPTY;
        for &tid in &ids {
            queue.insert(&mut threads, tid);
        }
        // Boost and un-boost the first waiter; arrival order must hold.
        threads.slot_mut(ids[0]).active_priority = Priority::new(1);
        queue.resort(&mut threads, ids[0]);
        threads.slot_mut(ids[0]).active_priority = Priority::new(4);
        queue.resort(&mut threads, ids[0]);
        assert_eq!(drain(&mut queue, &mut threads), vec![0, 1]);
    }
}
