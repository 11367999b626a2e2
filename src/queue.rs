//! A queue that holds a large number of records coming from multiple ring
//! buffers and yields them oldest-first.
//!
//! Instead of one priority queue over all events, where push/pop would be
//! logarithmic in the number of events, this leverages the fact that events
//! from the same ring buffer already arrive in timestamp order: each origin
//! gets a FIFO, and a heap orders the origins by the timestamp at the front
//! of their FIFO. Push and pop are then logarithmic in the number of origins.
//! The heap is maintained with explicit sifts on the front and back, which is
//! cheaper than remove-and-reinsert.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;

use rustc_hash::FxHashMap;

use crate::events::PerfEvent;

#[derive(Default)]
pub struct PerfEventQueue {
    /// Origin fds, heap-ordered by the timestamp of their FIFO's front.
    heap: Vec<RawFd>,
    queues: FxHashMap<RawFd, VecDeque<PerfEvent>>,
}

impl PerfEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: PerfEvent) {
        let origin_fd = event.origin_fd;
        if let Some(queue) = self.queues.get_mut(&origin_fd) {
            assert!(!queue.is_empty());
            // Fundamental assumption: events from the same ring buffer come
            // already in order.
            assert!(
                event.timestamp_ns() >= queue.back().unwrap().timestamp_ns(),
                "out-of-order event from fd {origin_fd}"
            );
            queue.push_back(event);
        } else {
            let mut queue = VecDeque::new();
            queue.push_back(event);
            self.queues.insert(origin_fd, queue);
            self.heap.push(origin_fd);
            self.sift_up_back();
        }
    }

    pub fn has_event(&self) -> bool {
        !self.heap.is_empty()
    }

    pub fn top(&self) -> Option<&PerfEvent> {
        let fd = *self.heap.first()?;
        self.queues[&fd].front()
    }

    pub fn pop(&mut self) -> Option<PerfEvent> {
        let top_fd = *self.heap.first()?;
        let top_queue = self.queues.get_mut(&top_fd).unwrap();
        let top_event = top_queue.pop_front().unwrap();

        if top_queue.is_empty() {
            self.queues.remove(&top_fd);
            let last = self.heap.len() - 1;
            self.heap.swap(0, last);
            self.heap.pop();
        }
        // Either the front origin has a new, later front timestamp, or it was
        // replaced by the heap's back; both sift down.
        self.sift_down_front();

        Some(top_event)
    }

    fn front_timestamp(&self, fd: RawFd) -> u64 {
        self.queues[&fd].front().unwrap().timestamp_ns()
    }

    fn sift_down_front(&mut self) {
        if self.heap.is_empty() {
            return;
        }

        let mut current = 0;
        loop {
            let mut smallest = current;
            let left = current * 2 + 1;
            let right = current * 2 + 2;
            if left < self.heap.len()
                && self.front_timestamp(self.heap[left])
                    < self.front_timestamp(self.heap[smallest])
            {
                smallest = left;
            }
            if right < self.heap.len()
                && self.front_timestamp(self.heap[right])
                    < self.front_timestamp(self.heap[smallest])
            {
                smallest = right;
            }
            if smallest == current {
                break;
            }
            self.heap.swap(smallest, current);
            current = smallest;
        }
    }

    fn sift_up_back(&mut self) {
        if self.heap.is_empty() {
            return;
        }

        let mut current = self.heap.len() - 1;
        while current > 0 {
            let parent = (current - 1) / 2;
            if self.front_timestamp(self.heap[parent]) <= self.front_timestamp(self.heap[current])
            {
                break;
            }
            self.heap.swap(parent, current);
            current = parent;
        }
    }
}
