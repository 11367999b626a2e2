//! Drains the event queue in timestamp order and dispatches each record to
//! the registered visitors.
//!
//! Records can race between different ring buffers, so their union is only
//! eventually ordered: a record is only committed once no earlier record can
//! still arrive, i.e. once it is older than the processing delay. Records
//! that show up even later than that are discarded and counted, which
//! preserves the ordering guarantee for everything downstream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::events::{PerfEvent, PerfEventVisitor};
use crate::queue::PerfEventQueue;
use crate::timing::{monotonic_timestamp_ns, NS_PER_MILLISECOND};

/// Do not process events that are more recent than 0.1 seconds. Events come
/// out of order as they are read from different perf_event_open ring buffers;
/// this delay ensures all of them are processed in timestamp order.
pub const PROCESSING_DELAY_NS: u64 = 100 * NS_PER_MILLISECOND;

#[derive(Default)]
pub struct PerfEventProcessor {
    queue: PerfEventQueue,
    visitors: Vec<Box<dyn PerfEventVisitor + Send>>,
    last_processed_timestamp_ns: u64,
    discarded_out_of_order_counter: Option<Arc<AtomicU64>>,
}

impl PerfEventProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_visitor(&mut self, visitor: Box<dyn PerfEventVisitor + Send>) {
        self.visitors.push(visitor);
    }

    pub fn set_discarded_out_of_order_counter(&mut self, counter: Arc<AtomicU64>) {
        self.discarded_out_of_order_counter = Some(counter);
    }

    pub fn add_event(&mut self, event: PerfEvent) {
        if self.last_processed_timestamp_ns > 0
            && event.timestamp_ns() < self.last_processed_timestamp_ns
        {
            if let Some(counter) = &self.discarded_out_of_order_counter {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }
        self.queue.push(event);
    }

    /// Processes all events older than the processing delay. Called
    /// periodically while the capture runs.
    pub fn process_old_events(&mut self) {
        self.process_events_older_than(monotonic_timestamp_ns().saturating_sub(PROCESSING_DELAY_NS));
    }

    /// Processes everything left. Called once at capture end, when no new
    /// records can arrive anymore.
    pub fn process_all_events(&mut self) {
        self.process_events_older_than(u64::MAX);
    }

    fn process_events_older_than(&mut self, cutoff_timestamp_ns: u64) {
        assert!(!self.visitors.is_empty());
        while let Some(top) = self.queue.top() {
            if top.timestamp_ns() >= cutoff_timestamp_ns {
                break;
            }
            let mut event = self.queue.pop().unwrap();
            // Guaranteed by the discard in add_event.
            assert!(event.timestamp_ns() >= self.last_processed_timestamp_ns);
            self.last_processed_timestamp_ns = event.timestamp_ns();
            for visitor in &mut self.visitors {
                event.accept(visitor.as_mut());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ForkEvent, PerfEventData};
    use std::sync::Mutex;

    fn event(origin_fd: i32, timestamp_ns: u64) -> PerfEvent {
        PerfEvent {
            origin_fd,
            data: PerfEventData::Fork(ForkEvent {
                timestamp_ns,
                pid: 0,
                tid: 0,
                parent_pid: 0,
                parent_tid: 0,
            }),
        }
    }

    struct RecordingVisitor {
        timestamps: Arc<Mutex<Vec<u64>>>,
    }

    impl PerfEventVisitor for RecordingVisitor {
        fn visit_fork(&mut self, event: &ForkEvent) {
            self.timestamps.lock().unwrap().push(event.timestamp_ns);
        }
    }

    fn processor_with_recorder() -> (PerfEventProcessor, Arc<Mutex<Vec<u64>>>) {
        let timestamps = Arc::new(Mutex::new(Vec::new()));
        let mut processor = PerfEventProcessor::new();
        processor.add_visitor(Box::new(RecordingVisitor {
            timestamps: timestamps.clone(),
        }));
        (processor, timestamps)
    }

    #[test]
    fn processes_in_timestamp_order_across_sources() {
        let (mut processor, timestamps) = processor_with_recorder();
        processor.add_event(event(1, 30));
        processor.add_event(event(2, 10));
        processor.add_event(event(1, 50));
        processor.add_event(event(2, 20));
        processor.process_all_events();
        assert_eq!(*timestamps.lock().unwrap(), vec![10, 20, 30, 50]);
    }

    #[test]
    fn old_events_respect_the_cutoff() {
        let (mut processor, timestamps) = processor_with_recorder();
        processor.add_event(event(1, 100));
        processor.add_event(event(1, 200));
        processor.add_event(event(1, 300));

        processor.process_events_older_than(250);
        assert_eq!(*timestamps.lock().unwrap(), vec![100, 200]);

        processor.process_all_events();
        assert_eq!(*timestamps.lock().unwrap(), vec![100, 200, 300]);
    }

    #[test]
    fn discards_events_older_than_last_processed() {
        let (mut processor, timestamps) = processor_with_recorder();
        let discarded = Arc::new(AtomicU64::new(0));
        processor.set_discarded_out_of_order_counter(discarded.clone());

        processor.add_event(event(1, 100));
        processor.process_all_events();

        // Arrives after an event with a later timestamp was committed.
        processor.add_event(event(2, 99));
        processor.process_all_events();

        assert_eq!(*timestamps.lock().unwrap(), vec![100]);
        assert_eq!(discarded.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dispatches_to_every_visitor() {
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        let mut processor = PerfEventProcessor::new();
        processor.add_visitor(Box::new(RecordingVisitor {
            timestamps: first.clone(),
        }));
        processor.add_visitor(Box::new(RecordingVisitor {
            timestamps: second.clone(),
        }));

        processor.add_event(event(1, 7));
        processor.process_all_events();

        assert_eq!(*first.lock().unwrap(), vec![7]);
        assert_eq!(*second.lock().unwrap(), vec![7]);
    }
}
