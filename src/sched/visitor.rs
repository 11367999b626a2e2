//! The visitor for scheduling slices and thread states.
//!
//! Consumes fork/exit records, cpu-wide context switches, and the
//! task_newtask, sched_switch and sched_wakeup tracepoints, in timestamp
//! order. Some of these records carry only a tid, so this visitor also owns
//! the system-wide tid→pid association, seeded from /proc and updated on
//! fork.
//!
//! Thread states are only tracked for the target process (the pid filter):
//! partial slices are collected at both capture boundaries through
//! `process_initial_state` and `process_remaining_open_states`.

use std::sync::Arc;

use log::error;

use super::context_switches::ContextSwitchManager;
use super::thread_states::ThreadStateManager;
use super::tid_pid::TidPidAssociator;
use crate::events::{
    ForkEvent, PerfEventVisitor, SchedSwitchEvent, SchedWakeupEvent, SwitchCpuWideEvent,
    TaskNewtaskEvent,
};
use crate::listener::{ThreadState, TracerListener};

pub struct ContextSwitchAndThreadStateVisitor {
    listener: Arc<dyn TracerListener>,
    associator: TidPidAssociator,
    switch_manager: ContextSwitchManager,
    state_manager: ThreadStateManager,
    /// None disables thread-state tracking entirely.
    thread_state_pid_filter: Option<i32>,
    /// Context switches still have to be paired when only thread state was
    /// requested, but no scheduling slices leave the visitor then.
    emit_scheduling_slices: bool,
}

impl ContextSwitchAndThreadStateVisitor {
    pub fn new(
        listener: Arc<dyn TracerListener>,
        thread_state_pid_filter: Option<i32>,
        emit_scheduling_slices: bool,
    ) -> Self {
        ContextSwitchAndThreadStateVisitor {
            listener,
            associator: TidPidAssociator::new(),
            switch_manager: ContextSwitchManager::new(),
            state_manager: ThreadStateManager::new(),
            thread_state_pid_filter,
            emit_scheduling_slices,
        }
    }

    pub fn process_initial_tid_to_pid_association(&mut self, tid: i32, pid: i32) {
        self.associator.associate_initial(tid, pid);
    }

    /// Seeds the state of a thread from its /proc stat letter, taken after
    /// the fds were enabled.
    pub fn process_initial_state(&mut self, timestamp_ns: u64, tid: i32, state_char: char) {
        if !self.tid_matches_pid_filter(tid) {
            return;
        }

        let state = thread_state_from_char(state_char).unwrap_or_else(|| {
            error!("Parsing thread state char '{state_char}' for tid {tid}");
            ThreadState::Unknown
        });
        self.state_manager.on_initial_state(timestamp_ns, tid, state);
    }

    /// Closes the open state of every tracked thread at capture end.
    pub fn process_remaining_open_states(&mut self, timestamp_ns: u64) {
        for slice in self.state_manager.on_capture_finished(timestamp_ns) {
            self.listener.on_thread_state_slice(slice);
        }
    }

    fn tid_matches_pid_filter(&self, tid: i32) -> bool {
        match self.thread_state_pid_filter {
            Some(filter_pid) => self.associator.pid_of_tid(tid) == Some(filter_pid),
            None => false,
        }
    }
}

impl PerfEventVisitor for ContextSwitchAndThreadStateVisitor {
    fn visit_fork(&mut self, event: &ForkEvent) {
        self.associator.associate_from_fork(event.tid, event.pid);
        if self.tid_matches_pid_filter(event.tid) {
            self.state_manager.on_new_task(
                event.timestamp_ns,
                event.tid,
                event.parent_tid,
                event.parent_pid,
            );
        }
    }

    fn visit_exit(&mut self, _event: &crate::events::ExitEvent) {
        // Keep the association: the exiting thread still goes through
        // sched_switches after its exit record.
    }

    fn visit_switch_cpu_wide(&mut self, event: &SwitchCpuWideEvent) {
        // Switches with tid 0 are associated with the idle state; never
        // consider them.
        if event.tid == 0 {
            return;
        }

        if event.is_switch_out {
            // On a switch-out caused by the thread exiting, pid and tid are
            // -1; the pairer falls back to its open entry.
            if let Some(slice) = self.switch_manager.process_switch_out(
                event.pid,
                event.tid,
                event.cpu,
                event.timestamp_ns,
            ) {
                if self.emit_scheduling_slices {
                    if slice.pid == -1 {
                        error!("SchedulingSlice with unknown pid");
                    }
                    self.listener.on_scheduling_slice(slice);
                }
            }
        } else {
            self.switch_manager.process_switch_in(
                Some(event.pid),
                event.tid,
                event.cpu,
                event.timestamp_ns,
            );
        }
    }

    fn visit_sched_switch(&mut self, event: &SchedSwitchEvent) {
        // Switches with tid 0 are associated with the idle state; never
        // consider them.

        // The switch-out side, for scheduling slices. The pid of the thread
        // being switched out comes from the record's generic sample fields,
        // but is -1 when the switch-out is caused by the thread exiting; fall
        // back to the tid→pid association in that case.
        if event.prev_tid != 0 {
            let mut prev_pid = event.prev_pid_or_minus_one;
            if prev_pid == -1 {
                if let Some(fallback) = self.associator.pid_of_tid(event.prev_tid) {
                    prev_pid = fallback;
                }
            } else {
                self.associator.associate_observed(event.prev_tid, prev_pid);
            }
            if let Some(slice) = self.switch_manager.process_switch_out(
                prev_pid,
                event.prev_tid,
                event.cpu,
                event.timestamp_ns,
            ) {
                if self.emit_scheduling_slices {
                    if slice.pid == -1 {
                        error!("SchedulingSlice with unknown pid");
                    }
                    self.listener.on_scheduling_slice(slice);
                }
            }
        }

        // The switch-in side. The tracepoint doesn't report the pid of the
        // incoming thread.
        if event.next_tid != 0 {
            self.switch_manager.process_switch_in(
                self.associator.pid_of_tid(event.next_tid),
                event.next_tid,
                event.cpu,
                event.timestamp_ns,
            );
        }

        // The switch-out side, for thread state.
        if event.prev_tid != 0 && self.tid_matches_pid_filter(event.prev_tid) {
            let new_state = thread_state_from_bits(event.prev_state_bits as u64);
            if let Some(slice) = self.state_manager.on_sched_switch_out(
                event.timestamp_ns,
                event.prev_tid,
                new_state,
            ) {
                self.listener.on_thread_state_slice(slice);
            }
        }

        // The switch-in side, for thread state.
        if event.next_tid != 0 && self.tid_matches_pid_filter(event.next_tid) {
            if let Some(slice) = self
                .state_manager
                .on_sched_switch_in(event.timestamp_ns, event.next_tid)
            {
                self.listener.on_thread_state_slice(slice);
            }
        }
    }

    fn visit_sched_wakeup(&mut self, event: &SchedWakeupEvent) {
        if !self.tid_matches_pid_filter(event.woken_tid) {
            return;
        }

        if let Some(slice) = self.state_manager.on_sched_wakeup(
            event.timestamp_ns,
            event.woken_tid,
            event.was_unblocked_by_tid,
            event.was_unblocked_by_pid,
        ) {
            self.listener.on_thread_state_slice(slice);
        }
    }

    fn visit_task_newtask(&mut self, event: &TaskNewtaskEvent) {
        // The thread name from this tracepoint is emitted directly by the
        // poller; only thread state is handled here.
        if !self.tid_matches_pid_filter(event.tid) {
            return;
        }
        self.state_manager.on_new_task(
            event.timestamp_ns,
            event.tid,
            event.was_created_by_tid,
            event.was_created_by_pid,
        );
    }
}

/// State letter from /proc/<tid>/stat, as also listed under
/// PROCESS STATE CODES in ps(1).
fn thread_state_from_char(c: char) -> Option<ThreadState> {
    match c {
        'R' => Some(ThreadState::Runnable),
        'S' => Some(ThreadState::InterruptibleSleep),
        'D' => Some(ThreadState::UninterruptibleSleep),
        'T' => Some(ThreadState::Stopped),
        't' => Some(ThreadState::Traced),
        'X' => Some(ThreadState::Dead),
        'Z' => Some(ThreadState::Zombie),
        // Parked is only produced by Linux 3.9 to 3.13 but still appears in
        // the sched_switch format file.
        'P' => Some(ThreadState::Parked),
        // Idle only applies to kernel threads.
        'I' => Some(ThreadState::Idle),
        _ => None,
    }
}

/// State bits of the prev_state field of sched:sched_switch, as given away
/// by the "print fmt" in its format file. If multiple bits are set, the
/// lowest wins.
fn thread_state_from_bits(bits: u64) -> ThreadState {
    if (bits & 0xff).count_ones() > 1 {
        error!(
            "The thread state mask {:#x} is a combination of states, reporting only the first",
            bits & 0xff
        );
    }
    if bits & 0x01 != 0 {
        ThreadState::InterruptibleSleep
    } else if bits & 0x02 != 0 {
        ThreadState::UninterruptibleSleep
    } else if bits & 0x04 != 0 {
        ThreadState::Stopped
    } else if bits & 0x08 != 0 {
        ThreadState::Traced
    } else if bits & 0x10 != 0 {
        ThreadState::Dead
    } else if bits & 0x20 != 0 {
        ThreadState::Zombie
    } else if bits & 0x40 != 0 {
        ThreadState::Parked
    } else if bits & 0x80 != 0 {
        ThreadState::Idle
    } else {
        ThreadState::Runnable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{SchedulingSlice, ThreadStateSlice, WakeupReason};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingListener {
        scheduling_slices: Mutex<Vec<SchedulingSlice>>,
        thread_state_slices: Mutex<Vec<ThreadStateSlice>>,
    }

    impl TracerListener for CollectingListener {
        fn on_scheduling_slice(&self, slice: SchedulingSlice) {
            self.scheduling_slices.lock().unwrap().push(slice);
        }

        fn on_thread_state_slice(&self, slice: ThreadStateSlice) {
            self.thread_state_slices.lock().unwrap().push(slice);
        }
    }

    fn switch_event(
        timestamp_ns: u64,
        cpu: u32,
        prev_pid: i32,
        prev_tid: i32,
        prev_state_bits: i64,
        next_tid: i32,
    ) -> SchedSwitchEvent {
        SchedSwitchEvent {
            timestamp_ns,
            cpu,
            prev_pid_or_minus_one: prev_pid,
            prev_tid,
            prev_state_bits,
            next_tid,
        }
    }

    #[test]
    fn one_thread_scheduling_slice() {
        let listener = Arc::new(CollectingListener::default());
        let mut visitor = ContextSwitchAndThreadStateVisitor::new(listener.clone(), None, true);

        visitor.visit_switch_cpu_wide(&SwitchCpuWideEvent {
            timestamp_ns: 100,
            cpu: 1,
            pid: 42,
            tid: 43,
            is_switch_out: false,
        });
        visitor.visit_switch_cpu_wide(&SwitchCpuWideEvent {
            timestamp_ns: 200,
            cpu: 1,
            pid: 42,
            tid: 43,
            is_switch_out: true,
        });

        assert_eq!(
            *listener.scheduling_slices.lock().unwrap(),
            vec![SchedulingSlice {
                pid: 42,
                tid: 43,
                core: 1,
                in_timestamp_ns: 100,
                out_timestamp_ns: 200,
            }]
        );
    }

    #[test]
    fn thread_exit_switch_out_takes_pid_from_association() {
        let listener = Arc::new(CollectingListener::default());
        let mut visitor = ContextSwitchAndThreadStateVisitor::new(listener.clone(), None, true);
        visitor.process_initial_tid_to_pid_association(43, 42);

        visitor.visit_sched_switch(&switch_event(100, 1, 42, 99, 0, 43));
        visitor.visit_sched_switch(&switch_event(200, 1, -1, 43, 0x20, 7));

        let slices = listener.scheduling_slices.lock().unwrap();
        assert_eq!(
            *slices,
            vec![SchedulingSlice {
                pid: 42,
                tid: 43,
                core: 1,
                in_timestamp_ns: 100,
                out_timestamp_ns: 200,
            }]
        );
    }

    #[test]
    fn idle_tid_zero_is_ignored() {
        let listener = Arc::new(CollectingListener::default());
        let mut visitor = ContextSwitchAndThreadStateVisitor::new(listener.clone(), None, true);

        visitor.visit_sched_switch(&switch_event(100, 0, 0, 0, 0, 10));
        visitor.visit_sched_switch(&switch_event(200, 0, 5, 10, 0, 0));
        visitor.visit_sched_switch(&switch_event(300, 0, 0, 0, 0, 10));

        // Only the 10-in/10-out pair produced a slice; the idle transitions
        // were dropped.
        assert_eq!(listener.scheduling_slices.lock().unwrap().len(), 1);
    }

    #[test]
    fn thread_state_round_trip_for_filtered_process() {
        let listener = Arc::new(CollectingListener::default());
        let mut visitor = ContextSwitchAndThreadStateVisitor::new(listener.clone(), Some(42), true);
        visitor.process_initial_tid_to_pid_association(42, 42);

        visitor.process_initial_state(100, 42, 'R');
        visitor.visit_sched_switch(&switch_event(200, 0, 1, 1, 0, 42));
        visitor.visit_sched_switch(&switch_event(300, 0, 42, 42, 0x01, 1));
        visitor.visit_sched_wakeup(&SchedWakeupEvent {
            timestamp_ns: 400,
            woken_tid: 42,
            was_unblocked_by_tid: 7,
            was_unblocked_by_pid: 6,
        });
        visitor.visit_sched_switch(&switch_event(500, 0, 1, 1, 0, 42));
        visitor.process_remaining_open_states(600);

        let slices = listener.thread_state_slices.lock().unwrap();
        let states: Vec<(ThreadState, u64, u64)> = slices
            .iter()
            .map(|s| (s.state, s.begin_timestamp_ns, s.end_timestamp_ns))
            .collect();
        assert_eq!(
            states,
            vec![
                (ThreadState::Runnable, 100, 200),
                (ThreadState::Running, 200, 300),
                (ThreadState::InterruptibleSleep, 300, 400),
                (ThreadState::Runnable, 400, 500),
                (ThreadState::Running, 500, 600),
            ]
        );
        assert_eq!(slices[3].wakeup_reason, WakeupReason::Unblocked);
        assert_eq!(slices[3].wakeup_tid, 7);
        assert_eq!(slices[3].wakeup_pid, 6);
    }

    #[test]
    fn threads_of_other_processes_are_not_tracked() {
        let listener = Arc::new(CollectingListener::default());
        let mut visitor = ContextSwitchAndThreadStateVisitor::new(listener.clone(), Some(42), true);
        visitor.process_initial_tid_to_pid_association(50, 43);

        visitor.process_initial_state(100, 50, 'R');
        visitor.visit_sched_switch(&switch_event(200, 0, 1, 1, 0, 50));
        visitor.process_remaining_open_states(300);

        assert!(listener.thread_state_slices.lock().unwrap().is_empty());
    }

    #[test]
    fn fork_extends_the_filter_to_new_threads() {
        let listener = Arc::new(CollectingListener::default());
        let mut visitor = ContextSwitchAndThreadStateVisitor::new(listener.clone(), Some(42), true);
        visitor.process_initial_tid_to_pid_association(42, 42);

        visitor.visit_fork(&ForkEvent {
            timestamp_ns: 100,
            pid: 42,
            tid: 44,
            parent_pid: 42,
            parent_tid: 42,
        });
        visitor.visit_sched_switch(&switch_event(200, 0, 1, 1, 0, 44));
        visitor.process_remaining_open_states(300);

        let slices = listener.thread_state_slices.lock().unwrap();
        let states: Vec<(i32, ThreadState)> = slices.iter().map(|s| (s.tid, s.state)).collect();
        assert_eq!(
            states,
            vec![(44, ThreadState::Runnable), (44, ThreadState::Running)]
        );
        assert_eq!(slices[0].wakeup_reason, WakeupReason::Created);
        assert_eq!(slices[0].wakeup_tid, 42);
    }

    #[test]
    fn state_char_and_bits_mappings() {
        assert_eq!(thread_state_from_char('R'), Some(ThreadState::Runnable));
        assert_eq!(thread_state_from_char('D'), Some(ThreadState::UninterruptibleSleep));
        assert_eq!(thread_state_from_char('t'), Some(ThreadState::Traced));
        assert_eq!(thread_state_from_char('?'), None);

        assert_eq!(thread_state_from_bits(0), ThreadState::Runnable);
        assert_eq!(thread_state_from_bits(0x01), ThreadState::InterruptibleSleep);
        assert_eq!(thread_state_from_bits(0x02), ThreadState::UninterruptibleSleep);
        assert_eq!(thread_state_from_bits(0x10), ThreadState::Dead);
        assert_eq!(thread_state_from_bits(0x80), ThreadState::Idle);
        // Lowest bit wins on combinations.
        assert_eq!(thread_state_from_bits(0x03), ThreadState::InterruptibleSleep);
    }
}
