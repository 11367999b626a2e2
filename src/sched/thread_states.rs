//! Tracks the scheduler state of each observed thread and produces a
//! `ThreadStateSlice` on every transition.
//!
//! The relationship between states and the tracepoints that move between
//! them:
//!
//!       task:task_newtask                         sched:sched_switch(in)
//!   ---------------------> ------------ ------------------------------> -----------
//!                          | Runnable |                                 | Running |
//!                          ------------ <------------------------------ -----------
//!                               ^           sched:sched_switch(out)       ^  |
//!                               |            with prev_state == R         .  |
//!                               |                                         .  |
//!                               |                  sched:sched_switch(in) .  |
//!                               |              ---------------- . . . . ..  |
//!                               |              | Not runnable |              |
//!                               -------------- | incl. exited | <------------
//!                        sched:sched_wakeup    ----------------   sched_switch(out)
//!                                                                 with prev_state != R
//!
//! A thread that exits is not transitioned out of the diagram: it remains
//! "not runnable" with state dead or zombie, because an exiting thread still
//! goes through one or more sched_switches after sched_process_exit.
//!
//! Events are processed in timestamp order, except that the initial states
//! are retrieved from /proc only after the perf fds have been enabled (so no
//! transition is lost in between). It is then common for the first tracepoint
//! events of a thread to be older than its initial-state timestamp; in that
//! case the stale initial state is discarded and replaced without emitting a
//! slice.

use log::{debug, error};
use rustc_hash::FxHashMap;

use crate::listener::{ThreadState, ThreadStateSlice, WakeupReason};

struct OpenState {
    state: ThreadState,
    begin_timestamp_ns: u64,
    wakeup_reason: WakeupReason,
    wakeup_tid: i32,
    wakeup_pid: i32,
}

impl OpenState {
    fn new(state: ThreadState, begin_timestamp_ns: u64) -> Self {
        OpenState {
            state,
            begin_timestamp_ns,
            wakeup_reason: WakeupReason::NotApplicable,
            wakeup_tid: 0,
            wakeup_pid: 0,
        }
    }

    fn with_wakeup(
        state: ThreadState,
        begin_timestamp_ns: u64,
        wakeup_reason: WakeupReason,
        wakeup_tid: i32,
        wakeup_pid: i32,
    ) -> Self {
        OpenState {
            state,
            begin_timestamp_ns,
            wakeup_reason,
            wakeup_tid,
            wakeup_pid,
        }
    }

    fn slice_ending_at(&self, tid: i32, end_timestamp_ns: u64) -> ThreadStateSlice {
        ThreadStateSlice {
            tid,
            state: self.state,
            begin_timestamp_ns: self.begin_timestamp_ns,
            end_timestamp_ns,
            wakeup_reason: self.wakeup_reason,
            wakeup_tid: self.wakeup_tid,
            wakeup_pid: self.wakeup_pid,
        }
    }
}

#[derive(Default)]
pub struct ThreadStateManager {
    open_states_by_tid: FxHashMap<i32, OpenState>,
}

impl ThreadStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_initial_state(&mut self, timestamp_ns: u64, tid: i32, state: ThreadState) {
        assert!(!self.open_states_by_tid.contains_key(&tid));
        self.open_states_by_tid
            .insert(tid, OpenState::new(state, timestamp_ns));
    }

    pub fn on_new_task(
        &mut self,
        timestamp_ns: u64,
        tid: i32,
        was_created_by_tid: i32,
        was_created_by_pid: i32,
    ) {
        if let Some(open_state) = self.open_states_by_tid.get(&tid) {
            if timestamp_ns >= open_state.begin_timestamp_ns {
                if open_state.state == ThreadState::Runnable
                    && open_state.wakeup_reason == WakeupReason::Created
                {
                    // Both the fork record and the task_newtask tracepoint
                    // report the creation; the second one is redundant.
                    debug!("Thread {tid} was already registered as newly created");
                } else {
                    error!("Processed task:task_newtask but thread {tid} was already known");
                }
                return;
            }
            // Fall through: the known state is the stale initial state.
        }
        self.open_states_by_tid.insert(
            tid,
            OpenState::with_wakeup(
                ThreadState::Runnable,
                timestamp_ns,
                WakeupReason::Created,
                was_created_by_tid,
                was_created_by_pid,
            ),
        );
    }

    pub fn on_sched_wakeup(
        &mut self,
        timestamp_ns: u64,
        tid: i32,
        was_unblocked_by_tid: i32,
        was_unblocked_by_pid: i32,
    ) -> Option<ThreadStateSlice> {
        let new_open_state = OpenState::with_wakeup(
            ThreadState::Runnable,
            timestamp_ns,
            WakeupReason::Unblocked,
            was_unblocked_by_tid,
            was_unblocked_by_pid,
        );

        let Some(open_state) = self.open_states_by_tid.get(&tid) else {
            error!("Processed sched:sched_wakeup but previous state of thread {tid} is unknown");
            self.open_states_by_tid.insert(tid, new_open_state);
            return None;
        };

        if timestamp_ns < open_state.begin_timestamp_ns {
            // Overwrite the stale initial state without emitting.
            self.open_states_by_tid.insert(tid, new_open_state);
            return None;
        }

        if open_state.state == ThreadState::Runnable || open_state.state == ThreadState::Running {
            // It is somewhat common for a thread to receive a wakeup while
            // already runnable or running: disregard the state change.
            return None;
        }

        if open_state.state == ThreadState::Zombie || open_state.state == ThreadState::Dead {
            error!(
                "Processed sched:sched_wakeup for thread {tid} but unexpected previous state {:?}",
                open_state.state
            );
        }

        let slice = open_state.slice_ending_at(tid, timestamp_ns);
        self.open_states_by_tid.insert(tid, new_open_state);
        Some(slice)
    }

    pub fn on_sched_switch_in(&mut self, timestamp_ns: u64, tid: i32) -> Option<ThreadStateSlice> {
        let new_open_state = OpenState::new(ThreadState::Running, timestamp_ns);

        let Some(open_state) = self.open_states_by_tid.get(&tid) else {
            error!(
                "Processed sched:sched_switch(in) but previous state of thread {tid} is unknown"
            );
            self.open_states_by_tid.insert(tid, new_open_state);
            return None;
        };

        if timestamp_ns < open_state.begin_timestamp_ns {
            self.open_states_by_tid.insert(tid, new_open_state);
            return None;
        }

        if open_state.state == ThreadState::Running {
            // No state change: keep the previous begin timestamp.
            return None;
        }

        // A previous state other than runnable is not an error: a thread can
        // go from a non-runnable state directly to running, skipping the
        // sched_wakeup event.

        let slice = open_state.slice_ending_at(tid, timestamp_ns);
        self.open_states_by_tid.insert(tid, new_open_state);
        Some(slice)
    }

    pub fn on_sched_switch_out(
        &mut self,
        timestamp_ns: u64,
        tid: i32,
        new_state: ThreadState,
    ) -> Option<ThreadStateSlice> {
        let new_open_state = OpenState::new(new_state, timestamp_ns);

        let Some(open_state) = self.open_states_by_tid.get(&tid) else {
            error!(
                "Processed sched:sched_switch(out) but previous state of thread {tid} is unknown"
            );
            self.open_states_by_tid.insert(tid, new_open_state);
            return None;
        };

        if timestamp_ns < open_state.begin_timestamp_ns {
            self.open_states_by_tid.insert(tid, new_open_state);
            return None;
        }

        // When switching out of a cpu, a previous state of runnable means
        // running: the initial states retrieved from /proc cannot tell the
        // two apart, as the kernel considers them the same state.
        let mut adjusted_state = open_state.state;
        if adjusted_state == ThreadState::Runnable {
            adjusted_state = ThreadState::Running;
        }

        if adjusted_state != ThreadState::Running {
            error!(
                "Processed sched:sched_switch(out) for thread {tid} but unexpected previous state {:?}",
                adjusted_state
            );
            if adjusted_state == new_state {
                // No state change: keep the previous begin timestamp.
                return None;
            }
        }

        let mut slice = open_state.slice_ending_at(tid, timestamp_ns);
        slice.state = adjusted_state;

        // If the thread exits with new_state zombie rather than dead, the
        // later switch to dead is never reported.
        self.open_states_by_tid.insert(tid, new_open_state);
        Some(slice)
    }

    /// Closes one slice per still-open thread at capture end.
    pub fn on_capture_finished(&mut self, timestamp_ns: u64) -> Vec<ThreadStateSlice> {
        self.open_states_by_tid
            .iter()
            .map(|(&tid, open_state)| open_state.slice_ending_at(tid, timestamp_ns))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(
        tid: i32,
        state: ThreadState,
        begin: u64,
        end: u64,
        reason: WakeupReason,
        wakeup_tid: i32,
        wakeup_pid: i32,
    ) -> ThreadStateSlice {
        ThreadStateSlice {
            tid,
            state,
            begin_timestamp_ns: begin,
            end_timestamp_ns: end,
            wakeup_reason: reason,
            wakeup_tid,
            wakeup_pid,
        }
    }

    const TID: i32 = 42;

    #[test]
    fn full_round_trip_produces_touching_slices() {
        let mut manager = ThreadStateManager::new();
        manager.on_initial_state(100, TID, ThreadState::Runnable);

        let s1 = manager.on_sched_switch_in(200, TID).unwrap();
        assert_eq!(
            s1,
            slice(TID, ThreadState::Runnable, 100, 200, WakeupReason::NotApplicable, 0, 0)
        );

        let s2 = manager
            .on_sched_switch_out(300, TID, ThreadState::InterruptibleSleep)
            .unwrap();
        assert_eq!(
            s2,
            slice(TID, ThreadState::Running, 200, 300, WakeupReason::NotApplicable, 0, 0)
        );

        let s3 = manager.on_sched_wakeup(400, TID, 7, 6).unwrap();
        assert_eq!(
            s3,
            slice(TID, ThreadState::InterruptibleSleep, 300, 400, WakeupReason::NotApplicable, 0, 0)
        );

        let s4 = manager.on_sched_switch_in(500, TID).unwrap();
        assert_eq!(s4, slice(TID, ThreadState::Runnable, 400, 500, WakeupReason::Unblocked, 7, 6));

        let finished = manager.on_capture_finished(600);
        assert_eq!(
            finished,
            vec![slice(TID, ThreadState::Running, 500, 600, WakeupReason::NotApplicable, 0, 0)]
        );
    }

    #[test]
    fn new_task_starts_runnable_with_created_reason() {
        let mut manager = ThreadStateManager::new();
        manager.on_new_task(100, TID, 7, 6);
        let s = manager.on_sched_switch_in(250, TID).unwrap();
        assert_eq!(s, slice(TID, ThreadState::Runnable, 100, 250, WakeupReason::Created, 7, 6));
    }

    #[test]
    fn wakeup_on_runnable_or_running_thread_is_ignored() {
        let mut manager = ThreadStateManager::new();
        manager.on_initial_state(100, TID, ThreadState::Runnable);
        assert!(manager.on_sched_wakeup(150, TID, 1, 1).is_none());

        manager.on_sched_switch_in(200, TID);
        assert!(manager.on_sched_wakeup(250, TID, 1, 1).is_none());

        // The running slice still begins at 200.
        let s = manager
            .on_sched_switch_out(300, TID, ThreadState::InterruptibleSleep)
            .unwrap();
        assert_eq!(s.begin_timestamp_ns, 200);
    }

    #[test]
    fn switch_in_on_running_thread_preserves_begin_timestamp() {
        let mut manager = ThreadStateManager::new();
        manager.on_initial_state(100, TID, ThreadState::Runnable);
        manager.on_sched_switch_in(200, TID);
        assert!(manager.on_sched_switch_in(250, TID).is_none());
        let s = manager
            .on_sched_switch_out(300, TID, ThreadState::InterruptibleSleep)
            .unwrap();
        assert_eq!(s.begin_timestamp_ns, 200);
    }

    #[test]
    fn stale_initial_state_is_overwritten_without_a_slice() {
        let mut manager = ThreadStateManager::new();
        // The /proc snapshot was taken at 500, but live events start at 400.
        manager.on_initial_state(500, TID, ThreadState::InterruptibleSleep);
        assert!(manager.on_sched_wakeup(400, TID, 3, 2).is_none());

        // Live events win; the runnable state begins at 400.
        let s = manager.on_sched_switch_in(450, TID).unwrap();
        assert_eq!(s, slice(TID, ThreadState::Runnable, 400, 450, WakeupReason::Unblocked, 3, 2));
    }

    #[test]
    fn switch_out_of_runnable_initial_state_reports_running() {
        let mut manager = ThreadStateManager::new();
        manager.on_initial_state(100, TID, ThreadState::Runnable);
        let s = manager
            .on_sched_switch_out(200, TID, ThreadState::InterruptibleSleep)
            .unwrap();
        assert_eq!(s.state, ThreadState::Running);
    }

    #[test]
    fn direct_switch_in_from_sleep_emits_the_sleep_slice() {
        // The sched_wakeup event can be skipped entirely.
        let mut manager = ThreadStateManager::new();
        manager.on_initial_state(100, TID, ThreadState::InterruptibleSleep);
        let s = manager.on_sched_switch_in(300, TID).unwrap();
        assert_eq!(s.state, ThreadState::InterruptibleSleep);
        assert_eq!(s.end_timestamp_ns, 300);
    }

    #[test]
    fn events_for_unknown_threads_seed_the_state() {
        let mut manager = ThreadStateManager::new();
        assert!(manager
            .on_sched_switch_out(100, TID, ThreadState::UninterruptibleSleep)
            .is_none());
        let s = manager.on_sched_wakeup(200, TID, 1, 1).unwrap();
        assert_eq!(s.state, ThreadState::UninterruptibleSleep);
        assert_eq!(s.begin_timestamp_ns, 100);
    }

    #[test]
    fn capture_finished_flushes_every_open_state() {
        let mut manager = ThreadStateManager::new();
        manager.on_initial_state(100, 1, ThreadState::Runnable);
        manager.on_initial_state(110, 2, ThreadState::InterruptibleSleep);
        let mut slices = manager.on_capture_finished(500);
        slices.sort_by_key(|s| s.tid);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].tid, 1);
        assert_eq!(slices[0].end_timestamp_ns, 500);
        assert_eq!(slices[1].state, ThreadState::InterruptibleSleep);
    }
}
