//! Pairs context switches into scheduling slices.
//!
//! For each core, the last switch-in into a thread is kept open and matched
//! with the next switch-out to produce a `SchedulingSlice`. Context switches
//! for the same core arrive in order; switches lost to ring-buffer overruns
//! leave unmatched halves, which are tolerated by overwriting open entries on
//! switch-in and dropping unmatched switch-outs.

use rustc_hash::FxHashMap;

use crate::listener::SchedulingSlice;

struct OpenSwitchIn {
    /// None when the switch-in source doesn't know the pid (the sched_switch
    /// tracepoint reports only the tid of the incoming thread).
    pid: Option<i32>,
    tid: i32,
    timestamp_ns: u64,
}

#[derive(Default)]
pub struct ContextSwitchManager {
    open_switches_by_core: FxHashMap<u32, OpenSwitchIn>,
}

impl ContextSwitchManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process_switch_in(
        &mut self,
        pid: Option<i32>,
        tid: i32,
        core: u32,
        timestamp_ns: u64,
    ) {
        // In case of lost out switches, a previous open switch-in for this
        // core can be present. Simply overwrite it.
        self.open_switches_by_core.insert(
            core,
            OpenSwitchIn {
                pid,
                tid,
                timestamp_ns,
            },
        );
    }

    /// When a switch-out is caused by the thread exiting, the kernel reports
    /// pid and tid as -1; the pid and tid of the open switch-in are used
    /// instead.
    pub fn process_switch_out(
        &mut self,
        pid: i32,
        tid: i32,
        core: u32,
        timestamp_ns: u64,
    ) -> Option<SchedulingSlice> {
        // No open switch-in happens at the beginning of a capture or in case
        // of lost in switches.
        let open_switch = self.open_switches_by_core.get(&core)?;

        let open_pid = open_switch.pid;
        let open_tid = open_switch.tid;
        let open_timestamp_ns = open_switch.timestamp_ns;
        assert!(timestamp_ns >= open_timestamp_ns);

        self.open_switches_by_core.remove(&core);

        if pid == -1 || tid == -1 {
            return Some(SchedulingSlice {
                pid: open_pid.unwrap_or(-1),
                tid: open_tid,
                core,
                in_timestamp_ns: open_timestamp_ns,
                out_timestamp_ns: timestamp_ns,
            });
        }

        // Mismatches happen in case of lost in/out switches.
        if open_tid != tid || open_pid.is_some_and(|open_pid| open_pid != pid) {
            return None;
        }

        Some(SchedulingSlice {
            pid,
            tid,
            core,
            in_timestamp_ns: open_timestamp_ns,
            out_timestamp_ns: timestamp_ns,
        })
    }

    pub fn clear(&mut self) {
        self.open_switches_by_core.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_in_and_out_into_a_slice() {
        let mut manager = ContextSwitchManager::new();
        manager.process_switch_in(Some(42), 43, 1, 100);
        let slice = manager.process_switch_out(42, 43, 1, 200).unwrap();
        assert_eq!(
            slice,
            SchedulingSlice {
                pid: 42,
                tid: 43,
                core: 1,
                in_timestamp_ns: 100,
                out_timestamp_ns: 200,
            }
        );
    }

    #[test]
    fn switch_out_without_open_in_is_dropped() {
        let mut manager = ContextSwitchManager::new();
        assert!(manager.process_switch_out(42, 43, 1, 200).is_none());
    }

    #[test]
    fn thread_exit_switch_out_uses_the_open_entry() {
        let mut manager = ContextSwitchManager::new();
        manager.process_switch_in(Some(42), 43, 1, 100);
        let slice = manager.process_switch_out(-1, -1, 1, 200).unwrap();
        assert_eq!(slice.pid, 42);
        assert_eq!(slice.tid, 43);
        assert_eq!(slice.in_timestamp_ns, 100);
        assert_eq!(slice.out_timestamp_ns, 200);
    }

    #[test]
    fn mismatched_tid_is_dropped() {
        let mut manager = ContextSwitchManager::new();
        manager.process_switch_in(Some(42), 43, 1, 100);
        assert!(manager.process_switch_out(42, 99, 1, 200).is_none());

        // The open entry was consumed; the next switch-out has nothing to
        // pair with either.
        assert!(manager.process_switch_out(42, 43, 1, 300).is_none());
    }

    #[test]
    fn switch_in_with_unknown_pid_pairs_by_tid() {
        let mut manager = ContextSwitchManager::new();
        manager.process_switch_in(None, 43, 0, 100);
        let slice = manager.process_switch_out(42, 43, 0, 250).unwrap();
        assert_eq!(slice.pid, 42);
        assert_eq!(slice.tid, 43);
    }

    #[test]
    fn new_switch_in_overwrites_open_entry() {
        let mut manager = ContextSwitchManager::new();
        manager.process_switch_in(Some(1), 10, 2, 100);
        // The switch-out for tid 10 was lost.
        manager.process_switch_in(Some(2), 20, 2, 150);
        let slice = manager.process_switch_out(2, 20, 2, 300).unwrap();
        assert_eq!(slice.tid, 20);
        assert_eq!(slice.in_timestamp_ns, 150);
    }

    #[test]
    fn cores_are_independent() {
        let mut manager = ContextSwitchManager::new();
        manager.process_switch_in(Some(1), 10, 0, 100);
        manager.process_switch_in(Some(2), 20, 1, 110);
        let slice0 = manager.process_switch_out(1, 10, 0, 200).unwrap();
        let slice1 = manager.process_switch_out(2, 20, 1, 210).unwrap();
        assert_eq!(slice0.core, 0);
        assert_eq!(slice1.core, 1);
    }
}
