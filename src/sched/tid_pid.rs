//! System-wide association between thread ids and the process they belong
//! to. Seeded from /proc at capture start, updated by fork records and by
//! observation of sched_switch records that carry both ids.
//!
//! The association of an exited thread is kept: the kernel still emits
//! sched_switch records for a thread after its exit record, and those need a
//! pid.

use log::error;
use rustc_hash::FxHashMap;

#[derive(Default)]
pub struct TidPidAssociator {
    pid_by_tid: FxHashMap<i32, i32>,
}

impl TidPidAssociator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn associate_initial(&mut self, tid: i32, pid: i32) {
        if self.pid_by_tid.insert(tid, pid).is_some() {
            error!("Overwriting previous pid for tid {tid} with initial pid {pid}");
        }
    }

    pub fn associate_from_fork(&mut self, tid: i32, pid: i32) {
        self.pid_by_tid.insert(tid, pid);
    }

    /// Records an association observed on a live record (e.g. a sched_switch
    /// whose switch-out side carries a valid pid).
    pub fn associate_observed(&mut self, tid: i32, pid: i32) {
        self.pid_by_tid.insert(tid, pid);
    }

    pub fn pid_of_tid(&self, tid: i32) -> Option<i32> {
        self.pid_by_tid.get(&tid).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fork_and_lookup() {
        let mut associator = TidPidAssociator::new();
        associator.associate_initial(100, 10);
        associator.associate_from_fork(101, 10);
        assert_eq!(associator.pid_of_tid(100), Some(10));
        assert_eq!(associator.pid_of_tid(101), Some(10));
        assert_eq!(associator.pid_of_tid(999), None);
    }

    #[test]
    fn observation_updates_the_association() {
        let mut associator = TidPidAssociator::new();
        associator.associate_observed(100, 10);
        assert_eq!(associator.pid_of_tid(100), Some(10));
        // The tid got recycled into another process.
        associator.associate_observed(100, 20);
        assert_eq!(associator.pid_of_tid(100), Some(20));
    }
}
