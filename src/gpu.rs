//! Correlates the three amdgpu driver tracepoints into GPU jobs.
//!
//! A single command-buffer submission produces one amdgpu_cs_ioctl, one
//! amdgpu_sched_run_job and one dma_fence_signaled event, all sharing the
//! same (context, seqno, timeline) triple. The three arrive on different
//! per-cpu ring buffers and bypass the ordered event queue (they are
//! high-rate), so any arrival order must be tolerated: each kind is parked in
//! its own map, and a job is emitted the moment the triple is complete.
//!
//! A consequence is that depth rows are assigned in completion order; with
//! out-of-order arrival that can differ from what a strictly-ordered world
//! would assign. This is accepted.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::listener::{GpuJob, TracerListener};

/// The payload common to all three tracepoints, after decode.
#[derive(Clone, Debug)]
pub struct GpuTracepointData {
    pub tid: i32,
    pub timestamp_ns: u64,
    pub context: u32,
    pub seqno: u32,
    pub timeline: String,
}

type Key = (u32, u32, String);

fn key_of(event: &GpuTracepointData) -> Key {
    (event.context, event.seqno, event.timeline.clone())
}

/// Minimum idle gap on a depth row before it can be reused. Keeps adjacent
/// jobs from crowding one row of the timeline.
const DEPTH_ROW_SLACK_NS: u64 = 1_000_000;

pub struct GpuJobCorrelator {
    listener: Arc<dyn TracerListener>,
    cs_ioctl_events: FxHashMap<Key, GpuTracepointData>,
    sched_run_job_events: FxHashMap<Key, GpuTracepointData>,
    dma_fence_signaled_events: FxHashMap<Key, GpuTracepointData>,
    latest_dma_signal_by_timeline: FxHashMap<String, u64>,
    depth_row_ends_by_timeline: FxHashMap<String, Vec<u64>>,
}

impl GpuJobCorrelator {
    pub fn new(listener: Arc<dyn TracerListener>) -> Self {
        GpuJobCorrelator {
            listener,
            cs_ioctl_events: FxHashMap::default(),
            sched_run_job_events: FxHashMap::default(),
            dma_fence_signaled_events: FxHashMap::default(),
            latest_dma_signal_by_timeline: FxHashMap::default(),
            depth_row_ends_by_timeline: FxHashMap::default(),
        }
    }

    pub fn push_cs_ioctl(&mut self, event: GpuTracepointData) {
        let key = key_of(&event);
        self.cs_ioctl_events.insert(key.clone(), event);
        self.emit_job_if_complete(&key);
    }

    pub fn push_sched_run_job(&mut self, event: GpuTracepointData) {
        let key = key_of(&event);
        self.sched_run_job_events.insert(key.clone(), event);
        self.emit_job_if_complete(&key);
    }

    pub fn push_dma_fence_signaled(&mut self, event: GpuTracepointData) {
        let key = key_of(&event);
        self.dma_fence_signaled_events.insert(key.clone(), event);
        self.emit_job_if_complete(&key);
    }

    fn emit_job_if_complete(&mut self, key: &Key) {
        if !self.cs_ioctl_events.contains_key(key)
            || !self.sched_run_job_events.contains_key(key)
            || !self.dma_fence_signaled_events.contains_key(key)
        {
            return;
        }

        let ioctl = self.cs_ioctl_events.remove(key).unwrap();
        let sched = self.sched_run_job_events.remove(key).unwrap();
        let dma = self.dma_fence_signaled_events.remove(key).unwrap();
        let timeline = &ioctl.timeline;

        // The hardware starts a job the moment the driver dispatches it,
        // unless the queue is still busy with a previous job; then the best
        // estimate for the start is when the previous job's fence signaled.
        let previous_signal = self
            .latest_dma_signal_by_timeline
            .get(timeline)
            .copied()
            .unwrap_or(0);
        let hardware_start_time_ns = sched.timestamp_ns.max(previous_signal);

        let latest = self
            .latest_dma_signal_by_timeline
            .entry(timeline.clone())
            .or_insert(0);
        *latest = (*latest).max(dma.timestamp_ns);

        let depth = self.depth_for_job(timeline, ioctl.timestamp_ns, dma.timestamp_ns);

        self.listener.on_gpu_job(GpuJob {
            tid: ioctl.tid,
            context: ioctl.context,
            seqno: ioctl.seqno,
            timeline: ioctl.timeline.clone(),
            depth,
            amdgpu_cs_ioctl_time_ns: ioctl.timestamp_ns,
            amdgpu_sched_run_job_time_ns: sched.timestamp_ns,
            gpu_hardware_start_time_ns: hardware_start_time_ns,
            dma_fence_signaled_time_ns: dma.timestamp_ns,
        });
    }

    /// Greedy first-fit row assignment: the lowest row whose last job ended
    /// at least the slack before this job's submission. The row vector only
    /// grows to the maximum concurrency ever seen on the timeline, which is
    /// small in practice.
    fn depth_for_job(
        &mut self,
        timeline: &str,
        start_timestamp_ns: u64,
        end_timestamp_ns: u64,
    ) -> u32 {
        let row_ends = self
            .depth_row_ends_by_timeline
            .entry(timeline.to_string())
            .or_default();

        for (depth, row_end) in row_ends.iter_mut().enumerate() {
            if start_timestamp_ns >= *row_end + DEPTH_ROW_SLACK_NS {
                *row_end = end_timestamp_ns;
                return depth as u32;
            }
        }

        row_ends.push(end_timestamp_ns);
        (row_ends.len() - 1) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingListener {
        gpu_jobs: Mutex<Vec<GpuJob>>,
    }

    impl TracerListener for CollectingListener {
        fn on_gpu_job(&self, gpu_job: GpuJob) {
            self.gpu_jobs.lock().unwrap().push(gpu_job);
        }
    }

    fn data(tid: i32, timestamp_ns: u64, context: u32, seqno: u32, timeline: &str) -> GpuTracepointData {
        GpuTracepointData {
            tid,
            timestamp_ns,
            context,
            seqno,
            timeline: timeline.to_string(),
        }
    }

    const SECOND: u64 = 1_000_000_000;

    #[test]
    fn emits_only_when_all_three_tracepoints_arrived() {
        let listener = Arc::new(CollectingListener::default());
        let mut correlator = GpuJobCorrelator::new(listener.clone());

        correlator.push_cs_ioctl(data(7, 100, 1, 10, "gfx"));
        assert!(listener.gpu_jobs.lock().unwrap().is_empty());
        correlator.push_sched_run_job(data(0, 200, 1, 10, "gfx"));
        assert!(listener.gpu_jobs.lock().unwrap().is_empty());
        correlator.push_dma_fence_signaled(data(0, 300, 1, 10, "gfx"));

        let jobs = listener.gpu_jobs.lock().unwrap();
        assert_eq!(
            *jobs,
            vec![GpuJob {
                tid: 7,
                context: 1,
                seqno: 10,
                timeline: "gfx".to_string(),
                depth: 0,
                amdgpu_cs_ioctl_time_ns: 100,
                amdgpu_sched_run_job_time_ns: 200,
                gpu_hardware_start_time_ns: 200,
                dma_fence_signaled_time_ns: 300,
            }]
        );
    }

    #[test]
    fn reverse_arrival_order_produces_the_same_job() {
        let listener = Arc::new(CollectingListener::default());
        let mut correlator = GpuJobCorrelator::new(listener.clone());

        correlator.push_dma_fence_signaled(data(0, 300, 1, 10, "gfx"));
        correlator.push_sched_run_job(data(0, 200, 1, 10, "gfx"));
        correlator.push_cs_ioctl(data(7, 100, 1, 10, "gfx"));

        let jobs = listener.gpu_jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].tid, 7);
        assert_eq!(jobs[0].amdgpu_cs_ioctl_time_ns, 100);
        assert_eq!(jobs[0].amdgpu_sched_run_job_time_ns, 200);
        assert_eq!(jobs[0].gpu_hardware_start_time_ns, 200);
        assert_eq!(jobs[0].dma_fence_signaled_time_ns, 300);
    }

    #[test]
    fn busy_timeline_delays_hardware_start_and_stacks_depth() {
        let listener = Arc::new(CollectingListener::default());
        let mut correlator = GpuJobCorrelator::new(listener.clone());

        correlator.push_cs_ioctl(data(7, 100, 1, 10, "gfx"));
        correlator.push_sched_run_job(data(0, 200, 1, 10, "gfx"));
        correlator.push_dma_fence_signaled(data(0, 300, 1, 10, "gfx"));

        // The second job is submitted while the first is still running.
        correlator.push_cs_ioctl(data(7, 110, 1, 11, "gfx"));
        correlator.push_sched_run_job(data(0, 210, 1, 11, "gfx"));
        correlator.push_dma_fence_signaled(data(0, 400, 1, 11, "gfx"));

        let jobs = listener.gpu_jobs.lock().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].depth, 0);
        assert_eq!(jobs[1].gpu_hardware_start_time_ns, 300);
        assert_eq!(jobs[1].depth, 1);
    }

    #[test]
    fn depth_row_is_reused_after_the_slack() {
        let listener = Arc::new(CollectingListener::default());
        let mut correlator = GpuJobCorrelator::new(listener.clone());

        correlator.push_cs_ioctl(data(7, 1 * SECOND, 1, 10, "gfx"));
        correlator.push_sched_run_job(data(0, 1 * SECOND + 10, 1, 10, "gfx"));
        correlator.push_dma_fence_signaled(data(0, 1 * SECOND + 20, 1, 10, "gfx"));

        // Submitted well over the slack after the first job ended.
        correlator.push_cs_ioctl(data(7, 2 * SECOND, 1, 11, "gfx"));
        correlator.push_sched_run_job(data(0, 2 * SECOND + 10, 1, 11, "gfx"));
        correlator.push_dma_fence_signaled(data(0, 2 * SECOND + 20, 1, 11, "gfx"));

        let jobs = listener.gpu_jobs.lock().unwrap();
        assert_eq!(jobs[0].depth, 0);
        assert_eq!(jobs[1].depth, 0);
    }

    #[test]
    fn timelines_are_independent() {
        let listener = Arc::new(CollectingListener::default());
        let mut correlator = GpuJobCorrelator::new(listener.clone());

        correlator.push_cs_ioctl(data(7, 100, 1, 10, "gfx"));
        correlator.push_sched_run_job(data(0, 200, 1, 10, "gfx"));
        correlator.push_dma_fence_signaled(data(0, 300, 1, 10, "gfx"));

        // Same context and seqno on a different timeline is a different job,
        // and its hardware start is not delayed by the gfx job.
        correlator.push_cs_ioctl(data(8, 110, 1, 10, "comp_1.0.0"));
        correlator.push_sched_run_job(data(0, 220, 1, 10, "comp_1.0.0"));
        correlator.push_dma_fence_signaled(data(0, 500, 1, 10, "comp_1.0.0"));

        let jobs = listener.gpu_jobs.lock().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[1].timeline, "comp_1.0.0");
        assert_eq!(jobs[1].gpu_hardware_start_time_ns, 220);
        assert_eq!(jobs[1].depth, 0);
    }

    #[test]
    fn incomplete_triples_stay_parked() {
        let listener = Arc::new(CollectingListener::default());
        let mut correlator = GpuJobCorrelator::new(listener.clone());

        correlator.push_cs_ioctl(data(7, 100, 1, 10, "gfx"));
        correlator.push_cs_ioctl(data(7, 110, 1, 11, "gfx"));
        correlator.push_sched_run_job(data(0, 210, 1, 11, "gfx"));
        assert!(listener.gpu_jobs.lock().unwrap().is_empty());

        // Completing seqno 11 emits only that job; seqno 10 stays parked.
        correlator.push_dma_fence_signaled(data(0, 400, 1, 11, "gfx"));
        let jobs = listener.gpu_jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].seqno, 11);
    }
}
