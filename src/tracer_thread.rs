//! The capture orchestrator: opens every requested event source, owns all
//! ring buffers and record decoding, and runs the main poll loop.
//!
//! Two threads do the work. The poller owns the ring buffers: it reads up to
//! a small batch of records from each buffer in round-robin order (so that a
//! chatty buffer cannot starve a quiet one), decodes them, and either handles
//! them inline (high-rate, self-contained records: GPU tracepoints, thread
//! names, user-selected tracepoints, lost counts) or pushes them onto the
//! deferred queue. The processing thread drains that queue into the
//! timestamp-ordering event processor, which drives the visitors.

use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{CaptureOptions, FunctionKind, SamplingMethod, SelectedTracepoint};
use crate::error::TracerError;
use crate::events::*;
use crate::gpu::{GpuJobCorrelator, GpuTracepointData};
use crate::listener::{LostRecords, ModulesUpdate, ThreadName, TracepointEvent, TracerListener};
use crate::perf::event_open::*;
use crate::perf::readers;
use crate::perf::records::*;
use crate::perf::ring_buffer::PerfEventRingBuffer;
use crate::perf::sys::*;
use crate::processor::PerfEventProcessor;
use crate::procfs;
use crate::sched::visitor::ContextSwitchAndThreadStateVisitor;
use crate::timing::{monotonic_timestamp_ns, NS_PER_SECOND};
use crate::unwinding::unwinder::FramehopUnwinder;
use crate::unwinding::visitor::{SampleCounters, UnwindingVisitor};

/// Records read consecutively from one ring buffer before moving to the
/// next.
const ROUND_ROBIN_POLLING_BATCH_SIZE: u32 = 5;

// Per-core ring buffer sizes. Large enough to absorb the poller not being
// scheduled for a few tens of milliseconds.
const UPROBES_RING_BUFFER_SIZE_KB: u64 = 8 * 1024;
const MMAP_TASK_RING_BUFFER_SIZE_KB: u64 = 64;
const SAMPLING_RING_BUFFER_SIZE_KB: u64 = 16 * 1024;
const THREAD_NAMES_RING_BUFFER_SIZE_KB: u64 = 64;
const CONTEXT_SWITCHES_AND_THREAD_STATE_RING_BUFFER_SIZE_KB: u64 = 2 * 1024;
const GPU_TRACING_RING_BUFFER_SIZE_KB: u64 = 256;
const INSTRUMENTED_TRACEPOINTS_RING_BUFFER_SIZE_KB: u64 = 8 * 1024;

const IDLE_TIME_ON_EMPTY_RING_BUFFERS: Duration = Duration::from_micros(100);
const IDLE_TIME_ON_EMPTY_DEFERRED_EVENTS: Duration = Duration::from_millis(1);

const EVENT_STATS_WINDOW_S: u64 = 5;

/// Synthetic origin for maps-snapshot events, which are timestamped at
/// snapshot time rather than with a kernel record timestamp.
const MAPS_ORIGIN_FD: RawFd = -1;

/// Wraps a visitor so the orchestrator can keep a handle for the calls that
/// happen outside the event stream (initial seeding, final flush).
struct SharedVisitor<V>(Arc<Mutex<V>>);

impl<V: PerfEventVisitor> PerfEventVisitor for SharedVisitor<V> {
    fn visit_switch_cpu_wide(&mut self, event: &SwitchCpuWideEvent) {
        self.0.lock().visit_switch_cpu_wide(event);
    }
    fn visit_fork(&mut self, event: &ForkEvent) {
        self.0.lock().visit_fork(event);
    }
    fn visit_exit(&mut self, event: &ExitEvent) {
        self.0.lock().visit_exit(event);
    }
    fn visit_maps(&mut self, event: &MapsEvent) {
        self.0.lock().visit_maps(event);
    }
    fn visit_stack_sample(&mut self, event: &mut StackSampleEvent) {
        self.0.lock().visit_stack_sample(event);
    }
    fn visit_callchain_sample(&mut self, event: &mut CallchainSampleEvent) {
        self.0.lock().visit_callchain_sample(event);
    }
    fn visit_uprobe(&mut self, event: &UprobeEvent) {
        self.0.lock().visit_uprobe(event);
    }
    fn visit_uretprobe(&mut self, event: &UretprobeEvent) {
        self.0.lock().visit_uretprobe(event);
    }
    fn visit_task_newtask(&mut self, event: &TaskNewtaskEvent) {
        self.0.lock().visit_task_newtask(event);
    }
    fn visit_sched_switch(&mut self, event: &SchedSwitchEvent) {
        self.0.lock().visit_sched_switch(event);
    }
    fn visit_sched_wakeup(&mut self, event: &SchedWakeupEvent) {
        self.0.lock().visit_sched_wakeup(event);
    }
}

#[derive(Default)]
struct EventStats {
    window_begin_ns: u64,
    sched_switch_count: u64,
    sample_count: u64,
    uprobes_count: u64,
    gpu_events_count: u64,
    lost_count: u64,
    lost_count_per_buffer: FxHashMap<String, u64>,
    discarded_out_of_order: Arc<AtomicU64>,
    sample_counters: SampleCounters,
}

impl EventStats {
    fn reset_window(&mut self) {
        self.window_begin_ns = monotonic_timestamp_ns();
        self.sched_switch_count = 0;
        self.sample_count = 0;
        self.uprobes_count = 0;
        self.gpu_events_count = 0;
        self.lost_count = 0;
        self.lost_count_per_buffer.clear();
        self.discarded_out_of_order.store(0, Ordering::Relaxed);
        self.sample_counters.unwind_errors.store(0, Ordering::Relaxed);
        self.sample_counters
            .discarded_samples_in_uretprobes
            .store(0, Ordering::Relaxed);
        self.sample_counters
            .discarded_empty_stack_samples
            .store(0, Ordering::Relaxed);
    }

    fn print_if_window_elapsed(&mut self) {
        let now_ns = monotonic_timestamp_ns();
        if self.window_begin_ns + EVENT_STATS_WINDOW_S * NS_PER_SECOND >= now_ns {
            return;
        }
        let window_s = (now_ns - self.window_begin_ns) as f64 / NS_PER_SECOND as f64;

        info!("Events per second (last {window_s:.1} s):");
        info!("  sched switches: {:.0}", self.sched_switch_count as f64 / window_s);
        info!("  samples: {:.0}", self.sample_count as f64 / window_s);
        info!("  u(ret)probes: {:.0}", self.uprobes_count as f64 / window_s);
        info!("  gpu events: {:.0}", self.gpu_events_count as f64 / window_s);

        if self.lost_count_per_buffer.is_empty() {
            info!("  lost: {:.0}", self.lost_count as f64 / window_s);
        } else {
            info!("  lost: {:.0}, of which:", self.lost_count as f64 / window_s);
            for (buffer_name, count) in &self.lost_count_per_buffer {
                info!("    from {buffer_name}: {:.0}", *count as f64 / window_s);
            }
        }

        let discarded_out_of_order = self.discarded_out_of_order.load(Ordering::Relaxed);
        if discarded_out_of_order > 0 {
            info!(
                "  discarded out of order: {:.0}",
                discarded_out_of_order as f64 / window_s
            );
        }

        let sample_count = self.sample_count.max(1);
        let unwind_errors = self.sample_counters.unwind_errors.load(Ordering::Relaxed);
        info!(
            "  unwind errors: {:.0} ({:.1}%)",
            unwind_errors as f64 / window_s,
            100.0 * unwind_errors as f64 / sample_count as f64
        );
        let discarded_in_uretprobes = self
            .sample_counters
            .discarded_samples_in_uretprobes
            .load(Ordering::Relaxed);
        info!(
            "  discarded samples in u(ret)probes: {:.0} ({:.1}%)",
            discarded_in_uretprobes as f64 / window_s,
            100.0 * discarded_in_uretprobes as f64 / sample_count as f64
        );

        self.reset_window();
    }
}

/// Decodes records out of ring buffers and routes them: light records are
/// handled inline, heavy ones are deferred to the processing thread.
struct RecordDecoder {
    target_pid: i32,
    trace_thread_state: bool,
    listener: Arc<dyn TracerListener>,

    uprobe_function_by_stream_id: FxHashMap<u64, usize>,
    uretprobe_function_by_stream_id: FxHashMap<u64, usize>,
    stack_sampling_ids: FxHashSet<u64>,
    callchain_sampling_ids: FxHashSet<u64>,
    task_newtask_ids: FxHashSet<u64>,
    task_rename_ids: FxHashSet<u64>,
    sched_switch_ids: FxHashSet<u64>,
    sched_wakeup_ids: FxHashSet<u64>,
    amdgpu_cs_ioctl_ids: FxHashSet<u64>,
    amdgpu_sched_run_job_ids: FxHashSet<u64>,
    dma_fence_signaled_ids: FxHashSet<u64>,
    selected_tracepoints_by_stream_id: FxHashMap<u64, SelectedTracepoint>,

    gpu_correlator: Option<GpuJobCorrelator>,
    /// Whether maps events have a consumer in the processing pipeline.
    unwinding_visitor_registered: bool,

    deferred_events: Arc<Mutex<Vec<PerfEvent>>>,
    stats: EventStats,
}

impl RecordDecoder {
    fn new(
        target_pid: i32,
        trace_thread_state: bool,
        listener: Arc<dyn TracerListener>,
    ) -> Self {
        RecordDecoder {
            target_pid,
            trace_thread_state,
            listener,
            uprobe_function_by_stream_id: FxHashMap::default(),
            uretprobe_function_by_stream_id: FxHashMap::default(),
            stack_sampling_ids: FxHashSet::default(),
            callchain_sampling_ids: FxHashSet::default(),
            task_newtask_ids: FxHashSet::default(),
            task_rename_ids: FxHashSet::default(),
            sched_switch_ids: FxHashSet::default(),
            sched_wakeup_ids: FxHashSet::default(),
            amdgpu_cs_ioctl_ids: FxHashSet::default(),
            amdgpu_sched_run_job_ids: FxHashSet::default(),
            dma_fence_signaled_ids: FxHashSet::default(),
            selected_tracepoints_by_stream_id: FxHashMap::default(),
            gpu_correlator: None,
            unwinding_visitor_registered: false,
            deferred_events: Arc::new(Mutex::new(Vec::new())),
            stats: EventStats::default(),
        }
    }

    fn defer(&self, origin_fd: RawFd, data: PerfEventData) {
        self.deferred_events
            .lock()
            .push(PerfEvent { origin_fd, data });
    }

    fn process_record(
        &mut self,
        ring_buffer: &mut PerfEventRingBuffer,
        header: &PerfEventHeader,
    ) {
        match header.kind {
            PERF_RECORD_SWITCH => {
                // Context switches are recorded cpu-wide, not per thread, so
                // this record type is not expected.
                error!(
                    "Unexpected PERF_RECORD_SWITCH in ring buffer '{}' (only PERF_RECORD_SWITCH_CPU_WIDE are expected)",
                    ring_buffer.name()
                );
                ring_buffer.skip_record(header);
            }
            PERF_RECORD_SWITCH_CPU_WIDE => self.process_switch_cpu_wide(ring_buffer, header),
            PERF_RECORD_FORK => self.process_fork(ring_buffer, header),
            PERF_RECORD_EXIT => self.process_exit(ring_buffer, header),
            PERF_RECORD_MMAP => self.process_mmap(ring_buffer, header),
            PERF_RECORD_SAMPLE => self.process_sample(ring_buffer, header),
            PERF_RECORD_LOST => self.process_lost(ring_buffer, header),
            PERF_RECORD_THROTTLE => {
                info!("PERF_RECORD_THROTTLE in ring buffer '{}'", ring_buffer.name());
                ring_buffer.skip_record(header);
            }
            PERF_RECORD_UNTHROTTLE => {
                info!("PERF_RECORD_UNTHROTTLE in ring buffer '{}'", ring_buffer.name());
                ring_buffer.skip_record(header);
            }
            kind => {
                error!(
                    "Unexpected record type in ring buffer '{}': {kind}",
                    ring_buffer.name()
                );
                ring_buffer.skip_record(header);
            }
        }
    }

    fn process_switch_cpu_wide(
        &mut self,
        ring_buffer: &mut PerfEventRingBuffer,
        header: &PerfEventHeader,
    ) {
        let record: SwitchCpuWideRecord = ring_buffer.consume_record(header);
        let sample_id = record.sample_id;
        let event = SwitchCpuWideEvent {
            timestamp_ns: sample_id.time,
            cpu: sample_id.cpu,
            pid: sample_id.pid as i32,
            tid: sample_id.tid as i32,
            is_switch_out: header.misc & PERF_RECORD_MISC_SWITCH_OUT != 0,
        };
        self.defer(ring_buffer.fd(), PerfEventData::SwitchCpuWide(event));
        self.stats.sched_switch_count += 1;
    }

    fn process_fork(&mut self, ring_buffer: &mut PerfEventRingBuffer, header: &PerfEventHeader) {
        let record: ForkExitRecord = ring_buffer.consume_record(header);
        self.defer(
            ring_buffer.fd(),
            PerfEventData::Fork(ForkEvent {
                timestamp_ns: record.time,
                pid: record.pid as i32,
                tid: record.tid as i32,
                parent_pid: record.ppid as i32,
                parent_tid: record.ptid as i32,
            }),
        );
    }

    fn process_exit(&mut self, ring_buffer: &mut PerfEventRingBuffer, header: &PerfEventHeader) {
        let record: ForkExitRecord = ring_buffer.consume_record(header);
        self.defer(
            ring_buffer.fd(),
            PerfEventData::Exit(ExitEvent {
                timestamp_ns: record.time,
                pid: record.pid as i32,
                tid: record.tid as i32,
                parent_pid: record.ppid as i32,
                parent_tid: record.ptid as i32,
            }),
        );
    }

    fn process_mmap(&mut self, ring_buffer: &mut PerfEventRingBuffer, header: &PerfEventHeader) {
        let pid = readers::read_mmap_record_pid(ring_buffer);
        ring_buffer.skip_record(header);

        if pid != self.target_pid {
            return;
        }

        // The target mapped something executable; refresh the maps. This
        // should happen rarely.
        let Ok(maps) = procfs::read_maps(pid) else {
            return;
        };
        let timestamp_ns = monotonic_timestamp_ns();
        if self.unwinding_visitor_registered {
            // The unwinding visitor notifies the listener once the event is
            // processed in order. Maps events are timestamped with the
            // current time, which can be ahead of records still sitting in
            // this ring buffer, so they get a synthetic origin of their own
            // to keep every origin's stream monotonic.
            self.defer(
                MAPS_ORIGIN_FD,
                PerfEventData::Maps(MapsEvent {
                    timestamp_ns,
                    pid,
                    maps,
                }),
            );
        } else {
            self.listener.on_modules_update(ModulesUpdate {
                pid,
                timestamp_ns,
                maps,
            });
        }
    }

    fn process_lost(&mut self, ring_buffer: &mut PerfEventRingBuffer, header: &PerfEventHeader) {
        let record: LostRecord = ring_buffer.consume_record(header);
        self.stats.lost_count += record.lost;
        *self
            .stats
            .lost_count_per_buffer
            .entry(ring_buffer.name().to_string())
            .or_default() += record.lost;
        self.listener.on_lost_records(LostRecords {
            count: record.lost,
            timestamp_ns: record.sample_id.time,
            buffer_name: ring_buffer.name().to_string(),
        });
    }

    fn process_sample(&mut self, ring_buffer: &mut PerfEventRingBuffer, header: &PerfEventHeader) {
        let stream_id = readers::read_sample_record_stream_id(ring_buffer);
        let fd = ring_buffer.fd();

        if let Some(&function_index) = self.uprobe_function_by_stream_id.get(&stream_id) {
            if header.size as usize
                != std::mem::size_of::<PerfEventHeader>() + std::mem::size_of::<UprobeRecord>()
            {
                ring_buffer.skip_record(header);
                return;
            }
            let record: UprobeRecord = ring_buffer.consume_record(header);
            let sample_id = record.sample_id;
            if sample_id.pid as i32 != self.target_pid {
                return;
            }
            self.defer(
                fd,
                PerfEventData::Uprobe(UprobeEvent {
                    timestamp_ns: sample_id.time,
                    pid: sample_id.pid as i32,
                    tid: sample_id.tid as i32,
                    cpu: sample_id.cpu,
                    sp: record.regs.sp,
                    ip: record.regs.ip,
                    return_address: record.top8bytes,
                    function_index,
                }),
            );
            self.stats.uprobes_count += 1;
        } else if let Some(&function_index) =
            self.uretprobe_function_by_stream_id.get(&stream_id)
        {
            if header.size as usize
                != std::mem::size_of::<PerfEventHeader>() + std::mem::size_of::<UretprobeRecord>()
            {
                ring_buffer.skip_record(header);
                return;
            }
            let record: UretprobeRecord = ring_buffer.consume_record(header);
            let sample_id = record.sample_id;
            if sample_id.pid as i32 != self.target_pid {
                return;
            }
            self.defer(
                fd,
                PerfEventData::Uretprobe(UretprobeEvent {
                    timestamp_ns: sample_id.time,
                    pid: sample_id.pid as i32,
                    tid: sample_id.tid as i32,
                    ax: record.regs.ax,
                    function_index,
                }),
            );
            self.stats.uprobes_count += 1;
        } else if self.stack_sampling_ids.contains(&stream_id) {
            let pid = readers::read_sample_record_pid(ring_buffer);
            if pid != self.target_pid {
                ring_buffer.skip_record(header);
                return;
            }
            // Samples with an unexpected size have no register or stack dump
            // (abi == PERF_SAMPLE_REGS_ABI_NONE) and are skipped inside
            // consume_stack_sample.
            if let Some(event) = readers::consume_stack_sample(ring_buffer, header) {
                self.defer(fd, PerfEventData::StackSample(event));
                self.stats.sample_count += 1;
            }
        } else if self.callchain_sampling_ids.contains(&stream_id) {
            let pid = readers::read_sample_record_pid(ring_buffer);
            if pid != self.target_pid {
                ring_buffer.skip_record(header);
                return;
            }
            let event = readers::consume_callchain_sample(ring_buffer, header);
            self.defer(fd, PerfEventData::CallchainSample(event));
            self.stats.sample_count += 1;
        } else if self.task_newtask_ids.contains(&stream_id) {
            let (sample_id, payload) = readers::consume_tracepoint(ring_buffer, header);
            let Some(tracepoint) = payload_as::<TaskNewtaskPayload>(&payload, "task_newtask")
            else {
                return;
            };
            let comm = comm_to_string(&{ tracepoint.comm });
            self.listener.on_thread_name(ThreadName {
                tid: tracepoint.pid,
                name: comm.clone(),
                timestamp_ns: sample_id.time,
            });
            if self.trace_thread_state {
                self.defer(
                    fd,
                    PerfEventData::TaskNewtask(TaskNewtaskEvent {
                        timestamp_ns: sample_id.time,
                        tid: tracepoint.pid,
                        comm,
                        was_created_by_tid: sample_id.tid as i32,
                        was_created_by_pid: sample_id.pid as i32,
                    }),
                );
            }
        } else if self.task_rename_ids.contains(&stream_id) {
            let (sample_id, payload) = readers::consume_tracepoint(ring_buffer, header);
            let Some(tracepoint) = payload_as::<TaskRenamePayload>(&payload, "task_rename")
            else {
                return;
            };
            self.listener.on_thread_name(ThreadName {
                tid: tracepoint.pid,
                name: comm_to_string(&{ tracepoint.newcomm }),
                timestamp_ns: sample_id.time,
            });
        } else if self.sched_switch_ids.contains(&stream_id) {
            let (sample_id, payload) = readers::consume_tracepoint(ring_buffer, header);
            let Some(tracepoint) = payload_as::<SchedSwitchPayload>(&payload, "sched_switch")
            else {
                return;
            };
            self.defer(
                fd,
                PerfEventData::SchedSwitch(SchedSwitchEvent {
                    timestamp_ns: sample_id.time,
                    cpu: sample_id.cpu,
                    prev_pid_or_minus_one: sample_id.pid as i32,
                    prev_tid: tracepoint.prev_pid,
                    prev_state_bits: tracepoint.prev_state,
                    next_tid: tracepoint.next_pid,
                }),
            );
            self.stats.sched_switch_count += 1;
        } else if self.sched_wakeup_ids.contains(&stream_id) {
            let (sample_id, payload) = readers::consume_tracepoint(ring_buffer, header);
            let Some(tracepoint) = payload_as::<SchedWakeupPayload>(&payload, "sched_wakeup")
            else {
                return;
            };
            self.defer(
                fd,
                PerfEventData::SchedWakeup(SchedWakeupEvent {
                    timestamp_ns: sample_id.time,
                    woken_tid: tracepoint.pid,
                    was_unblocked_by_tid: sample_id.tid as i32,
                    was_unblocked_by_pid: sample_id.pid as i32,
                }),
            );
        } else if self.amdgpu_cs_ioctl_ids.contains(&stream_id) {
            let (sample_id, payload) = readers::consume_tracepoint(ring_buffer, header);
            let Some(tracepoint) = payload_as::<AmdgpuCsIoctlPayload>(&payload, "amdgpu_cs_ioctl")
            else {
                return;
            };
            // GPU tracepoints are not filtered by pid: all GPU activity on
            // the system is of interest.
            let data = GpuTracepointData {
                tid: sample_id.tid as i32,
                timestamp_ns: sample_id.time,
                context: tracepoint.context,
                seqno: tracepoint.seqno,
                timeline: extract_data_loc_string(tracepoint.timeline, &payload),
            };
            if let Some(correlator) = &mut self.gpu_correlator {
                correlator.push_cs_ioctl(data);
            }
            self.stats.gpu_events_count += 1;
        } else if self.amdgpu_sched_run_job_ids.contains(&stream_id) {
            let (sample_id, payload) = readers::consume_tracepoint(ring_buffer, header);
            let Some(tracepoint) =
                payload_as::<AmdgpuSchedRunJobPayload>(&payload, "amdgpu_sched_run_job")
            else {
                return;
            };
            let data = GpuTracepointData {
                tid: sample_id.tid as i32,
                timestamp_ns: sample_id.time,
                context: tracepoint.context,
                seqno: tracepoint.seqno,
                timeline: extract_data_loc_string(tracepoint.timeline, &payload),
            };
            if let Some(correlator) = &mut self.gpu_correlator {
                correlator.push_sched_run_job(data);
            }
            self.stats.gpu_events_count += 1;
        } else if self.dma_fence_signaled_ids.contains(&stream_id) {
            let (sample_id, payload) = readers::consume_tracepoint(ring_buffer, header);
            let Some(tracepoint) =
                payload_as::<DmaFenceSignaledPayload>(&payload, "dma_fence_signaled")
            else {
                return;
            };
            let data = GpuTracepointData {
                tid: sample_id.tid as i32,
                timestamp_ns: sample_id.time,
                context: tracepoint.context,
                seqno: tracepoint.seqno,
                timeline: extract_data_loc_string(tracepoint.timeline, &payload),
            };
            if let Some(correlator) = &mut self.gpu_correlator {
                correlator.push_dma_fence_signaled(data);
            }
            self.stats.gpu_events_count += 1;
        } else if let Some(tracepoint_info) =
            self.selected_tracepoints_by_stream_id.get(&stream_id)
        {
            let category = tracepoint_info.category.clone();
            let name = tracepoint_info.name.clone();
            let (sample_id, payload) = readers::consume_tracepoint(ring_buffer, header);
            self.listener.on_tracepoint_event(TracepointEvent {
                pid: sample_id.pid as i32,
                tid: sample_id.tid as i32,
                cpu: sample_id.cpu,
                timestamp_ns: sample_id.time,
                category,
                name,
                raw_payload: payload,
            });
        } else {
            error!("PERF_RECORD_SAMPLE with unexpected stream id: {stream_id}");
            ring_buffer.skip_record(header);
        }
    }
}

fn payload_as<T: Copy>(payload: &[u8], what: &str) -> Option<T> {
    if payload.len() < std::mem::size_of::<T>() {
        error!(
            "Truncated {what} tracepoint payload: {} bytes",
            payload.len()
        );
        return None;
    }
    Some(pod_from_bytes(payload))
}

pub struct TracerThread {
    options: CaptureOptions,
    listener: Arc<dyn TracerListener>,

    tracing_fds: Vec<RawFd>,
    ring_buffers: Vec<PerfEventRingBuffer>,
    decoder: RecordDecoder,

    processor: Option<PerfEventProcessor>,
    sched_visitor: Option<Arc<Mutex<ContextSwitchAndThreadStateVisitor>>>,
}

impl TracerThread {
    pub fn new(options: CaptureOptions, listener: Arc<dyn TracerListener>) -> Self {
        let decoder = RecordDecoder::new(options.pid, options.trace_thread_state, listener.clone());
        TracerThread {
            options,
            listener,
            tracing_fds: Vec::new(),
            ring_buffers: Vec::new(),
            decoder,
            processor: None,
            sched_visitor: None,
        }
    }

    /// Opens every requested event source, wires up the visitors, enables
    /// recording, and seeds the initial thread names, associations and
    /// states. On error, everything opened so far is closed again.
    pub fn open_events(&mut self) -> Result<(), TracerError> {
        match self.open_events_inner() {
            Ok(()) => Ok(()),
            Err(error) => {
                self.ring_buffers.clear();
                for &fd in &self.tracing_fds {
                    close_fd(fd);
                }
                self.tracing_fds.clear();
                Err(error)
            }
        }
    }

    fn open_events_inner(&mut self) -> Result<(), TracerError> {
        let options = self.options.clone();

        if options.sampling_method != SamplingMethod::Off && options.sampling_period_ns == 0 {
            return Err(TracerError::InvalidOptions(
                "sampling requested with a period of 0 ns".to_string(),
            ));
        }

        // perf_event_open refers to cores as "cpus". Context switches and
        // kernel-side bookkeeping are recorded on all cores; samples and
        // u(ret)probes only on the cores of the target's cpuset, as those are
        // the only cores the target is scheduled on.
        let all_cpus: Vec<i32> = (0..procfs::num_cores()).collect();
        let mut cpuset_cpus = procfs::cpuset_cpus(options.pid);
        if cpuset_cpus.is_empty() {
            cpuset_cpus = all_cpus.clone();
        }

        // Two fds per instrumented function per core add up quickly.
        if let Err(error) = procfs::raise_open_files_soft_limit() {
            warn!("Could not raise the open-files limit: {error}");
        }

        if options.trace_context_switches && !options.trace_thread_state {
            // Scheduling slices alone come from the kernel's built-in
            // context-switch records; with thread state enabled, the
            // sched_switch tracepoint provides both and the built-in source
            // is not opened.
            self.open_context_switches(&all_cpus)?;
        }

        self.open_mmap_task(&cpuset_cpus)?;

        let mut uprobes_event_open_errors = false;
        if !options.instrumented_functions.is_empty() {
            uprobes_event_open_errors = !self.open_user_space_probes(&cpuset_cpus);
        }

        // Take the initial maps snapshot only now: opening the uprobe fds
        // creates the [uprobes] map entry, and the snapshot must contain it.
        let initial_maps =
            procfs::read_maps(options.pid).map_err(|error| TracerError::TargetProcess {
                pid: options.pid,
                error,
            })?;

        match options.sampling_method {
            SamplingMethod::Off => {}
            SamplingMethod::Dwarf | SamplingMethod::FramePointers => {
                self.open_sampling(&cpuset_cpus)?;
            }
        }

        self.open_thread_name_tracepoints(&all_cpus)?;

        if options.trace_thread_state {
            self.open_thread_state_tracepoints(&all_cpus)?;
        }

        if options.trace_gpu_driver {
            // All GPU activity on the system is recorded, hence all cores.
            match self.open_gpu_tracepoints(&all_cpus) {
                Ok(()) => {
                    self.decoder.gpu_correlator =
                        Some(GpuJobCorrelator::new(self.listener.clone()));
                }
                Err(error) => {
                    // The amdgpu tracepoints can vanish if the module is
                    // unloaded; the rest of the capture is still useful.
                    warn!("Could not open GPU tracepoints, continuing without: {error}");
                }
            }
        }

        self.open_selected_tracepoints(&all_cpus)?;

        if uprobes_event_open_errors {
            warn!(
                "There were errors opening uprobe events: did you forget to run as root?"
            );
        }

        if self.ring_buffers.is_empty() {
            return Err(TracerError::NoEventSources);
        }

        // Visitors. The unwinding visitor goes first so callstack records of
        // an instant precede scheduling records of the same instant.
        let mut processor = PerfEventProcessor::new();
        processor
            .set_discarded_out_of_order_counter(self.decoder.stats.discarded_out_of_order.clone());

        if options.sampling_method != SamplingMethod::Off
            || !options.instrumented_functions.is_empty()
        {
            let visitor = UnwindingVisitor::new(
                self.listener.clone(),
                Arc::new(options.instrumented_functions.clone()),
                &initial_maps,
                FramehopUnwinder::new(),
                self.decoder.stats.sample_counters.clone(),
            );
            processor.add_visitor(Box::new(SharedVisitor(Arc::new(Mutex::new(visitor)))));
            self.decoder.unwinding_visitor_registered = true;
        }

        // Always registered: fork and exit records flow regardless of the
        // enabled sources, and the tid→pid association must stay current.
        {
            let thread_state_pid_filter = options.trace_thread_state.then_some(options.pid);
            let visitor = Arc::new(Mutex::new(ContextSwitchAndThreadStateVisitor::new(
                self.listener.clone(),
                thread_state_pid_filter,
                options.trace_context_switches,
            )));
            processor.add_visitor(Box::new(SharedVisitor(visitor.clone())));
            self.sched_visitor = Some(visitor);
        }

        self.processor = Some(processor);

        // Start recording.
        for &fd in &self.tracing_fds {
            perf_event_enable(fd);
        }

        // Initial thread names and states are retrieved after enabling the
        // fds, so nothing is lost in between; the thread-state machinery
        // resolves the overlap in favor of the live events.
        let pids_and_tids = procfs::all_pids_and_tids();
        let name_timestamp_ns = monotonic_timestamp_ns();
        for &(_, tid) in &pids_and_tids {
            if let Some(name) = procfs::thread_name(tid) {
                if !name.is_empty() {
                    self.listener.on_thread_name(ThreadName {
                        tid,
                        name,
                        timestamp_ns: name_timestamp_ns,
                    });
                }
            }
        }

        if let Some(visitor) = &self.sched_visitor {
            let mut visitor = visitor.lock();
            for &(pid, tid) in &pids_and_tids {
                visitor.process_initial_tid_to_pid_association(tid, pid);
            }
            if options.trace_thread_state {
                for &(_, tid) in &pids_and_tids {
                    if let Some(state_char) = procfs::thread_state_char(tid) {
                        visitor.process_initial_state(monotonic_timestamp_ns(), tid, state_char);
                    }
                }
            }
        }

        Ok(())
    }

    /// The main poll loop. Returns when `exit_requested` is set; by then all
    /// deferred events have been processed, open slices flushed, and all fds
    /// closed.
    pub fn run(mut self, exit_requested: Arc<AtomicBool>) {
        let mut processor = self.processor.take().expect("open_events not called");
        let deferred_events = self.decoder.deferred_events.clone();
        let stop_deferred_thread = Arc::new(AtomicBool::new(false));
        let sched_visitor = self.sched_visitor.clone();

        let deferred_thread = thread::Builder::new()
            .name("perfspan-events".to_string())
            .spawn({
                let stop = stop_deferred_thread.clone();
                move || {
                    loop {
                        // Once the stop flag is set the poller has stopped
                        // producing; drain until empty, then exit.
                        let should_exit = stop.load(Ordering::Acquire);
                        let events = std::mem::take(&mut *deferred_events.lock());
                        if events.is_empty() {
                            if should_exit {
                                break;
                            }
                            thread::sleep(IDLE_TIME_ON_EMPTY_DEFERRED_EVENTS);
                            continue;
                        }
                        for event in events {
                            processor.add_event(event);
                        }
                        processor.process_old_events();
                    }

                    processor.process_all_events();
                    if let Some(visitor) = sched_visitor {
                        visitor
                            .lock()
                            .process_remaining_open_states(monotonic_timestamp_ns());
                    }
                }
            })
            .expect("could not spawn the event processing thread");

        self.decoder.stats.reset_window();
        let mut last_iteration_saw_events = false;

        while !exit_requested.load(Ordering::Relaxed) {
            if !last_iteration_saw_events {
                self.decoder.stats.print_if_window_elapsed();
                // Don't poll continuously, but don't sleep so long that ring
                // buffers overflow.
                thread::sleep(IDLE_TIME_ON_EMPTY_RING_BUFFERS);
            }
            last_iteration_saw_events = false;

            // Round-robin over the buffers with a small per-buffer batch, so
            // no buffer is read constantly while others overflow.
            for index in 0..self.ring_buffers.len() {
                if exit_requested.load(Ordering::Relaxed) {
                    break;
                }
                for _ in 0..ROUND_ROBIN_POLLING_BATCH_SIZE {
                    let ring_buffer = &mut self.ring_buffers[index];
                    if !ring_buffer.has_new_record() {
                        break;
                    }
                    last_iteration_saw_events = true;
                    let header = ring_buffer.read_header();
                    self.decoder.process_record(ring_buffer, &header);
                }
            }
        }

        // Shutdown: stop producing, let the processing thread drain
        // everything and flush the open thread states, then stop recording
        // and release the kernel resources.
        stop_deferred_thread.store(true, Ordering::Release);
        if deferred_thread.join().is_err() {
            error!("The event processing thread panicked");
        }

        for &fd in &self.tracing_fds {
            perf_event_disable(fd);
        }
        self.ring_buffers.clear();
        for &fd in &self.tracing_fds {
            close_fd(fd);
        }
        self.tracing_fds.clear();
    }

    fn open_context_switches(&mut self, cpus: &[i32]) -> Result<(), TracerError> {
        let mut fds = Vec::new();
        for &cpu in cpus {
            match context_switch_event_open(-1, cpu) {
                Ok(fd) => fds.push((cpu, fd)),
                Err(error) => {
                    for &(_, fd) in &fds {
                        close_fd(fd);
                    }
                    log_permission_hint(&error);
                    return Err(TracerError::PerfEventOpen {
                        source_name: format!("context switch (cpu {cpu})"),
                        error,
                    });
                }
            }
        }
        for (cpu, fd) in fds {
            self.add_fd_with_own_ring_buffer(
                fd,
                CONTEXT_SWITCHES_AND_THREAD_STATE_RING_BUFFER_SIZE_KB,
                format!("context_switch_{cpu}"),
            )?;
        }
        Ok(())
    }

    fn open_mmap_task(&mut self, cpus: &[i32]) -> Result<(), TracerError> {
        let mut fds = Vec::new();
        for &cpu in cpus {
            match mmap_task_event_open(-1, cpu) {
                Ok(fd) => fds.push((cpu, fd)),
                Err(error) => {
                    for &(_, fd) in &fds {
                        close_fd(fd);
                    }
                    log_permission_hint(&error);
                    return Err(TracerError::PerfEventOpen {
                        source_name: format!("mmap, fork and exit (cpu {cpu})"),
                        error,
                    });
                }
            }
        }
        for (cpu, fd) in fds {
            self.add_fd_with_own_ring_buffer(
                fd,
                MMAP_TASK_RING_BUFFER_SIZE_KB,
                format!("mmap_task_{cpu}"),
            )?;
        }
        Ok(())
    }

    fn open_sampling(&mut self, cpus: &[i32]) -> Result<(), TracerError> {
        let period_ns = self.options.sampling_period_ns;
        let mut fds = Vec::new();
        for &cpu in cpus {
            let opened = match self.options.sampling_method {
                SamplingMethod::Dwarf => stack_sample_event_open(period_ns, -1, cpu),
                SamplingMethod::FramePointers => callchain_sample_event_open(period_ns, -1, cpu),
                SamplingMethod::Off => unreachable!(),
            };
            match opened {
                Ok(fd) => fds.push((cpu, fd)),
                Err(error) => {
                    for &(_, fd) in &fds {
                        close_fd(fd);
                    }
                    log_permission_hint(&error);
                    return Err(TracerError::PerfEventOpen {
                        source_name: format!("sampling (cpu {cpu})"),
                        error,
                    });
                }
            }
        }
        for (cpu, fd) in fds {
            let stream_id = stream_id_of(fd)?;
            match self.options.sampling_method {
                SamplingMethod::Dwarf => self.decoder.stack_sampling_ids.insert(stream_id),
                SamplingMethod::FramePointers => {
                    self.decoder.callchain_sampling_ids.insert(stream_id)
                }
                SamplingMethod::Off => unreachable!(),
            };
            self.add_fd_with_own_ring_buffer(
                fd,
                SAMPLING_RING_BUFFER_SIZE_KB,
                format!("sampling_{cpu}"),
            )?;
        }
        Ok(())
    }

    /// Opens uprobes and uretprobes for every instrumented function. A
    /// failure for one function closes that function's fds and moves on, so
    /// a single unprobeable binary doesn't spoil the capture. Returns false
    /// if any function failed.
    fn open_user_space_probes(&mut self, cpus: &[i32]) -> bool {
        let pmu_type = match procfs::uprobe_pmu_type() {
            Ok(pmu_type) => pmu_type,
            Err(error) => {
                error!("Could not read the uprobe PMU type: {error}");
                return false;
            }
        };

        let functions = self.options.instrumented_functions.clone();
        let mut had_errors = false;
        // All u(ret)probe fds of one cpu share a single ring buffer.
        let mut fds_per_cpu: FxHashMap<i32, Vec<RawFd>> = FxHashMap::default();

        for (function_index, function) in functions.iter().enumerate() {
            let Ok(binary_path) = CString::new(function.binary_path.as_str()) else {
                error!("Invalid binary path for function {:#x}", function.absolute_address);
                had_errors = true;
                continue;
            };

            let open_uprobes = function.kind != FunctionKind::ManualStop;
            let open_uretprobes = function.kind != FunctionKind::ManualStart;

            let mut uprobe_fds: Vec<(i32, RawFd)> = Vec::new();
            let mut uretprobe_fds: Vec<(i32, RawFd)> = Vec::new();
            let mut function_failed = false;

            if open_uprobes {
                for &cpu in cpus {
                    match uprobe_retaddr_event_open(
                        pmu_type,
                        &binary_path,
                        function.file_offset,
                        -1,
                        cpu,
                    ) {
                        Ok(fd) => uprobe_fds.push((cpu, fd)),
                        Err(error) => {
                            error!(
                                "Opening uprobe {:#x} on cpu {cpu}: {error}",
                                function.absolute_address
                            );
                            function_failed = true;
                            break;
                        }
                    }
                }
            }
            if open_uretprobes && !function_failed {
                for &cpu in cpus {
                    match uretprobe_event_open(
                        pmu_type,
                        &binary_path,
                        function.file_offset,
                        -1,
                        cpu,
                    ) {
                        Ok(fd) => uretprobe_fds.push((cpu, fd)),
                        Err(error) => {
                            error!(
                                "Opening uretprobe {:#x} on cpu {cpu}: {error}",
                                function.absolute_address
                            );
                            function_failed = true;
                            break;
                        }
                    }
                }
            }

            if function_failed {
                for &(_, fd) in uprobe_fds.iter().chain(&uretprobe_fds) {
                    close_fd(fd);
                }
                had_errors = true;
                continue;
            }

            // Uretprobes are registered (and so enabled) before uprobes: a
            // uprobe without its uretprobe is temporarily tolerable, the
            // opposite is not.
            for (cpu, fd) in uretprobe_fds {
                match stream_id_of(fd) {
                    Ok(stream_id) => {
                        self.decoder
                            .uretprobe_function_by_stream_id
                            .insert(stream_id, function_index);
                        self.tracing_fds.push(fd);
                        fds_per_cpu.entry(cpu).or_default().push(fd);
                    }
                    Err(_) => close_fd(fd),
                }
            }
            for (cpu, fd) in uprobe_fds {
                match stream_id_of(fd) {
                    Ok(stream_id) => {
                        self.decoder
                            .uprobe_function_by_stream_id
                            .insert(stream_id, function_index);
                        self.tracing_fds.push(fd);
                        fds_per_cpu.entry(cpu).or_default().push(fd);
                    }
                    Err(_) => close_fd(fd),
                }
            }
        }

        // One ring buffer per cpu; all other fds of that cpu are redirected
        // onto it.
        for (cpu, fds) in fds_per_cpu {
            let Some(&ring_buffer_fd) = fds.first() else {
                continue;
            };
            match PerfEventRingBuffer::new(
                ring_buffer_fd,
                UPROBES_RING_BUFFER_SIZE_KB,
                format!("uprobes_uretprobes_{cpu}"),
            ) {
                Ok(ring_buffer) => {
                    self.ring_buffers.push(ring_buffer);
                    for &fd in &fds[1..] {
                        perf_event_redirect(fd, ring_buffer_fd);
                    }
                }
                Err(error) => {
                    error!("Mapping the uprobe ring buffer for cpu {cpu}: {error}");
                    had_errors = true;
                }
            }
        }

        !had_errors
    }

    fn open_thread_name_tracepoints(&mut self, cpus: &[i32]) -> Result<(), TracerError> {
        let stream_id_sets = self.open_tracepoint_group(
            &[("task", "task_newtask"), ("task", "task_rename")],
            cpus,
            THREAD_NAMES_RING_BUFFER_SIZE_KB,
            "thread_name",
        )?;
        let mut sets = stream_id_sets.into_iter();
        self.decoder.task_newtask_ids = sets.next().unwrap();
        self.decoder.task_rename_ids = sets.next().unwrap();
        Ok(())
    }

    fn open_thread_state_tracepoints(&mut self, cpus: &[i32]) -> Result<(), TracerError> {
        // task:task_newtask is also needed here, but the thread-name group
        // already opened it.
        let stream_id_sets = self.open_tracepoint_group(
            &[("sched", "sched_switch"), ("sched", "sched_wakeup")],
            cpus,
            CONTEXT_SWITCHES_AND_THREAD_STATE_RING_BUFFER_SIZE_KB,
            "sched",
        )?;
        let mut sets = stream_id_sets.into_iter();
        self.decoder.sched_switch_ids = sets.next().unwrap();
        self.decoder.sched_wakeup_ids = sets.next().unwrap();
        Ok(())
    }

    fn open_gpu_tracepoints(&mut self, cpus: &[i32]) -> Result<(), TracerError> {
        let stream_id_sets = self.open_tracepoint_group(
            &[
                ("amdgpu", "amdgpu_cs_ioctl"),
                ("amdgpu", "amdgpu_sched_run_job"),
                ("dma_fence", "dma_fence_signaled"),
            ],
            cpus,
            GPU_TRACING_RING_BUFFER_SIZE_KB,
            "gpu",
        )?;
        let mut sets = stream_id_sets.into_iter();
        self.decoder.amdgpu_cs_ioctl_ids = sets.next().unwrap();
        self.decoder.amdgpu_sched_run_job_ids = sets.next().unwrap();
        self.decoder.dma_fence_signaled_ids = sets.next().unwrap();
        Ok(())
    }

    fn open_selected_tracepoints(&mut self, cpus: &[i32]) -> Result<(), TracerError> {
        for tracepoint in self.options.instrumented_tracepoints.clone() {
            let stream_id_sets = self.open_tracepoint_group(
                &[(tracepoint.category.as_str(), tracepoint.name.as_str())],
                cpus,
                INSTRUMENTED_TRACEPOINTS_RING_BUFFER_SIZE_KB,
                &format!("{}:{}", tracepoint.category, tracepoint.name),
            )?;
            for stream_id in stream_id_sets.into_iter().flatten() {
                self.decoder
                    .selected_tracepoints_by_stream_id
                    .insert(stream_id, tracepoint.clone());
            }
        }
        Ok(())
    }

    /// Opens a group of tracepoints on every given cpu, sharing one ring
    /// buffer per cpu across the whole group. Either the entire group opens
    /// or nothing is kept. Returns the stream ids per tracepoint, in input
    /// order.
    fn open_tracepoint_group(
        &mut self,
        tracepoints: &[(&str, &str)],
        cpus: &[i32],
        ring_buffer_size_kb: u64,
        buffer_name_prefix: &str,
    ) -> Result<Vec<FxHashSet<u64>>, TracerError> {
        let mut opened_fds: Vec<(usize, i32, RawFd)> = Vec::new();
        let close_all = |fds: &[(usize, i32, RawFd)]| {
            for &(_, _, fd) in fds {
                close_fd(fd);
            }
        };

        for (tracepoint_index, &(category, name)) in tracepoints.iter().enumerate() {
            let tracepoint_id = match procfs::tracepoint_id(category, name) {
                Ok(tracepoint_id) => tracepoint_id,
                Err(error) => {
                    close_all(&opened_fds);
                    return Err(TracerError::PerfEventOpen {
                        source_name: format!("{category}:{name} tracepoint"),
                        error,
                    });
                }
            };
            for &cpu in cpus {
                match tracepoint_event_open(tracepoint_id, -1, cpu) {
                    Ok(fd) => opened_fds.push((tracepoint_index, cpu, fd)),
                    Err(error) => {
                        close_all(&opened_fds);
                        log_permission_hint(&error);
                        return Err(TracerError::PerfEventOpen {
                            source_name: format!("{category}:{name} tracepoint (cpu {cpu})"),
                            error,
                        });
                    }
                }
            }
        }

        let mut stream_id_sets: Vec<FxHashSet<u64>> = vec![FxHashSet::default(); tracepoints.len()];
        let mut ring_buffer_fd_by_cpu: FxHashMap<i32, RawFd> = FxHashMap::default();

        for &(tracepoint_index, _, fd) in &opened_fds {
            let stream_id = match stream_id_of(fd) {
                Ok(stream_id) => stream_id,
                Err(error) => {
                    close_all(&opened_fds);
                    return Err(error);
                }
            };
            stream_id_sets[tracepoint_index].insert(stream_id);
        }

        // Commit all fds first: from here on, failures are cleaned up by the
        // caller through tracing_fds.
        for &(_, _, fd) in &opened_fds {
            self.tracing_fds.push(fd);
        }

        for (_, cpu, fd) in opened_fds {
            match ring_buffer_fd_by_cpu.get(&cpu) {
                Some(&ring_buffer_fd) => perf_event_redirect(fd, ring_buffer_fd),
                None => {
                    let ring_buffer = PerfEventRingBuffer::new(
                        fd,
                        ring_buffer_size_kb,
                        format!("{buffer_name_prefix}_{cpu}"),
                    )
                    .map_err(|error| TracerError::PerfEventOpen {
                        source_name: format!("{buffer_name_prefix} ring buffer (cpu {cpu})"),
                        error,
                    })?;
                    self.ring_buffers.push(ring_buffer);
                    ring_buffer_fd_by_cpu.insert(cpu, fd);
                }
            }
        }

        Ok(stream_id_sets)
    }

    fn add_fd_with_own_ring_buffer(
        &mut self,
        fd: RawFd,
        size_kb: u64,
        name: String,
    ) -> Result<(), TracerError> {
        let ring_buffer = PerfEventRingBuffer::new(fd, size_kb, name.clone()).map_err(|error| {
            close_fd(fd);
            TracerError::PerfEventOpen {
                source_name: name,
                error,
            }
        })?;
        self.tracing_fds.push(fd);
        self.ring_buffers.push(ring_buffer);
        Ok(())
    }
}

fn stream_id_of(fd: RawFd) -> Result<u64, TracerError> {
    perf_event_get_id(fd).map_err(|error| TracerError::PerfEventOpen {
        source_name: "stream id".to_string(),
        error,
    })
}

fn log_permission_hint(error: &std::io::Error) {
    if error.kind() != std::io::ErrorKind::PermissionDenied {
        return;
    }
    let level = procfs::read_string_lossy("/proc/sys/kernel/perf_event_paranoid")
        .ok()
        .and_then(|content| content.trim().parse::<i32>().ok());
    if let Some(level) = level {
        if level > -1 {
            warn!(
                "'/proc/sys/kernel/perf_event_paranoid' is currently set to {level}; \
                 tracing system-wide requires -1 (or running as root):"
            );
            warn!("    echo '-1' | sudo tee /proc/sys/kernel/perf_event_paranoid");
        }
    }
}
