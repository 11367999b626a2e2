//! The sink for everything the engine produces. One method per record kind.
//!
//! The listener is called from the capture's processing thread for queued
//! records and from the poller thread for high-rate records that bypass the
//! queue (GPU tracepoints, thread names, user-selected tracepoints), so
//! implementations must be thread-safe.

/// A thread owned a core for the interval `[in_timestamp_ns, out_timestamp_ns]`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SchedulingSlice {
    pub pid: i32,
    pub tid: i32,
    pub core: u32,
    pub in_timestamp_ns: u64,
    pub out_timestamp_ns: u64,
}

/// Kernel scheduler states as this engine reports them. `Running` is our
/// refinement: the kernel calls both runnable-waiting and on-cpu "R".
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadState {
    Running,
    Runnable,
    InterruptibleSleep,
    UninterruptibleSleep,
    Stopped,
    Traced,
    Dead,
    Zombie,
    Parked,
    Idle,
    /// Seeded from /proc when the state letter was not recognized; replaced
    /// by the first real observation.
    Unknown,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum WakeupReason {
    #[default]
    NotApplicable,
    /// The slice begins because the thread was just created.
    Created,
    /// The slice begins because the thread was woken from a blocked state.
    Unblocked,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ThreadStateSlice {
    pub tid: i32,
    pub state: ThreadState,
    pub begin_timestamp_ns: u64,
    pub end_timestamp_ns: u64,
    pub wakeup_reason: WakeupReason,
    /// Who created or unblocked the thread; 0 when not applicable.
    pub wakeup_tid: i32,
    pub wakeup_pid: i32,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CallstackSample {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    /// Program counters, innermost frame first.
    pub pcs: Vec<u64>,
}

/// What the unwinder knows about one program counter; sent once per frame of
/// each sample so the host can symbolize.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AddressInfo {
    pub absolute_address: u64,
    pub function_name: String,
    pub offset_in_function: u64,
    pub map_name: String,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FunctionCall {
    pub pid: i32,
    pub tid: i32,
    pub absolute_address: u64,
    pub begin_timestamp_ns: u64,
    pub end_timestamp_ns: u64,
    /// Number of strictly-enclosing instrumented calls on the same thread.
    pub depth: u32,
    pub return_value: u64,
}

/// One AMD GPU command-buffer submission, reconstructed from the three
/// correlated driver tracepoints.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct GpuJob {
    pub tid: i32,
    pub context: u32,
    pub seqno: u32,
    pub timeline: String,
    pub depth: u32,
    pub amdgpu_cs_ioctl_time_ns: u64,
    pub amdgpu_sched_run_job_time_ns: u64,
    /// When the job plausibly started on the hardware: dispatch time, pushed
    /// back behind the previous job's fence signal if the queue was busy.
    pub gpu_hardware_start_time_ns: u64,
    pub dma_fence_signaled_time_ns: u64,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ThreadName {
    pub tid: i32,
    pub name: String,
    pub timestamp_ns: u64,
}

/// A raw payload of a user-selected tracepoint.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TracepointEvent {
    pub pid: i32,
    pub tid: i32,
    pub cpu: u32,
    pub timestamp_ns: u64,
    pub category: String,
    pub name: String,
    pub raw_payload: Vec<u8>,
}

/// The target's module mappings changed (an executable mmap was observed).
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ModulesUpdate {
    pub pid: i32,
    pub timestamp_ns: u64,
    /// The refreshed content of /proc/<pid>/maps.
    pub maps: String,
}

/// The kernel reported records lost to ring-buffer overrun.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LostRecords {
    pub count: u64,
    pub timestamp_ns: u64,
    pub buffer_name: String,
}

/// All methods default to dropping the record so implementations only handle
/// what they need.
#[allow(unused_variables)]
pub trait TracerListener: Send + Sync {
    fn on_scheduling_slice(&self, slice: SchedulingSlice) {}
    fn on_thread_state_slice(&self, slice: ThreadStateSlice) {}
    fn on_callstack_sample(&self, sample: CallstackSample) {}
    fn on_address_info(&self, address_info: AddressInfo) {}
    fn on_function_call(&self, function_call: FunctionCall) {}
    fn on_gpu_job(&self, gpu_job: GpuJob) {}
    fn on_thread_name(&self, thread_name: ThreadName) {}
    fn on_tracepoint_event(&self, event: TracepointEvent) {}
    fn on_modules_update(&self, update: ModulesUpdate) {}
    fn on_lost_records(&self, lost: LostRecords) {}
}
