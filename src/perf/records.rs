//! In-memory layouts of the perf_event_open records and raw tracepoint
//! payloads this engine consumes. Every struct must stay in sync with the
//! sample_type / sample_regs_user configuration in `event_open.rs`: the bits
//! set there determine which fields the kernel emits, in field order.
//!
//! Tracepoint payload layouts follow the event format files under
//! `/sys/kernel/tracing/events/<category>/<name>/format`.

use super::sys::PerfEventHeader;

/// Trailer/prefix emitted because of
/// `PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_STREAM_ID | PERF_SAMPLE_CPU`
/// with `sample_id_all = 1`.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SampleId {
    pub pid: u32,
    pub tid: u32,
    pub time: u64,
    pub stream_id: u64,
    pub cpu: u32,
    pub res: u32,
}

/// PERF_RECORD_SWITCH_CPU_WIDE.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SwitchCpuWideRecord {
    pub next_prev_pid: u32,
    pub next_prev_tid: u32,
    pub sample_id: SampleId,
}

/// PERF_RECORD_FORK and PERF_RECORD_EXIT share this layout.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ForkExitRecord {
    pub pid: u32,
    pub ppid: u32,
    pub tid: u32,
    pub ptid: u32,
    pub time: u64,
    pub sample_id: SampleId,
}

/// PERF_RECORD_LOST.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct LostRecord {
    pub id: u64,
    pub lost: u64,
    pub sample_id: SampleId,
}

/// User register dump for DWARF stack samples: all 17 general-purpose
/// registers, in mask-bit order. Must stay in sync with
/// `SAMPLE_REGS_USER_ALL`.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RegsUserAll {
    pub abi: u64,
    pub ax: u64,
    pub bx: u64,
    pub cx: u64,
    pub dx: u64,
    pub si: u64,
    pub di: u64,
    pub bp: u64,
    pub sp: u64,
    pub ip: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Register dump of uprobe records. Must stay in sync with
/// `SAMPLE_REGS_USER_SP_IP`; the kernel dumps registers in ascending mask-bit
/// order, and SP (bit 7) precedes IP (bit 8).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RegsUserSpIp {
    pub abi: u64,
    pub sp: u64,
    pub ip: u64,
}

/// Register dump of uretprobe records, AX only.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RegsUserAx {
    pub abi: u64,
    pub ax: u64,
}

/// The largest user stack dump we request. The kernel caps the whole record
/// at (1 << 16) - 8 bytes, so this leaves room for the header, sample id and
/// register dump.
pub const SAMPLE_STACK_USER_SIZE: usize = 65000;

/// The stack dump of a uprobe record: only the top 8 bytes, which hold the
/// return address about to be hijacked by the uretprobe trampoline.
pub const SAMPLE_STACK_USER_SIZE_8BYTES: usize = 8;

/// PERF_RECORD_SAMPLE of a uprobe: sp/ip registers plus the top 8 stack
/// bytes.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UprobeRecord {
    pub sample_id: SampleId,
    pub regs: RegsUserSpIp,
    pub stack_size: u64,
    pub top8bytes: u64,
    pub stack_dyn_size: u64,
}

/// PERF_RECORD_SAMPLE of a uretprobe: the AX register, which holds the
/// integer return value in the System V ABI.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct UretprobeRecord {
    pub sample_id: SampleId,
    pub regs: RegsUserAx,
}

/// Layout of a full DWARF stack sample as it sits in the ring buffer. Only
/// used for offset computation and the exact-size check; the stack bytes are
/// copied out into a dynamically sized event.
#[repr(C, packed)]
pub struct StackSampleRecordLayout {
    pub header: PerfEventHeader,
    pub sample_id: SampleId,
    pub regs: RegsUserAll,
    pub stack_size: u64,
    pub stack_data: [u8; SAMPLE_STACK_USER_SIZE],
    pub stack_dyn_size: u64,
}

pub const STACK_SAMPLE_RECORD_SIZE: usize = std::mem::size_of::<StackSampleRecordLayout>();
pub const STACK_SAMPLE_REGS_OFFSET: u64 =
    std::mem::offset_of!(StackSampleRecordLayout, regs) as u64;
pub const STACK_SAMPLE_DATA_OFFSET: u64 =
    std::mem::offset_of!(StackSampleRecordLayout, stack_data) as u64;
pub const STACK_SAMPLE_DYN_SIZE_OFFSET: u64 =
    std::mem::offset_of!(StackSampleRecordLayout, stack_dyn_size) as u64;

/// The fixed prefix of a callchain sample; `nr` instruction pointers follow.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CallchainSampleFixed {
    pub sample_id: SampleId,
    pub nr: u64,
}

/// The fixed prefix of a raw (tracepoint) sample; `size` payload bytes
/// follow.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RawSampleFixed {
    pub sample_id: SampleId,
    pub size: u32,
}

// Tracepoint payloads. Each starts with the common fields.

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TracepointCommon {
    pub common_type: u16,
    pub common_flags: u8,
    pub common_preempt_count: u8,
    pub common_pid: i32,
}

pub const TASK_COMM_LEN: usize = 16;

#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct TaskNewtaskPayload {
    pub common: TracepointCommon,
    pub pid: i32,
    pub comm: [u8; TASK_COMM_LEN],
    pub clone_flags: u64,
    pub oom_score_adj: i16,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct TaskRenamePayload {
    pub common: TracepointCommon,
    pub pid: i32,
    pub oldcomm: [u8; TASK_COMM_LEN],
    pub newcomm: [u8; TASK_COMM_LEN],
    pub oom_score_adj: i16,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct SchedSwitchPayload {
    pub common: TracepointCommon,
    pub prev_comm: [u8; TASK_COMM_LEN],
    pub prev_pid: i32,
    pub prev_prio: i32,
    pub prev_state: i64,
    pub next_comm: [u8; TASK_COMM_LEN],
    pub next_pid: i32,
    pub next_prio: i32,
}

/// Only the stable prefix: older kernels append a `success` field before
/// `target_cpu`, newer ones don't, and we need neither.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct SchedWakeupPayload {
    pub common: TracepointCommon,
    pub comm: [u8; TASK_COMM_LEN],
    pub pid: i32,
    pub prio: i32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct AmdgpuCsIoctlPayload {
    pub common: TracepointCommon,
    pub sched_job_id: u64,
    pub timeline: i32,
    pub context: u32,
    pub seqno: u32,
    pub dma_fence: u64,
    pub ring_name: u64,
    pub num_ibs: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct AmdgpuSchedRunJobPayload {
    pub common: TracepointCommon,
    pub sched_job_id: u64,
    pub timeline: i32,
    pub context: u32,
    pub seqno: u32,
    pub ring_name: u64,
    pub num_ibs: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct DmaFenceSignaledPayload {
    pub common: TracepointCommon,
    pub driver: i32,
    pub timeline: i32,
    pub context: u32,
    pub seqno: u32,
}

/// Copies a record layout out of a byte buffer. The caller guarantees that
/// `bytes` holds at least `size_of::<T>()` bytes of a record with T's layout.
pub fn pod_from_bytes<T: Copy>(bytes: &[u8]) -> T {
    assert!(bytes.len() >= std::mem::size_of::<T>());
    // Layouts are repr(C, packed), so any alignment is fine.
    unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const T) }
}

/// Resolves a kernel `__data_loc` value against a tracepoint payload: the
/// high 16 bits hold the length, the low 16 bits the offset of the string
/// from the start of the payload.
pub fn extract_data_loc_string(data_loc: i32, payload: &[u8]) -> String {
    let length = ((data_loc >> 16) & 0xffff) as usize;
    let offset = (data_loc & 0xffff) as usize;
    if length == 0 || offset.saturating_add(length) > payload.len() {
        return String::new();
    }
    let bytes = &payload[offset..offset + length];
    // The string should already be null-terminated; don't rely on it.
    let end = memchr::memchr(0, bytes).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// A comm fixed-size field, truncated at the first NUL.
pub fn comm_to_string(comm: &[u8; TASK_COMM_LEN]) -> String {
    let end = memchr::memchr(0, comm).unwrap_or(comm.len());
    String::from_utf8_lossy(&comm[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn record_sizes() {
        assert_eq!(mem::size_of::<SampleId>(), 32);
        assert_eq!(mem::size_of::<SwitchCpuWideRecord>(), 40);
        assert_eq!(mem::size_of::<ForkExitRecord>(), 56);
        assert_eq!(mem::size_of::<LostRecord>(), 48);
        assert_eq!(mem::size_of::<RegsUserAll>(), 8 * 18);
        assert_eq!(mem::size_of::<UprobeRecord>(), 32 + 24 + 24);
        assert_eq!(mem::size_of::<UretprobeRecord>(), 32 + 16);
        assert_eq!(STACK_SAMPLE_RECORD_SIZE, 8 + 32 + 144 + 8 + 65000 + 8);
        assert_eq!(STACK_SAMPLE_DATA_OFFSET, 192);
    }

    #[test]
    fn tracepoint_payload_sizes() {
        // Cross-checked against the format files of a 5.x kernel.
        assert_eq!(mem::size_of::<TracepointCommon>(), 8);
        assert_eq!(mem::size_of::<TaskNewtaskPayload>(), 8 + 4 + 16 + 8 + 2);
        assert_eq!(mem::size_of::<SchedSwitchPayload>(), 8 + 16 + 4 + 4 + 8 + 16 + 4 + 4);
        assert_eq!(mem::size_of::<DmaFenceSignaledPayload>(), 8 + 4 + 4 + 4 + 4);
    }

    #[test]
    fn pod_round_trip() {
        let record = ForkExitRecord {
            pid: 10,
            ppid: 1,
            tid: 11,
            ptid: 2,
            time: 1234,
            sample_id: SampleId {
                pid: 10,
                tid: 11,
                time: 1234,
                stream_id: 7,
                cpu: 3,
                res: 0,
            },
        };
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &record as *const _ as *const u8,
                mem::size_of::<ForkExitRecord>(),
            )
        };
        let copy: ForkExitRecord = pod_from_bytes(bytes);
        assert_eq!({ copy.pid }, 10);
        assert_eq!({ copy.time }, 1234);
        assert_eq!({ copy.sample_id.stream_id }, 7);
    }

    #[test]
    fn data_loc_strings() {
        // Payload with a string "gfx" at offset 12, length 4 (incl. NUL).
        let mut payload = vec![0u8; 16];
        payload[12..16].copy_from_slice(b"gfx\0");
        let data_loc: i32 = (4 << 16) | 12;
        assert_eq!(extract_data_loc_string(data_loc, &payload), "gfx");

        // Out-of-range data_loc yields an empty string instead of panicking.
        let bad: i32 = (32 << 16) | 12;
        assert_eq!(extract_data_loc_string(bad, &payload), "");
    }

    #[test]
    fn comm_truncates_at_nul() {
        let mut comm = [0u8; TASK_COMM_LEN];
        comm[..4].copy_from_slice(b"init");
        assert_eq!(comm_to_string(&comm), "init");
    }
}
