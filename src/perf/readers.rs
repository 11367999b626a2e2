//! Decode of the records whose size is not fixed: stack samples (the dump is
//! `dyn_size` bytes), callchain samples (`nr` instruction pointers), raw
//! tracepoints, and the peeks decode needs before deciding how to consume a
//! record.

use byteorder::{ByteOrder, NativeEndian};

use super::records::*;
use super::ring_buffer::PerfEventRingBuffer;
use super::sys::PerfEventHeader;
use crate::events::{CallchainSampleEvent, StackSampleEvent};

const HEADER_SIZE: u64 = std::mem::size_of::<PerfEventHeader>() as u64;

// All PERF_RECORD_SAMPLEs start with the header followed by the SampleId
// fields, so single fields can be peeked at fixed offsets before committing
// to a full consume.

pub fn read_sample_record_stream_id(ring_buffer: &PerfEventRingBuffer) -> u64 {
    ring_buffer.read_value_at_offset(HEADER_SIZE + std::mem::offset_of!(SampleId, stream_id) as u64)
}

pub fn read_sample_record_pid(ring_buffer: &PerfEventRingBuffer) -> i32 {
    ring_buffer.read_value_at_offset(HEADER_SIZE + std::mem::offset_of!(SampleId, pid) as u64)
}

/// The pid field of a PERF_RECORD_MMAP, which directly follows the header.
pub fn read_mmap_record_pid(ring_buffer: &PerfEventRingBuffer) -> i32 {
    ring_buffer.read_value_at_offset(HEADER_SIZE)
}

/// Consumes a DWARF stack sample. Returns None for samples with an
/// unexpected size: these have abi == PERF_SAMPLE_REGS_ABI_NONE, no register
/// dump and no stack (commonly seen while a process exits), and are skipped.
pub fn consume_stack_sample(
    ring_buffer: &mut PerfEventRingBuffer,
    header: &PerfEventHeader,
) -> Option<Box<StackSampleEvent>> {
    if header.size as usize != STACK_SAMPLE_RECORD_SIZE {
        ring_buffer.skip_record(header);
        return None;
    }

    let sample_id: SampleId = ring_buffer.read_value_at_offset(HEADER_SIZE);
    let regs: RegsUserAll = ring_buffer.read_value_at_offset(STACK_SAMPLE_REGS_OFFSET);
    let dyn_size: u64 = ring_buffer.read_value_at_offset(STACK_SAMPLE_DYN_SIZE_OFFSET);

    let mut stack = vec![0u8; dyn_size as usize];
    ring_buffer.read_raw_at_offset(&mut stack, STACK_SAMPLE_DATA_OFFSET);
    ring_buffer.skip_record(header);

    Some(Box::new(StackSampleEvent {
        timestamp_ns: sample_id.time,
        pid: sample_id.pid as i32,
        tid: sample_id.tid as i32,
        cpu: sample_id.cpu,
        regs,
        stack,
    }))
}

/// Consumes a frame-pointer callchain sample.
pub fn consume_callchain_sample(
    ring_buffer: &mut PerfEventRingBuffer,
    header: &PerfEventHeader,
) -> CallchainSampleEvent {
    let fixed: CallchainSampleFixed = ring_buffer.read_value_at_offset(HEADER_SIZE);
    let sample_id = fixed.sample_id;

    // Guard nr against a truncated record.
    let max_ips = (header.size as u64)
        .saturating_sub(HEADER_SIZE + std::mem::size_of::<CallchainSampleFixed>() as u64)
        / 8;
    let nr = fixed.nr.min(max_ips) as usize;

    let mut raw_ips = vec![0u8; nr * 8];
    ring_buffer.read_raw_at_offset(
        &mut raw_ips,
        HEADER_SIZE + std::mem::size_of::<CallchainSampleFixed>() as u64,
    );
    ring_buffer.skip_record(header);

    let mut ips = vec![0u64; nr];
    NativeEndian::read_u64_into(&raw_ips, &mut ips);

    CallchainSampleEvent {
        timestamp_ns: sample_id.time,
        pid: sample_id.pid as i32,
        tid: sample_id.tid as i32,
        ips,
    }
}

/// Consumes a raw tracepoint sample, returning the generic sample fields and
/// the tracepoint payload bytes.
pub fn consume_tracepoint(
    ring_buffer: &mut PerfEventRingBuffer,
    header: &PerfEventHeader,
) -> (SampleId, Vec<u8>) {
    let fixed: RawSampleFixed = ring_buffer.read_value_at_offset(HEADER_SIZE);

    let payload_offset = HEADER_SIZE + std::mem::size_of::<RawSampleFixed>() as u64;
    let max_payload = (header.size as u64).saturating_sub(payload_offset);
    let size = (fixed.size as u64).min(max_payload) as usize;

    let mut payload = vec![0u8; size];
    ring_buffer.read_raw_at_offset(&mut payload, payload_offset);
    ring_buffer.skip_record(header);

    (fixed.sample_id, payload)
}
