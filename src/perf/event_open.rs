//! Typed perf_event_open constructors for every event source the engine
//! uses, plus the small ioctl wrappers that go with the returned fds.
//!
//! All sources share the same base configuration: one record per event
//! (`sample_period = 1` unless sampling), CLOCK_MONOTONIC timestamps,
//! `sample_id_all` so lost records are timestamped too, and
//! TID | TIME | STREAM_ID | CPU on every record so decode can dispatch on the
//! stream id.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use super::records::{SAMPLE_STACK_USER_SIZE, SAMPLE_STACK_USER_SIZE_8BYTES};
use super::sys::*;

pub const SAMPLE_TYPE_TID_TIME_STREAMID_CPU: u64 =
    PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_STREAM_ID | PERF_SAMPLE_CPU;

/// All 17 general-purpose x86_64 registers, as needed for DWARF unwinding.
/// Must stay in sync with `records::RegsUserAll`.
pub const SAMPLE_REGS_USER_ALL: u64 = (1 << PERF_REG_X86_AX)
    | (1 << PERF_REG_X86_BX)
    | (1 << PERF_REG_X86_CX)
    | (1 << PERF_REG_X86_DX)
    | (1 << PERF_REG_X86_SI)
    | (1 << PERF_REG_X86_DI)
    | (1 << PERF_REG_X86_BP)
    | (1 << PERF_REG_X86_SP)
    | (1 << PERF_REG_X86_IP)
    | (1 << PERF_REG_X86_R8)
    | (1 << PERF_REG_X86_R9)
    | (1 << PERF_REG_X86_R10)
    | (1 << PERF_REG_X86_R11)
    | (1 << PERF_REG_X86_R12)
    | (1 << PERF_REG_X86_R13)
    | (1 << PERF_REG_X86_R14)
    | (1 << PERF_REG_X86_R15);

/// Must stay in sync with `records::RegsUserSpIp`.
pub const SAMPLE_REGS_USER_SP_IP: u64 = (1 << PERF_REG_X86_SP) | (1 << PERF_REG_X86_IP);

/// Must stay in sync with `records::RegsUserAx`.
pub const SAMPLE_REGS_USER_AX: u64 = 1 << PERF_REG_X86_AX;

pub const CALLCHAIN_MAX_STACK_DEPTH: u16 = 127;

fn generic_attr() -> PerfEventAttr {
    let mut attr: PerfEventAttr = unsafe { mem::zeroed() };
    attr.size = mem::size_of::<PerfEventAttr>() as u32;
    attr.sample_period_or_freq = 1;
    attr.clock_id = libc::CLOCK_MONOTONIC;
    attr.sample_type = SAMPLE_TYPE_TID_TIME_STREAMID_CPU;
    // sample_id_all also puts timestamps on lost records.
    attr.flags = PERF_ATTR_FLAG_DISABLED
        | PERF_ATTR_FLAG_SAMPLE_ID_ALL
        | PERF_ATTR_FLAG_USE_CLOCKID;
    attr
}

fn generic_event_open(attr: &PerfEventAttr, pid: libc::pid_t, cpu: i32) -> io::Result<RawFd> {
    let fd = sys_perf_event_open(attr, pid, cpu, -1, PERF_FLAG_FD_CLOEXEC);
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Cpu-wide context switches (PERF_RECORD_SWITCH_CPU_WIDE).
pub fn context_switch_event_open(pid: libc::pid_t, cpu: i32) -> io::Result<RawFd> {
    let mut attr = generic_attr();
    attr.kind = PERF_TYPE_SOFTWARE;
    attr.config = PERF_COUNT_SW_DUMMY;
    attr.flags |= PERF_ATTR_FLAG_CONTEX_SWITCH;
    generic_event_open(&attr, pid, cpu)
}

/// Fork, exit and mmap records on one fd.
pub fn mmap_task_event_open(pid: libc::pid_t, cpu: i32) -> io::Result<RawFd> {
    let mut attr = generic_attr();
    attr.kind = PERF_TYPE_SOFTWARE;
    attr.config = PERF_COUNT_SW_DUMMY;
    attr.flags |= PERF_ATTR_FLAG_MMAP | PERF_ATTR_FLAG_TASK;
    generic_event_open(&attr, pid, cpu)
}

/// Periodic samples with a full register and user-stack dump, for DWARF
/// unwinding.
pub fn stack_sample_event_open(
    period_ns: u64,
    pid: libc::pid_t,
    cpu: i32,
) -> io::Result<RawFd> {
    let mut attr = generic_attr();
    attr.kind = PERF_TYPE_SOFTWARE;
    attr.config = PERF_COUNT_SW_CPU_CLOCK;
    attr.sample_period_or_freq = period_ns;
    attr.sample_type |= PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER;
    attr.sample_regs_user = SAMPLE_REGS_USER_ALL;
    attr.sample_stack_user = SAMPLE_STACK_USER_SIZE as u32;
    generic_event_open(&attr, pid, cpu)
}

/// Periodic samples with a kernel-walked frame-pointer callchain.
pub fn callchain_sample_event_open(
    period_ns: u64,
    pid: libc::pid_t,
    cpu: i32,
) -> io::Result<RawFd> {
    let mut attr = generic_attr();
    attr.kind = PERF_TYPE_SOFTWARE;
    attr.config = PERF_COUNT_SW_CPU_CLOCK;
    attr.sample_period_or_freq = period_ns;
    attr.sample_type |= PERF_SAMPLE_CALLCHAIN;
    attr.sample_max_stack = CALLCHAIN_MAX_STACK_DEPTH;
    generic_event_open(&attr, pid, cpu)
}

fn uprobe_attr(pmu_type: u32, binary_path: &CString, file_offset: u64) -> PerfEventAttr {
    let mut attr = generic_attr();
    attr.kind = pmu_type;
    attr.bp_addr_or_config = binary_path.as_ptr() as u64; // config1 == uprobe_path
    attr.bp_len_or_config = file_offset; // config2 == probe_offset
    attr
}

/// Uprobe on function entry. Captures sp and ip, plus the top 8 stack bytes:
/// the return address, recorded here because the installation of the
/// uretprobe trampoline is about to overwrite it on the real stack.
pub fn uprobe_retaddr_event_open(
    pmu_type: u32,
    binary_path: &CString,
    file_offset: u64,
    pid: libc::pid_t,
    cpu: i32,
) -> io::Result<RawFd> {
    let mut attr = uprobe_attr(pmu_type, binary_path, file_offset);
    attr.config = 0;
    attr.sample_type |= PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER;
    attr.sample_regs_user = SAMPLE_REGS_USER_SP_IP;
    attr.sample_stack_user = SAMPLE_STACK_USER_SIZE_8BYTES as u32;
    generic_event_open(&attr, pid, cpu)
}

/// Uretprobe on function return. Captures AX, the integer return value.
pub fn uretprobe_event_open(
    pmu_type: u32,
    binary_path: &CString,
    file_offset: u64,
    pid: libc::pid_t,
    cpu: i32,
) -> io::Result<RawFd> {
    let mut attr = uprobe_attr(pmu_type, binary_path, file_offset);
    attr.config = 1; // Bit 0 of config selects the uretprobe.
    attr.sample_type |= PERF_SAMPLE_REGS_USER;
    attr.sample_regs_user = SAMPLE_REGS_USER_AX;
    generic_event_open(&attr, pid, cpu)
}

/// A tracepoint given by its id from tracefs; the payload arrives raw.
pub fn tracepoint_event_open(
    tracepoint_id: u64,
    pid: libc::pid_t,
    cpu: i32,
) -> io::Result<RawFd> {
    let mut attr = generic_attr();
    attr.kind = PERF_TYPE_TRACEPOINT;
    attr.config = tracepoint_id;
    attr.sample_type |= PERF_SAMPLE_RAW;
    generic_event_open(&attr, pid, cpu)
}

fn perf_ioctl(fd: RawFd, request: libc::c_ulong, what: &str) {
    let ret = unsafe { libc::ioctl(fd, request as _, 0) };
    if ret != 0 {
        log::error!("{what}: {}", io::Error::last_os_error());
    }
}

pub fn perf_event_enable(fd: RawFd) {
    perf_ioctl(fd, PERF_EVENT_IOC_ENABLE, "PERF_EVENT_IOC_ENABLE");
}

pub fn perf_event_disable(fd: RawFd) {
    perf_ioctl(fd, PERF_EVENT_IOC_DISABLE, "PERF_EVENT_IOC_DISABLE");
}

/// Redirects the records of `from_fd` onto `to_fd`'s ring buffer, so many fds
/// can share one buffer per core.
pub fn perf_event_redirect(from_fd: RawFd, to_fd: RawFd) {
    let ret = unsafe { libc::ioctl(from_fd, PERF_EVENT_IOC_SET_OUTPUT as _, to_fd) };
    if ret != 0 {
        log::error!(
            "PERF_EVENT_IOC_SET_OUTPUT: {}",
            io::Error::last_os_error()
        );
    }
}

/// The kernel-assigned stream id of the fd, carried on every record it
/// produces.
pub fn perf_event_get_id(fd: RawFd) -> io::Result<u64> {
    let mut id: u64 = 0;
    let ret = unsafe { libc::ioctl(fd, PERF_EVENT_IOC_ID as _, &mut id) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(id)
}

pub fn close_fd(fd: RawFd) {
    unsafe { libc::close(fd) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regs_masks_match_record_layouts() {
        assert_eq!(SAMPLE_REGS_USER_ALL.count_ones(), 17);
        assert_eq!(SAMPLE_REGS_USER_SP_IP.count_ones(), 2);
        assert_eq!(SAMPLE_REGS_USER_AX, 1);
    }

    #[test]
    fn generic_attr_configuration() {
        let attr = generic_attr();
        assert_eq!(attr.sample_period_or_freq, 1);
        assert_eq!(attr.clock_id, libc::CLOCK_MONOTONIC);
        assert_eq!(attr.sample_type, SAMPLE_TYPE_TID_TIME_STREAMID_CPU);
        assert_ne!(attr.flags & PERF_ATTR_FLAG_DISABLED, 0);
        assert_ne!(attr.flags & PERF_ATTR_FLAG_SAMPLE_ID_ALL, 0);
        assert_ne!(attr.flags & PERF_ATTR_FLAG_USE_CLOCKID, 0);
    }
}
