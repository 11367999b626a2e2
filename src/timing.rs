use std::mem;

/// Current CLOCK_MONOTONIC time in nanoseconds.
///
/// All perf_event_open file descriptors are opened with `use_clockid = 1` and
/// `clockid = CLOCK_MONOTONIC`, so timestamps read here are directly
/// comparable with record timestamps.
pub fn monotonic_timestamp_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    assert_eq!(ret, 0, "clock_gettime(CLOCK_MONOTONIC) cannot fail");
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

pub const NS_PER_MILLISECOND: u64 = 1_000_000;
pub const NS_PER_SECOND: u64 = 1_000_000_000;
