//! Capture configuration. Immutable for the duration of a capture.

use crate::procfs;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum SamplingMethod {
    #[default]
    Off,
    /// Kernel-walked callchains; cheap, needs frame pointers in the target.
    FramePointers,
    /// Register and stack dumps unwound with DWARF CFI.
    Dwarf,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum FunctionKind {
    /// Instrumented with both a uprobe and a uretprobe.
    #[default]
    Regular,
    /// Manual timer start: only the uprobe fires.
    ManualStart,
    /// Manual timer stop: only the uretprobe fires.
    ManualStop,
}

/// A user-space function to instrument dynamically. The metadata comes from
/// the host (binary path, ELF file offset of the entry point, and the
/// absolute address the binary is loaded at in the target).
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InstrumentedFunction {
    pub binary_path: String,
    pub file_offset: u64,
    pub absolute_address: u64,
    pub kind: FunctionKind,
}

/// An arbitrary kernel tracepoint whose raw payloads should be forwarded.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct SelectedTracepoint {
    pub category: String,
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct CaptureOptions {
    pub pid: i32,
    pub sampling_method: SamplingMethod,
    pub sampling_period_ns: u64,
    pub trace_context_switches: bool,
    pub trace_thread_state: bool,
    pub trace_gpu_driver: bool,
    pub instrumented_functions: Vec<InstrumentedFunction>,
    pub instrumented_tracepoints: Vec<SelectedTracepoint>,
}

impl CaptureOptions {
    /// Defaults: sampling off, context switches on, thread state off, GPU
    /// driver tracing on iff the amdgpu tracepoints exist on this machine.
    pub fn for_pid(pid: i32) -> Self {
        CaptureOptions {
            pid,
            sampling_method: SamplingMethod::Off,
            sampling_period_ns: 0,
            trace_context_switches: true,
            trace_thread_state: false,
            trace_gpu_driver: procfs::amdgpu_tracepoints_exist(),
            instrumented_functions: Vec::new(),
            instrumented_tracepoints: Vec::new(),
        }
    }
}

/// Converts a sampling rate in Hz to the period in nanoseconds that
/// perf_event_open expects. None for rates that don't yield a representable
/// period.
pub fn sampling_period_ns_from_rate(rate_hz: f64) -> Option<u64> {
    let period_ns = 1_000_000_000.0 / rate_hz;
    if period_ns > 0.0 && period_ns <= u64::MAX as f64 {
        Some(period_ns as u64)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_period_from_rate() {
        assert_eq!(sampling_period_ns_from_rate(1000.0), Some(1_000_000));
        assert_eq!(sampling_period_ns_from_rate(99.0), Some(10_101_010));
        assert_eq!(sampling_period_ns_from_rate(0.0), None);
        assert_eq!(sampling_period_ns_from_rate(-5.0), None);
    }

    #[test]
    fn defaults() {
        let options = CaptureOptions::for_pid(42);
        assert_eq!(options.pid, 42);
        assert_eq!(options.sampling_method, SamplingMethod::Off);
        assert!(options.trace_context_switches);
        assert!(!options.trace_thread_state);
        assert!(options.instrumented_functions.is_empty());
    }
}
