//! A whole-system tracing engine for Linux built on perf_event_open.
//!
//! Given a target process, a capture produces a time-ordered stream of:
//!
//! - scheduling slices: when each thread of the target owned a cpu core;
//! - thread-state slices: the non-running lifecycle of each thread, with the
//!   reason it became runnable (woken, created);
//! - function calls: entry and return of dynamically instrumented user-space
//!   functions, reconstructed from uprobes and uretprobes, with callstacks
//!   that remain correct across frames whose return address was hijacked by
//!   the uretprobe trampoline;
//! - GPU jobs: AMD command-buffer submissions, correlated from three kernel
//!   driver tracepoints and timed at ioctl, scheduler dispatch, hardware
//!   start and fence signal;
//! - thread names and raw payloads of user-selected tracepoints.
//!
//! Records are delivered to a [`TracerListener`]. A capture is configured
//! with [`CaptureOptions`] and driven through [`Tracer::start`] /
//! [`Tracer::stop`].
//!
//! Everything requires `perf_event_paranoid = -1` or root, since all event
//! sources are opened system-wide (per core, not per thread).

#![cfg(target_os = "linux")]

pub mod config;
pub mod error;
pub mod events;
pub mod gpu;
pub mod listener;
pub mod proc_maps;
pub mod processor;
pub mod procfs;
pub mod queue;
pub mod sched;
pub mod timing;
pub mod tracer;
pub mod tracer_thread;
pub mod unwinding;

pub mod perf;

pub use config::{
    CaptureOptions, FunctionKind, InstrumentedFunction, SamplingMethod, SelectedTracepoint,
};
pub use error::TracerError;
pub use listener::{
    AddressInfo, CallstackSample, FunctionCall, GpuJob, LostRecords, ModulesUpdate,
    SchedulingSlice, ThreadName, ThreadState, ThreadStateSlice, TracepointEvent, TracerListener,
    WakeupReason,
};
pub use tracer::Tracer;
