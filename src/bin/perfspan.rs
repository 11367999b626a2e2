//! Thin command-line shell around the tracing engine: records a pid for a
//! while and logs what comes out. Mostly useful for checking a machine's
//! configuration and eyeballing event rates; real consumers implement
//! `TracerListener` themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;

use perfspan::{
    config, CallstackSample, CaptureOptions, FunctionCall, GpuJob, LostRecords, SamplingMethod,
    SchedulingSlice, SelectedTracepoint, ThreadName, ThreadStateSlice, Tracer, TracerListener,
};

#[derive(Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum SamplingArg {
    Off,
    Fp,
    Dwarf,
}

/// Record scheduling, thread-state, sampling and GPU activity of a process.
#[derive(Parser)]
#[command(name = "perfspan", version)]
struct Opt {
    /// Pid of the process to trace.
    #[arg(long)]
    pid: i32,

    /// How long to record, in seconds; ctrl-c stops earlier.
    #[arg(long, default_value = "10")]
    duration: u64,

    /// Callstack sampling method.
    #[arg(long, value_enum, default_value = "off")]
    sampling: SamplingArg,

    /// Sampling rate in Hz.
    #[arg(long, default_value = "1000")]
    rate: f64,

    /// Also track the scheduler state of every thread of the target.
    #[arg(long)]
    thread_state: bool,

    /// Do not record scheduling slices.
    #[arg(long)]
    no_context_switches: bool,

    /// Do not record AMD GPU jobs even if the driver is present.
    #[arg(long)]
    no_gpu: bool,

    /// Additional tracepoints to forward, as category:name pairs.
    #[arg(long = "tracepoint")]
    tracepoints: Vec<String>,

    /// Print every record as it is delivered.
    #[arg(long)]
    verbose: bool,
}

#[derive(Default)]
struct CountingListener {
    verbose: bool,
    scheduling_slices: AtomicU64,
    thread_state_slices: AtomicU64,
    callstack_samples: AtomicU64,
    function_calls: AtomicU64,
    gpu_jobs: AtomicU64,
    thread_names: AtomicU64,
    tracepoint_events: AtomicU64,
    lost_records: AtomicU64,
}

impl TracerListener for CountingListener {
    fn on_scheduling_slice(&self, slice: SchedulingSlice) {
        self.scheduling_slices.fetch_add(1, Ordering::Relaxed);
        if self.verbose {
            info!("{slice:?}");
        }
    }

    fn on_thread_state_slice(&self, slice: ThreadStateSlice) {
        self.thread_state_slices.fetch_add(1, Ordering::Relaxed);
        if self.verbose {
            info!("{slice:?}");
        }
    }

    fn on_callstack_sample(&self, sample: CallstackSample) {
        self.callstack_samples.fetch_add(1, Ordering::Relaxed);
        if self.verbose {
            info!(
                "CallstackSample {{ tid: {}, ts: {}, frames: {} }}",
                sample.tid,
                sample.timestamp_ns,
                sample.pcs.len()
            );
        }
    }

    fn on_function_call(&self, function_call: FunctionCall) {
        self.function_calls.fetch_add(1, Ordering::Relaxed);
        if self.verbose {
            info!("{function_call:?}");
        }
    }

    fn on_gpu_job(&self, gpu_job: GpuJob) {
        self.gpu_jobs.fetch_add(1, Ordering::Relaxed);
        if self.verbose {
            info!("{gpu_job:?}");
        }
    }

    fn on_thread_name(&self, thread_name: ThreadName) {
        self.thread_names.fetch_add(1, Ordering::Relaxed);
        if self.verbose {
            info!("{thread_name:?}");
        }
    }

    fn on_tracepoint_event(&self, event: perfspan::TracepointEvent) {
        self.tracepoint_events.fetch_add(1, Ordering::Relaxed);
        if self.verbose {
            info!(
                "TracepointEvent {{ {}:{}, tid: {}, {} payload bytes }}",
                event.category,
                event.name,
                event.tid,
                event.raw_payload.len()
            );
        }
    }

    fn on_lost_records(&self, lost: LostRecords) {
        self.lost_records.fetch_add(lost.count, Ordering::Relaxed);
    }
}

impl CountingListener {
    fn print_summary(&self) {
        info!("Capture finished:");
        info!(
            "  scheduling slices: {}",
            self.scheduling_slices.load(Ordering::Relaxed)
        );
        info!(
            "  thread state slices: {}",
            self.thread_state_slices.load(Ordering::Relaxed)
        );
        info!(
            "  callstack samples: {}",
            self.callstack_samples.load(Ordering::Relaxed)
        );
        info!(
            "  function calls: {}",
            self.function_calls.load(Ordering::Relaxed)
        );
        info!("  gpu jobs: {}", self.gpu_jobs.load(Ordering::Relaxed));
        info!(
            "  thread names: {}",
            self.thread_names.load(Ordering::Relaxed)
        );
        info!(
            "  tracepoint events: {}",
            self.tracepoint_events.load(Ordering::Relaxed)
        );
        info!(
            "  lost records: {}",
            self.lost_records.load(Ordering::Relaxed)
        );
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opt = Opt::parse();

    let mut options = CaptureOptions::for_pid(opt.pid);
    options.trace_context_switches = !opt.no_context_switches;
    options.trace_thread_state = opt.thread_state;
    if opt.no_gpu {
        options.trace_gpu_driver = false;
    }
    options.sampling_method = match opt.sampling {
        SamplingArg::Off => SamplingMethod::Off,
        SamplingArg::Fp => SamplingMethod::FramePointers,
        SamplingArg::Dwarf => SamplingMethod::Dwarf,
    };
    if options.sampling_method != SamplingMethod::Off {
        let Some(period_ns) = config::sampling_period_ns_from_rate(opt.rate) else {
            eprintln!("Invalid sampling rate: {}", opt.rate);
            std::process::exit(1);
        };
        options.sampling_period_ns = period_ns;
    }
    for tracepoint in &opt.tracepoints {
        let Some((category, name)) = tracepoint.split_once(':') else {
            eprintln!("Tracepoints must be given as category:name, got '{tracepoint}'");
            std::process::exit(1);
        };
        options.instrumented_tracepoints.push(SelectedTracepoint {
            category: category.to_string(),
            name: name.to_string(),
        });
    }

    let listener = Arc::new(CountingListener {
        verbose: opt.verbose,
        ..Default::default()
    });

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    ctrlc::set_handler({
        let stop = stop.clone();
        move || stop.store(true, Ordering::SeqCst)
    })
    .expect("cannot register the ctrl-c handler");

    let tracer = match Tracer::start(options, listener.clone()) {
        Ok(tracer) => tracer,
        Err(error) => {
            eprintln!("Cannot start capture: {error}");
            std::process::exit(1);
        }
    };

    info!(
        "Recording pid {} for {} s (ctrl-c to stop earlier)...",
        opt.pid, opt.duration
    );
    let deadline = std::time::Instant::now() + Duration::from_secs(opt.duration);
    while std::time::Instant::now() < deadline && !stop.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(50));
    }
    tracer.stop();

    listener.print_summary();
}
