//! The public capture handle. `start` spawns the capture threads and only
//! returns once every event source has been opened and enabled (or opening
//! failed); `stop` requests shutdown and joins them, after which every
//! record, including the slices closed at capture end, has been delivered to
//! the listener.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::config::CaptureOptions;
use crate::error::TracerError;
use crate::listener::TracerListener;
use crate::tracer_thread::TracerThread;

pub struct Tracer {
    exit_requested: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

impl Tracer {
    pub fn start(
        options: CaptureOptions,
        listener: Arc<dyn TracerListener>,
    ) -> Result<Tracer, TracerError> {
        let exit_requested = Arc::new(AtomicBool::new(false));

        // The tracer thread reports back once all event sources are open, so
        // that a failure to start surfaces here synchronously.
        let (startup_sender, startup_receiver) = crossbeam_channel::bounded(1);

        let join_handle = std::thread::Builder::new()
            .name("perfspan-tracer".to_string())
            .spawn({
                let exit_requested = exit_requested.clone();
                move || {
                    let mut tracer_thread = TracerThread::new(options, listener);
                    let startup_result = tracer_thread.open_events();
                    let ok = startup_result.is_ok();
                    startup_sender
                        .send(startup_result)
                        .expect("startup receiver dropped");
                    if ok {
                        tracer_thread.run(exit_requested);
                    }
                }
            })
            .expect("could not spawn the tracer thread");

        match startup_receiver.recv() {
            Ok(Ok(())) => Ok(Tracer {
                exit_requested,
                join_handle: Some(join_handle),
            }),
            Ok(Err(error)) => {
                let _ = join_handle.join();
                Err(error)
            }
            Err(_) => {
                // The tracer thread died before reporting.
                let _ = join_handle.join();
                Err(TracerError::NoEventSources)
            }
        }
    }

    /// Ends the capture. Blocks until all remaining events are processed and
    /// the still-open thread-state slices have been flushed to the listener.
    pub fn stop(mut self) {
        self.request_stop_and_join();
    }

    fn request_stop_and_join(&mut self) {
        self.exit_requested.store(true, Ordering::Relaxed);
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                log::error!("The tracer thread panicked");
            }
        }
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        self.request_stop_and_join();
    }
}
