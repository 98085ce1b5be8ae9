//! Frame processing worker
//!
//! One worker thread per streaming backend. It claims the newest frame from
//! its slot, runs the filter stage when active and forwards the result to the
//! frame sink. Slow filters drop frames in the slot instead of queuing them,
//! so output latency stays bounded by one filter call.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::capture::Frame;
use crate::error::{CameraError, CameraResult, FilterError};
use crate::filters::SharedFilter;
use crate::pipeline::slot::{Claim, FrameSlot};

/// Downstream consumer of output frames (encoder, renderer).
///
/// The frame is only borrowed for the call; receivers that keep the pixels
/// must clone the frame.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: &Frame);
}

impl<F> FrameSink for F
where
    F: Fn(&Frame) + Send + Sync,
{
    fn on_frame(&self, frame: &Frame) {
        self(frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopping,
}

/// Producer handle into a running loop's slot
#[derive(Clone)]
pub struct FramePublisher(Arc<FrameSlot>);

impl FramePublisher {
    /// Non-blocking; replaces any frame the worker has not claimed yet
    pub fn publish(&self, frame: Frame) {
        self.0.publish(frame);
    }
}

pub struct FrameProcessingLoop {
    name: String,
    filter: SharedFilter,
    sink: Arc<dyn FrameSink>,
    state: LoopState,
    slot: Option<Arc<FrameSlot>>,
    worker: Option<JoinHandle<()>>,
}

impl FrameProcessingLoop {
    pub fn new(name: impl Into<String>, filter: SharedFilter, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            name: name.into(),
            filter,
            sink,
            state: LoopState::Idle,
            slot: None,
            worker: None,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Spawn the worker. Rejected with `AlreadyActive` unless idle.
    pub fn start(&mut self) -> CameraResult<FramePublisher> {
        if self.state != LoopState::Idle {
            return Err(CameraError::AlreadyActive);
        }

        let slot = Arc::new(FrameSlot::new());
        let worker = {
            let slot = Arc::clone(&slot);
            let filter = self.filter.clone();
            let sink = Arc::clone(&self.sink);
            let name = self.name.clone();
            thread::Builder::new()
                .name(format!("frame-processing:{}", self.name))
                .spawn(move || run_worker(&name, &slot, &filter, sink.as_ref()))?
        };

        self.slot = Some(Arc::clone(&slot));
        self.worker = Some(worker);
        self.state = LoopState::Running;
        info!(name = %self.name, "Frame processing loop started");

        Ok(FramePublisher(slot))
    }

    /// Shut the slot down and join the worker. Returns once any in-flight
    /// filter call has finished. No-op while idle.
    pub fn stop(&mut self) {
        if self.state == LoopState::Idle {
            return;
        }
        self.state = LoopState::Stopping;

        if let Some(slot) = self.slot.take() {
            slot.shutdown();
            let (published, claimed, dropped) = slot.stats();
            debug!(name = %self.name, published, claimed, dropped, "Slot statistics");
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(name = %self.name, "Frame processing worker panicked");
            }
        }

        self.state = LoopState::Idle;
        info!(name = %self.name, "Frame processing loop stopped");
    }
}

impl Drop for FrameProcessingLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(name: &str, slot: &FrameSlot, filter: &SharedFilter, sink: &dyn FrameSink) {
    debug!(name, "Frame processing worker running");

    while let Claim::Frame(frame) = slot.claim_blocking() {
        // Held through forwarding so a reconfiguration never observes a
        // frame processed under the previous filter state.
        let mut stage = filter.lock();

        let output = if stage.is_active() {
            let started = Instant::now();
            let result = panic::catch_unwind(AssertUnwindSafe(|| stage.process(&frame)))
                .unwrap_or_else(|payload| Err(FilterError::Panicked(panic_message(payload))));
            metrics::histogram!("camsource_filter_time_us")
                .record(started.elapsed().as_micros() as f64);

            match result {
                Ok(output) => output,
                Err(e) => {
                    warn!(
                        name,
                        sequence = frame.sequence(),
                        error = %e,
                        "Filter failed, dropping frame"
                    );
                    metrics::counter!("camsource_filter_failures").increment(1);
                    None
                }
            }
        } else {
            Some(frame)
        };

        if let Some(output) = output {
            sink.on_frame(&output);
            metrics::counter!("camsource_frames_forwarded").increment(1);
        }
        drop(stage);
    }

    debug!(name, "Frame processing worker exiting");
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
