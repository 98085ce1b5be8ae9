//! Camera backends: the device-integrated sensors and external UVC cameras
//!
//! Both variants share the same streaming core: a capture device feeding its
//! own frame processing loop. They differ in how the device is obtained.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::capture::device::{CaptureDevice, DeviceFactory, FrameCallback};
use crate::capture::settings::CaptureSettings;
use crate::controller::{CameraIdentity, Facing};
use crate::error::{CameraError, CameraResult};
use crate::filters::SharedFilter;
use crate::hotplug::DeviceHandle;
use crate::pipeline::processing::{FrameProcessingLoop, FrameSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Closed,
    Open,
    Streaming,
}

/// Device plus the processing loop it feeds
struct StreamCore {
    device: Option<Box<dyn CaptureDevice>>,
    processing: FrameProcessingLoop,
    state: BackendState,
    settings: Option<CaptureSettings>,
}

impl StreamCore {
    fn new(name: &str, filter: SharedFilter, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            device: None,
            processing: FrameProcessingLoop::new(name, filter, sink),
            state: BackendState::Closed,
            settings: None,
        }
    }

    fn open(&mut self) -> CameraResult<()> {
        if self.state != BackendState::Closed {
            return Ok(());
        }
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| CameraError::DeviceUnavailable("no capture device".into()))?;
        device.open()?;
        debug!(device = device.name(), "Capture device opened");
        self.state = BackendState::Open;
        Ok(())
    }

    fn start_streaming(&mut self, settings: CaptureSettings) -> CameraResult<()> {
        match self.state {
            BackendState::Closed => {
                return Err(CameraError::DeviceUnavailable("device is not open".into()))
            }
            BackendState::Streaming => return Err(CameraError::AlreadyActive),
            BackendState::Open => {}
        }
        let device = self
            .device
            .as_mut()
            .ok_or_else(|| CameraError::DeviceUnavailable("no capture device".into()))?;

        let publisher = self.processing.start()?;
        let callback: FrameCallback = Arc::new(move |frame| publisher.publish(frame));
        if let Err(e) = device.start(&settings, callback) {
            self.processing.stop();
            return Err(e);
        }

        self.settings = Some(settings);
        self.state = BackendState::Streaming;
        Ok(())
    }

    fn stop_streaming(&mut self) {
        if self.state != BackendState::Streaming {
            return;
        }
        // Producer first, then the worker: nothing publishes into a dead slot
        if let Some(device) = self.device.as_mut() {
            device.stop();
        }
        self.processing.stop();
        self.state = BackendState::Open;
    }

    fn close(&mut self) {
        if self.state == BackendState::Closed {
            return;
        }
        self.stop_streaming();
        if let Some(device) = self.device.as_mut() {
            device.close();
        }
        self.state = BackendState::Closed;
    }
}

impl Drop for StreamCore {
    fn drop(&mut self) {
        self.close();
    }
}

/// Front or back sensor built into the device
pub struct InternalCamera {
    facing: Facing,
    factory: Arc<dyn DeviceFactory>,
    core: StreamCore,
}

impl InternalCamera {
    pub fn new(
        facing: Facing,
        factory: Arc<dyn DeviceFactory>,
        filter: SharedFilter,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        let mut core = StreamCore::new("internal", filter, sink);
        core.device = Some(factory.internal(facing));
        Self {
            facing,
            factory,
            core,
        }
    }

    pub fn facing(&self) -> Facing {
        self.facing
    }

    /// Switch sensors. A live stream is stopped, the new sensor opened and
    /// streaming resumed with the same settings; facing is never swapped on
    /// a running stream.
    #[instrument(skip(self), fields(from = ?self.facing))]
    pub fn set_facing(&mut self, facing: Facing) -> CameraResult<()> {
        if facing == self.facing {
            return Ok(());
        }

        let previous = self.core.state;
        let settings = self.core.settings;
        self.core.close();
        self.core.device = Some(self.factory.internal(facing));
        self.facing = facing;
        info!(?facing, "Internal camera facing changed");

        if previous != BackendState::Closed {
            self.core.open()?;
        }
        if let (BackendState::Streaming, Some(settings)) = (previous, settings) {
            self.core.start_streaming(settings)?;
        }
        Ok(())
    }
}

/// USB video-class camera reached through a permission-granted handle
pub struct ExternalCamera {
    handle: DeviceHandle,
    factory: Arc<dyn DeviceFactory>,
    core: StreamCore,
}

impl ExternalCamera {
    pub fn new(
        handle: DeviceHandle,
        factory: Arc<dyn DeviceFactory>,
        filter: SharedFilter,
        sink: Arc<dyn FrameSink>,
    ) -> Self {
        Self {
            handle,
            factory,
            core: StreamCore::new("external", filter, sink),
        }
    }

    fn open(&mut self) -> CameraResult<()> {
        if self.core.device.is_none() {
            let control = self
                .handle
                .granted_control()
                .ok_or_else(|| CameraError::PermissionDenied(self.handle.device.to_string()))?;
            self.core.device = Some(self.factory.external(control));
        }
        self.core.open()
    }
}

/// The active camera: one of the two backend variants
pub enum CameraBackend {
    Internal(InternalCamera),
    External(ExternalCamera),
}

impl CameraBackend {
    fn core(&self) -> &StreamCore {
        match self {
            CameraBackend::Internal(camera) => &camera.core,
            CameraBackend::External(camera) => &camera.core,
        }
    }

    fn core_mut(&mut self) -> &mut StreamCore {
        match self {
            CameraBackend::Internal(camera) => &mut camera.core,
            CameraBackend::External(camera) => &mut camera.core,
        }
    }

    pub fn identity(&self) -> CameraIdentity {
        match self {
            CameraBackend::Internal(camera) => CameraIdentity::Internal(camera.facing),
            CameraBackend::External(_) => CameraIdentity::External,
        }
    }

    pub fn state(&self) -> BackendState {
        self.core().state
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == BackendState::Streaming
    }

    /// Acquire the device. `PermissionDenied` for an external camera whose
    /// handle has no granted control block.
    pub fn open(&mut self) -> CameraResult<()> {
        debug!(identity = %self.identity(), "Opening backend");
        match self {
            CameraBackend::Internal(camera) => camera.core.open(),
            CameraBackend::External(camera) => camera.open(),
        }
    }

    pub fn start_streaming(&mut self, settings: CaptureSettings) -> CameraResult<()> {
        info!(identity = %self.identity(), %settings, "Starting backend stream");
        self.core_mut().start_streaming(settings)
    }

    /// Idempotent; frame delivery has quiesced when this returns
    pub fn stop_streaming(&mut self) {
        debug!(identity = %self.identity(), "Stopping backend stream");
        self.core_mut().stop_streaming();
    }

    /// Safe to call on a backend that was never opened
    pub fn close(&mut self) {
        debug!(identity = %self.identity(), "Closing backend");
        self.core_mut().close();
    }

    /// Last successfully applied settings
    pub fn current_settings(&self) -> Option<CaptureSettings> {
        self.core().settings
    }

    /// Restart the stream on the same device with new settings. On failure
    /// the previous settings are restored if possible and the error returned.
    pub fn reconfigure(&mut self, settings: CaptureSettings) -> CameraResult<()> {
        let previous = self.current_settings();
        self.stop_streaming();
        metrics::counter!("camsource_backend_restarts").increment(1);

        match self.start_streaming(settings) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(previous) = previous {
                    warn!(error = %e, %previous, "Reconfigure failed, restoring previous settings");
                    if let Err(restore) = self.start_streaming(previous) {
                        warn!(error = %restore, "Failed to restore previous settings");
                    }
                }
                Err(e)
            }
        }
    }
}
