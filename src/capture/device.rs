//! Driver seam between camera backends and the hardware

use std::sync::Arc;

use crate::capture::frame::Frame;
use crate::capture::settings::CaptureSettings;
use crate::controller::Facing;
use crate::error::CameraResult;
use crate::hotplug::ControlBlock;

/// Called on the driver's delivery thread for every captured frame.
/// Must not block: it only publishes into a frame slot.
pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// One physical capture device
pub trait CaptureDevice: Send {
    /// Claim the device
    fn open(&mut self) -> CameraResult<()>;

    /// Begin delivering frames to `callback` at `settings`
    fn start(&mut self, settings: &CaptureSettings, callback: FrameCallback) -> CameraResult<()>;

    /// Quiesce delivery. No callback fires after this returns.
    fn stop(&mut self);

    /// Release the device. Safe on a device that was never opened.
    fn close(&mut self);

    fn name(&self) -> &str;
}

/// Builds capture devices for each camera identity
pub trait DeviceFactory: Send + Sync {
    fn internal(&self, facing: Facing) -> Box<dyn CaptureDevice>;

    fn external(&self, control: &ControlBlock) -> Box<dyn CaptureDevice>;
}
