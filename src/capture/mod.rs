pub mod backend;
pub mod device;
pub mod frame;
pub mod settings;
pub mod v4l2;
pub mod yuv;

pub use backend::CameraBackend;
pub use device::{CaptureDevice, DeviceFactory, FrameCallback};
pub use frame::Frame;
pub use frame::PixelFormat;
pub use settings::CaptureSettings;
pub use v4l2::{V4l2Device, V4l2DeviceFactory};
