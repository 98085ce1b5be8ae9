//! V4L2 capture devices
//!
//! Both the device-integrated sensors and UVC cameras show up as V4L2
//! capture nodes, so one driver implementation serves both backends.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::device::{CaptureDevice, DeviceFactory, FrameCallback};
use crate::capture::frame::{Frame, FrameMetadata, PixelFormat, Rotation};
use crate::capture::settings::CaptureSettings;
use crate::capture::yuv;
use crate::controller::Facing;
use crate::error::{CameraError, CameraResult};
use crate::hotplug::ControlBlock;
use crate::CaptureConfig;

/// How long a dequeue may block before the delivery thread rechecks its
/// stop flag
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

struct DeliveryWorker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Driver-side pixel layouts we can turn into NV21, in order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SensorLayout {
    Nv21,
    Yuyv,
}

impl SensorLayout {
    const PREFERENCE: [SensorLayout; 2] = [SensorLayout::Nv21, SensorLayout::Yuyv];

    fn fourcc(self) -> FourCC {
        match self {
            SensorLayout::Nv21 => FourCC::new(&PixelFormat::Nv21.fourcc()),
            SensorLayout::Yuyv => FourCC::new(b"YUYV"),
        }
    }

    fn pick(offered: &[FourCC]) -> Option<Self> {
        Self::PREFERENCE
            .into_iter()
            .find(|layout| offered.contains(&layout.fourcc()))
    }

    /// Bytes per row when the driver leaves `bytesperline` unset
    fn min_stride(self, width: u32) -> u32 {
        match self {
            SensorLayout::Nv21 => width,
            SensorLayout::Yuyv => width * 2,
        }
    }

    fn repack(self, data: &[u8], width: u32, height: u32, stride: u32) -> Option<Vec<u8>> {
        match self {
            SensorLayout::Nv21 => yuv::compact_nv21(data, width, height, stride),
            SensorLayout::Yuyv => yuv::yuyv_to_nv21(data, width, height, stride),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Negotiated {
    layout: SensorLayout,
    stride: u32,
}

/// Frames dequeued before the startup latency hint has elapsed are discarded
#[derive(Debug, Clone, Copy)]
struct Warmup {
    until: Instant,
}

impl Warmup {
    fn new(started: Instant, hint_ms: u32) -> Self {
        Self {
            until: started + Duration::from_millis(u64::from(hint_ms)),
        }
    }

    fn settled(&self, captured: Instant) -> bool {
        captured >= self.until
    }
}

/// A V4L2 capture node streaming through memory-mapped buffers
pub struct V4l2Device {
    path: String,
    buffer_count: u32,
    rotation: Rotation,
    mirrored: bool,
    device: Option<Device>,
    worker: Option<DeliveryWorker>,
}

impl V4l2Device {
    pub fn new(path: impl Into<String>, buffer_count: u32) -> Self {
        Self {
            path: path.into(),
            buffer_count,
            rotation: Rotation::Deg0,
            mirrored: false,
            device: None,
            worker: None,
        }
    }

    pub fn with_orientation(mut self, rotation: Rotation, mirrored: bool) -> Self {
        self.rotation = rotation;
        self.mirrored = mirrored;
        self
    }

    fn negotiate(device: &Device, settings: &CaptureSettings) -> CameraResult<Negotiated> {
        let offered: Vec<FourCC> = device
            .enum_formats()?
            .into_iter()
            .map(|desc| desc.fourcc)
            .collect();
        let layout = SensorLayout::pick(&offered).ok_or_else(|| {
            let offered: Vec<String> = offered.iter().map(ToString::to_string).collect();
            CameraError::UnsupportedFormat {
                requested: *settings,
                reason: format!("driver offers neither NV21 nor YUYV ({})", offered.join(", ")),
            }
        })?;

        let mut fmt = device.format()?;
        fmt.width = settings.width;
        fmt.height = settings.height;
        fmt.fourcc = layout.fourcc();

        let applied = device.set_format(&fmt)?;
        if applied.width != settings.width
            || applied.height != settings.height
            || applied.fourcc != fmt.fourcc
        {
            return Err(CameraError::UnsupportedFormat {
                requested: *settings,
                reason: format!(
                    "driver offered {}x{} {}",
                    applied.width, applied.height, applied.fourcc
                ),
            });
        }

        if let Err(e) = device.set_params(&Parameters::with_fps(settings.fps)) {
            // Frame interval is advisory on many UVC devices
            warn!(fps = settings.fps, error = %e, "Failed to set frame interval");
        }

        let stride = match applied.stride {
            0 => layout.min_stride(settings.width),
            stride => stride,
        };
        debug!(?layout, stride, "Negotiated sensor format");
        Ok(Negotiated { layout, stride })
    }
}

impl CaptureDevice for V4l2Device {
    #[instrument(skip(self), fields(path = %self.path))]
    fn open(&mut self) -> CameraResult<()> {
        if self.device.is_some() {
            return Ok(());
        }

        let device = Device::with_path(&self.path)
            .map_err(|e| CameraError::from_open_error(&self.path, e))?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CameraError::DeviceUnavailable(format!(
                "{} doesn't support video capture",
                self.path
            )));
        }

        self.device = Some(device);
        Ok(())
    }

    #[instrument(skip(self, callback), fields(path = %self.path, settings = %settings))]
    fn start(&mut self, settings: &CaptureSettings, callback: FrameCallback) -> CameraResult<()> {
        if self.worker.is_some() {
            return Err(CameraError::AlreadyActive);
        }
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| CameraError::DeviceUnavailable(format!("{} is not open", self.path)))?;

        let Negotiated { layout, stride } = Self::negotiate(device, settings)?;

        let mut stream = MmapStream::with_buffers(device, Type::VideoCapture, self.buffer_count)?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let settings = *settings;
        let (rotation, mirrored) = (self.rotation, self.mirrored);
        let path = self.path.clone();

        let handle = thread::Builder::new()
            .name(format!("v4l2-delivery:{}", self.path))
            .spawn(move || {
                let warmup = Warmup::new(Instant::now(), settings.startup_latency_ms);
                let mut sequence = 0u64;
                while !stop_flag.load(Ordering::Acquire) {
                    let timestamp = Instant::now();
                    match stream.next() {
                        Ok(_) if !warmup.settled(timestamp) => continue,
                        Ok((buf, meta)) => {
                            let used = (meta.bytesused as usize).min(buf.len());
                            // Repacked out of the driver pool: the buffer is
                            // requeued on the next dequeue
                            let Some(data) = layout.repack(
                                &buf[..used],
                                settings.width,
                                settings.height,
                                stride,
                            ) else {
                                warn!(
                                    path = %path,
                                    bytes = used,
                                    "Short capture buffer, dropping frame"
                                );
                                continue;
                            };
                            sequence += 1;
                            let frame_meta = FrameMetadata {
                                sequence,
                                width: settings.width,
                                height: settings.height,
                                format: settings.sensor_format(),
                                rotation,
                                mirrored,
                                device_timestamp: Some(
                                    Duration::from_secs(meta.timestamp.sec as u64)
                                        + Duration::from_micros(meta.timestamp.usec as u64),
                                ),
                            };
                            callback(Frame {
                                data: Bytes::from(data),
                                meta: Arc::new(frame_meta),
                                timestamp,
                            });
                        }
                        Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                        Err(e) => {
                            warn!(path = %path, error = %e, "Dequeue failed");
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                }
                debug!(path = %path, frames = sequence, "Delivery thread exiting");
            })?;

        self.worker = Some(DeliveryWorker { stop, handle });
        info!(
            rotation = self.rotation.degrees(),
            mirrored = self.mirrored,
            "Capture stream started with {} buffers",
            self.buffer_count
        );
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::Release);
            if worker.handle.join().is_err() {
                warn!(path = %self.path, "Delivery thread panicked");
            }
            debug!(path = %self.path, "Capture stream stopped");
        }
    }

    fn close(&mut self) {
        self.stop();
        if self.device.take().is_some() {
            debug!(path = %self.path, "Device closed");
        }
    }

    fn name(&self) -> &str {
        &self.path
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        self.close();
    }
}

/// Maps camera identities onto V4L2 nodes from the capture config
pub struct V4l2DeviceFactory {
    front_device: String,
    back_device: String,
    front_rotation: Rotation,
    back_rotation: Rotation,
    buffer_count: u32,
}

impl V4l2DeviceFactory {
    pub fn new(config: &CaptureConfig) -> Self {
        Self {
            front_device: config.front_device.clone(),
            back_device: config.back_device.clone(),
            front_rotation: Rotation::from_degrees(config.front_rotation),
            back_rotation: Rotation::from_degrees(config.back_rotation),
            buffer_count: config.buffer_count,
        }
    }

    /// Sensor mounting of a built-in camera; the front one is mirrored
    fn orientation(&self, facing: Facing) -> (Rotation, bool) {
        match facing {
            Facing::Front => (self.front_rotation, true),
            Facing::Back => (self.back_rotation, false),
        }
    }
}

impl DeviceFactory for V4l2DeviceFactory {
    fn internal(&self, facing: Facing) -> Box<dyn CaptureDevice> {
        let path = match facing {
            Facing::Front => &self.front_device,
            Facing::Back => &self.back_device,
        };
        let (rotation, mirrored) = self.orientation(facing);
        Box::new(V4l2Device::new(path, self.buffer_count).with_orientation(rotation, mirrored))
    }

    fn external(&self, control: &ControlBlock) -> Box<dyn CaptureDevice> {
        debug!(device = %control.device(), "Building external capture device");
        Box::new(V4l2Device::new(
            control.path().to_string_lossy(),
            self.buffer_count,
        ))
    }
}
