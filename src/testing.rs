//! Scripted devices for exercising backends and the controller without hardware

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::capture::device::{CaptureDevice, DeviceFactory, FrameCallback};
use crate::capture::frame::{Frame, FrameMetadata};
use crate::capture::settings::CaptureSettings;
use crate::controller::Facing;
use crate::error::{CameraError, CameraResult};
use crate::hotplug::{ControlBlock, DeviceRef, PermissionRequester};

/// Shared, ordered log of device calls, e.g. `"open internal-back"`
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    /// Everything recorded so far, left in place
    pub fn snapshot(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Everything recorded since the last take
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

#[derive(Default)]
struct Failures {
    open: HashSet<String>,
    start: HashSet<String>,
}

pub struct FakeDevice {
    name: String,
    log: CallLog,
    failures: Arc<Mutex<Failures>>,
    sequence: u64,
}

impl CaptureDevice for FakeDevice {
    fn open(&mut self) -> CameraResult<()> {
        if self.failures.lock().unwrap().open.contains(&self.name) {
            self.log.push(format!("open {} failed", self.name));
            return Err(CameraError::DeviceUnavailable(self.name.clone()));
        }
        self.log.push(format!("open {}", self.name));
        Ok(())
    }

    fn start(&mut self, settings: &CaptureSettings, callback: FrameCallback) -> CameraResult<()> {
        if self.failures.lock().unwrap().start.contains(&self.name) {
            self.log.push(format!("start {} {} failed", self.name, settings));
            return Err(CameraError::DeviceUnavailable(self.name.clone()));
        }
        self.log.push(format!("start {} {}", self.name, settings));

        // One frame per start, shaped like the sensor output
        self.sequence += 1;
        let format = settings.sensor_format();
        let data = vec![0x80u8; format.frame_len(settings.width, settings.height)];
        callback(Frame::new(
            data,
            FrameMetadata::new(self.sequence, settings.width, settings.height, format),
        ));
        Ok(())
    }

    fn stop(&mut self) {
        self.log.push(format!("stop {}", self.name));
    }

    fn close(&mut self) {
        self.log.push(format!("close {}", self.name));
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Builds [`FakeDevice`]s named `internal-front`, `internal-back` and `external`
#[derive(Clone, Default)]
pub struct FakeFactory {
    pub log: CallLog,
    failures: Arc<Mutex<Failures>>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later `open` of the named device fail
    pub fn fail_open(&self, name: &str) {
        self.failures.lock().unwrap().open.insert(name.to_string());
    }

    /// Make every later `start` of the named device fail
    pub fn fail_start(&self, name: &str) {
        self.failures.lock().unwrap().start.insert(name.to_string());
    }

    /// Undo `fail_open` and `fail_start` for the named device
    pub fn recover(&self, name: &str) {
        let mut failures = self.failures.lock().unwrap();
        failures.open.remove(name);
        failures.start.remove(name);
    }

    fn device(&self, name: &str) -> Box<dyn CaptureDevice> {
        Box::new(FakeDevice {
            name: name.to_string(),
            log: self.log.clone(),
            failures: Arc::clone(&self.failures),
            sequence: 0,
        })
    }
}

impl DeviceFactory for FakeFactory {
    fn internal(&self, facing: Facing) -> Box<dyn CaptureDevice> {
        match facing {
            Facing::Front => self.device("internal-front"),
            Facing::Back => self.device("internal-back"),
        }
    }

    fn external(&self, _control: &ControlBlock) -> Box<dyn CaptureDevice> {
        self.device("external")
    }
}

/// Records requests; the test decides the answer by feeding events
#[derive(Default)]
pub struct RecordingPermissions {
    pub requested: Mutex<Vec<DeviceRef>>,
}

impl PermissionRequester for RecordingPermissions {
    fn request_permission(&self, device: &DeviceRef) {
        self.requested.lock().unwrap().push(device.clone());
    }
}
