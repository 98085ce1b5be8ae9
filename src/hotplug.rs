//! External camera discovery: attach/detach and permission events
//!
//! The controller treats [`HotplugEvent`]s as the only source of truth for
//! external device presence. [`V4l2HotplugMonitor`] produces them by polling
//! V4L2 nodes; [`AccessPermissionRequester`] answers permission requests.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use flume::Sender;
use nix::unistd::{access, AccessFlags};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use v4l::capability::Flags as CapFlags;
use v4l::Device;

use crate::HotplugConfig;

/// A discovered device, not necessarily open
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceRef {
    pub path: PathBuf,
    pub name: String,
}

impl DeviceRef {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.path.display())
    }
}

/// Proof that access to a device was granted; what an external camera
/// backend opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlBlock {
    device: DeviceRef,
}

impl ControlBlock {
    pub fn new(device: DeviceRef) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn path(&self) -> &Path {
        &self.device.path
    }
}

/// The tracked external device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub device: DeviceRef,
    pub permission_granted: bool,
    pub control: Option<ControlBlock>,
}

impl DeviceHandle {
    pub fn new(device: DeviceRef) -> Self {
        Self {
            device,
            permission_granted: false,
            control: None,
        }
    }

    pub fn grant(&mut self, control: ControlBlock) {
        self.permission_granted = true;
        self.control = Some(control);
    }

    pub fn revoke(&mut self) {
        self.permission_granted = false;
        self.control = None;
    }

    /// Control block, only once permission has been granted
    pub fn granted_control(&self) -> Option<&ControlBlock> {
        self.control.as_ref().filter(|_| self.permission_granted)
    }

    pub fn is_for(&self, device: &DeviceRef) -> bool {
        self.device.path == device.path
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    Attached(DeviceRef),
    Detached(DeviceRef),
    PermissionGranted(DeviceRef, ControlBlock),
    PermissionDenied(DeviceRef),
}

impl HotplugEvent {
    pub fn device(&self) -> &DeviceRef {
        match self {
            HotplugEvent::Attached(device)
            | HotplugEvent::Detached(device)
            | HotplugEvent::PermissionGranted(device, _)
            | HotplugEvent::PermissionDenied(device) => device,
        }
    }
}

/// Asks the platform for access to a device.
///
/// Asynchronous: the answer arrives later as `PermissionGranted` or
/// `PermissionDenied`. Called with the controller lock held, so
/// implementations must not call back into the controller.
pub trait PermissionRequester: Send + Sync {
    fn request_permission(&self, device: &DeviceRef);
}

/// Grants access when the process can read and write the device node
pub struct AccessPermissionRequester {
    events: Sender<HotplugEvent>,
}

impl AccessPermissionRequester {
    pub fn new(events: Sender<HotplugEvent>) -> Self {
        Self { events }
    }

    fn has_access(path: &Path) -> bool {
        access(path, AccessFlags::R_OK | AccessFlags::W_OK).is_ok()
    }
}

impl PermissionRequester for AccessPermissionRequester {
    fn request_permission(&self, device: &DeviceRef) {
        let event = if Self::has_access(&device.path) {
            info!(%device, "Device access granted");
            HotplugEvent::PermissionGranted(device.clone(), ControlBlock::new(device.clone()))
        } else {
            warn!(%device, "Device access denied");
            HotplugEvent::PermissionDenied(device.clone())
        };
        if self.events.send(event).is_err() {
            debug!("Hotplug channel closed, dropping permission result");
        }
    }
}

/// Polls V4L2 capture nodes and reports external devices coming and going
pub struct V4l2HotplugMonitor {
    prefix: String,
    scan_range: u32,
    poll_interval: Duration,
    exclude: HashSet<PathBuf>,
    known: BTreeMap<PathBuf, DeviceRef>,
}

impl V4l2HotplugMonitor {
    /// `internal` lists the nodes of the built-in sensors, which are never
    /// reported as external devices
    pub fn new(config: &HotplugConfig, internal: &[&str]) -> Self {
        let exclude = config
            .exclude
            .iter()
            .map(String::as_str)
            .chain(internal.iter().copied())
            .map(PathBuf::from)
            .collect();

        Self {
            prefix: config.device_prefix.clone(),
            scan_range: config.scan_range,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            exclude,
            known: BTreeMap::new(),
        }
    }

    /// External capture nodes currently present
    pub fn scan(&self) -> Vec<DeviceRef> {
        let mut found = Vec::new();
        for i in 0..self.scan_range {
            let path = PathBuf::from(format!("{}{}", self.prefix, i));
            if !path.exists() || self.exclude.contains(&path) {
                continue;
            }

            match Device::with_path(&path) {
                Ok(dev) => match dev.query_caps() {
                    Ok(caps) if caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) => {
                        found.push(DeviceRef::new(path, caps.card));
                    }
                    Ok(_) => {}
                    Err(e) => debug!(path = %path.display(), error = %e, "Capability query failed"),
                },
                // Present but not ours yet; the permission request decides
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    let name = path.display().to_string();
                    found.push(DeviceRef::new(path, name));
                }
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping node"),
            }
        }
        found
    }

    /// Fold a scan result into the known set; detaches are reported first
    pub fn diff(&mut self, present: Vec<DeviceRef>) -> Vec<HotplugEvent> {
        let present: BTreeMap<PathBuf, DeviceRef> =
            present.into_iter().map(|d| (d.path.clone(), d)).collect();

        let mut events: Vec<HotplugEvent> = self
            .known
            .iter()
            .filter(|(path, _)| !present.contains_key(*path))
            .map(|(_, device)| HotplugEvent::Detached(device.clone()))
            .collect();
        events.extend(
            present
                .iter()
                .filter(|(path, _)| !self.known.contains_key(*path))
                .map(|(_, device)| HotplugEvent::Attached(device.clone())),
        );

        self.known = present;
        events
    }

    /// Poll until the receiving side of `events` goes away
    pub async fn run(mut self, events: Sender<HotplugEvent>) {
        info!(prefix = %self.prefix, interval = ?self.poll_interval, "Hotplug monitor running");
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let present = self.scan();
            for event in self.diff(present) {
                info!(?event, "Hotplug event");
                if events.send_async(event).await.is_err() {
                    info!("Hotplug monitor stopping");
                    return;
                }
            }
        }
    }
}
