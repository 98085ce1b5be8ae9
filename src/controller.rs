//! Camera source controller
//!
//! Owns the single active camera backend and the awareness of an external
//! device. Two independent axes: external device state
//! (none / unauthorized / ready) and the active camera identity. Every
//! transition runs under one controller-wide lock, so switches, filter
//! toggles and hotplug events are totally ordered and a backend's
//! stop/open/start sequence always completes before the next one begins.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwap;
use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::capture::backend::{CameraBackend, ExternalCamera, InternalCamera};
use crate::capture::device::DeviceFactory;
use crate::capture::settings::{CaptureProfiles, CaptureSettings};
use crate::error::{CameraError, CameraResult};
use crate::filters::{FilterKind, SharedFilter};
use crate::hotplug::{DeviceHandle, DeviceRef, HotplugEvent, PermissionRequester};
use crate::pipeline::processing::FrameSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Facing {
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraIdentity {
    Internal(Facing),
    External,
}

impl CameraIdentity {
    /// Parse an application-layer camera position. Unknown positions map to
    /// the back camera.
    pub fn from_position(position: &str) -> Self {
        match position {
            "front" => CameraIdentity::Internal(Facing::Front),
            "external" => CameraIdentity::External,
            _ => CameraIdentity::Internal(Facing::Back),
        }
    }

    pub fn position(&self) -> &'static str {
        match self {
            CameraIdentity::Internal(Facing::Front) => "front",
            CameraIdentity::Internal(Facing::Back) => "back",
            CameraIdentity::External => "external",
        }
    }
}

impl std::fmt::Display for CameraIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.position())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternalDeviceState {
    NoExternalDevice,
    ExternalDeviceUnauthorized,
    ExternalDeviceReady,
}

/// Notifications for the application layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraEvent {
    CameraIdentityChanged(CameraIdentity),
    ExternalDeviceAvailabilityChanged(bool),
    /// A camera failed to start and the controller fell back
    SourceFailed {
        identity: CameraIdentity,
        error: String,
    },
}

/// Snapshot published after every transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub identity: CameraIdentity,
    pub device_state: ExternalDeviceState,
    pub device: Option<DeviceRef>,
    pub capturing: bool,
    pub settings: Option<CaptureSettings>,
}

struct ControllerState {
    identity: CameraIdentity,
    device: Option<DeviceHandle>,
    /// Present only while capturing
    backend: Option<CameraBackend>,
}

impl ControllerState {
    fn device_state(&self) -> ExternalDeviceState {
        match &self.device {
            None => ExternalDeviceState::NoExternalDevice,
            Some(handle) if handle.granted_control().is_some() => {
                ExternalDeviceState::ExternalDeviceReady
            }
            Some(_) => ExternalDeviceState::ExternalDeviceUnauthorized,
        }
    }

    fn status(&self) -> ControllerStatus {
        ControllerStatus {
            identity: self.identity,
            device_state: self.device_state(),
            device: self.device.as_ref().map(|h| h.device.clone()),
            capturing: self.backend.is_some(),
            settings: self.backend.as_ref().and_then(CameraBackend::current_settings),
        }
    }
}

pub struct CameraSourceController {
    state: Mutex<ControllerState>,
    factory: Arc<dyn DeviceFactory>,
    permissions: Arc<dyn PermissionRequester>,
    filter: SharedFilter,
    sink: Arc<dyn FrameSink>,
    profiles: CaptureProfiles,
    default_facing: Facing,
    subscribers: Mutex<Vec<Sender<CameraEvent>>>,
    status: ArcSwap<ControllerStatus>,
}

impl CameraSourceController {
    pub fn new(
        factory: Arc<dyn DeviceFactory>,
        permissions: Arc<dyn PermissionRequester>,
        filter: SharedFilter,
        sink: Arc<dyn FrameSink>,
        profiles: CaptureProfiles,
    ) -> Self {
        let state = ControllerState {
            identity: CameraIdentity::Internal(Facing::Back),
            device: None,
            backend: None,
        };
        let status = ArcSwap::from_pointee(state.status());

        Self {
            state: Mutex::new(state),
            factory,
            permissions,
            filter,
            sink,
            profiles,
            default_facing: Facing::Back,
            subscribers: Mutex::new(Vec::new()),
            status,
        }
    }

    /// Internal facing used at startup and as the fallback identity
    pub fn with_default_facing(mut self, facing: Facing) -> Self {
        self.default_facing = facing;
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.identity = CameraIdentity::Internal(facing);
        self.status.store(Arc::new(state.status()));
        self
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fallback_identity(&self) -> CameraIdentity {
        CameraIdentity::Internal(self.default_facing)
    }

    /// New event stream; every subscriber sees every event
    pub fn subscribe(&self) -> Receiver<CameraEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    fn emit(&self, event: CameraEvent) {
        debug!(?event, "Emitting camera event");
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn publish_status(&self, state: &ControllerState) {
        self.status.store(Arc::new(state.status()));
    }

    /// Lock-free view of the last completed transition
    pub fn status(&self) -> Arc<ControllerStatus> {
        self.status.load_full()
    }

    pub fn identity(&self) -> CameraIdentity {
        self.status.load().identity
    }

    pub fn device_state(&self) -> ExternalDeviceState {
        self.status.load().device_state
    }

    pub fn is_capturing(&self) -> bool {
        self.status.load().capturing
    }

    pub fn filter(&self) -> &SharedFilter {
        &self.filter
    }

    fn settings_for(&self, identity: &CameraIdentity) -> CaptureSettings {
        CaptureSettings::derive(identity, self.filter.is_active(), &self.profiles)
    }

    /// Build, open and start a backend for `identity`
    fn launch(
        &self,
        state: &ControllerState,
        identity: CameraIdentity,
    ) -> CameraResult<CameraBackend> {
        let mut backend = match identity {
            CameraIdentity::Internal(facing) => CameraBackend::Internal(InternalCamera::new(
                facing,
                Arc::clone(&self.factory),
                self.filter.clone(),
                Arc::clone(&self.sink),
            )),
            CameraIdentity::External => {
                let handle = state.device.clone().ok_or_else(|| {
                    CameraError::DeviceUnavailable("no external device attached".into())
                })?;
                CameraBackend::External(ExternalCamera::new(
                    handle,
                    Arc::clone(&self.factory),
                    self.filter.clone(),
                    Arc::clone(&self.sink),
                ))
            }
        };

        backend.open()?;
        backend.start_streaming(self.settings_for(&identity))?;
        Ok(backend)
    }

    /// Bring up the fallback camera after `identity` failed
    fn fall_back(&self, state: &mut ControllerState, failed: CameraIdentity, error: &CameraError) {
        let fallback = self.fallback_identity();
        warn!(%failed, %fallback, %error, "Camera failed, falling back");
        self.emit(CameraEvent::SourceFailed {
            identity: failed,
            error: error.to_string(),
        });

        match self.launch(state, fallback) {
            Ok(backend) => state.backend = Some(backend),
            Err(e) => warn!(%fallback, error = %e, "Fallback camera failed too, capture stopped"),
        }
        if state.identity != fallback {
            state.identity = fallback;
            self.emit(CameraEvent::CameraIdentityChanged(fallback));
        }
    }

    /// Open and stream the active camera. An external camera that fails to
    /// start falls back to the default internal one.
    #[instrument(skip(self))]
    pub fn start(&self) -> CameraResult<()> {
        let mut state = self.lock();
        if state.backend.is_some() {
            return Err(CameraError::AlreadyActive);
        }

        let identity = state.identity;
        match self.launch(&state, identity) {
            Ok(backend) => state.backend = Some(backend),
            Err(e) if identity == CameraIdentity::External => {
                self.fall_back(&mut state, identity, &e);
                if state.backend.is_none() {
                    self.publish_status(&state);
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }

        info!(identity = %state.identity, "Capture started");
        self.publish_status(&state);
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn stop(&self) -> CameraResult<()> {
        let mut state = self.lock();
        let mut backend = state.backend.take().ok_or(CameraError::NotActive)?;
        backend.close();
        info!(identity = %state.identity, "Capture stopped");
        self.publish_status(&state);
        Ok(())
    }

    /// Request a camera. Returns the identity in effect afterwards.
    ///
    /// Selecting the active identity is a no-op. Selecting `External`
    /// without a ready device keeps the current camera and re-announces it.
    /// A failed switch restores the previous camera and returns the error.
    #[instrument(skip(self))]
    pub fn select_camera(&self, identity: CameraIdentity) -> CameraResult<CameraIdentity> {
        let mut state = self.lock();

        if identity == CameraIdentity::External
            && state.device_state() != ExternalDeviceState::ExternalDeviceReady
        {
            info!(current = %state.identity, "External camera not ready, keeping current camera");
            self.emit(CameraEvent::CameraIdentityChanged(state.identity));
            return Ok(state.identity);
        }

        if identity == state.identity {
            debug!(%identity, "Camera already selected");
            return Ok(identity);
        }

        let previous = state.identity;
        let Some(mut current) = state.backend.take() else {
            state.identity = identity;
            self.emit(CameraEvent::CameraIdentityChanged(identity));
            self.publish_status(&state);
            return Ok(identity);
        };

        current.close();
        drop(current);

        let result = match self.launch(&state, identity) {
            Ok(backend) => {
                state.backend = Some(backend);
                state.identity = identity;
                info!(%previous, %identity, "Camera switched");
                self.emit(CameraEvent::CameraIdentityChanged(identity));
                Ok(identity)
            }
            Err(e) => {
                warn!(%identity, error = %e, "Switch failed, restoring previous camera");
                match self.launch(&state, previous) {
                    Ok(backend) => state.backend = Some(backend),
                    Err(restore) => self.fall_back(&mut state, previous, &restore),
                }
                Err(e)
            }
        };

        self.publish_status(&state);
        result
    }

    /// Enable or disable one filter kind. When that changes whether the
    /// filter stage is active, a streaming backend is restarted once with
    /// the matching profile; the camera identity never changes.
    #[instrument(skip(self))]
    pub fn set_filter_enabled(&self, kind: FilterKind, enabled: bool) -> CameraResult<()> {
        let mut state = self.lock();

        let (was_active, now_active) = {
            let mut stage = self.filter.lock();
            let was_active = stage.is_active();
            stage.set_enabled(kind, enabled);
            (was_active, stage.is_active())
        };
        if was_active == now_active {
            return Ok(());
        }

        let identity = state.identity;
        let settings = CaptureSettings::derive(&identity, now_active, &self.profiles);
        if let Some(backend) = state.backend.as_mut().filter(|b| b.is_streaming()) {
            if let Err(e) = backend.reconfigure(settings) {
                self.filter.lock().set_enabled(kind, !enabled);
                if !backend.is_streaming() {
                    // Neither profile could be restarted on this camera
                    if let Some(mut stranded) = state.backend.take() {
                        stranded.close();
                    }
                    self.fall_back(&mut state, identity, &e);
                }
                self.publish_status(&state);
                return Err(e);
            }
            info!(%identity, %settings, "Capture reconfigured for filter change");
        }

        self.publish_status(&state);
        Ok(())
    }

    /// Feed one event from the hotplug source
    #[instrument(skip(self))]
    pub fn handle_hotplug(&self, event: HotplugEvent) {
        let mut state = self.lock();

        match event {
            HotplugEvent::Attached(device) => {
                if let Some(handle) = &state.device {
                    debug!(
                        tracked = %handle.device,
                        %device,
                        "Already tracking an external device"
                    );
                    return;
                }
                info!(%device, "External device attached, requesting permission");
                state.device = Some(DeviceHandle::new(device.clone()));
                self.permissions.request_permission(&device);
            }
            HotplugEvent::PermissionGranted(device, control) => {
                let Some(handle) = state.device.as_mut().filter(|h| h.is_for(&device)) else {
                    debug!(%device, "Permission granted for untracked device");
                    return;
                };
                let was_ready = handle.granted_control().is_some();
                handle.grant(control);
                if was_ready {
                    debug!(%device, "External device already ready");
                } else {
                    info!(%device, "External device ready");
                    self.emit(CameraEvent::ExternalDeviceAvailabilityChanged(true));
                }
            }
            HotplugEvent::PermissionDenied(device) => {
                let Some(handle) = state.device.as_mut().filter(|h| h.is_for(&device)) else {
                    return;
                };
                handle.revoke();
                warn!(%device, "External device permission denied");
            }
            HotplugEvent::Detached(device) => {
                if !state.device.as_ref().is_some_and(|h| h.is_for(&device)) {
                    debug!(%device, "Untracked device detached");
                    return;
                }
                let was_ready = state.device_state() == ExternalDeviceState::ExternalDeviceReady;
                state.device = None;
                info!(%device, "External device detached");
                if was_ready {
                    self.emit(CameraEvent::ExternalDeviceAvailabilityChanged(false));
                }

                if state.identity == CameraIdentity::External {
                    self.detach_active_external(&mut state);
                }
            }
        }

        self.publish_status(&state);
    }

    fn detach_active_external(&self, state: &mut ControllerState) {
        let fallback = self.fallback_identity();
        if let Some(mut backend) = state.backend.take() {
            backend.close();
            drop(backend);
            match self.launch(state, fallback) {
                Ok(backend) => state.backend = Some(backend),
                Err(e) => {
                    warn!(%fallback, error = %e, "Fallback camera failed after detach");
                    self.emit(CameraEvent::SourceFailed {
                        identity: fallback,
                        error: e.to_string(),
                    });
                }
            }
        }
        state.identity = fallback;
        self.emit(CameraEvent::CameraIdentityChanged(fallback));
    }

    /// Re-ask for access to a tracked but unauthorized device. Returns
    /// whether a request was issued.
    pub fn request_external_permission(&self) -> bool {
        let state = self.lock();
        match &state.device {
            Some(handle) if handle.granted_control().is_none() => {
                self.permissions.request_permission(&handle.device);
                true
            }
            _ => false,
        }
    }
}

impl Drop for CameraSourceController {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut backend) = state.backend.take() {
            backend.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FilterError;
    use crate::filters::{FilterStage, VideoFilters};
    use crate::hotplug::ControlBlock;
    use crate::testing::{CallLog, FakeFactory, RecordingPermissions};
    use crate::Frame;
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;

    const BACK: CameraIdentity = CameraIdentity::Internal(Facing::Back);
    const FRONT: CameraIdentity = CameraIdentity::Internal(Facing::Front);

    struct Harness {
        controller: CameraSourceController,
        factory: FakeFactory,
        permissions: Arc<RecordingPermissions>,
        events: Receiver<CameraEvent>,
        frames: Arc<Mutex<Vec<Frame>>>,
    }

    impl Harness {
        fn new() -> Self {
            let factory = FakeFactory::new();
            let permissions = Arc::new(RecordingPermissions::default());
            let frames = Arc::new(Mutex::new(Vec::new()));
            let sink_frames = Arc::clone(&frames);
            let controller = CameraSourceController::new(
                Arc::new(factory.clone()),
                permissions.clone(),
                SharedFilter::new(VideoFilters::new()),
                Arc::new(move |frame: &Frame| sink_frames.lock().unwrap().push(frame.clone())),
                CaptureProfiles::default(),
            );
            let events = controller.subscribe();
            Self {
                controller,
                factory,
                permissions,
                events,
                frames,
            }
        }

        fn calls(&self) -> Vec<String> {
            self.factory.log.take()
        }

        fn events(&self) -> Vec<CameraEvent> {
            self.events.try_iter().collect()
        }

        /// Attach and authorize an external camera
        fn attach_ready(&self) -> DeviceRef {
            let device = usb_camera();
            self.controller
                .handle_hotplug(HotplugEvent::Attached(device.clone()));
            self.controller.handle_hotplug(HotplugEvent::PermissionGranted(
                device.clone(),
                ControlBlock::new(device.clone()),
            ));
            device
        }
    }

    fn usb_camera() -> DeviceRef {
        DeviceRef::new("/dev/video4", "USB Camera")
    }

    #[test]
    fn positions_round_trip_and_default_to_back() {
        for identity in [FRONT, BACK, CameraIdentity::External] {
            assert_eq!(CameraIdentity::from_position(identity.position()), identity);
        }
        assert_eq!(CameraIdentity::from_position("sideways"), BACK);
    }

    #[test]
    fn start_and_stop_reject_repeats() {
        let h = Harness::new();
        assert!(matches!(h.controller.stop(), Err(CameraError::NotActive)));

        h.controller.start().unwrap();
        assert!(h.controller.is_capturing());
        assert!(matches!(h.controller.start(), Err(CameraError::AlreadyActive)));

        h.controller.stop().unwrap();
        assert!(matches!(h.controller.stop(), Err(CameraError::NotActive)));
        assert!(!h.controller.is_capturing());

        assert_eq!(
            h.calls(),
            vec![
                "open internal-back",
                "start internal-back 1280x720@30 NV21",
                "stop internal-back",
                "close internal-back",
            ]
        );
        assert!(h.events().is_empty());
    }

    #[test]
    fn captured_frames_reach_the_sink() {
        let h = Harness::new();
        h.controller.start().unwrap();

        for _ in 0..200 {
            if !h.frames.lock().unwrap().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        h.controller.stop().unwrap();

        let frames = h.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!((frames[0].width(), frames[0].height()), (1280, 720));
        assert_eq!(frames[0].format(), crate::PixelFormat::Nv21);
    }

    #[test]
    fn selecting_the_active_camera_is_a_no_op() {
        let h = Harness::new();
        h.controller.start().unwrap();
        h.calls();

        assert_eq!(h.controller.select_camera(BACK).unwrap(), BACK);
        assert_eq!(h.controller.select_camera(BACK).unwrap(), BACK);

        assert!(h.calls().is_empty());
        assert!(h.events().is_empty());
    }

    #[test]
    fn selecting_while_idle_only_changes_identity() {
        let h = Harness::new();

        assert_eq!(h.controller.select_camera(FRONT).unwrap(), FRONT);
        assert!(h.calls().is_empty());
        assert_eq!(h.events(), vec![CameraEvent::CameraIdentityChanged(FRONT)]);

        h.controller.start().unwrap();
        assert_eq!(
            h.calls(),
            vec!["open internal-front", "start internal-front 1280x720@30 NV21"]
        );
    }

    #[test]
    fn switching_stops_the_old_camera_before_opening_the_new_one() {
        let h = Harness::new();
        h.controller.start().unwrap();
        h.calls();

        h.controller.select_camera(FRONT).unwrap();
        assert_eq!(
            h.calls(),
            vec![
                "stop internal-back",
                "close internal-back",
                "open internal-front",
                "start internal-front 1280x720@30 NV21",
            ]
        );
        assert_eq!(h.events(), vec![CameraEvent::CameraIdentityChanged(FRONT)]);
        assert_eq!(h.controller.identity(), FRONT);
    }

    #[test]
    fn external_device_becomes_selectable_only_once_granted() {
        let h = Harness::new();
        h.controller.start().unwrap();
        h.calls();

        let device = usb_camera();
        h.controller
            .handle_hotplug(HotplugEvent::Attached(device.clone()));
        assert_eq!(*h.permissions.requested.lock().unwrap(), vec![device.clone()]);
        assert_eq!(
            h.controller.device_state(),
            ExternalDeviceState::ExternalDeviceUnauthorized
        );

        // Not ready: current camera kept and re-announced
        assert_eq!(h.controller.select_camera(CameraIdentity::External).unwrap(), BACK);
        assert_eq!(h.events(), vec![CameraEvent::CameraIdentityChanged(BACK)]);

        h.controller.handle_hotplug(HotplugEvent::PermissionGranted(
            device.clone(),
            ControlBlock::new(device),
        ));
        assert_eq!(h.controller.device_state(), ExternalDeviceState::ExternalDeviceReady);
        assert_eq!(
            h.events(),
            vec![CameraEvent::ExternalDeviceAvailabilityChanged(true)]
        );

        // No automatic switch
        assert_eq!(h.controller.identity(), BACK);
        assert!(h.calls().is_empty());

        h.controller.select_camera(CameraIdentity::External).unwrap();
        assert_eq!(
            h.calls(),
            vec![
                "stop internal-back",
                "close internal-back",
                "open external",
                "start external 1920x1080@30 NV21",
            ]
        );
        assert_eq!(
            h.events(),
            vec![CameraEvent::CameraIdentityChanged(CameraIdentity::External)]
        );
    }

    #[test]
    fn detaching_the_active_external_camera_falls_back_once() {
        let h = Harness::new();
        let device = h.attach_ready();
        h.controller.start().unwrap();
        h.controller.select_camera(CameraIdentity::External).unwrap();
        h.calls();
        h.events();

        h.controller.handle_hotplug(HotplugEvent::Detached(device));

        assert_eq!(
            h.calls(),
            vec![
                "stop external",
                "close external",
                "open internal-back",
                "start internal-back 1280x720@30 NV21",
            ]
        );
        assert_eq!(
            h.events(),
            vec![
                CameraEvent::ExternalDeviceAvailabilityChanged(false),
                CameraEvent::CameraIdentityChanged(BACK),
            ]
        );
        assert_eq!(h.controller.identity(), BACK);
        assert!(h.controller.is_capturing());
        assert_eq!(h.controller.device_state(), ExternalDeviceState::NoExternalDevice);
    }

    #[test]
    fn detaching_an_unauthorized_device_is_silent() {
        let h = Harness::new();
        h.controller.start().unwrap();
        let device = usb_camera();
        h.controller
            .handle_hotplug(HotplugEvent::Attached(device.clone()));
        h.controller
            .handle_hotplug(HotplugEvent::PermissionDenied(device.clone()));
        h.calls();

        h.controller.handle_hotplug(HotplugEvent::Detached(device));
        assert!(h.calls().is_empty());
        assert!(h.events().is_empty());
        assert_eq!(h.controller.identity(), BACK);
    }

    #[test]
    fn failed_switch_restores_previous_camera() {
        let h = Harness::new();
        h.attach_ready();
        h.factory.fail_open("external");
        h.controller.start().unwrap();
        h.calls();
        h.events();

        let result = h.controller.select_camera(CameraIdentity::External);
        assert!(matches!(result, Err(CameraError::DeviceUnavailable(_))));
        assert_eq!(
            h.calls(),
            vec![
                "stop internal-back",
                "close internal-back",
                "open external failed",
                "open internal-back",
                "start internal-back 1280x720@30 NV21",
            ]
        );
        assert!(h.events().is_empty());
        assert_eq!(h.controller.identity(), BACK);
        assert!(h.controller.is_capturing());
    }

    #[test]
    fn starting_a_broken_external_camera_falls_back() {
        let h = Harness::new();
        h.attach_ready();
        h.factory.fail_open("external");
        h.controller.select_camera(CameraIdentity::External).unwrap();
        h.events();

        h.controller.start().unwrap();
        assert_eq!(h.controller.identity(), BACK);
        assert!(h.controller.is_capturing());

        let events = h.events();
        assert!(matches!(
            &events[..],
            [
                CameraEvent::SourceFailed {
                    identity: CameraIdentity::External,
                    ..
                },
                CameraEvent::CameraIdentityChanged(BACK),
            ]
        ));
    }

    #[test]
    fn filter_activity_change_restarts_stream_once() {
        let h = Harness::new();
        h.controller.start().unwrap();
        h.calls();

        h.controller
            .set_filter_enabled(FilterKind::BackgroundBlur, true)
            .unwrap();
        assert_eq!(
            h.calls(),
            vec!["stop internal-back", "start internal-back 640x480@30 ARGB"]
        );
        assert_eq!(
            h.controller.status().settings.map(|s| s.format),
            Some(crate::PixelFormat::Argb)
        );

        // Still active either way: no restart
        h.controller
            .set_filter_enabled(FilterKind::PixelatedFace, true)
            .unwrap();
        h.controller
            .set_filter_enabled(FilterKind::BackgroundBlur, false)
            .unwrap();
        assert!(h.calls().is_empty());

        h.controller
            .set_filter_enabled(FilterKind::PixelatedFace, false)
            .unwrap();
        assert_eq!(
            h.calls(),
            vec!["stop internal-back", "start internal-back 1280x720@30 NV21"]
        );

        assert!(h.events().is_empty());
        assert_eq!(h.controller.identity(), BACK);
    }

    #[test]
    fn filter_toggle_while_idle_touches_no_device() {
        let h = Harness::new();
        h.controller
            .set_filter_enabled(FilterKind::PixelatedFace, true)
            .unwrap();
        assert!(h.calls().is_empty());
        assert!(h.controller.filter().is_active());

        h.controller.start().unwrap();
        assert_eq!(
            h.calls(),
            vec!["open internal-back", "start internal-back 640x480@30 ARGB"]
        );
    }

    #[test]
    fn denied_device_can_be_asked_again() {
        let h = Harness::new();
        assert!(!h.controller.request_external_permission());

        let device = usb_camera();
        h.controller
            .handle_hotplug(HotplugEvent::Attached(device.clone()));
        h.controller
            .handle_hotplug(HotplugEvent::PermissionDenied(device.clone()));
        assert_eq!(
            h.controller.device_state(),
            ExternalDeviceState::ExternalDeviceUnauthorized
        );

        assert!(h.controller.request_external_permission());
        assert_eq!(h.permissions.requested.lock().unwrap().len(), 2);

        h.controller.handle_hotplug(HotplugEvent::PermissionGranted(
            device.clone(),
            ControlBlock::new(device),
        ));
        assert!(!h.controller.request_external_permission());
    }

    #[test]
    fn second_attached_device_is_ignored() {
        let h = Harness::new();
        h.attach_ready();
        h.controller.handle_hotplug(HotplugEvent::Attached(DeviceRef::new(
            "/dev/video6",
            "Other Camera",
        )));

        let status = h.controller.status();
        assert_eq!(status.device, Some(usb_camera()));
        assert_eq!(status.device_state, ExternalDeviceState::ExternalDeviceReady);
        assert_eq!(h.permissions.requested.lock().unwrap().len(), 1);
    }

    #[test]
    fn repeated_grant_announces_availability_once() {
        let h = Harness::new();
        let device = h.attach_ready();
        h.controller.handle_hotplug(HotplugEvent::PermissionGranted(
            device.clone(),
            ControlBlock::new(device),
        ));

        assert_eq!(
            h.events(),
            vec![CameraEvent::ExternalDeviceAvailabilityChanged(true)]
        );
        assert_eq!(h.controller.device_state(), ExternalDeviceState::ExternalDeviceReady);
    }

    #[test]
    fn failed_filter_restart_on_external_falls_back_to_internal() {
        let h = Harness::new();
        h.attach_ready();
        h.controller.start().unwrap();
        h.controller.select_camera(CameraIdentity::External).unwrap();
        h.calls();
        h.events();
        h.factory.fail_start("external");

        let result = h
            .controller
            .set_filter_enabled(FilterKind::BackgroundBlur, true);
        assert!(matches!(result, Err(CameraError::DeviceUnavailable(_))));
        assert_eq!(
            h.calls(),
            vec![
                "stop external",
                "start external 480x360@20 ARGB failed",
                "start external 1920x1080@30 NV21 failed",
                "close external",
                "open internal-back",
                "start internal-back 1280x720@30 NV21",
            ]
        );

        let events = h.events();
        assert!(matches!(
            &events[..],
            [
                CameraEvent::SourceFailed {
                    identity: CameraIdentity::External,
                    ..
                },
                CameraEvent::CameraIdentityChanged(BACK),
            ]
        ));
        assert_eq!(h.controller.identity(), BACK);
        assert!(h.controller.is_capturing());
        assert!(!h.controller.filter().is_active());
    }

    #[test]
    fn failed_filter_restart_without_fallback_stops_capture() {
        let h = Harness::new();
        h.controller.start().unwrap();
        h.calls();
        h.factory.fail_start("internal-back");

        assert!(h
            .controller
            .set_filter_enabled(FilterKind::BackgroundBlur, true)
            .is_err());
        assert_eq!(
            h.calls(),
            vec![
                "stop internal-back",
                "start internal-back 640x480@30 ARGB failed",
                "start internal-back 1280x720@30 NV21 failed",
                "close internal-back",
                "open internal-back",
                "start internal-back 1280x720@30 NV21 failed",
                "close internal-back",
            ]
        );
        assert!(matches!(
            &h.events()[..],
            [CameraEvent::SourceFailed { identity: BACK, .. }]
        ));
        assert!(!h.controller.is_capturing());

        // Nothing is left half-open: capture can be started again
        h.factory.recover("internal-back");
        h.controller.start().unwrap();
        assert!(h.controller.is_capturing());
    }

    #[test]
    fn concurrent_toggles_and_switches_never_overlap_streams() {
        let h = Harness::new();
        h.controller.start().unwrap();

        thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..50 {
                    h.controller
                        .set_filter_enabled(FilterKind::BackgroundBlur, i % 2 == 0)
                        .unwrap();
                }
            });
            scope.spawn(|| {
                for i in 0..50 {
                    let identity = if i % 2 == 0 { FRONT } else { BACK };
                    h.controller.select_camera(identity).unwrap();
                }
            });
        });
        h.controller.stop().unwrap();

        let mut open = HashSet::new();
        let mut streaming = HashSet::new();
        for call in h.calls() {
            let mut words = call.split_whitespace();
            let (Some(verb), Some(device)) = (words.next(), words.next()) else {
                panic!("malformed call {call}");
            };
            let device = device.to_string();
            match verb {
                "open" => {
                    assert!(open.is_empty(), "{call} while {open:?} open");
                    open.insert(device);
                }
                "start" => {
                    assert!(open.contains(&device), "{call} on a closed device");
                    assert!(streaming.is_empty(), "{call} while {streaming:?} streaming");
                    streaming.insert(device);
                }
                "stop" => assert!(streaming.remove(&device), "{call} while not streaming"),
                "close" => {
                    assert!(!streaming.contains(&device), "{call} while streaming");
                    assert!(open.remove(&device), "{call} while not open");
                }
                other => panic!("unexpected call {other}"),
            }
        }
        assert!(open.is_empty());
        assert!(streaming.is_empty());
    }

    /// Blocks inside `process` until released
    struct GatedFilter {
        entered: flume::Sender<()>,
        release: Receiver<()>,
        log: CallLog,
    }

    impl FilterStage for GatedFilter {
        fn is_active(&self) -> bool {
            true
        }

        fn is_enabled(&self, _kind: FilterKind) -> bool {
            true
        }

        fn set_enabled(&mut self, _kind: FilterKind, _enabled: bool) {}

        fn process(&mut self, frame: &Frame) -> Result<Option<Frame>, FilterError> {
            let _ = self.entered.send(());
            let _ = self.release.recv();
            self.log.push("filter returned");
            Ok(Some(frame.clone()))
        }
    }

    #[test]
    fn stop_waits_for_the_in_flight_filter_call() {
        let factory = FakeFactory::new();
        let (entered_tx, entered_rx) = flume::unbounded();
        let (release_tx, release_rx) = flume::unbounded();
        let controller = CameraSourceController::new(
            Arc::new(factory.clone()),
            Arc::new(RecordingPermissions::default()),
            SharedFilter::new(GatedFilter {
                entered: entered_tx,
                release: release_rx,
                log: factory.log.clone(),
            }),
            Arc::new(|_: &Frame| {}),
            CaptureProfiles::default(),
        );

        controller.start().unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        thread::scope(|scope| {
            let stopper = scope.spawn(|| controller.stop());

            thread::sleep(Duration::from_millis(50));
            assert!(!stopper.is_finished());
            assert!(!factory
                .log
                .snapshot()
                .iter()
                .any(|call| call.starts_with("close")));

            release_tx.send(()).unwrap();
            stopper.join().unwrap().unwrap();
        });

        let calls = factory.log.take();
        let returned = calls.iter().position(|c| c == "filter returned").unwrap();
        let closed = calls.iter().position(|c| c == "close internal-back").unwrap();
        assert!(returned < closed);
    }
}
