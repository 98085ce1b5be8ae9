//! Capture settings and the profiles they are derived from

use serde::{Deserialize, Serialize};

use crate::capture::frame::PixelFormat;
use crate::controller::CameraIdentity;

/// Settings a backend streams with. Always derived, never edited in place:
/// see [`CaptureSettings::derive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSettings {
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub startup_latency_ms: u32,
}

impl CaptureSettings {
    /// Filter-active sessions trade resolution and frame rate for filter
    /// compute, and switch the output to packed ARGB.
    pub fn derive(
        identity: &CameraIdentity,
        filter_active: bool,
        profiles: &CaptureProfiles,
    ) -> Self {
        let pair = match identity {
            CameraIdentity::Internal(_) => &profiles.internal,
            CameraIdentity::External => &profiles.external,
        };
        let profile = if filter_active {
            &pair.filtered
        } else {
            &pair.full
        };

        Self {
            fps: profile.fps,
            width: profile.width,
            height: profile.height,
            format: if filter_active {
                PixelFormat::Argb
            } else {
                PixelFormat::Nv21
            },
            startup_latency_ms: profiles.startup_latency_ms,
        }
    }

    /// Format the driver is asked to deliver. Filtering converts to ARGB on
    /// the worker, so the sensor always streams NV21.
    pub fn sensor_format(&self) -> PixelFormat {
        PixelFormat::Nv21
    }
}

impl std::fmt::Display for CaptureSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{}@{} {}",
            self.width, self.height, self.fps, self.format
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureProfile {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl CaptureProfile {
    pub const fn new(width: u32, height: u32, fps: u32) -> Self {
        Self { width, height, fps }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilePair {
    pub full: CaptureProfile,
    pub filtered: CaptureProfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureProfiles {
    pub internal: ProfilePair,
    pub external: ProfilePair,
    #[serde(default)]
    pub startup_latency_ms: u32,
}

impl Default for CaptureProfiles {
    fn default() -> Self {
        Self {
            internal: ProfilePair {
                full: CaptureProfile::new(1280, 720, 30),
                filtered: CaptureProfile::new(640, 480, 30),
            },
            external: ProfilePair {
                full: CaptureProfile::new(1920, 1080, 30),
                filtered: CaptureProfile::new(480, 360, 20),
            },
            startup_latency_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Facing;

    #[test]
    fn external_filter_profile_is_low_resolution_argb() {
        let profiles = CaptureProfiles::default();
        let settings = CaptureSettings::derive(&CameraIdentity::External, true, &profiles);
        assert_eq!((settings.width, settings.height, settings.fps), (480, 360, 20));
        assert_eq!(settings.format, PixelFormat::Argb);

        let settings = CaptureSettings::derive(&CameraIdentity::External, false, &profiles);
        assert_eq!((settings.width, settings.height, settings.fps), (1920, 1080, 30));
        assert_eq!(settings.format, PixelFormat::Nv21);
    }

    #[test]
    fn internal_facing_does_not_change_profile() {
        let profiles = CaptureProfiles::default();
        let front =
            CaptureSettings::derive(&CameraIdentity::Internal(Facing::Front), false, &profiles);
        let back =
            CaptureSettings::derive(&CameraIdentity::Internal(Facing::Back), false, &profiles);
        assert_eq!(front, back);
        assert_eq!(front.to_string(), "1280x720@30 NV21");
    }
}
