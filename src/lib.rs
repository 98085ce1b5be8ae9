pub mod capture;
pub mod controller;
pub mod error;
pub mod filters;
pub mod hotplug;
pub mod pipeline;
pub mod session;

#[cfg(test)]
mod testing;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use capture::{Frame, PixelFormat};
pub use controller::{
    CameraEvent, CameraIdentity, CameraSourceController, ExternalDeviceState, Facing,
};
pub use error::{CameraError, CameraResult};

use capture::settings::CaptureProfiles;

/// System configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub hotplug: HotplugConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// V4L2 node of the front sensor
    pub front_device: String,
    /// V4L2 node of the back sensor
    pub back_device: String,
    /// Clockwise mounting angle of each sensor, in degrees
    pub front_rotation: i32,
    pub back_rotation: i32,
    pub default_facing: Facing,
    pub buffer_count: u32,
    pub profiles: CaptureProfiles,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotplugConfig {
    /// Node prefix; indices 0..scan_range are appended
    pub device_prefix: String,
    pub scan_range: u32,
    pub poll_interval_ms: u64,
    /// Nodes never reported as external, in addition to the internal sensors
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directives; `RUST_LOG` wins
    pub filter: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            front_device: "/dev/video1".into(),
            back_device: "/dev/video0".into(),
            front_rotation: 0,
            back_rotation: 0,
            default_facing: Facing::Back,
            buffer_count: 4,
            profiles: CaptureProfiles::default(),
        }
    }
}

impl Default for HotplugConfig {
    fn default() -> Self {
        Self {
            device_prefix: "/dev/video".into(),
            scan_range: 16,
            poll_interval_ms: 500,
            exclude: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "camsource=debug".into(),
        }
    }
}

impl Config {
    /// Defaults, overlaid by a TOML file, overlaid by `CAMSOURCE_*`
    /// environment variables (`__` separates nested keys).
    ///
    /// Without an explicit path, `camsource.toml` in the working directory
    /// is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("camsource").required(false),
        };

        config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("CAMSOURCE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}
