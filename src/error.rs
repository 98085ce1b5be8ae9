//! Error taxonomy shared by backends, the processing loop and the controller

use thiserror::Error;

use crate::capture::settings::CaptureSettings;

pub type CameraResult<T> = Result<T, CameraError>;

#[derive(Debug, Error)]
pub enum CameraError {
    /// Hardware busy, missing, or the driver refused the claim
    #[error("camera device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("camera permission denied: {0}")]
    PermissionDenied(String),

    /// The driver rejected the requested resolution/format. Callers pick a
    /// nearest supported size themselves.
    #[error("unsupported capture format {requested}: {reason}")]
    UnsupportedFormat {
        requested: CaptureSettings,
        reason: String,
    },

    #[error("capture is already active")]
    AlreadyActive,

    #[error("capture is not active")]
    NotActive,

    /// Only ever produced inside the processing loop, where it is recovered
    #[error("filter stage failed: {0}")]
    FilterFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CameraError {
    /// Map an OS error from opening a device node onto the taxonomy
    pub fn from_open_error(path: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => {
                CameraError::PermissionDenied(format!("{path}: {err}"))
            }
            _ => CameraError::DeviceUnavailable(format!("{path}: {err}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("face detector failed: {0}")]
    Detector(String),

    #[error("segmenter failed: {0}")]
    Segmenter(String),

    #[error("frame buffer too small: expected {expected} bytes, got {actual}")]
    ShortBuffer { expected: usize, actual: usize },

    #[error("filter panicked: {0}")]
    Panicked(String),
}

impl From<FilterError> for CameraError {
    fn from(err: FilterError) -> Self {
        CameraError::FilterFailure(err.to_string())
    }
}
