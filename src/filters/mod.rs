//! Pluggable per-frame vision filters
//!
//! The processing loop only sees [`FilterStage`]. [`VideoFilters`] is the
//! stock implementation: face pixelation and background blur driven by
//! external detector/segmenter collaborators.

pub mod convert;
pub mod effects;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::capture::frame::{Frame, FrameMetadata, PixelFormat, Rotation};
use crate::error::FilterError;

pub use convert::ArgbImage;
pub use effects::{ForegroundMask, Rect};

const PIXELATE_BLOCK: u32 = 15;
const BACKGROUND_BLUR_RADIUS: u32 = 10;
const FOREGROUND_THRESHOLD: f32 = 0.94;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    BackgroundBlur,
    PixelatedFace,
}

/// A per-frame transform. Active iff at least one kind is enabled.
pub trait FilterStage: Send {
    fn is_active(&self) -> bool;

    fn is_enabled(&self, kind: FilterKind) -> bool;

    fn set_enabled(&mut self, kind: FilterKind, enabled: bool);

    /// Transform one frame. `Ok(None)` means no output for this frame.
    fn process(&mut self, frame: &Frame) -> Result<Option<Frame>, FilterError>;
}

/// Filter stage shared by the controller and the processing worker.
///
/// Its lock is the one the worker holds for the duration of a filter call,
/// so toggling a filter waits for any in-flight frame.
#[derive(Clone)]
pub struct SharedFilter(Arc<Mutex<Box<dyn FilterStage>>>);

impl SharedFilter {
    pub fn new(stage: impl FilterStage + 'static) -> Self {
        Self(Arc::new(Mutex::new(Box::new(stage))))
    }

    pub fn lock(&self) -> MutexGuard<'_, Box<dyn FilterStage>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_active()
    }
}

/// Locates faces in an upright ARGB image
pub trait FaceDetector: Send {
    fn detect(&mut self, image: &ArgbImage) -> Result<Vec<Rect>, FilterError>;
}

/// Produces a foreground confidence mask for an upright ARGB image
pub trait Segmenter: Send {
    fn segment(&mut self, image: &ArgbImage) -> Result<ForegroundMask, FilterError>;
}

#[derive(Default)]
pub struct VideoFilters {
    background_blur: bool,
    pixelated_face: bool,
    face_detector: Option<Box<dyn FaceDetector>>,
    segmenter: Option<Box<dyn Segmenter>>,
    /// Last face seen, reused while tracking is lost
    cached_face: Option<Rect>,
}

impl VideoFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_face_detector(mut self, detector: impl FaceDetector + 'static) -> Self {
        self.face_detector = Some(Box::new(detector));
        self
    }

    pub fn with_segmenter(mut self, segmenter: impl Segmenter + 'static) -> Self {
        self.segmenter = Some(Box::new(segmenter));
        self
    }

    pub fn clear_cache(&mut self) {
        self.cached_face = None;
    }

    fn face(&mut self, image: &ArgbImage) -> Result<Option<Rect>, FilterError> {
        let Some(detector) = self.face_detector.as_mut() else {
            return Ok(None);
        };
        match detector.detect(image)?.first() {
            Some(&face) => {
                self.cached_face = Some(face);
                Ok(Some(face))
            }
            None => Ok(self.cached_face),
        }
    }
}

impl FilterStage for VideoFilters {
    fn is_active(&self) -> bool {
        self.background_blur || self.pixelated_face
    }

    fn is_enabled(&self, kind: FilterKind) -> bool {
        match kind {
            FilterKind::BackgroundBlur => self.background_blur,
            FilterKind::PixelatedFace => self.pixelated_face,
        }
    }

    fn set_enabled(&mut self, kind: FilterKind, enabled: bool) {
        match kind {
            FilterKind::BackgroundBlur => self.background_blur = enabled,
            FilterKind::PixelatedFace => self.pixelated_face = enabled,
        }
        if !self.pixelated_face {
            self.clear_cache();
        }
        debug!(?kind, enabled, active = self.is_active(), "Filter toggled");
    }

    fn process(&mut self, frame: &Frame) -> Result<Option<Frame>, FilterError> {
        if !self.is_active() {
            return Ok(Some(frame.clone()));
        }

        let mut image = ArgbImage::from_frame(frame)?;

        if self.pixelated_face {
            if let Some(face) = self.face(&image)? {
                effects::pixelate(&mut image, face, PIXELATE_BLOCK);
            }
        }

        if self.background_blur {
            if let Some(segmenter) = self.segmenter.as_mut() {
                let mask = segmenter.segment(&image)?;
                effects::blur_background(
                    &mut image,
                    &mask,
                    BACKGROUND_BLUR_RADIUS,
                    FOREGROUND_THRESHOLD,
                );
            }
        }

        let meta = FrameMetadata {
            sequence: frame.meta.sequence,
            width: image.width,
            height: image.height,
            format: PixelFormat::Argb,
            rotation: Rotation::Deg0,
            mirrored: frame.meta.mirrored,
            device_timestamp: frame.meta.device_timestamp,
        };

        Ok(Some(Frame {
            data: image.into_bytes(),
            meta: Arc::new(meta),
            timestamp: frame.timestamp,
        }))
    }
}
