//! Ownership table for publishers
//!
//! Each publisher id owns one camera source controller. The manager is
//! passed by reference to whatever needs to reach a publisher.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::controller::CameraSourceController;
use crate::error::CameraError;
use crate::hotplug::HotplugEvent;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("publisher {0} already exists")]
    DuplicatePublisher(String),

    #[error("unknown publisher {0}")]
    UnknownPublisher(String),

    #[error(transparent)]
    Camera(#[from] CameraError),
}

#[derive(Default)]
pub struct SessionManager {
    publishers: HashMap<String, Arc<CameraSourceController>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_publisher(
        &mut self,
        id: impl Into<String>,
        controller: CameraSourceController,
    ) -> Result<Arc<CameraSourceController>, SessionError> {
        let id = id.into();
        if self.publishers.contains_key(&id) {
            return Err(SessionError::DuplicatePublisher(id));
        }
        let controller = Arc::new(controller);
        info!(publisher = %id, "Publisher created");
        self.publishers.insert(id, Arc::clone(&controller));
        Ok(controller)
    }

    pub fn publisher(&self, id: &str) -> Result<Arc<CameraSourceController>, SessionError> {
        self.publishers
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownPublisher(id.to_string()))
    }

    /// Stop the publisher's capture if running and forget it
    pub fn remove_publisher(&mut self, id: &str) -> Result<(), SessionError> {
        let controller = self
            .publishers
            .remove(id)
            .ok_or_else(|| SessionError::UnknownPublisher(id.to_string()))?;
        match controller.stop() {
            Ok(()) | Err(CameraError::NotActive) => {}
            Err(e) => warn!(publisher = %id, error = %e, "Failed to stop publisher"),
        }
        info!(publisher = %id, "Publisher removed");
        Ok(())
    }

    pub fn publisher_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.publishers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every publisher tracks external devices independently
    pub fn dispatch_hotplug(&self, event: &HotplugEvent) {
        debug!(
            device = %event.device(),
            publishers = self.publishers.len(),
            "Dispatching hotplug event"
        );
        for controller in self.publishers.values() {
            controller.handle_hotplug(event.clone());
        }
    }

    /// Stop every publisher's capture
    pub fn shutdown(&mut self) {
        for id in self.publisher_ids() {
            let _ = self.remove_publisher(&id);
        }
    }
}
