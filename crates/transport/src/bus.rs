//! Backend composition

use crate::device::{Backend, Device, DeviceInfo};
use crate::error::{Result, TransportError};
use std::sync::Arc;
use tracing::debug;

/// The composed transport: enumeration concatenates all backends, connect
/// dispatches to the first backend that claims the path.
pub struct TransportBus {
    backends: Vec<Box<dyn Backend>>,
}

impl TransportBus {
    /// Compose backends. At least one must be configured.
    pub fn new(backends: Vec<Box<dyn Backend>>) -> Result<Self> {
        if backends.is_empty() {
            return Err(TransportError::NoTransports);
        }
        Ok(Self { backends })
    }

    pub fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        let mut infos = Vec::new();
        for backend in &self.backends {
            infos.extend(backend.enumerate()?);
        }
        Ok(infos)
    }

    pub fn owns(&self, path: &str) -> bool {
        self.backends.iter().any(|b| b.owns(path))
    }

    pub fn connect(&self, path: &str, debug: bool, reset: bool) -> Result<Arc<dyn Device>> {
        for backend in &self.backends {
            if backend.owns(path) {
                return backend.connect(path, debug, reset);
            }
        }
        debug!(path, "no backend claims path");
        Err(TransportError::NotFound)
    }

    /// Called on program exit.
    pub fn close(&self) {
        for backend in &self.backends {
            backend.close();
        }
    }
}
