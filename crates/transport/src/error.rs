//! Transport error types

use thiserror::Error;

/// Errors surfaced by backends and device handles.
///
/// Display strings for the stable kinds are part of the HTTP contract.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No backend claims the path, or the device vanished between
    /// enumeration and connect.
    #[error("device not found")]
    NotFound,

    /// Read or write on a handle that was already closed.
    #[error("closed device")]
    ClosedDevice,

    /// The device dropped off the bus mid-transfer.
    #[error("device disconnected during action")]
    Disconnected,

    /// Debug connect on a device without a debug link.
    #[error("debug link not available")]
    NoDebugLink,

    /// Startup with an empty backend list.
    #[error("no transports enabled")]
    NoTransports,

    #[error("{0}")]
    Usb(#[from] rusb::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for transport results
pub type Result<T> = std::result::Result<T, TransportError>;
