//! Backend and device traits

use crate::error::Result;
use protocol::DeviceType;
use std::sync::Arc;

/// One device as seen by a backend enumeration.
///
/// `path` is the backend-native identifier (opaque to everything above the
/// transport layer, unstable across reconnects). The device registry
/// rewrites it to a public id before anything reaches a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_type: DeviceType,
    /// Device exposes the second, debug vendor interface.
    pub debug: bool,
}

/// An open device handle.
///
/// Handles are shared between the call path and the cancellation watcher,
/// so all operations take `&self`; implementations use interior mutability.
pub trait Device: Send + Sync {
    /// Read one report. Blocks until a report arrives, the handle is
    /// closed, or the device disconnects.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one report.
    fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Close the handle. An in-flight read is unblocked best-effort.
    /// `disconnected` skips the residual-report drain, because reading a
    /// vanished device is unreliable.
    fn close(&self, disconnected: bool) -> Result<()>;
}

/// One way of reaching devices (libusb, UDP emulator, ...).
pub trait Backend: Send + Sync {
    /// List currently visible devices.
    fn enumerate(&self) -> Result<Vec<DeviceInfo>>;

    /// Whether this backend's paths include `path`.
    fn owns(&self, path: &str) -> bool;

    /// Open a device. `debug` claims the debug interface; `reset` issues a
    /// USB device reset before claiming (skipped when another session holds
    /// the device's other interface).
    fn connect(&self, path: &str, debug: bool, reset: bool) -> Result<Arc<dyn Device>>;

    /// Called once on program exit.
    fn close(&self) {}
}
