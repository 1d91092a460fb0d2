//! Device transports for hwbridge
//!
//! A backend exposes a uniform surface over one way of reaching devices:
//! enumerate, claim a path, connect, and per-device read/write/close.
//! [`TransportBus`] composes backends; paths are dispatched by prefix
//! (`lib` for libusb, `udp-` for the emulator), assigned at enumeration
//! time.
//!
//! Backends are best-effort about cancellation: reads poll in 50 ms slices
//! and re-check a closed flag, so closing a device unblocks an in-flight
//! read within roughly one slice.

pub mod bus;
pub mod device;
pub mod error;
pub mod libusb;
pub mod mock;
pub mod udp;

pub use bus::TransportBus;
pub use device::{Backend, Device, DeviceInfo};
pub use error::{Result, TransportError};
pub use libusb::LibUsb;
pub use udp::{PortPair, UdpEmulator};
