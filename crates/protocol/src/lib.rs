//! Protocol library for hwbridge
//!
//! This crate defines the message framing shared between the HTTP boundary
//! and the device transports, plus the wire-visible types serialized to
//! clients. Message payloads are opaque; the daemon never parses the
//! device's application-layer protocol.
//!
//! Two framings exist for the same `(kind, payload)` message:
//!
//! - the *outer form* used at the HTTP boundary: a 6-byte big-endian
//!   `kind | size` header followed by the payload, hex-encoded in transit;
//! - the *wire form* used at the USB boundary: fixed 64-byte reports, the
//!   first carrying a `? # #` magic plus the header, continuations carrying
//!   a single `?` marker.
//!
//! # Example
//!
//! ```
//! use protocol::{wire, Message};
//!
//! let msg = Message { kind: 0x0001, data: vec![0xAB; 100] };
//! let reports = wire::pack(msg.kind, &msg.data);
//! let decoded = wire::unpack(&reports).unwrap();
//! assert_eq!(decoded, msg);
//!
//! let outer = wire::to_outer(&msg);
//! assert_eq!(wire::from_outer(&outer).unwrap(), msg);
//! ```

pub mod error;
pub mod types;
pub mod wire;

pub use error::{ProtocolError, Result};
pub use types::{
    DeviceType, EnumerateEntry, Message, SessionInfo, VersionInfo, PRODUCT_CLASSIC_FIRMWARE,
    PRODUCT_NEXTGEN_BOOTLOADER, PRODUCT_NEXTGEN_FIRMWARE, VENDOR_CLASSIC, VENDOR_NEXTGEN,
};
pub use wire::{Deframer, Report, REPORT_LEN};
