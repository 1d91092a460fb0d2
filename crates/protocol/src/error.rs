//! Protocol error types

use thiserror::Error;

/// Errors raised while framing or deframing messages.
///
/// The display strings are part of the HTTP contract: clients match on them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Outer-form header/length mismatch, or a payload validator rejected
    /// the parsed payload.
    #[error("malformed data")]
    MalformedData,

    /// An inbound report after synchronization did not carry the marker byte.
    #[error("malformed wire format")]
    MalformedWireFormat,
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
