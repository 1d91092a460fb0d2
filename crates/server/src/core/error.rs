//! Core error types

use thiserror::Error;

/// Errors surfaced by the session and transport engine.
///
/// Display strings are the HTTP contract; clients match on them.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The optimistic acquire guard failed: another client moved ahead.
    #[error("wrong previous session")]
    WrongPreviousSession,

    /// No such session id in the relevant map.
    #[error("session not found")]
    SessionNotFound,

    /// The session is busy and stealing is disabled, or a concurrent call
    /// already holds the session's in-flight flag.
    #[error("other call in progress")]
    OtherCallInProgress,

    /// Public id not present in the device registry.
    #[error("device not found")]
    DeviceNotFound,

    /// A read-mode call arrived with a body.
    #[error("non-empty body on read mode")]
    NonEmptyBodyOnRead,

    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),

    #[error(transparent)]
    Transport(#[from] transport::TransportError),

    /// A blocking worker died underneath us.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Type alias for core results
pub type Result<T> = std::result::Result<T, CoreError>;
