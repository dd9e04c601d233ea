//! Error types shared across the server core.
//!
//! Codec errors live next to the codec ([`crate::packet::DecodeError`],
//! [`crate::payload::FramingError`]); this module holds the errors surfaced
//! to application code.

use thiserror::Error;

/// The connection's outbound queue is gone; no further writes are possible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("connection closed")]
pub struct ClosedError;

/// A problem sending a fire-and-forget packet from a namespace.
#[derive(Debug, Error)]
pub enum EmitError {
    /// The namespace has no live transport underneath it.
    #[error("not connected")]
    NotConnected,

    /// The owning connection has shut down.
    #[error("connection closed")]
    Closed,

    /// The arguments could not be serialized.
    #[error("failed to encode arguments: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A problem with an acknowledged round-trip call.
#[derive(Debug, Error)]
pub enum CallError {
    /// The namespace has no live transport underneath it.
    #[error("not connected")]
    NotConnected,

    /// The owning connection has shut down.
    #[error("connection closed")]
    Closed,

    /// The arguments could not be serialized.
    #[error("failed to encode arguments: {0}")]
    Encode(#[source] serde_json::Error),

    /// The ack's result array did not match the expected reply shape.
    #[error("failed to decode reply: {0}")]
    Decode(#[source] serde_json::Error),

    /// No matching ack arrived before the deadline.
    #[error("timed out waiting for acknowledgment")]
    Timeout,
}

impl From<EmitError> for CallError {
    fn from(e: EmitError) -> Self {
        match e {
            EmitError::NotConnected => CallError::NotConnected,
            EmitError::Closed => CallError::Closed,
            EmitError::Encode(e) => CallError::Encode(e),
        }
    }
}

/// A problem sending an acknowledgment reply from a handler.
#[derive(Debug, Error)]
pub enum AckError {
    /// The originating packet did not request an acknowledgment.
    #[error("no acknowledgment was requested")]
    NotRequested,

    /// The results could not be serialized.
    #[error("failed to encode results: {0}")]
    Encode(#[source] serde_json::Error),

    /// The reply could not be sent.
    #[error(transparent)]
    Emit(#[from] EmitError),
}

/// An unknown or unregistered transport name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transport `{0}`")]
pub struct InvalidTransport(pub String);

/// The admission hook rejected a handshake request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("connection disallowed: {reason}")]
pub struct ConnectionDisallowed {
    /// Why the request was turned away.
    pub reason: String,
}

impl ConnectionDisallowed {
    /// Reject with the given reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
