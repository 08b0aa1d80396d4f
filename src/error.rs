//! The crate's error hierarchy.
//!
//! Codec and protocol errors carry enough context (byte offset, field name,
//! D-Bus error name) that a caller can act on them without re-parsing the
//! message; see §7 of the design notes for the propagation policy.

use thiserror::Error;

use crate::names::ErrorName;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A type signature was malformed, too long, too deeply nested, or
    /// otherwise failed to parse.
    #[error("invalid signature `{signature}`: {reason}")]
    Signature { signature: String, reason: String },

    /// Writing or reading a value would require padding past the end of the
    /// buffer, or the declared length of a container does not agree with its
    /// contents.
    #[error("alignment error at offset {offset}: {reason}")]
    Alignment { offset: usize, reason: String },

    /// A short read, a missing/garbled NUL terminator, invalid UTF-8, or an
    /// invalid object path was encountered while decoding.
    #[error("read error at offset {offset}: {reason}")]
    ReadBuffer { offset: usize, reason: String },

    /// A decoded value was structurally well-formed but out of range for its
    /// type (e.g. a boolean that isn't 0 or 1).
    #[error("invalid value at offset {offset}: {reason}")]
    InvalidValue { offset: usize, reason: String },

    /// The SASL handshake failed: every mechanism was rejected, or the
    /// server sent something that doesn't fit the protocol.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The transport is gone, or a message was sent before the handshake
    /// completed.
    #[error("connection error: {0}")]
    Connection(String),

    /// A message carried a required header field missing, or a forbidden
    /// one present, for its message type.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The daemon (or peer) replied with `ERROR`.
    #[error("remote error {name}: {message}")]
    Remote { name: ErrorName, message: String },

    /// A pending call's deadline elapsed before a reply arrived.
    #[error("call timed out")]
    Timeout,

    /// A pending call was cancelled by its caller.
    #[error("call was cancelled")]
    Cancelled,

    /// Wraps the underlying I/O error from the transport.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn signature(signature: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Signature {
            signature: signature.into(),
            reason: reason.into(),
        }
    }

    pub fn alignment(offset: usize, reason: impl Into<String>) -> Self {
        Error::Alignment {
            offset,
            reason: reason.into(),
        }
    }

    pub fn read_buffer(offset: usize, reason: impl Into<String>) -> Self {
        Error::ReadBuffer {
            offset,
            reason: reason.into(),
        }
    }

    pub fn invalid_value(offset: usize, reason: impl Into<String>) -> Self {
        Error::InvalidValue {
            offset,
            reason: reason.into(),
        }
    }

    /// True for errors that §7 says must not terminate the connection: a
    /// single bad message is dropped and logged, not fatal.
    pub fn is_recoverable_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::Signature { .. }
                | Error::Alignment { .. }
                | Error::ReadBuffer { .. }
                | Error::InvalidValue { .. }
                | Error::Protocol(_)
        )
    }
}
