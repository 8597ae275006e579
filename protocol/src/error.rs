//! Encode and decode failures for the binary wire format.

use thiserror::Error;

/// Result type for decode operations.
pub type DecodeResult<T> = Result<T, DecodeError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// A variable-length field cannot be described by its 32-bit length prefix
    #[error("field `{field}` is {length} bytes, longer than a u32 length prefix allows")]
    TooLong { field: &'static str, length: usize },

    #[error("failed to allocate {bytes} bytes for an encoded message")]
    Allocation { bytes: usize },
}

/// A decode failure, tagged with the wire field being read when it occurred.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to decode field `{field}`: {kind}")]
pub struct DecodeError {
    /// Wire name of the field that could not be read
    pub field: &'static str,
    pub kind: DecodeErrorKind,
}

impl DecodeError {
    pub fn new(field: &'static str, kind: DecodeErrorKind) -> Self {
        Self { field, kind }
    }
}

/// What went wrong while reading a field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeErrorKind {
    /// Buffer is empty, so there is no message type tag
    #[error("message is empty, no type tag")]
    MissingHeader,

    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("unknown control kind 0x{0:02x}")]
    UnknownControlKind(u8),

    /// Not enough bytes left for a fixed-width field
    #[error("need {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    /// A length prefix points past the end of the buffer
    #[error("declared length {declared} exceeds {remaining} remaining bytes")]
    LengthOverrun { declared: usize, remaining: usize },

    #[error("string is not valid UTF-8")]
    InvalidUtf8,
}
