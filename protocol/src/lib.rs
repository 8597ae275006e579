//! # Wire Protocol
//!
//! Binary message format shared by the field streaming server and its clients.
//!
//! Every message starts with a one byte type tag followed by a fixed layout of
//! little-endian fields. Variable-length fields (strings, frame payloads) are
//! preceded by an explicit `u32` byte count.
//!
//! | Tag    | Message         | Payload                                                  |
//! |--------|-----------------|----------------------------------------------------------|
//! | `0x01` | `ClientInput`   | `f32 x, f32 y, f32 z, f32 value, u32 timestamp`          |
//! | `0x02` | `ClientControl` | `u8 kind, f32 parameter`                                 |
//! | `0x10` | `ServerFrame`   | `string sessionId, f64 simTime, u32 payloadLen, payload` |
//! | `0x11` | `ServerState`   | `string sessionId, f32 time, i32 width, height, depth`   |
//! | `0x12` | `ServerError`   | `string sessionId, string message`                       |
//!
//! Decoding never panics and never reads past the end of the input; every
//! failure names the field that could not be read.
//!
//! ```
//! use protocol::{decode, encode, ClientInputMessage, Message};
//!
//! let message = Message::ClientInput(ClientInputMessage {
//!     x: 0.5,
//!     y: 0.5,
//!     z: 0.5,
//!     value: 1.0,
//!     timestamp: 42,
//! });
//! let bytes = encode(&message).unwrap();
//! assert_eq!(decode(&bytes).unwrap(), message);
//! ```

pub mod codec;
pub mod error;
pub mod transform;

pub use codec::{decode, encode, Decoder, Encoder};
pub use error::{DecodeError, DecodeErrorKind, DecodeResult, EncodeError};

/// Size of the type tag preceding every message.
pub const HEADER_SIZE: usize = 1;
/// Size of the length prefix on strings and payloads.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Message type tags as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    ClientInput = 0x01,
    ClientControl = 0x02,
    ServerFrame = 0x10,
    ServerState = 0x11,
    ServerError = 0x12,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0x01 => Ok(Self::ClientInput),
            0x02 => Ok(Self::ClientControl),
            0x10 => Ok(Self::ServerFrame),
            0x11 => Ok(Self::ServerState),
            0x12 => Ok(Self::ServerError),
            other => Err(other),
        }
    }
}

/// Simulation control requested by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ControlKind {
    Pause = 0x01,
    Resume = 0x02,
    Reset = 0x03,
    SetSpeed = 0x04,
}

impl TryFrom<u8> for ControlKind {
    type Error = u8;

    fn try_from(kind: u8) -> Result<Self, Self::Error> {
        match kind {
            0x01 => Ok(Self::Pause),
            0x02 => Ok(Self::Resume),
            0x03 => Ok(Self::Reset),
            0x04 => Ok(Self::SetSpeed),
            other => Err(other),
        }
    }
}

/// A localized perturbation requested by the client.
///
/// Coordinates are meant to lie in `[0, 1]`, but the codec does not enforce
/// it; out-of-range values are forwarded untouched.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientInputMessage {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub value: f32,
    /// Opaque client counter, never compared against wall-clock time
    pub timestamp: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientControlMessage {
    pub kind: ControlKind,
    /// Only meaningful for `SetSpeed`
    pub parameter: f32,
}

/// One simulation frame: electric then magnetic field, each a flat
/// little-endian `f32` array, after the frame transform has been applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerFrameMessage {
    pub session_id: String,
    pub sim_time: f64,
    pub payload: Vec<u8>,
}

impl ServerFrameMessage {
    /// Encoded size of a frame for `session_id` carrying `payload_len` bytes.
    pub fn encoded_len_for(session_id: &str, payload_len: usize) -> usize {
        HEADER_SIZE + string_len(session_id) + 8 + LENGTH_PREFIX_SIZE + payload_len
    }
}

/// Session announcement sent after creation and after a reset.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStateMessage {
    pub session_id: String,
    pub time: f32,
    pub width: i32,
    pub height: i32,
    pub depth: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerErrorMessage {
    pub session_id: String,
    pub message: String,
}

/// Every message that can cross the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ClientInput(ClientInputMessage),
    ClientControl(ClientControlMessage),
    ServerFrame(ServerFrameMessage),
    ServerState(ServerStateMessage),
    ServerError(ServerErrorMessage),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::ClientInput(_) => MessageType::ClientInput,
            Message::ClientControl(_) => MessageType::ClientControl,
            Message::ServerFrame(_) => MessageType::ServerFrame,
            Message::ServerState(_) => MessageType::ServerState,
            Message::ServerError(_) => MessageType::ServerError,
        }
    }

    /// True for the messages a client is allowed to send.
    pub fn is_client_message(&self) -> bool {
        matches!(self, Message::ClientInput(_) | Message::ClientControl(_))
    }

    /// Exact number of bytes `encode` produces for this message.
    pub fn encoded_len(&self) -> usize {
        let body = match self {
            Message::ClientInput(_) => 4 * 4 + 4,
            Message::ClientControl(_) => 1 + 4,
            Message::ServerFrame(frame) => {
                string_len(&frame.session_id) + 8 + LENGTH_PREFIX_SIZE + frame.payload.len()
            }
            Message::ServerState(state) => string_len(&state.session_id) + 4 + 3 * 4,
            Message::ServerError(error) => {
                string_len(&error.session_id) + string_len(&error.message)
            }
        };
        HEADER_SIZE + body
    }
}

fn string_len(s: &str) -> usize {
    LENGTH_PREFIX_SIZE + s.len()
}
