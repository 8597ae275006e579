//! Byte-level encoder and decoder for the wire format.

use crate::error::{DecodeError, DecodeErrorKind, DecodeResult, EncodeError};
use crate::{
    ClientControlMessage, ClientInputMessage, ControlKind, Message, MessageType,
    ServerErrorMessage, ServerFrameMessage, ServerStateMessage,
};

/// Encodes messages into a reusable output buffer.
///
/// The buffer is cleared at the start of each `encode` call, so one encoder
/// can serve many messages without reallocating. All growth goes through
/// [`Encoder::try_reserve`], so a message too large for memory is an
/// [`EncodeError::Allocation`] rather than an abort.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes room for `additional` more bytes, reporting allocation failure.
    pub fn try_reserve(&mut self, additional: usize) -> Result<(), EncodeError> {
        self.buf
            .try_reserve_exact(additional)
            .map_err(|_| EncodeError::Allocation { bytes: additional })
    }

    /// Encodes `message`, returning a view of the encoded bytes.
    pub fn encode(&mut self, message: &Message) -> Result<&[u8], EncodeError> {
        self.buf.clear();
        self.try_reserve(message.encoded_len())?;
        self.put_u8(message.message_type() as u8);

        match message {
            Message::ClientInput(input) => {
                self.put_f32(input.x);
                self.put_f32(input.y);
                self.put_f32(input.z);
                self.put_f32(input.value);
                self.put_u32(input.timestamp);
            }
            Message::ClientControl(control) => {
                self.put_u8(control.kind as u8);
                self.put_f32(control.parameter);
            }
            Message::ServerFrame(frame) => {
                self.put_string("sessionId", &frame.session_id)?;
                self.put_f64(frame.sim_time);
                self.put_bytes("payload", &frame.payload)?;
            }
            Message::ServerState(state) => {
                self.put_string("sessionId", &state.session_id)?;
                self.put_f32(state.time);
                self.put_i32(state.width);
                self.put_i32(state.height);
                self.put_i32(state.depth);
            }
            Message::ServerError(error) => {
                self.put_string("sessionId", &error.session_id)?;
                self.put_string("message", &error.message)?;
            }
        }

        Ok(&self.buf)
    }

    /// Encodes a `ServerFrame` whose payload `write_payload` appends directly
    /// to the output buffer, so the payload never exists as a separate
    /// allocation.
    ///
    /// Room for `payload_capacity` bytes is reserved up front. The length
    /// prefix is filled in from what `write_payload` actually wrote.
    pub fn encode_frame_with<F, E>(
        &mut self,
        session_id: &str,
        sim_time: f64,
        payload_capacity: usize,
        write_payload: F,
    ) -> Result<&[u8], E>
    where
        F: FnOnce(&mut Vec<u8>) -> Result<(), E>,
        E: From<EncodeError>,
    {
        self.buf.clear();
        self.try_reserve(ServerFrameMessage::encoded_len_for(
            session_id,
            payload_capacity,
        ))?;
        self.put_u8(MessageType::ServerFrame as u8);
        self.put_string("sessionId", session_id)?;
        self.put_f64(sim_time);

        let prefix_at = self.buf.len();
        self.put_u32(0);
        let start = self.buf.len();
        write_payload(&mut self.buf)?;

        let written = self.buf.len() - start;
        let length = u32::try_from(written).map_err(|_| EncodeError::TooLong {
            field: "payload",
            length: written,
        })?;
        self.buf[prefix_at..start].copy_from_slice(&length.to_le_bytes());
        Ok(&self.buf)
    }

    /// Takes ownership of the last encoded message, leaving the encoder empty.
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn put_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    fn put_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    fn put_length(&mut self, field: &'static str, length: usize) -> Result<(), EncodeError> {
        let length = u32::try_from(length).map_err(|_| EncodeError::TooLong { field, length })?;
        self.put_u32(length);
        Ok(())
    }

    fn put_string(&mut self, field: &'static str, value: &str) -> Result<(), EncodeError> {
        self.put_bytes(field, value.as_bytes())
    }

    fn put_bytes(&mut self, field: &'static str, value: &[u8]) -> Result<(), EncodeError> {
        self.put_length(field, value.len())?;
        self.buf.extend_from_slice(value);
        Ok(())
    }
}

/// Encodes a single message into a freshly allocated, exactly sized buffer.
pub fn encode(message: &Message) -> Result<Vec<u8>, EncodeError> {
    let mut encoder = Encoder::new();
    encoder.encode(message)?;
    Ok(encoder.into_inner())
}

/// Cursor over an immutable input buffer.
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn position(&self) -> usize {
        self.offset
    }

    /// Reads the message type tag.
    pub fn read_header(&mut self) -> DecodeResult<MessageType> {
        let tag = self
            .take("header", 1)
            .map_err(|_| DecodeError::new("header", DecodeErrorKind::MissingHeader))?[0];
        MessageType::try_from(tag)
            .map_err(|tag| DecodeError::new("header", DecodeErrorKind::UnknownMessageType(tag)))
    }

    pub fn read_u8(&mut self, field: &'static str) -> DecodeResult<u8> {
        Ok(self.take(field, 1)?[0])
    }

    pub fn read_u32(&mut self, field: &'static str) -> DecodeResult<u32> {
        Ok(u32::from_le_bytes(self.take_array(field)?))
    }

    pub fn read_i32(&mut self, field: &'static str) -> DecodeResult<i32> {
        Ok(i32::from_le_bytes(self.take_array(field)?))
    }

    pub fn read_f32(&mut self, field: &'static str) -> DecodeResult<f32> {
        Ok(f32::from_bits(u32::from_le_bytes(self.take_array(field)?)))
    }

    pub fn read_f64(&mut self, field: &'static str) -> DecodeResult<f64> {
        Ok(f64::from_bits(u64::from_le_bytes(self.take_array(field)?)))
    }

    /// Reads a `u32` length prefix followed by that many bytes.
    pub fn read_bytes(&mut self, field: &'static str) -> DecodeResult<&'a [u8]> {
        let declared = self.read_u32(field)? as usize;
        let remaining = self.remaining();
        if declared > remaining {
            return Err(DecodeError::new(
                field,
                DecodeErrorKind::LengthOverrun {
                    declared,
                    remaining,
                },
            ));
        }
        self.take(field, declared)
    }

    pub fn read_string(&mut self, field: &'static str) -> DecodeResult<String> {
        let bytes = self.read_bytes(field)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::new(field, DecodeErrorKind::InvalidUtf8))
    }

    pub fn read_client_input(&mut self) -> DecodeResult<ClientInputMessage> {
        Ok(ClientInputMessage {
            x: self.read_f32("x")?,
            y: self.read_f32("y")?,
            z: self.read_f32("z")?,
            value: self.read_f32("value")?,
            timestamp: self.read_u32("timestamp")?,
        })
    }

    pub fn read_client_control(&mut self) -> DecodeResult<ClientControlMessage> {
        let raw = self.read_u8("kind")?;
        let kind = ControlKind::try_from(raw)
            .map_err(|kind| DecodeError::new("kind", DecodeErrorKind::UnknownControlKind(kind)))?;
        Ok(ClientControlMessage {
            kind,
            parameter: self.read_f32("parameter")?,
        })
    }

    pub fn read_server_frame(&mut self) -> DecodeResult<ServerFrameMessage> {
        let session_id = self.read_string("sessionId")?;
        let sim_time = self.read_f64("simTime")?;
        let payload = self.read_bytes("payload")?.to_vec();
        Ok(ServerFrameMessage {
            session_id,
            sim_time,
            payload,
        })
    }

    pub fn read_server_state(&mut self) -> DecodeResult<ServerStateMessage> {
        Ok(ServerStateMessage {
            session_id: self.read_string("sessionId")?,
            time: self.read_f32("time")?,
            width: self.read_i32("width")?,
            height: self.read_i32("height")?,
            depth: self.read_i32("depth")?,
        })
    }

    pub fn read_server_error(&mut self) -> DecodeResult<ServerErrorMessage> {
        Ok(ServerErrorMessage {
            session_id: self.read_string("sessionId")?,
            message: self.read_string("message")?,
        })
    }

    /// Reads a whole message: tag first, then the matching body.
    pub fn read_message(&mut self) -> DecodeResult<Message> {
        let message = match self.read_header()? {
            MessageType::ClientInput => Message::ClientInput(self.read_client_input()?),
            MessageType::ClientControl => Message::ClientControl(self.read_client_control()?),
            MessageType::ServerFrame => Message::ServerFrame(self.read_server_frame()?),
            MessageType::ServerState => Message::ServerState(self.read_server_state()?),
            MessageType::ServerError => Message::ServerError(self.read_server_error()?),
        };
        Ok(message)
    }

    fn take(&mut self, field: &'static str, needed: usize) -> DecodeResult<&'a [u8]> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(DecodeError::new(
                field,
                DecodeErrorKind::Truncated { needed, remaining },
            ));
        }
        let data = self.data;
        let start = self.offset;
        self.offset += needed;
        Ok(&data[start..self.offset])
    }

    fn take_array<const N: usize>(&mut self, field: &'static str) -> DecodeResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(field, N)?);
        Ok(out)
    }
}

/// Decodes one message from `bytes`.
///
/// Bytes past the end of the message body are ignored.
pub fn decode(bytes: &[u8]) -> DecodeResult<Message> {
    Decoder::new(bytes).read_message()
}
