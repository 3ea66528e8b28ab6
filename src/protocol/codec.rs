//! Frame codec for the master wire format
//!
//! Handles framing of opaque payloads. Decoding is incremental: TCP hands
//! us arbitrary chunks, so the decoder keeps its place between calls.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::MARKER;

/// Header size: marker(4) + serial(4) + list size(4) + length(4) = 16 bytes
pub const HEADER_SIZE: usize = 16;

/// Default limit for inbound payloads (10 MB)
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid frame marker: {0:02X?}")]
    InvalidMarker([u8; 4]),

    #[error("Payload too large: {0} bytes (max: {1})")]
    PayloadTooLarge(usize, usize),

    #[error("Serialization error: {0}")]
    Serialization(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<bincode::Error> for CodecError {
    fn from(e: bincode::Error) -> Self {
        CodecError::Serialization(e)
    }
}

pub type CodecResult<T> = Result<T, CodecError>;

/// One decoded unit of the wire protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Correlates a response with its request
    pub serial_number: u32,
    /// Number of payload segments
    pub list_size: u32,
    /// Serialized message bytes
    pub payload: Bytes,
}

impl Frame {
    pub fn new(serial_number: u32, list_size: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            serial_number,
            list_size,
            payload: payload.into(),
        }
    }

    /// Length of the payload as carried in the header
    pub fn payload_length(&self) -> usize {
        self.payload.len()
    }

    /// Append the wire form of this frame to `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> CodecResult<()> {
        encode(self.serial_number, self.list_size, &self.payload, buf)
    }
}

/// Encode a frame header plus `payload` into `buf`.
///
/// The payload must already hold a fully serialized message. The only
/// failure is a payload whose length does not fit the 32-bit length field.
pub fn encode(
    serial_number: u32,
    list_size: u32,
    payload: &[u8],
    buf: &mut BytesMut,
) -> CodecResult<()> {
    let length = u32::try_from(payload.len())
        .map_err(|_| CodecError::PayloadTooLarge(payload.len(), u32::MAX as usize))?;

    buf.reserve(HEADER_SIZE + payload.len());
    buf.put_slice(&MARKER);
    buf.put_u32(serial_number);
    buf.put_u32(list_size);
    buf.put_u32(length);
    buf.put_slice(payload);

    Ok(())
}

/// Decodes frames from a byte stream
pub struct Decoder {
    state: DecodeState,
    max_payload_size: usize,
}

#[derive(Default)]
enum DecodeState {
    #[default]
    Header,
    Payload {
        serial_number: u32,
        list_size: u32,
        length: usize,
    },
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a decoder that rejects payloads longer than `max_payload_size`
    pub fn with_max_payload(max_payload_size: usize) -> Self {
        Self {
            state: DecodeState::Header,
            max_payload_size,
        }
    }

    /// Attempt to decode a frame from the buffer.
    ///
    /// Returns `Ok(None)` if more data is needed; the caller appends the
    /// next chunk to the same buffer and calls again. An `InvalidMarker`
    /// error means the stream is out of sync and cannot be recovered.
    pub fn decode(&mut self, buf: &mut BytesMut) -> CodecResult<Option<Frame>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_SIZE {
                        return Ok(None);
                    }

                    if buf[0..4] != MARKER {
                        return Err(CodecError::InvalidMarker([buf[0], buf[1], buf[2], buf[3]]));
                    }

                    buf.advance(4);
                    let serial_number = buf.get_u32();
                    let list_size = buf.get_u32();
                    let length = buf.get_u32() as usize;

                    if length > self.max_payload_size {
                        return Err(CodecError::PayloadTooLarge(length, self.max_payload_size));
                    }

                    self.state = DecodeState::Payload {
                        serial_number,
                        list_size,
                        length,
                    };
                }
                DecodeState::Payload {
                    serial_number,
                    list_size,
                    length,
                } => {
                    if buf.len() < length {
                        return Ok(None);
                    }

                    let payload = buf.split_to(length).freeze();
                    self.state = DecodeState::Header;

                    return Ok(Some(Frame {
                        serial_number,
                        list_size,
                        payload,
                    }));
                }
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
