//! Protocol module - Defines the wire protocol spoken with the master
//!
//! Every frame uses a fixed 16-byte header followed by the payload:
//! - 4 bytes marker (`FF 7F F4 FE`)
//! - 4 bytes serial number (big-endian)
//! - 4 bytes list size (big-endian)
//! - 4 bytes payload length (big-endian)
//! - Variable length payload

mod codec;
mod message;
mod status;

pub use codec::*;
pub use message::*;
pub use status::*;

/// Default master port
pub const DEFAULT_PORT: u16 = 8000;

/// Marker bytes that open every frame
pub const MARKER: [u8; 4] = [0xFF, 0x7F, 0xF4, 0xFE];

/// Serial number reserved for frames that answer no request
pub const UNSOLICITED_SERIAL: u32 = 0;

/// List size used for single-segment payloads
pub const SINGLE_SEGMENT: u32 = 1;
