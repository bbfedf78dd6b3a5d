//! Protocol Module
//!
//! The framing contract between raw socket bytes and discrete packets.
//!
//! The core never looks inside a packet. A [`Protocol`] decides how bytes are
//! cut into packets on the way in and how packets become bytes on the way
//! out; the connection pipeline only moves the results between threads.
//!
//! ## Reference Framing (LengthPrefixed)
//! ```text
//! ┌──────────┬─────────────────────────────┐
//! │ Len (4)  │         Payload             │
//! └──────────┴─────────────────────────────┘
//! ```

mod codec;

use std::io::{Read, Write};

use crate::error::Result;

pub use codec::{Frame, LengthPrefixed, HEADER_SIZE, MAX_PAYLOAD_SIZE};

/// One decoded application-level message
pub trait Packet: Send + 'static {
    /// Raw payload bytes
    fn as_bytes(&self) -> &[u8];
}

/// Turns a byte stream into packets and back
///
/// `read_packet` must report a peer that went away between packets as
/// [`NetError::Eof`](crate::NetError::Eof), and a stream cut short inside a
/// packet as any other error. The reader stage closes quietly on the former
/// and reports the latter through `on_error`.
pub trait Protocol: Send + Sync + 'static {
    type Packet: Packet;

    /// Block until one complete packet has been read
    fn read_packet<R: Read>(&self, reader: &mut R) -> Result<Self::Packet>;

    /// Encode and send one packet
    fn write_packet<W: Write>(&self, writer: &mut W, packet: &Self::Packet) -> Result<()>;
}
