//! Length-prefixed codec
//!
//! Reference [`Protocol`] used by the bundled binaries and tests.
//!
//! ## Wire Format
//! ```text
//! ┌──────────┬─────────────────────────────┐
//! │ Len (4)  │         Payload             │
//! └──────────┴─────────────────────────────┘
//! ```
//! Length is big-endian and counts payload bytes only.

use std::io::{self, Read, Write};

use bytes::Bytes;

use super::{Packet, Protocol};
use crate::error::{NetError, Result};

/// Header size: 4 bytes length
pub const HEADER_SIZE: usize = 4;

/// Maximum payload size (16 MB)
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Opaque payload carried by [`LengthPrefixed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self(payload.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl Packet for Frame {
    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bytes> for Frame {
    fn from(payload: Bytes) -> Self {
        Self(payload)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(payload: Vec<u8>) -> Self {
        Self(Bytes::from(payload))
    }
}

impl From<&'static str> for Frame {
    fn from(payload: &'static str) -> Self {
        Self(Bytes::from_static(payload.as_bytes()))
    }
}

/// 4-byte length header followed by the payload
#[derive(Debug, Clone, Copy, Default)]
pub struct LengthPrefixed;

impl LengthPrefixed {
    /// Encode a frame to bytes
    pub fn encode(frame: &Frame) -> Result<Vec<u8>> {
        let payload = frame.as_bytes();
        if payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(NetError::Protocol(format!(
                "Payload too large: {} bytes (max {})",
                payload.len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let mut message = Vec::with_capacity(HEADER_SIZE + payload.len());
        message.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        message.extend_from_slice(payload);
        Ok(message)
    }

    /// Decode one frame from the front of `bytes`
    ///
    /// Returns the frame and the number of bytes consumed
    pub fn decode(bytes: &[u8]) -> Result<(Frame, usize)> {
        if bytes.len() < HEADER_SIZE {
            return Err(NetError::Protocol(format!(
                "Incomplete header: expected {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }

        let payload_len = Self::payload_len([bytes[0], bytes[1], bytes[2], bytes[3]])?;
        let total_len = HEADER_SIZE + payload_len;
        if bytes.len() < total_len {
            return Err(NetError::Protocol(format!(
                "Incomplete payload: expected {} bytes, got {}",
                total_len,
                bytes.len()
            )));
        }

        let frame = Frame(Bytes::copy_from_slice(&bytes[HEADER_SIZE..total_len]));
        Ok((frame, total_len))
    }

    fn payload_len(header: [u8; HEADER_SIZE]) -> Result<usize> {
        let payload_len = u32::from_be_bytes(header);
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(NetError::Protocol(format!(
                "Payload too large: {} bytes (max {})",
                payload_len, MAX_PAYLOAD_SIZE
            )));
        }
        Ok(payload_len as usize)
    }
}

impl Protocol for LengthPrefixed {
    type Packet = Frame;

    fn read_packet<R: Read>(&self, reader: &mut R) -> Result<Frame> {
        // Read header first
        let mut header = [0u8; HEADER_SIZE];
        match fill(reader, &mut header)? {
            0 => return Err(NetError::Eof),
            HEADER_SIZE => {}
            got => {
                return Err(NetError::Protocol(format!(
                    "Incomplete header: expected {} bytes, got {}",
                    HEADER_SIZE, got
                )))
            }
        }

        let payload_len = Self::payload_len(header)?;

        let mut payload = vec![0u8; payload_len];
        let got = fill(reader, &mut payload)?;
        if got < payload_len {
            return Err(NetError::Protocol(format!(
                "Incomplete payload: expected {} bytes, got {}",
                payload_len, got
            )));
        }

        Ok(Frame::from(payload))
    }

    fn write_packet<W: Write>(&self, writer: &mut W, packet: &Frame) -> Result<()> {
        let bytes = Self::encode(packet)?;
        writer.write_all(&bytes)?;
        writer.flush()?;
        Ok(())
    }
}

/// Like `read_exact`, but a short stream returns the count instead of failing
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
