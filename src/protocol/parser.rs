//! Frame Decoder and Packet Reader
//!
//! Two pieces live here:
//!
//! 1. [`FrameDecoder`] looks at the front of an inbound byte buffer and tells
//!    the caller whether a complete frame (header + body) is available, and
//!    how long it is. Like any stream decoder it answers in three ways:
//!    - `Ok(Some(len))` - a complete frame of `len` bytes is buffered
//!    - `Ok(None)` - need more data
//!    - `Err(ParseError)` - the declared frame is unacceptable
//!
//! 2. [`PacketReader`] walks the body of a single frame, reading the MySQL
//!    primitive types (fixed-width little-endian integers, length-encoded
//!    integers and byte strings, null-terminated strings).

use crate::protocol::types::{PacketHeader, HEADER_SIZE};
use thiserror::Error;

/// Errors that can occur while decoding frames and packet bodies.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// The body ended before a field could be read
    #[error("truncated packet: missing {0}")]
    Truncated(&'static str),

    /// The body is structurally wrong
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// A frame declares more bytes than the connection accepts
    #[error("packet too large: {size} bytes (max: {max})")]
    PacketTooLarge { size: usize, max: usize },
}

/// Result type for decoding operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Recognises complete frames at the front of a buffer.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_packet_size: usize,
}

impl FrameDecoder {
    /// Creates a decoder rejecting frames larger than `max_packet_size`
    /// (header included).
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }

    /// Returns the total length of the next frame if it is fully buffered.
    pub fn decode(&self, buf: &[u8]) -> ParseResult<Option<usize>> {
        match self.frame_length(buf)? {
            Some(len) if buf.len() >= len => Ok(Some(len)),
            _ => Ok(None),
        }
    }

    /// Returns the declared length of the next frame as soon as its header
    /// is buffered, whether or not the body has arrived.
    pub fn frame_length(&self, buf: &[u8]) -> ParseResult<Option<usize>> {
        let header = match PacketHeader::parse(buf) {
            Some(header) => header,
            None => return Ok(None),
        };

        let len = header.frame_length();
        if len > self.max_packet_size {
            return Err(ParseError::PacketTooLarge {
                size: len,
                max: self.max_packet_size,
            });
        }
        Ok(Some(len))
    }
}

/// A cursor over a packet body.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Creates a reader over a full frame, positioned after the header.
    pub fn for_frame(frame: &'a [u8]) -> ParseResult<Self> {
        if frame.len() < HEADER_SIZE {
            return Err(ParseError::Truncated("packet header"));
        }
        Ok(Self {
            data: frame,
            pos: HEADER_SIZE,
        })
    }

    /// Current offset into the underlying slice.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn has_remaining(&self) -> bool {
        self.pos < self.data.len()
    }

    pub fn read_u8(&mut self, what: &'static str) -> ParseResult<u8> {
        let byte = *self.data.get(self.pos).ok_or(ParseError::Truncated(what))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u16_le(&mut self, what: &'static str) -> ParseResult<u16> {
        let bytes = self.read_bytes(2, what)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u24_le(&mut self, what: &'static str) -> ParseResult<u32> {
        let bytes = self.read_bytes(3, what)?;
        Ok(u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16))
    }

    pub fn read_u32_le(&mut self, what: &'static str) -> ParseResult<u32> {
        let bytes = self.read_bytes(4, what)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64_le(&mut self, what: &'static str) -> ParseResult<u64> {
        let bytes = self.read_bytes(8, what)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Reads a length-encoded integer.
    ///
    /// - 0x00-0xFA: the value itself
    /// - 0xFB: NULL, returned as `None`
    /// - 0xFC / 0xFD / 0xFE: 2, 3 or 8 byte value follows
    pub fn read_lenenc_int(&mut self, what: &'static str) -> ParseResult<Option<u64>> {
        match self.read_u8(what)? {
            first @ 0x00..=0xFA => Ok(Some(u64::from(first))),
            0xFB => Ok(None),
            0xFC => self.read_u16_le(what).map(|v| Some(u64::from(v))),
            0xFD => self.read_u24_le(what).map(|v| Some(u64::from(v))),
            0xFE => self.read_u64_le(what).map(Some),
            0xFF => Err(ParseError::InvalidPacket(format!(
                "{}: 0xFF is not a length prefix",
                what
            ))),
        }
    }

    /// Reads length-encoded bytes; a NULL prefix yields an empty vector.
    pub fn read_lenenc_bytes(&mut self, what: &'static str) -> ParseResult<Vec<u8>> {
        let len = self.read_lenenc_int(what)?.unwrap_or(0);
        let len = usize::try_from(len)
            .map_err(|_| ParseError::InvalidPacket(format!("{}: length overflow", what)))?;
        Ok(self.read_bytes(len, what)?.to_vec())
    }

    /// Reads a null-terminated string. A missing terminator consumes the
    /// rest of the body.
    pub fn read_null_string(&mut self, what: &'static str) -> ParseResult<String> {
        if !self.has_remaining() {
            return Err(ParseError::Truncated(what));
        }
        let rest = &self.data[self.pos..];
        let (raw, consumed) = match rest.iter().position(|&b| b == 0) {
            Some(end) => (&rest[..end], end + 1),
            None => (rest, rest.len()),
        };
        self.pos += consumed;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    /// Reads everything left as a string.
    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    pub fn read_bytes(&mut self, len: usize, what: &'static str) -> ParseResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(ParseError::Truncated(what));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    pub fn skip(&mut self, len: usize, what: &'static str) -> ParseResult<()> {
        self.read_bytes(len, what).map(|_| ())
    }
}
