//! MySQL Wire Protocol
//!
//! Framing and packet codecs for the client/server protocol.
//!
//! ## Overview
//!
//! Every unit on the wire is a frame: a 3-byte little-endian body length, a
//! 1-byte sequence number, then the body. Command frames carry the command
//! code in the first body byte.
//!
//! ## Modules
//!
//! - `types`: constants, command codes, capability flags, frame header
//! - `parser`: frame recognition and a bounds-checked body reader
//! - `writer`: length-encoded and null-terminated encoders on `BufMut`
//! - `packet`: the `MySqlPacket` family with its shared encode contract
//! - `security`: `mysql_native_password` scramble
//!
//! ## Example
//!
//! ```
//! use mysqlmux::protocol::{ErrorPacket, FrameDecoder, MySqlPacket};
//!
//! let packet = MySqlPacket::from(ErrorPacket::new(1047, "Unknown command"));
//! let bytes = packet.to_bytes(1);
//!
//! let decoder = FrameDecoder::new(1024);
//! assert_eq!(decoder.decode(&bytes).unwrap(), Some(bytes.len()));
//! ```

pub mod packet;
pub mod parser;
pub mod security;
pub mod types;
pub mod writer;

// Re-export commonly used types for convenience
pub use packet::{
    AuthPacket, CommandPacket, EofPacket, ErrorPacket, FieldPacket, HandshakePacket, MySqlPacket,
    OkPacket, PrepareOkPacket,
};
pub use parser::{FrameDecoder, PacketReader, ParseError, ParseResult};
pub use types::{Command, PacketHeader, HEADER_SIZE};
pub use writer::MySqlBufMut;
