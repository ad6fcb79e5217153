//! MySQL Wire Protocol Types
//!
//! Constants and small value types shared by the framing code, the packet
//! family and the command dispatcher.
//!
//! ## Frame Format
//!
//! ```text
//! ┌──────────────┬──────────┬─────────────────────────────┐
//! │ length (3B)  │ seq (1B) │ body (length bytes)         │
//! │ little-endian│          │ body[0] = command code      │
//! └──────────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! The length field counts the body only; the 4-byte header is excluded.

use std::fmt;

/// Size of the frame header (3-byte length + 1-byte sequence number)
pub const HEADER_SIZE: usize = 4;

/// Largest body a single frame can declare (2^24 - 1)
pub const MAX_BODY_LENGTH: usize = 0xFF_FF_FF;

/// Default upper bound on an inbound frame (16 MB)
pub const DEFAULT_MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Length of the reserved filler in the authentication packet
pub const AUTH_FILLER_LENGTH: usize = 23;

/// Commands the dispatcher understands.
///
/// The discriminant is the command byte found in `frame[4]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    ProcessKill = 0x0c,
    Ping = 0x0e,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtClose = 0x19,
    /// Keep-alive sent by peer proxy nodes
    Heartbeat = 0x40,
}

impl Command {
    /// Maps a command byte to a known command.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Command::Quit),
            0x02 => Some(Command::InitDb),
            0x03 => Some(Command::Query),
            0x0c => Some(Command::ProcessKill),
            0x0e => Some(Command::Ping),
            0x16 => Some(Command::StmtPrepare),
            0x17 => Some(Command::StmtExecute),
            0x19 => Some(Command::StmtClose),
            0x40 => Some(Command::Heartbeat),
            _ => None,
        }
    }

    /// The command byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Protocol name of the command, e.g. `COM_QUERY`.
    pub fn name(self) -> &'static str {
        match self {
            Command::Quit => "COM_QUIT",
            Command::InitDb => "COM_INIT_DB",
            Command::Query => "COM_QUERY",
            Command::ProcessKill => "COM_PROCESS_KILL",
            Command::Ping => "COM_PING",
            Command::StmtPrepare => "COM_STMT_PREPARE",
            Command::StmtExecute => "COM_STMT_EXECUTE",
            Command::StmtClose => "COM_STMT_CLOSE",
            Command::Heartbeat => "COM_HEARTBEAT",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Client/server capability flags.
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 12;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 13;
    pub const CLIENT_RESERVED: u32 = 1 << 14;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;

    /// Capabilities advertised in the handshake.
    pub const SERVER_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_ODBC
        | CLIENT_IGNORE_SPACE
        | CLIENT_PROTOCOL_41
        | CLIENT_INTERACTIVE
        | CLIENT_IGNORE_SIGPIPE
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION;

    /// Capabilities sent when logging in to a backend node.
    pub const BACKEND_CLIENT_FLAGS: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_ODBC
        | CLIENT_IGNORE_SPACE
        | CLIENT_PROTOCOL_41
        | CLIENT_INTERACTIVE
        | CLIENT_IGNORE_SIGPIPE
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS;
}

/// Server status flags.
pub mod server_status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
}

/// Protocol-level error numbers written into error packets.
pub mod error_code {
    pub const ER_YES: u16 = 1003;
    pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
    pub const ER_NO_DB_ERROR: u16 = 1046;
    pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;
    pub const ER_BAD_DB_ERROR: u16 = 1049;
    pub const ER_UNKNOWN_CHARACTER_SET: u16 = 1115;
    pub const ER_NOT_ALLOWED_COMMAND: u16 = 1148;
    pub const ER_NET_PACKET_TOO_LARGE: u16 = 1153;
    pub const ER_UNKNOWN_STMT_HANDLER: u16 = 1243;
    pub const ER_NOT_SUPPORTED_YET: u16 = 1235;

    /// SQL state used when no more specific state applies
    pub const DEFAULT_SQL_STATE: &[u8; 5] = b"HY000";
}

/// Collation indexes for the charset names we accept in configuration.
pub mod charset {
    pub const LATIN1_SWEDISH_CI: u8 = 8;
    pub const GBK_CHINESE_CI: u8 = 28;
    pub const UTF8_GENERAL_CI: u8 = 33;
    pub const UTF8MB4_GENERAL_CI: u8 = 45;
    pub const BINARY: u8 = 63;

    /// Resolves a charset name (case-insensitive) to its default collation index.
    pub fn index_of(name: &str) -> Option<u8> {
        match name.to_ascii_lowercase().as_str() {
            "latin1" => Some(LATIN1_SWEDISH_CI),
            "gbk" => Some(GBK_CHINESE_CI),
            "utf8" | "utf8mb3" => Some(UTF8_GENERAL_CI),
            "utf8mb4" => Some(UTF8MB4_GENERAL_CI),
            "binary" => Some(BINARY),
            _ => None,
        }
    }
}

/// The 4-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Body length in bytes (header excluded)
    pub length: u32,
    /// Sequence number, wraps at 255
    pub sequence: u8,
}

impl PacketHeader {
    /// Reads a header from the front of `buf`, if four bytes are available.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: u32::from(buf[0]) | (u32::from(buf[1]) << 8) | (u32::from(buf[2]) << 16),
            sequence: buf[3],
        })
    }

    /// Encodes the header.
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        [
            (self.length & 0xFF) as u8,
            ((self.length >> 8) & 0xFF) as u8,
            ((self.length >> 16) & 0xFF) as u8,
            self.sequence,
        ]
    }

    /// Header plus body length.
    pub fn frame_length(self) -> usize {
        HEADER_SIZE + self.length as usize
    }
}
