//! MySQL Packet Family
//!
//! Every packet the proxy writes is a variant of [`MySqlPacket`]. They share
//! one encode contract: the 3-byte length is always `body_size()`, followed by
//! the sequence number and the variant's body serializer.
//!
//! ```text
//! MySqlPacket::encode(seq)
//!   ├── put_u24_le(body_size())
//!   ├── put_u8(seq)
//!   └── match variant => write_body()
//! ```
//!
//! A body of `MAX_BODY_LENGTH` bytes or more is split into full-length
//! packets with consecutive sequence numbers, ending with a shorter (possibly
//! empty) one.
//!
//! Decoders take a complete frame (header included) as produced by the
//! connection read path.

use crate::protocol::parser::{PacketReader, ParseError, ParseResult};
use crate::protocol::types::{
    capabilities, error_code, server_status, AUTH_FILLER_LENGTH, HEADER_SIZE, MAX_BODY_LENGTH,
};
use crate::protocol::writer::{lenenc_bytes_size, lenenc_int_size, MySqlBufMut};
use bytes::{BufMut, BytesMut};
use rand::distributions::Alphanumeric;
use rand::Rng;

const OK_HEADER: u8 = 0x00;
const EOF_HEADER: u8 = 0xFE;
const ERROR_HEADER: u8 = 0xFF;
const SQL_STATE_MARKER: u8 = b'#';
const HANDSHAKE_FILLER_LENGTH: usize = 13;

/// Column type used when describing prepared-statement parameters
pub const FIELD_TYPE_VAR_STRING: u8 = 0xFD;

/// Any packet the proxy can put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MySqlPacket {
    Handshake(HandshakePacket),
    Auth(AuthPacket),
    Ok(OkPacket),
    Error(ErrorPacket),
    Eof(EofPacket),
    PrepareOk(PrepareOkPacket),
    Field(FieldPacket),
    Command(CommandPacket),
}

impl MySqlPacket {
    /// Exact number of body bytes `encode` will write.
    pub fn body_size(&self) -> usize {
        match self {
            MySqlPacket::Handshake(p) => p.body_size(),
            MySqlPacket::Auth(p) => p.body_size(),
            MySqlPacket::Ok(p) => p.body_size(),
            MySqlPacket::Error(p) => p.body_size(),
            MySqlPacket::Eof(_) => 5,
            MySqlPacket::PrepareOk(_) => 12,
            MySqlPacket::Field(p) => p.body_size(),
            MySqlPacket::Command(p) => 1 + p.arg.len(),
        }
    }

    /// Appends header and body to `buf`. Returns the sequence number the
    /// next packet of the exchange should carry.
    pub fn encode(&self, sequence: u8, buf: &mut BytesMut) -> u8 {
        let size = self.body_size();
        if size >= MAX_BODY_LENGTH {
            return self.encode_split(sequence, size, buf);
        }

        buf.reserve(HEADER_SIZE + size);
        buf.put_u24_le(size as u32);
        buf.put_u8(sequence);

        let start = buf.len();
        self.write_body(buf);
        debug_assert_eq!(
            buf.len() - start,
            size,
            "{} body does not match its declared length",
            self.name()
        );
        sequence.wrapping_add(1)
    }

    fn encode_split(&self, sequence: u8, size: usize, buf: &mut BytesMut) -> u8 {
        let mut body = BytesMut::with_capacity(size);
        self.write_body(&mut body);
        debug_assert_eq!(body.len(), size);

        buf.reserve(size + HEADER_SIZE * (size / MAX_BODY_LENGTH + 1));
        let mut sequence = sequence;
        let mut rest = &body[..];
        loop {
            let len = rest.len().min(MAX_BODY_LENGTH);
            buf.put_u24_le(len as u32);
            buf.put_u8(sequence);
            buf.put_slice(&rest[..len]);
            rest = &rest[len..];
            sequence = sequence.wrapping_add(1);
            if len < MAX_BODY_LENGTH {
                return sequence;
            }
        }
    }

    fn write_body(&self, buf: &mut BytesMut) {
        match self {
            MySqlPacket::Handshake(p) => p.write_body(buf),
            MySqlPacket::Auth(p) => p.write_body(buf),
            MySqlPacket::Ok(p) => p.write_body(buf),
            MySqlPacket::Error(p) => p.write_body(buf),
            MySqlPacket::Eof(p) => p.write_body(buf),
            MySqlPacket::PrepareOk(p) => p.write_body(buf),
            MySqlPacket::Field(p) => p.write_body(buf),
            MySqlPacket::Command(p) => {
                buf.put_u8(p.command);
                buf.put_slice(&p.arg);
            }
        }
    }

    /// Encodes into a fresh buffer.
    pub fn to_bytes(&self, sequence: u8) -> BytesMut {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body_size());
        self.encode(sequence, &mut buf);
        buf
    }

    /// Human readable packet name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            MySqlPacket::Handshake(_) => "MySQL Handshake Packet",
            MySqlPacket::Auth(_) => "MySQL Authentication Packet",
            MySqlPacket::Ok(_) => "MySQL OK Packet",
            MySqlPacket::Error(_) => "MySQL Error Packet",
            MySqlPacket::Eof(_) => "MySQL EOF Packet",
            MySqlPacket::PrepareOk(_) => "MySQL Prepare OK Packet",
            MySqlPacket::Field(_) => "MySQL Field Packet",
            MySqlPacket::Command(_) => "MySQL Command Packet",
        }
    }
}

macro_rules! impl_from_packet {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(
            impl From<$ty> for MySqlPacket {
                fn from(packet: $ty) -> Self {
                    MySqlPacket::$variant(packet)
                }
            }
        )*
    };
}

impl_from_packet!(
    Handshake(HandshakePacket),
    Auth(AuthPacket),
    Ok(OkPacket),
    Error(ErrorPacket),
    Eof(EofPacket),
    PrepareOk(PrepareOkPacket),
    Field(FieldPacket),
    Command(CommandPacket),
);

/// Initial greeting from server to client.
///
/// ```text
/// 1   protocol_version (10)
/// n   server_version (null-terminated)
/// 4   thread_id
/// 8   seed, first part
/// 1   0x00
/// 2   server_capabilities (lower 16 bits)
/// 1   charset_index
/// 2   server_status
/// 13  filler
/// n   seed, rest (null-terminated)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakePacket {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    /// Full scramble seed (first 8 bytes + rest)
    pub seed: Vec<u8>,
    pub server_capabilities: u16,
    pub charset_index: u8,
    pub server_status: u16,
}

impl HandshakePacket {
    /// Builds a greeting with a fresh random 20-byte seed.
    pub fn new(thread_id: u32, server_version: impl Into<String>, charset_index: u8) -> Self {
        let seed = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(20)
            .collect();
        Self {
            protocol_version: 10,
            server_version: server_version.into(),
            thread_id,
            seed,
            server_capabilities: (capabilities::SERVER_CAPABILITIES & 0xFFFF) as u16,
            charset_index,
            server_status: server_status::SERVER_STATUS_AUTOCOMMIT,
        }
    }

    fn split_seed(&self) -> (&[u8], &[u8]) {
        let split = self.seed.len().min(8);
        self.seed.split_at(split)
    }

    fn body_size(&self) -> usize {
        let (first, rest) = self.split_seed();
        1 + self.server_version.len() + 1 + 4 + first.len() + 1 + 2 + 1 + 2
            + HANDSHAKE_FILLER_LENGTH
            + rest.len()
            + 1
    }

    fn write_body(&self, buf: &mut BytesMut) {
        let (first, rest) = self.split_seed();
        buf.put_u8(self.protocol_version);
        buf.put_null_string(self.server_version.as_bytes());
        buf.put_u32_le(self.thread_id);
        buf.put_null_string(first);
        buf.put_u16_le(self.server_capabilities);
        buf.put_u8(self.charset_index);
        buf.put_u16_le(self.server_status);
        buf.put_bytes(0, HANDSHAKE_FILLER_LENGTH);
        buf.put_null_string(rest);
    }

    /// Decodes a greeting frame.
    pub fn decode(frame: &[u8]) -> ParseResult<Self> {
        let mut reader = PacketReader::for_frame(frame)?;
        let protocol_version = reader.read_u8("protocol version")?;
        if protocol_version == ERROR_HEADER {
            return Err(ParseError::InvalidPacket(
                "server answered with an error instead of a handshake".to_string(),
            ));
        }
        let server_version = reader.read_null_string("server version")?;
        let thread_id = reader.read_u32_le("thread id")?;
        let mut seed = reader.read_bytes(8, "seed")?.to_vec();
        reader.skip(1, "seed terminator")?;
        let server_capabilities = reader.read_u16_le("server capabilities")?;
        let charset_index = reader.read_u8("charset index")?;
        let server_status = reader.read_u16_le("server status")?;
        reader.skip(HANDSHAKE_FILLER_LENGTH, "handshake filler")?;
        if reader.has_remaining() {
            let rest = reader.read_null_string("seed rest")?;
            seed.extend_from_slice(rest.as_bytes());
        }
        Ok(Self {
            protocol_version,
            server_version,
            thread_id,
            seed,
            server_capabilities,
            charset_index,
            server_status,
        })
    }
}

/// Client login request, sent in answer to the handshake.
///
/// ```text
/// 4   client_flags
/// 4   max_packet_size
/// 1   charset_index
/// 23  filler, always zero
/// n   user (null-terminated)
/// n   password (length-coded)
/// n   database (null-terminated, only with CLIENT_CONNECT_WITH_DB; omitted when `None`)
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthPacket {
    pub client_flags: u32,
    pub max_packet_size: u32,
    pub charset_index: u8,
    pub user: String,
    pub password: Vec<u8>,
    pub database: Option<String>,
}

impl AuthPacket {
    /// 4 + 4 + 1 + 23
    const FIXED_SIZE: usize = 32;

    fn body_size(&self) -> usize {
        Self::FIXED_SIZE
            + self.user.len()
            + 1
            + lenenc_bytes_size(&self.password)
            + self.database.as_ref().map_or(0, |db| db.len() + 1)
    }

    fn write_body(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.client_flags);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.charset_index);
        buf.put_bytes(0, AUTH_FILLER_LENGTH);
        buf.put_null_string(self.user.as_bytes());
        buf.put_lenenc_bytes(&self.password);
        if let Some(db) = &self.database {
            buf.put_null_string(db.as_bytes());
        }
    }

    /// Decodes a login request frame.
    pub fn decode(frame: &[u8]) -> ParseResult<Self> {
        let mut reader = PacketReader::for_frame(frame)?;
        let client_flags = reader.read_u32_le("client flags")?;
        let max_packet_size = reader.read_u32_le("max packet size")?;
        let charset_index = reader.read_u8("charset index")?;
        reader.skip(AUTH_FILLER_LENGTH, "filler")?;
        let user = reader.read_null_string("user")?;
        let password = if reader.has_remaining() {
            reader.read_lenenc_bytes("password")?
        } else {
            Vec::new()
        };
        let database = if client_flags & capabilities::CLIENT_CONNECT_WITH_DB != 0
            && reader.has_remaining()
        {
            Some(reader.read_null_string("database")?)
        } else {
            None
        };
        Ok(Self {
            client_flags,
            max_packet_size,
            charset_index,
            user,
            password,
            database,
        })
    }
}

/// Success response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub insert_id: u64,
    pub server_status: u16,
    pub warning_count: u16,
    pub message: Option<Vec<u8>>,
}

impl Default for OkPacket {
    fn default() -> Self {
        Self {
            affected_rows: 0,
            insert_id: 0,
            server_status: server_status::SERVER_STATUS_AUTOCOMMIT,
            warning_count: 0,
            message: None,
        }
    }
}

impl OkPacket {
    fn body_size(&self) -> usize {
        1 + lenenc_int_size(self.affected_rows)
            + lenenc_int_size(self.insert_id)
            + 4
            + self.message.as_deref().map_or(0, lenenc_bytes_size)
    }

    fn write_body(&self, buf: &mut BytesMut) {
        buf.put_u8(OK_HEADER);
        buf.put_lenenc_int(self.affected_rows);
        buf.put_lenenc_int(self.insert_id);
        buf.put_u16_le(self.server_status);
        buf.put_u16_le(self.warning_count);
        if let Some(message) = &self.message {
            buf.put_lenenc_bytes(message);
        }
    }

    pub fn decode(frame: &[u8]) -> ParseResult<Self> {
        let mut reader = PacketReader::for_frame(frame)?;
        let header = reader.read_u8("ok header")?;
        if header != OK_HEADER {
            return Err(ParseError::InvalidPacket(format!(
                "expected OK header, found {:#04x}",
                header
            )));
        }
        let affected_rows = reader.read_lenenc_int("affected rows")?.unwrap_or(0);
        let insert_id = reader.read_lenenc_int("insert id")?.unwrap_or(0);
        let server_status = reader.read_u16_le("server status")?;
        let warning_count = reader.read_u16_le("warning count")?;
        let message = if reader.has_remaining() {
            Some(reader.read_lenenc_bytes("message")?)
        } else {
            None
        };
        Ok(Self {
            affected_rows,
            insert_id,
            server_status,
            warning_count,
            message,
        })
    }
}

/// Failure response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPacket {
    pub errno: u16,
    pub sql_state: [u8; 5],
    pub message: String,
}

impl ErrorPacket {
    pub fn new(errno: u16, message: impl Into<String>) -> Self {
        Self {
            errno,
            sql_state: *error_code::DEFAULT_SQL_STATE,
            message: message.into(),
        }
    }

    fn body_size(&self) -> usize {
        1 + 2 + 1 + self.sql_state.len() + self.message.len()
    }

    fn write_body(&self, buf: &mut BytesMut) {
        buf.put_u8(ERROR_HEADER);
        buf.put_u16_le(self.errno);
        buf.put_u8(SQL_STATE_MARKER);
        buf.put_slice(&self.sql_state);
        buf.put_slice(self.message.as_bytes());
    }

    pub fn decode(frame: &[u8]) -> ParseResult<Self> {
        let mut reader = PacketReader::for_frame(frame)?;
        let header = reader.read_u8("error header")?;
        if header != ERROR_HEADER {
            return Err(ParseError::InvalidPacket(format!(
                "expected error header, found {:#04x}",
                header
            )));
        }
        let errno = reader.read_u16_le("errno")?;
        let mut sql_state = *error_code::DEFAULT_SQL_STATE;
        if reader.remaining() >= 6 && frame[reader.position()] == SQL_STATE_MARKER {
            reader.skip(1, "sql state marker")?;
            sql_state.copy_from_slice(reader.read_bytes(5, "sql state")?);
        }
        let message = reader.read_rest_string();
        Ok(Self {
            errno,
            sql_state,
            message,
        })
    }
}

/// End-of-data marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EofPacket {
    pub warning_count: u16,
    pub status: u16,
}

impl Default for EofPacket {
    fn default() -> Self {
        Self {
            warning_count: 0,
            status: server_status::SERVER_STATUS_AUTOCOMMIT,
        }
    }
}

impl EofPacket {
    fn write_body(&self, buf: &mut BytesMut) {
        buf.put_u8(EOF_HEADER);
        buf.put_u16_le(self.warning_count);
        buf.put_u16_le(self.status);
    }
}

/// First response to COM_STMT_PREPARE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareOkPacket {
    pub statement_id: u32,
    pub columns: u16,
    pub parameters: u16,
    pub warning_count: u16,
}

impl PrepareOkPacket {
    fn write_body(&self, buf: &mut BytesMut) {
        buf.put_u8(OK_HEADER);
        buf.put_u32_le(self.statement_id);
        buf.put_u16_le(self.columns);
        buf.put_u16_le(self.parameters);
        buf.put_u8(0);
        buf.put_u16_le(self.warning_count);
    }
}

/// Column definition (protocol 4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPacket {
    pub catalog: String,
    pub db: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    pub charset_index: u16,
    pub length: u32,
    pub field_type: u8,
    pub flags: u16,
    pub decimals: u8,
}

impl FieldPacket {
    /// Definition for an untyped `?` placeholder.
    pub fn parameter(charset_index: u8) -> Self {
        Self {
            catalog: "def".to_string(),
            db: String::new(),
            table: String::new(),
            org_table: String::new(),
            name: "?".to_string(),
            org_name: String::new(),
            charset_index: u16::from(charset_index),
            length: 0,
            field_type: FIELD_TYPE_VAR_STRING,
            flags: 0,
            decimals: 0,
        }
    }

    fn strings(&self) -> [&str; 6] {
        [
            &self.catalog,
            &self.db,
            &self.table,
            &self.org_table,
            &self.name,
            &self.org_name,
        ]
    }

    fn body_size(&self) -> usize {
        let strings: usize = self
            .strings()
            .iter()
            .map(|s| lenenc_bytes_size(s.as_bytes()))
            .sum();
        // fixed-length block: 0x0c + 2 + 4 + 1 + 2 + 1 + 2 filler
        strings + 13
    }

    fn write_body(&self, buf: &mut BytesMut) {
        for s in self.strings() {
            buf.put_lenenc_bytes(s.as_bytes());
        }
        buf.put_u8(0x0c);
        buf.put_u16_le(self.charset_index);
        buf.put_u32_le(self.length);
        buf.put_u8(self.field_type);
        buf.put_u16_le(self.flags);
        buf.put_u8(self.decimals);
        buf.put_bytes(0, 2);
    }
}

/// A command request: command byte followed by its argument bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    pub command: u8,
    pub arg: Vec<u8>,
}

impl CommandPacket {
    pub fn new(command: u8, arg: impl Into<Vec<u8>>) -> Self {
        Self {
            command,
            arg: arg.into(),
        }
    }

    pub fn decode(frame: &[u8]) -> ParseResult<Self> {
        let mut reader = PacketReader::for_frame(frame)?;
        let command = reader.read_u8("command")?;
        Ok(Self {
            command,
            arg: reader.read_rest().to_vec(),
        })
    }
}
