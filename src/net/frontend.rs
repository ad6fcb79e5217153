//! Frontend Connection
//!
//! A connection from a MySQL client to the proxy.
//!
//! ## Protocol Flow
//!
//! ```text
//! register()  ──> Handshake (seq 0, 20-byte seed)
//! client      ──> Auth packet
//!   ok        <── OK (seq 2), command mode
//!   denied    <── ER_ACCESS_DENIED_ERROR (seq 2), stays open
//! client      ──> command frames ──handler pool──> FrontendCommandHandler
//! ```
//!
//! The semantic work (credential checks, query routing, killing sessions,
//! executing statements) belongs to a [`SessionHandler`] collaborator.

use crate::commands::FrontendCommandHandler;
use crate::config::SystemConfig;
use crate::net::connection::{
    duration_millis, ConnectionCore, ConnectionError, ErrorKind, NioConnection,
};
use crate::net::lock;
use crate::protocol::types::error_code;
use crate::protocol::{
    AuthPacket, EofPacket, ErrorPacket, FieldPacket, HandshakePacket, MySqlPacket, OkPacket,
    PacketReader, PrepareOkPacket,
};
use crate::SERVER_VERSION;
use bytes::Bytes;
use mio::net::TcpStream;
use mio::{Registry, Token};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info};

/// Collaborator that gives meaning to a client session.
///
/// Hooks run on the processor's handler pool. They answer the client
/// through the connection (`write_ok`, `write_err_message`,
/// `write_packet`). An `Err` is reported to the client as an `ER_YES` error
/// packet and the connection stays open.
pub trait SessionHandler: Send + Sync {
    /// Verifies a login. `seed` is the scramble sent in the handshake.
    fn authenticate(&self, auth: &AuthPacket, seed: &[u8]) -> Result<(), ErrorPacket>;

    /// Switches the active schema. The default accepts any name.
    fn init_db(&self, conn: &FrontendConnection, schema: &str) -> anyhow::Result<()> {
        conn.set_schema(Some(schema.to_string()));
        conn.write_ok(1);
        Ok(())
    }

    fn query(&self, conn: &FrontendConnection, sql: &str) -> anyhow::Result<()>;

    /// Terminates connection `target`.
    fn kill(&self, conn: &FrontendConnection, target: u32) -> anyhow::Result<()> {
        let _ = target;
        conn.write_err_message(1, error_code::ER_UNKNOWN_COM_ERROR, "Unknown command");
        Ok(())
    }

    /// Executes a prepared statement; `frame` is the raw COM_STMT_EXECUTE.
    fn stmt_execute(
        &self,
        conn: &FrontendConnection,
        stmt: &PreparedStatement,
        frame: &[u8],
    ) -> anyhow::Result<()> {
        let _ = (stmt, frame);
        conn.write_err_message(
            1,
            error_code::ER_NOT_SUPPORTED_YET,
            "Prepared statement execution is not supported",
        );
        Ok(())
    }

    /// Keep-alive from a peer node.
    fn heartbeat(&self, conn: &FrontendConnection, frame: &[u8]) -> anyhow::Result<()> {
        let _ = frame;
        conn.write_ok(1);
        Ok(())
    }
}

/// A statement registered by COM_STMT_PREPARE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    pub id: u32,
    pub sql: String,
    pub parameters: u16,
}

/// A client connection.
pub struct FrontendConnection {
    core: ConnectionCore,
    me: Weak<FrontendConnection>,
    session: Arc<dyn SessionHandler>,
    charset: String,
    charset_index: u8,
    seed: Mutex<Vec<u8>>,
    authenticated: AtomicBool,
    user: Mutex<Option<String>>,
    schema: Mutex<Option<String>>,
    statements: Mutex<HashMap<u32, PreparedStatement>>,
    next_statement_id: AtomicU32,
}

impl FrontendConnection {
    pub fn new(
        socket: TcpStream,
        peer: SocketAddr,
        session: Arc<dyn SessionHandler>,
        config: &SystemConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let this: Weak<dyn NioConnection> = me.clone();
            Self {
                core: ConnectionCore::new(
                    socket,
                    peer,
                    this,
                    config.max_packet_size,
                    config.idle_timeout,
                ),
                me: me.clone(),
                session,
                charset: config.charset.clone(),
                charset_index: config.charset_index(),
                seed: Mutex::new(Vec::new()),
                authenticated: AtomicBool::new(false),
                user: Mutex::new(None),
                schema: Mutex::new(None),
                statements: Mutex::new(HashMap::new()),
                next_statement_id: AtomicU32::new(0),
            }
        })
    }

    pub fn core(&self) -> &ConnectionCore {
        &self.core
    }

    pub fn charset(&self) -> &str {
        &self.charset
    }

    pub fn charset_index(&self) -> u8 {
        self.charset_index
    }

    /// Scramble seed sent in the handshake.
    pub fn seed(&self) -> Vec<u8> {
        lock(&self.seed).clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn user(&self) -> Option<String> {
        lock(&self.user).clone()
    }

    pub fn schema(&self) -> Option<String> {
        lock(&self.schema).clone()
    }

    pub fn set_schema(&self, schema: Option<String>) {
        *lock(&self.schema) = schema;
    }

    pub fn statement(&self, id: u32) -> Option<PreparedStatement> {
        lock(&self.statements).get(&id).cloned()
    }

    pub fn write_packet(&self, packet: &MySqlPacket, seq: u8) {
        self.core.write_packet(packet, seq);
    }

    pub fn write_ok(&self, seq: u8) {
        self.write_packet(&MySqlPacket::Ok(OkPacket::default()), seq);
    }

    pub fn write_err_message(&self, seq: u8, errno: u16, message: impl Into<String>) {
        self.write_packet(&MySqlPacket::Error(ErrorPacket::new(errno, message)), seq);
    }

    /// Runs frame handling on the handler pool, or inline when the
    /// connection has no processor.
    fn dispatch(&self, frame: Bytes) {
        let processor = self.core.processor();
        match (processor, self.me.upgrade()) {
            (Some(processor), Some(conn)) => {
                processor.handler().execute(move || conn.handle_frame(&frame));
            }
            _ => self.handle_frame(&frame),
        }
    }

    fn handle_frame(&self, frame: &[u8]) {
        if self.is_closed() {
            return;
        }
        let result = if self.is_authenticated() {
            FrontendCommandHandler::new(self).handle(frame)
        } else {
            self.authenticate(frame);
            Ok(())
        };
        if let Err(e) = result {
            self.error(ErrorKind::HandleData, &*e);
        }
    }

    fn authenticate(&self, frame: &[u8]) {
        let auth = match AuthPacket::decode(frame) {
            Ok(auth) => auth,
            Err(e) => {
                debug!(conn = self.id(), error = %e, "Malformed authentication packet");
                self.write_err_message(
                    2,
                    error_code::ER_ACCESS_DENIED_ERROR,
                    "Malformed authentication packet",
                );
                return;
            }
        };

        let seed = self.seed();
        match self.session.authenticate(&auth, &seed) {
            Ok(()) => {
                info!(
                    conn = self.id(),
                    user = %auth.user,
                    host = %self.core.host(),
                    "Client authenticated"
                );
                *lock(&self.user) = Some(auth.user);
                self.set_schema(auth.database.filter(|db| !db.is_empty()));
                self.authenticated.store(true, Ordering::Release);
                self.write_ok(2);
            }
            Err(denied) => {
                info!(conn = self.id(), user = %auth.user, errno = denied.errno, "Authentication failed");
                self.write_packet(&MySqlPacket::Error(denied), 2);
            }
        }
    }

    pub(crate) fn init_db(&self, frame: &[u8]) -> anyhow::Result<()> {
        let mut reader = PacketReader::for_frame(frame)?;
        reader.skip(1, "command")?;
        let schema = reader.read_rest_string();
        if schema.is_empty() {
            self.write_err_message(1, error_code::ER_NO_DB_ERROR, "No database selected");
            return Ok(());
        }
        self.session.init_db(self, &schema)
    }

    pub(crate) fn query(&self, frame: &[u8]) -> anyhow::Result<()> {
        let sql = Self::read_sql(frame)?;
        if sql.trim().is_empty() {
            self.write_err_message(1, error_code::ER_NOT_ALLOWED_COMMAND, "Empty SQL");
            return Ok(());
        }
        self.session.query(self, &sql)
    }

    pub(crate) fn ping(&self) {
        self.write_ok(1);
    }

    pub(crate) fn kill(&self, frame: &[u8]) -> anyhow::Result<()> {
        let mut reader = PacketReader::for_frame(frame)?;
        reader.skip(1, "command")?;
        let target = reader.read_u32_le("connection id")?;
        self.session.kill(self, target)
    }

    pub(crate) fn stmt_prepare(&self, frame: &[u8]) -> anyhow::Result<()> {
        let sql = Self::read_sql(frame)?;
        if sql.trim().is_empty() {
            self.write_err_message(1, error_code::ER_NOT_ALLOWED_COMMAND, "Empty SQL");
            return Ok(());
        }

        let parameters = u16::try_from(sql.matches('?').count()).unwrap_or(u16::MAX);
        let id = self.next_statement_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        lock(&self.statements).insert(
            id,
            PreparedStatement {
                id,
                sql,
                parameters,
            },
        );

        // PREPARE_OK, one definition per parameter, then EOF; one chunk
        let mut chunk = self.core.allocate();
        let mut seq = 1u8;
        MySqlPacket::PrepareOk(PrepareOkPacket {
            statement_id: id,
            columns: 0,
            parameters,
            warning_count: 0,
        })
        .encode(seq, &mut chunk);
        if parameters > 0 {
            let field = MySqlPacket::Field(FieldPacket::parameter(self.charset_index));
            for _ in 0..parameters {
                seq = seq.wrapping_add(1);
                field.encode(seq, &mut chunk);
            }
            seq = seq.wrapping_add(1);
            MySqlPacket::Eof(EofPacket::default()).encode(seq, &mut chunk);
        }
        debug!(conn = self.id(), statement = id, parameters, "Statement prepared");
        self.core.write(chunk);
        Ok(())
    }

    pub(crate) fn stmt_execute(&self, frame: &[u8]) -> anyhow::Result<()> {
        let id = Self::read_statement_id(frame)?;
        match self.statement(id) {
            Some(stmt) => self.session.stmt_execute(self, &stmt, frame),
            None => {
                self.write_err_message(
                    1,
                    error_code::ER_UNKNOWN_STMT_HANDLER,
                    format!("Unknown prepared statement handler ({}) given to mysqld_stmt_execute", id),
                );
                Ok(())
            }
        }
    }

    pub(crate) fn stmt_close(&self, frame: &[u8]) -> anyhow::Result<()> {
        let id = Self::read_statement_id(frame)?;
        lock(&self.statements).remove(&id);
        Ok(())
    }

    pub(crate) fn heartbeat(&self, frame: &[u8]) -> anyhow::Result<()> {
        self.session.heartbeat(self, frame)
    }

    fn read_sql(frame: &[u8]) -> anyhow::Result<String> {
        let mut reader = PacketReader::for_frame(frame)?;
        reader.skip(1, "command")?;
        Ok(reader.read_rest_string())
    }

    fn read_statement_id(frame: &[u8]) -> anyhow::Result<u32> {
        let mut reader = PacketReader::for_frame(frame)?;
        reader.skip(1, "command")?;
        Ok(reader.read_u32_le("statement id")?)
    }
}

impl NioConnection for FrontendConnection {
    fn id(&self) -> u32 {
        self.core.id()
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    fn register(&self, registry: &Arc<Registry>, token: Token) -> Result<(), ConnectionError> {
        self.core.register_socket(registry, token)?;

        let handshake = HandshakePacket::new(self.id(), SERVER_VERSION, self.charset_index);
        *lock(&self.seed) = handshake.seed.clone();
        self.write_packet(&MySqlPacket::Handshake(handshake), 0);
        Ok(())
    }

    fn read(&self) -> Result<(), ConnectionError> {
        let outcome = self.core.read_frames()?;
        for frame in outcome.frames {
            self.dispatch(frame);
        }
        if outcome.eof {
            debug!(conn = self.id(), "Client closed the connection");
            self.close();
        }
        Ok(())
    }

    fn write_by_event(&self) -> Result<(), ConnectionError> {
        self.core.flush()
    }

    fn write_by_queue(&self) -> Result<(), ConnectionError> {
        self.core.flush()
    }

    fn error(&self, kind: ErrorKind, cause: &(dyn StdError + 'static)) {
        self.core.log_error(kind, cause);
        match kind {
            ErrorKind::HandleData => {
                self.write_err_message(1, error_code::ER_YES, cause.to_string());
            }
            _ => {
                self.close();
            }
        }
    }

    fn close(&self) -> bool {
        self.core.close_socket()
    }

    fn cleanup(&self) {
        self.core.release();
        lock(&self.statements).clear();
    }

    fn idle_check(&self) {
        if self.core.is_idle_timeout() {
            debug!(
                conn = self.id(),
                host = %self.core.host(),
                idle_timeout_ms = duration_millis(self.core.idle_timeout()),
                "Idle timeout"
            );
            self.close();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::net::connection::test_support::{read_frame, shared_registry, socket_pair};
    use crate::net::processor::tests::test_config;
    use crate::net::processor::Processor;
    use crate::protocol::security::{scramble_native_password, verify_native_password};
    use crate::protocol::types::capabilities;
    use crate::protocol::CommandPacket;
    use mio::Poll;
    use std::io::Write;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Accepts `root`/`secret`, records queries and answers them with OK.
    #[derive(Default)]
    pub(crate) struct RecordingSession {
        pub queries: Mutex<Vec<String>>,
        pub fail_queries: bool,
    }

    impl SessionHandler for RecordingSession {
        fn authenticate(&self, auth: &AuthPacket, seed: &[u8]) -> Result<(), ErrorPacket> {
            if auth.user == "root" && verify_native_password(b"secret", seed, &auth.password) {
                Ok(())
            } else {
                Err(ErrorPacket::new(
                    error_code::ER_ACCESS_DENIED_ERROR,
                    format!("Access denied for user '{}'", auth.user),
                ))
            }
        }

        fn query(&self, conn: &FrontendConnection, sql: &str) -> anyhow::Result<()> {
            if self.fail_queries {
                anyhow::bail!("no route for {}", sql);
            }
            lock(&self.queries).push(sql.to_string());
            conn.write_ok(1);
            Ok(())
        }
    }

    struct Harness {
        processor: Arc<Processor>,
        conn: Arc<FrontendConnection>,
        client: std::net::TcpStream,
        session: Arc<RecordingSession>,
        _poll: Poll,
    }

    impl Harness {
        fn new(session: RecordingSession) -> Self {
            let processor = Arc::new(Processor::new("Processor0", &test_config()).unwrap());
            let session = Arc::new(session);
            let (socket, peer, client) = socket_pair();
            let conn = FrontendConnection::new(socket, peer, session.clone(), &test_config());
            conn.core().set_id(1);
            conn.core().set_accepted(true);
            conn.core().set_processor(Arc::clone(&processor));
            processor.add_frontend(Arc::clone(&conn));

            let poll = Poll::new().unwrap();
            conn.register(&shared_registry(&poll), Token(1)).unwrap();
            conn.write_by_queue().unwrap();

            Self {
                processor,
                conn,
                client,
                session,
                _poll: poll,
            }
        }

        fn logged_in(session: RecordingSession) -> Self {
            let mut harness = Self::new(session);
            let handshake = HandshakePacket::decode(&read_frame(&mut harness.client)).unwrap();
            let auth = login_packet("root", b"secret", &handshake.seed, Some("orders"));
            let reply = harness.exchange(&auth);
            assert_eq!(reply[4], 0x00);
            harness
        }

        fn send(&mut self, frame: &[u8]) {
            self.client.write_all(frame).unwrap();
        }

        /// Sends `frame`, waits for the connection to queue a reply and
        /// flushes it.
        fn exchange(&mut self, frame: &[u8]) -> Vec<u8> {
            self.send(frame);
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.conn.core().pending_chunks() == 0 && Instant::now() < deadline {
                self.conn.read().unwrap();
                thread::sleep(Duration::from_millis(2));
            }
            self.conn.write_by_queue().unwrap();
            read_frame(&mut self.client)
        }

        fn command(&mut self, command: u8, arg: &[u8]) -> Vec<u8> {
            let frame = MySqlPacket::from(CommandPacket::new(command, arg.to_vec())).to_bytes(0);
            self.exchange(&frame)
        }
    }

    fn login_packet(user: &str, password: &[u8], seed: &[u8], db: Option<&str>) -> Vec<u8> {
        let auth = AuthPacket {
            client_flags: capabilities::BACKEND_CLIENT_FLAGS,
            max_packet_size: 16 * 1024 * 1024,
            charset_index: 33,
            user: user.to_string(),
            password: scramble_native_password(password, seed),
            database: db.map(str::to_string),
        };
        MySqlPacket::Auth(auth).to_bytes(1).to_vec()
    }

    fn errno(frame: &[u8]) -> u16 {
        ErrorPacket::decode(frame).unwrap().errno
    }

    #[test]
    fn test_handshake_on_register() {
        let mut harness = Harness::new(RecordingSession::default());
        let frame = read_frame(&mut harness.client);

        assert_eq!(frame[3], 0, "handshake uses sequence 0");
        let handshake = HandshakePacket::decode(&frame).unwrap();
        assert_eq!(handshake.protocol_version, 10);
        assert_eq!(handshake.thread_id, 1);
        assert_eq!(handshake.seed, harness.conn.seed());
        assert_eq!(handshake.seed.len(), 20);
        assert_eq!(handshake.server_version, SERVER_VERSION);
    }

    #[test]
    fn test_login_success() {
        let mut harness = Harness::new(RecordingSession::default());
        let handshake = HandshakePacket::decode(&read_frame(&mut harness.client)).unwrap();

        let reply = harness.exchange(&login_packet("root", b"secret", &handshake.seed, Some("orders")));
        assert_eq!(reply[3], 2);
        assert_eq!(reply[4], 0x00);
        assert!(harness.conn.is_authenticated());
        assert_eq!(harness.conn.user().as_deref(), Some("root"));
        assert_eq!(harness.conn.schema().as_deref(), Some("orders"));
    }

    #[test]
    fn test_login_denied_keeps_connection_open() {
        let mut harness = Harness::new(RecordingSession::default());
        let handshake = HandshakePacket::decode(&read_frame(&mut harness.client)).unwrap();

        let reply = harness.exchange(&login_packet("root", b"wrong", &handshake.seed, None));
        assert_eq!(reply[3], 2);
        assert_eq!(errno(&reply), error_code::ER_ACCESS_DENIED_ERROR);
        assert!(!harness.conn.is_authenticated());
        assert!(!harness.conn.is_closed());
    }

    #[test]
    fn test_query_dispatch() {
        let mut harness = Harness::logged_in(RecordingSession::default());

        let reply = harness.command(0x03, b"SELECT 1");
        assert_eq!(reply[4], 0x00);
        assert_eq!(*lock(&harness.session.queries), vec!["SELECT 1".to_string()]);
        assert_eq!(harness.processor.command_count().query(), 1);
    }

    #[test]
    fn test_unknown_command_keeps_connection_open() {
        let mut harness = Harness::logged_in(RecordingSession::default());

        let reply = harness.command(0x7f, b"");
        let err = ErrorPacket::decode(&reply).unwrap();
        assert_eq!(err.errno, error_code::ER_UNKNOWN_COM_ERROR);
        assert_eq!(err.message, "Unknown command");
        assert!(!harness.conn.is_closed());
        assert_eq!(harness.processor.command_count().other(), 1);

        // still usable afterwards
        let reply = harness.command(0x0e, b"");
        assert_eq!(reply[4], 0x00);
    }

    #[test]
    fn test_empty_query_and_schema() {
        let mut harness = Harness::logged_in(RecordingSession::default());

        assert_eq!(errno(&harness.command(0x03, b"  ")), error_code::ER_NOT_ALLOWED_COMMAND);
        assert_eq!(errno(&harness.command(0x02, b"")), error_code::ER_NO_DB_ERROR);

        let reply = harness.command(0x02, b"shop");
        assert_eq!(reply[4], 0x00);
        assert_eq!(harness.conn.schema().as_deref(), Some("shop"));
        assert!(lock(&harness.session.queries).is_empty());
    }

    #[test]
    fn test_handler_error_becomes_error_packet() {
        let mut harness = Harness::logged_in(RecordingSession {
            fail_queries: true,
            ..Default::default()
        });

        let err = ErrorPacket::decode(&harness.command(0x03, b"SELECT 1")).unwrap();
        assert_eq!(err.errno, error_code::ER_YES);
        assert!(err.message.contains("no route"));
        assert!(!harness.conn.is_closed());
    }

    #[test]
    fn test_kill_defaults_to_unknown_command() {
        let mut harness = Harness::logged_in(RecordingSession::default());
        let reply = harness.command(0x0c, &7u32.to_le_bytes());
        assert_eq!(errno(&reply), error_code::ER_UNKNOWN_COM_ERROR);
        assert_eq!(harness.processor.command_count().kill(), 1);
    }

    #[test]
    fn test_prepared_statement_lifecycle() {
        let mut harness = Harness::logged_in(RecordingSession::default());

        let reply = harness.command(0x16, b"SELECT * FROM t WHERE a = ? AND b = ?");
        assert_eq!(reply[4], 0x00);
        let id = u32::from_le_bytes([reply[5], reply[6], reply[7], reply[8]]);
        let params = u16::from_le_bytes([reply[11], reply[12]]);
        assert_eq!(params, 2);
        for seq in 2..=3 {
            let field = read_frame(&mut harness.client);
            assert_eq!(field[3], seq);
        }
        let eof = read_frame(&mut harness.client);
        assert_eq!(eof[4], 0xFE);
        assert_eq!(eof[3], 4);
        assert_eq!(harness.conn.statement(id).unwrap().parameters, 2);

        let reply = harness.command(0x17, &id.to_le_bytes());
        assert_eq!(errno(&reply), error_code::ER_NOT_SUPPORTED_YET);

        let reply = harness.command(0x17, &99u32.to_le_bytes());
        assert_eq!(errno(&reply), error_code::ER_UNKNOWN_STMT_HANDLER);

        let close = MySqlPacket::from(CommandPacket::new(0x19, id.to_le_bytes().to_vec())).to_bytes(0);
        harness.send(&close);
        let deadline = Instant::now() + Duration::from_secs(5);
        while harness.conn.statement(id).is_some() && Instant::now() < deadline {
            harness.conn.read().unwrap();
            thread::sleep(Duration::from_millis(2));
        }
        assert!(harness.conn.statement(id).is_none());
        assert_eq!(harness.processor.command_count().stmt_close(), 1);
    }

    #[test]
    fn test_quit_closes() {
        let mut harness = Harness::logged_in(RecordingSession::default());
        let quit = MySqlPacket::from(CommandPacket::new(0x01, Vec::new())).to_bytes(0);
        harness.send(&quit);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !harness.conn.is_closed() && Instant::now() < deadline {
            harness.conn.read().unwrap();
            thread::sleep(Duration::from_millis(2));
        }
        assert!(harness.conn.is_closed());
        assert_eq!(harness.processor.command_count().quit(), 1);
    }
}
