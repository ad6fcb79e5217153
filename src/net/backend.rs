//! Backend Connection
//!
//! A link from the proxy to a downstream MySQL node.
//!
//! ```text
//! Connector   ──> non-blocking connect completes, processor bound
//! node        ──> Handshake (seq 0)
//! proxy       <── Auth (seq 1, mysql_native_password scramble)
//! node        ──> OK   -> ready, BackendHandler::connected
//!                 ERR  -> error callback, closed
//! node        ──> any later frame -> BackendHandler::handle
//! ```
//!
//! Frames are handled inline on the R-loop. Handlers push anything that
//! may block onto the processor's executor pool.

use crate::config::SystemConfig;
use crate::net::connection::{ConnectionCore, ConnectionError, ErrorKind, NioConnection};
use crate::net::factory::configure_socket;
use crate::protocol::security::scramble_native_password;
use crate::protocol::types::{capabilities, Command, HEADER_SIZE};
use crate::protocol::{AuthPacket, CommandPacket, ErrorPacket, HandshakePacket, MySqlPacket};
use anyhow::{anyhow, bail};
use mio::net::TcpStream;
use mio::{Registry, Token};
use std::error::Error as StdError;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Login details for a backend node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCredentials {
    pub user: String,
    pub password: String,
    pub database: Option<String>,
    pub charset_index: u8,
}

/// Receives the events of a backend link.
pub trait BackendHandler: Send + Sync {
    /// Login succeeded; the link accepts commands.
    fn connected(&self, conn: &BackendConnection) -> anyhow::Result<()> {
        let _ = conn;
        Ok(())
    }

    /// A frame (header included) arrived after login.
    fn handle(&self, conn: &BackendConnection, frame: &[u8]) -> anyhow::Result<()>;

    /// The link failed; it is closed right after this returns.
    fn connection_error(&self, conn: &BackendConnection, kind: ErrorKind, cause: &(dyn StdError + 'static)) {
        let _ = (conn, kind, cause);
    }

    /// The socket was closed.
    fn closed(&self, conn: &BackendConnection) {
        let _ = conn;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Phase {
    AwaitHandshake = 0,
    Authenticating = 1,
    Ready = 2,
}

/// A connection to a backend node.
pub struct BackendConnection {
    core: ConnectionCore,
    addr: SocketAddr,
    credentials: BackendCredentials,
    handler: Arc<dyn BackendHandler>,
    phase: AtomicU8,
    thread_id: AtomicU32,
}

impl BackendConnection {
    /// Starts a non-blocking connect to `addr`. Hand the result to
    /// [`Connector::post_connect`](crate::net::Connector::post_connect).
    pub fn connect(
        addr: SocketAddr,
        credentials: BackendCredentials,
        handler: Arc<dyn BackendHandler>,
        config: &SystemConfig,
    ) -> io::Result<Arc<Self>> {
        let stream = TcpStream::connect(addr)?;
        configure_socket(&stream, config)?;
        Ok(Self::new(stream, addr, credentials, handler, config))
    }

    pub fn new(
        socket: TcpStream,
        addr: SocketAddr,
        credentials: BackendCredentials,
        handler: Arc<dyn BackendHandler>,
        config: &SystemConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let this: Weak<dyn NioConnection> = me.clone();
            Self {
                core: ConnectionCore::new(
                    socket,
                    addr,
                    this,
                    config.max_packet_size,
                    config.idle_timeout,
                ),
                addr,
                credentials,
                handler,
                phase: AtomicU8::new(Phase::AwaitHandshake as u8),
                thread_id: AtomicU32::new(0),
            }
        })
    }

    pub fn core(&self) -> &ConnectionCore {
        &self.core
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn credentials(&self) -> &BackendCredentials {
        &self.credentials
    }

    /// Connection id the node assigned in its handshake.
    pub fn thread_id(&self) -> u32 {
        self.thread_id.load(Ordering::Acquire)
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase() == Phase::Ready
    }

    fn phase(&self) -> Phase {
        match self.phase.load(Ordering::Acquire) {
            0 => Phase::AwaitHandshake,
            1 => Phase::Authenticating,
            _ => Phase::Ready,
        }
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Checks a pending non-blocking connect. `Ok(false)` means still in
    /// progress.
    pub fn finish_connect(&self) -> io::Result<bool> {
        self.core.with_socket(|socket| {
            if let Some(e) = socket.take_error()? {
                return Err(e);
            }
            match socket.peer_addr() {
                Ok(_) => Ok(true),
                Err(e)
                    if e.kind() == io::ErrorKind::NotConnected
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    Ok(false)
                }
                Err(e) => Err(e),
            }
        })
    }

    pub fn write_packet(&self, packet: &MySqlPacket, seq: u8) {
        self.core.write_packet(packet, seq);
    }

    /// Sends a command, starting a new sequence.
    pub fn send_command(&self, command: Command, arg: impl Into<Vec<u8>>) {
        self.write_packet(&MySqlPacket::from(CommandPacket::new(command.as_byte(), arg)), 0);
    }

    pub fn query(&self, sql: &str) {
        self.send_command(Command::Query, sql.as_bytes());
    }

    pub fn ping(&self) {
        self.send_command(Command::Ping, Vec::new());
    }

    /// Says goodbye to the node and closes the socket.
    pub fn quit(&self) -> anyhow::Result<()> {
        self.send_command(Command::Quit, Vec::new());
        self.core.flush()?;
        self.close();
        Ok(())
    }

    fn handle_frame(&self, frame: &[u8]) -> anyhow::Result<()> {
        match self.phase() {
            Phase::AwaitHandshake => self.answer_handshake(frame),
            Phase::Authenticating => self.finish_login(frame),
            Phase::Ready => self.handler.handle(self, frame),
        }
    }

    fn answer_handshake(&self, frame: &[u8]) -> anyhow::Result<()> {
        if frame.get(HEADER_SIZE) == Some(&0xFF) {
            let err = ErrorPacket::decode(frame)?;
            bail!("node refused connection: {} {}", err.errno, err.message);
        }
        let handshake = HandshakePacket::decode(frame)?;
        self.thread_id.store(handshake.thread_id, Ordering::Release);

        let creds = &self.credentials;
        let mut client_flags = capabilities::BACKEND_CLIENT_FLAGS;
        if creds.database.is_none() {
            client_flags &= !capabilities::CLIENT_CONNECT_WITH_DB;
        }
        let auth = AuthPacket {
            client_flags,
            max_packet_size: u32::try_from(self.core.max_packet_size()).unwrap_or(u32::MAX),
            charset_index: creds.charset_index,
            user: creds.user.clone(),
            password: scramble_native_password(creds.password.as_bytes(), &handshake.seed),
            database: creds.database.clone(),
        };

        let seq = frame.get(3).copied().unwrap_or(0).wrapping_add(1);
        self.set_phase(Phase::Authenticating);
        self.write_packet(&MySqlPacket::Auth(auth), seq);
        debug!(
            conn = self.id(),
            node = %self.addr,
            server_version = %handshake.server_version,
            "Answered node handshake"
        );
        Ok(())
    }

    fn finish_login(&self, frame: &[u8]) -> anyhow::Result<()> {
        match frame.get(HEADER_SIZE) {
            Some(0x00) => {
                self.set_phase(Phase::Ready);
                info!(
                    conn = self.id(),
                    node = %self.addr,
                    user = %self.credentials.user,
                    "Backend authenticated"
                );
                self.handler.connected(self)
            }
            Some(0xFF) => {
                let err = ErrorPacket::decode(frame)?;
                bail!("login to {} failed: {} {}", self.addr, err.errno, err.message);
            }
            Some(0xFE) => Err(anyhow!("node {} requested an unsupported auth method", self.addr)),
            _ => Err(anyhow!("unexpected login reply from {}", self.addr)),
        }
    }
}

impl NioConnection for BackendConnection {
    fn id(&self) -> u32 {
        self.core.id()
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    fn register(&self, registry: &Arc<Registry>, token: Token) -> Result<(), ConnectionError> {
        self.core.register_socket(registry, token)
    }

    fn read(&self) -> Result<(), ConnectionError> {
        let outcome = self.core.read_frames()?;
        for frame in outcome.frames {
            if self.is_closed() {
                break;
            }
            if let Err(e) = self.handle_frame(&frame) {
                self.error(ErrorKind::HandleData, &*e);
            }
        }
        if outcome.eof {
            debug!(conn = self.id(), node = %self.addr, "Node closed the connection");
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
        self.handler.connection_error(self, kind, cause);
        self.close();
    }

    fn close(&self) -> bool {
        if !self.core.close_socket() {
            return false;
        }
        self.handler.closed(self);
        true
    }

    fn cleanup(&self) {
        self.core.release();
    }

    fn idle_check(&self) {
        if self.core.is_idle_timeout() {
            debug!(conn = self.id(), node = %self.addr, "Idle timeout");
            self.close();
        }
    }
}
