//! Connection Core
//!
//! State shared by every connection variant: the socket, the inbound staging
//! buffer, the ordered output queue, activity timestamps and the closed flag.
//! Variants (`FrontendConnection`, `BackendConnection`) embed a
//! [`ConnectionCore`] and implement [`NioConnection`] on top of it.
//!
//! ## Lifecycle
//!
//! ```text
//! Created ──register()──> Registered ──first I/O──> Active
//!                                                     │
//!                    error() / quit / idle_check()    │
//!                                                     ▼
//!                   Cleaned <──sweep── Closed <── Closing
//! ```
//!
//! ## Write Path
//!
//! Producers append chunks to the output queue and post the connection to
//! the reactor's write queue. Two paths drain it: the W-loop
//! (`write_by_queue`) and WRITABLE readiness on the R-loop
//! (`write_by_event`). Both go through [`ConnectionCore::flush`], which holds
//! the per-connection flush lock for the whole drain and always pops from the
//! head, so at most one thread writes a given socket and bytes leave in
//! submission order whichever path triggered the flush.
//!
//! Lock order is flush -> socket -> queue. Producers only take the queue lock.

use crate::buffer::DEFAULT_CHUNK_SIZE;
use crate::net::processor::Processor;
use crate::net::lock;
use crate::protocol::{FrameDecoder, MySqlPacket, ParseError};
use bytes::{Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

/// Milliseconds since the Unix epoch.
pub fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_millis)
        .unwrap_or_default()
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// What went wrong, reported through [`NioConnection::error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Register,
    Read,
    WriteByEvent,
    WriteByQueue,
    HandleData,
    Connect,
}

impl ErrorKind {
    /// Stable numeric code used in logs.
    pub fn code(self) -> u32 {
        match self {
            ErrorKind::Register => 3001,
            ErrorKind::Read => 3002,
            ErrorKind::WriteByEvent => 3003,
            ErrorKind::WriteByQueue => 3004,
            ErrorKind::HandleData => 3005,
            ErrorKind::Connect => 3006,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Register => "register",
            ErrorKind::Read => "read",
            ErrorKind::WriteByEvent => "write_by_event",
            ErrorKind::WriteByQueue => "write_by_queue",
            ErrorKind::HandleData => "handle_data",
            ErrorKind::Connect => "connect",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.code())
    }
}

/// Errors raised on the connection I/O paths.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An inbound frame exceeds the configured maximum
    #[error("packet too large: {size} bytes (max: {max})")]
    PacketTooLarge { size: usize, max: usize },

    /// Malformed packet body
    #[error("parse error: {0}")]
    Parse(ParseError),

    /// The socket has already been closed
    #[error("connection closed")]
    Closed,

    /// The connection has no processor to hand work to
    #[error("connection is not bound to a processor")]
    NotRegistered,
}

impl From<ParseError> for ConnectionError {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::PacketTooLarge { size, max } => ConnectionError::PacketTooLarge { size, max },
            other => ConnectionError::Parse(other),
        }
    }
}

impl ConnectionError {
    /// Peer went away; not worth more than a debug line.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ConnectionError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            ConnectionError::Closed => true,
            _ => false,
        }
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Created = 0,
    Registered = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
    Cleaned = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Created,
            1 => ConnectionState::Registered,
            2 => ConnectionState::Active,
            3 => ConnectionState::Closing,
            4 => ConnectionState::Closed,
            _ => ConnectionState::Cleaned,
        }
    }
}

/// The contract the reactor and processor drive.
pub trait NioConnection: Send + Sync {
    fn id(&self) -> u32;

    fn is_closed(&self) -> bool;

    /// Registers the socket for readiness. Frontends also queue their
    /// handshake here.
    fn register(&self, registry: &Arc<Registry>, token: Token) -> Result<(), ConnectionError>;

    /// Reads everything available and handles each complete frame.
    fn read(&self) -> Result<(), ConnectionError>;

    /// Flush triggered by WRITABLE readiness.
    fn write_by_event(&self) -> Result<(), ConnectionError>;

    /// Flush triggered by the reactor write queue.
    fn write_by_queue(&self) -> Result<(), ConnectionError>;

    fn error(&self, kind: ErrorKind, cause: &(dyn StdError + 'static));

    /// Closes the socket. Returns `false` if it was already closed.
    fn close(&self) -> bool;

    /// Releases buffers and the socket once the connection left its registry.
    fn cleanup(&self);

    /// Closes the connection if it has been idle longer than its timeout.
    fn idle_check(&self);
}

/// Outcome of one read-readiness cycle.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Complete frames, header included, in arrival order
    pub frames: Vec<Bytes>,
    /// The peer closed its end
    pub eof: bool,
}

#[derive(Debug, Default)]
struct FlushState {
    /// Bytes of the head chunk already written
    offset: usize,
    /// WRITABLE interest is currently registered
    writable: bool,
}

/// Shared connection state.
pub struct ConnectionCore {
    id: AtomicU32,
    host: String,
    port: u16,
    local_port: u16,
    socket: Mutex<Option<TcpStream>>,
    registration: Mutex<Option<(Arc<Registry>, Token)>>,
    processor: OnceLock<Arc<Processor>>,
    read_buffer: Mutex<Option<BytesMut>>,
    write_queue: Mutex<VecDeque<BytesMut>>,
    flush: Mutex<FlushState>,
    decoder: FrameDecoder,
    max_packet_size: usize,
    idle_timeout: AtomicU64,
    state: AtomicU8,
    closed: AtomicBool,
    accepted: AtomicBool,
    start_time: u64,
    last_read_time: AtomicU64,
    last_write_time: AtomicU64,
    net_in_bytes: AtomicU64,
    net_out_bytes: AtomicU64,
    this: Weak<dyn NioConnection>,
}

impl ConnectionCore {
    /// Wraps `socket`. `this` points back at the owning connection so writes
    /// can post it to the reactor.
    pub fn new(
        socket: TcpStream,
        peer: SocketAddr,
        this: Weak<dyn NioConnection>,
        max_packet_size: usize,
        idle_timeout: Duration,
    ) -> Self {
        let now = current_millis();
        let local_port = socket.local_addr().map(|a| a.port()).unwrap_or(0);
        Self {
            id: AtomicU32::new(0),
            host: peer.ip().to_string(),
            port: peer.port(),
            local_port,
            socket: Mutex::new(Some(socket)),
            registration: Mutex::new(None),
            processor: OnceLock::new(),
            read_buffer: Mutex::new(None),
            write_queue: Mutex::new(VecDeque::new()),
            flush: Mutex::new(FlushState::default()),
            decoder: FrameDecoder::new(max_packet_size),
            max_packet_size,
            idle_timeout: AtomicU64::new(duration_millis(idle_timeout)),
            state: AtomicU8::new(ConnectionState::Created as u8),
            closed: AtomicBool::new(false),
            accepted: AtomicBool::new(false),
            start_time: now,
            last_read_time: AtomicU64::new(now),
            last_write_time: AtomicU64::new(now),
            net_in_bytes: AtomicU64::new(0),
            net_out_bytes: AtomicU64::new(0),
            this,
        }
    }

    pub fn id(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    pub fn set_id(&self, id: u32) {
        self.id.store(id, Ordering::Release);
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted.load(Ordering::Acquire)
    }

    pub fn set_accepted(&self, accepted: bool) {
        self.accepted.store(accepted, Ordering::Release);
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout.load(Ordering::Relaxed))
    }

    pub fn set_idle_timeout(&self, timeout: Duration) {
        self.idle_timeout
            .store(duration_millis(timeout), Ordering::Relaxed);
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn mark_active(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Registered as u8,
            ConnectionState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn last_read_time(&self) -> u64 {
        self.last_read_time.load(Ordering::Relaxed)
    }

    pub fn last_write_time(&self) -> u64 {
        self.last_write_time.load(Ordering::Relaxed)
    }

    pub fn net_in_bytes(&self) -> u64 {
        self.net_in_bytes.load(Ordering::Relaxed)
    }

    pub fn net_out_bytes(&self) -> u64 {
        self.net_out_bytes.load(Ordering::Relaxed)
    }

    pub fn processor(&self) -> Option<&Arc<Processor>> {
        self.processor.get()
    }

    /// Binds the connection to its processor and takes the inbound staging
    /// buffer from the processor's pool. A connection is bound once.
    pub fn set_processor(&self, processor: Arc<Processor>) -> bool {
        if self.processor.set(processor).is_err() {
            warn!(conn = self.id(), "Connection is already bound to a processor");
            return false;
        }
        if let Some(p) = self.processor.get() {
            *lock(&self.read_buffer) = Some(p.buffer_pool().allocate());
        }
        true
    }

    /// Whether the socket is registered with a reactor.
    pub fn is_registered(&self) -> bool {
        lock(&self.registration).is_some()
    }

    /// Runs `f` against the socket, failing with `NotConnected` once it has
    /// been released.
    pub fn with_socket<R>(&self, f: impl FnOnce(&mut TcpStream) -> io::Result<R>) -> io::Result<R> {
        match lock(&self.socket).as_mut() {
            Some(socket) => f(socket),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Output chunk from the processor pool, or a fresh one when unbound.
    pub fn allocate(&self) -> BytesMut {
        match self.processor.get() {
            Some(p) => p.buffer_pool().allocate(),
            None => BytesMut::with_capacity(DEFAULT_CHUNK_SIZE),
        }
    }

    pub fn recycle(&self, chunk: BytesMut) {
        if let Some(p) = self.processor.get() {
            p.buffer_pool().recycle(chunk);
        }
    }

    /// Registers the socket for READABLE, plus WRITABLE when output is
    /// already waiting.
    pub fn register_socket(&self, registry: &Arc<Registry>, token: Token) -> Result<(), ConnectionError> {
        let mut flush = lock(&self.flush);
        let mut socket = lock(&self.socket);
        let socket = socket.as_mut().ok_or(ConnectionError::Closed)?;

        let pending = !lock(&self.write_queue).is_empty();
        let interest = if pending {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        registry.register(socket, token, interest)?;
        *lock(&self.registration) = Some((Arc::clone(registry), token));
        flush.writable = pending;

        self.set_state(ConnectionState::Registered);
        debug!(conn = self.id(), host = %self.host, port = self.port, "Connection registered");
        Ok(())
    }

    /// Reads until the socket would block, returning every complete frame.
    pub fn read_frames(&self) -> Result<ReadOutcome, ConnectionError> {
        let mut outcome = ReadOutcome::default();
        let mut guard = lock(&self.read_buffer);
        let buffer = guard.get_or_insert_with(|| BytesMut::with_capacity(DEFAULT_CHUNK_SIZE));
        let mut socket = lock(&self.socket);
        let socket = socket.as_mut().ok_or(ConnectionError::Closed)?;

        loop {
            if buffer.len() == buffer.capacity() {
                buffer.reserve(buffer.capacity().max(DEFAULT_CHUNK_SIZE));
            }
            let start = buffer.len();
            let capacity = buffer.capacity();
            buffer.resize(capacity, 0);

            match socket.read(&mut buffer[start..]) {
                Ok(0) => {
                    buffer.truncate(start);
                    outcome.eof = true;
                    break;
                }
                Ok(n) => {
                    buffer.truncate(start + n);
                    self.net_in_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    if let Some(p) = self.processor.get() {
                        p.add_net_in_bytes(n as u64);
                    }
                    self.last_read_time.store(current_millis(), Ordering::Relaxed);
                    trace!(conn = self.id(), bytes = n, "Read data");
                    self.extract_frames(buffer, &mut outcome.frames)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    buffer.truncate(start);
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    buffer.truncate(start);
                }
                Err(e) => {
                    buffer.truncate(start);
                    return Err(e.into());
                }
            }
        }

        self.mark_active();
        Ok(outcome)
    }

    fn extract_frames(&self, buffer: &mut BytesMut, frames: &mut Vec<Bytes>) -> Result<(), ConnectionError> {
        let mut offset = 0;
        while let Some(len) = self.decoder.decode(&buffer[offset..])? {
            frames.push(Bytes::copy_from_slice(&buffer[offset..offset + len]));
            offset += len;
        }

        if offset > 0 {
            let len = buffer.len();
            buffer.copy_within(offset..len, 0);
            buffer.truncate(len - offset);
        }

        // A frame larger than the staging buffer grows it; the pool will not
        // take the grown buffer back.
        if let Some(need) = self.decoder.frame_length(buffer)? {
            if need > buffer.capacity() {
                trace!(conn = self.id(), need, "Growing read buffer");
                buffer.reserve(need - buffer.len());
            }
        }
        Ok(())
    }

    /// Appends `chunk` to the output queue and posts the connection for a
    /// queue-driven flush.
    pub fn write(&self, chunk: BytesMut) {
        if chunk.is_empty() {
            self.recycle(chunk);
            return;
        }
        if self.is_closed() {
            self.recycle(chunk);
            return;
        }
        lock(&self.write_queue).push_back(chunk);

        if let (Some(processor), Some(this)) = (self.processor.get(), self.this.upgrade()) {
            processor.post_write(this);
        }
    }

    /// Encodes `packet` with sequence `seq` into a pooled chunk and writes it.
    pub fn write_packet(&self, packet: &MySqlPacket, seq: u8) {
        let mut chunk = self.allocate();
        packet.encode(seq, &mut chunk);
        trace!(conn = self.id(), packet = packet.name(), seq, "Queued packet");
        self.write(chunk);
    }

    /// Number of chunks waiting to be flushed.
    pub fn pending_chunks(&self) -> usize {
        lock(&self.write_queue).len()
    }

    /// Drains the output queue into the socket.
    ///
    /// Leaves WRITABLE interest registered when the socket would block, and
    /// drops it once the queue is empty.
    pub fn flush(&self) -> Result<(), ConnectionError> {
        let mut state = lock(&self.flush);
        let mut socket = lock(&self.socket);
        let socket = socket.as_mut().ok_or(ConnectionError::Closed)?;

        loop {
            let mut chunk = match lock(&self.write_queue).pop_front() {
                Some(chunk) => chunk,
                None => break,
            };

            while state.offset < chunk.len() {
                match socket.write(&chunk[state.offset..]) {
                    Ok(0) => {
                        self.recycle(chunk);
                        state.offset = 0;
                        return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                    }
                    Ok(n) => {
                        state.offset += n;
                        self.net_out_bytes.fetch_add(n as u64, Ordering::Relaxed);
                        if let Some(p) = self.processor.get() {
                            p.add_net_out_bytes(n as u64);
                        }
                        self.last_write_time.store(current_millis(), Ordering::Relaxed);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        lock(&self.write_queue).push_front(chunk);
                        if !state.writable {
                            self.set_interest(socket, true)?;
                            state.writable = true;
                        }
                        trace!(conn = self.id(), "Socket would block, waiting for WRITABLE");
                        return Ok(());
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        self.recycle(chunk);
                        state.offset = 0;
                        return Err(e.into());
                    }
                }
            }

            state.offset = 0;
            self.recycle(chunk);
        }

        if state.writable {
            self.set_interest(socket, false)?;
            state.writable = false;
        }
        self.mark_active();
        Ok(())
    }

    fn set_interest(&self, socket: &mut TcpStream, writable: bool) -> io::Result<()> {
        if let Some((registry, token)) = lock(&self.registration).as_ref() {
            let interest = if writable {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            registry.reregister(socket, *token, interest)?;
        }
        Ok(())
    }

    /// Closes the socket once. Returns `false` if already closed.
    pub fn close_socket(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.set_state(ConnectionState::Closing);

        if let Some(socket) = lock(&self.socket).as_mut() {
            if let Some((registry, _)) = lock(&self.registration).as_ref() {
                let _ = registry.deregister(socket);
            }
            let _ = socket.shutdown(Shutdown::Both);
        }

        self.set_state(ConnectionState::Closed);
        debug!(conn = self.id(), host = %self.host, port = self.port, "Connection closed");
        true
    }

    /// Returns buffers to the pool and drops the socket.
    pub fn release(&self) {
        let socket = lock(&self.socket).take();
        drop(socket);
        lock(&self.registration).take();

        if let Some(buffer) = lock(&self.read_buffer).take() {
            self.recycle(buffer);
        }
        let pending: Vec<BytesMut> = lock(&self.write_queue).drain(..).collect();
        for chunk in pending {
            self.recycle(chunk);
        }

        self.set_state(ConnectionState::Cleaned);
        debug!(conn = self.id(), "Connection cleaned up");
    }

    /// Whether the connection has been quiet longer than its idle timeout.
    pub fn is_idle_timeout(&self) -> bool {
        let last = self.last_read_time().max(self.last_write_time());
        current_millis() > last.saturating_add(self.idle_timeout.load(Ordering::Relaxed))
    }

    /// Logs an error reported through the error callback.
    pub fn log_error(&self, kind: ErrorKind, cause: &(dyn StdError + 'static)) {
        let disconnect = cause
            .downcast_ref::<ConnectionError>()
            .is_some_and(ConnectionError::is_disconnect);
        if disconnect {
            debug!(conn = self.id(), kind = %kind, error = %cause, "Connection dropped by peer");
        } else {
            warn!(conn = self.id(), kind = %kind, error = %cause, host = %self.host, "Connection error");
        }
    }
}
