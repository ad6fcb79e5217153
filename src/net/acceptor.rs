//! Acceptor
//!
//! One thread per listening port. Each accepted socket is turned into a
//! connection by a [`ConnectionFactory`], given a fresh id, bound to the
//! next processor in round-robin order and queued for reactor registration.
//!
//! A failure while setting up one connection drops its socket and is
//! logged; the accept loop keeps going.

use crate::net::connection::{ConnectionError, NioConnection};
use crate::net::factory::ConnectionFactory;
use crate::net::processor::Processor;
use crate::net::{guarded, lock};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const LISTENER: Token = Token(0);
const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Issues connection ids: 1, 2, ... 0xFFFF_FFFF, then 1 again. Never 0.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: Mutex<u32>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A generator whose next id is `last + 1` (or 1 after the maximum).
    pub fn starting_at(last: u32) -> Self {
        Self {
            last: Mutex::new(last),
        }
    }

    pub fn next_id(&self) -> u32 {
        let mut last = lock(&self.last);
        if *last == u32::MAX {
            *last = 0;
        }
        *last += 1;
        *last
    }
}

/// Cycles over a fixed, non-empty list.
#[derive(Debug)]
pub struct RoundRobin<T> {
    items: Vec<Arc<T>>,
    next: AtomicUsize,
}

impl<T> RoundRobin<T> {
    /// Returns `None` for an empty list.
    pub fn new(items: Vec<Arc<T>>) -> Option<Self> {
        if items.is_empty() {
            return None;
        }
        Some(Self {
            items,
            next: AtomicUsize::new(0),
        })
    }

    pub fn next(&self) -> &Arc<T> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.items.len();
        &self.items[i]
    }

    pub fn items(&self) -> &[Arc<T>] {
        &self.items
    }
}

/// Accepts client sockets on one port.
pub struct NioAcceptor {
    name: String,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    factory: Arc<dyn ConnectionFactory>,
    processors: RoundRobin<Processor>,
    ids: Arc<IdGenerator>,
    accept_count: AtomicU64,
}

impl NioAcceptor {
    /// Binds the listening socket. Failing to bind is fatal for startup.
    pub fn bind(
        name: impl Into<String>,
        addr: SocketAddr,
        factory: Arc<dyn ConnectionFactory>,
        processors: Vec<Arc<Processor>>,
        ids: Arc<IdGenerator>,
    ) -> io::Result<Arc<Self>> {
        let name = name.into();
        let processors = RoundRobin::new(processors).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "acceptor needs at least one processor")
        })?;
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        info!(acceptor = %name, addr = %local_addr, "Listening");

        Ok(Arc::new(Self {
            name,
            local_addr,
            listener: Mutex::new(Some(listener)),
            factory,
            processors,
            ids,
            accept_count: AtomicU64::new(0),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Connections handed to processors so far.
    pub fn accept_count(&self) -> u64 {
        self.accept_count.load(Ordering::Relaxed)
    }

    /// Spawns the accept thread.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        let mut listener = lock(&self.listener).take().ok_or_else(|| {
            io::Error::other(format!("acceptor {} already started", self.name))
        })?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;

        let acceptor = Arc::clone(self);
        thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || acceptor.run(poll, listener))?;
        Ok(())
    }

    fn run(&self, mut poll: Poll, listener: TcpListener) {
        let mut events = Events::with_capacity(128);
        loop {
            if let Err(e) = poll.poll(&mut events, Some(ACCEPT_POLL_TIMEOUT)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    warn!(acceptor = %self.name, error = %e, "Poll failed");
                }
                continue;
            }
            if events.iter().any(|event| event.token() == LISTENER) {
                guarded(&self.name, || self.accept_all(&listener));
            }
        }
    }

    /// Accepts until the listener would block.
    fn accept_all(&self, listener: &TcpListener) {
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.accept(stream, peer) {
                        warn!(acceptor = %self.name, peer = %peer, error = %e, "Failed to accept connection");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(acceptor = %self.name, error = %e, "Accept failed");
                    break;
                }
            }
        }
    }

    /// Wraps, identifies, binds and queues one accepted socket. The socket
    /// is closed on any error.
    pub fn accept(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ConnectionError> {
        let conn = self.factory.make(stream, peer)?;
        let core = conn.core();
        core.set_accepted(true);
        core.set_id(self.ids.next_id());

        let processor = self.processors.next();
        if !core.set_processor(Arc::clone(processor)) {
            conn.close();
            return Err(ConnectionError::NotRegistered);
        }
        processor.add_frontend(Arc::clone(&conn));
        processor.post_register(conn.clone());

        self.accept_count.fetch_add(1, Ordering::Relaxed);
        debug!(
            acceptor = %self.name,
            conn = conn.id(),
            processor = processor.name(),
            peer = %peer,
            "Accepted connection"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::factory::FrontendConnectionFactory;
    use crate::net::frontend::tests::RecordingSession;
    use crate::net::processor::tests::test_config;
    use std::collections::HashMap;
    use std::time::Instant;

    #[test]
    fn test_ids_are_monotonic_and_never_zero() {
        let ids = IdGenerator::new();
        let mut last = 0;
        for _ in 0..1000 {
            let id = ids.next_id();
            assert!(id > last);
            last = id;
        }
        assert_eq!(last, 1000);
    }

    #[test]
    fn test_ids_wrap_to_one() {
        let ids = IdGenerator::starting_at(u32::MAX - 2);
        assert_eq!(ids.next_id(), u32::MAX - 1);
        assert_eq!(ids.next_id(), u32::MAX);
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn test_ids_unique_across_threads() {
        let ids = Arc::new(IdGenerator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                thread::spawn(move || (0..500).map(|_| ids.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<u32> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 2000);
        assert!(!all.contains(&0));
    }

    #[test]
    fn test_round_robin_fairness() {
        let items: Vec<Arc<usize>> = (0..4).map(Arc::new).collect();
        let rr = RoundRobin::new(items).unwrap();

        let mut counts: HashMap<usize, usize> = HashMap::new();
        for _ in 0..100 {
            *counts.entry(**rr.next()).or_default() += 1;
        }
        assert_eq!(counts.len(), 4);
        assert!(counts.values().all(|&n| n == 25));
    }

    #[test]
    fn test_round_robin_rejects_empty() {
        assert!(RoundRobin::<usize>::new(Vec::new()).is_none());
    }

    #[test]
    fn test_accept_spreads_connections() {
        let config = test_config();
        let processors: Vec<Arc<Processor>> = (0..4)
            .map(|i| Arc::new(Processor::new(format!("Processor{}", i), &config).unwrap()))
            .collect();
        let factory = Arc::new(FrontendConnectionFactory::new(
            config.clone(),
            Arc::new(RecordingSession::default()),
        ));
        let acceptor = NioAcceptor::bind(
            "TestServer",
            "127.0.0.1:0".parse().unwrap(),
            factory,
            processors.clone(),
            Arc::new(IdGenerator::new()),
        )
        .unwrap();
        acceptor.start().unwrap();

        let clients: Vec<_> = (0..100)
            .map(|_| std::net::TcpStream::connect(acceptor.local_addr()).unwrap())
            .collect();

        let deadline = Instant::now() + Duration::from_secs(10);
        while acceptor.accept_count() < 100 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(acceptor.accept_count(), 100);
        for processor in &processors {
            assert_eq!(processor.frontend_count(), 25, "{}", processor.name());
        }

        let mut ids: Vec<u32> = processors
            .iter()
            .flat_map(|p| p.frontends())
            .map(|c| c.id())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=100).collect::<Vec<u32>>());
        drop(clients);
    }

    #[test]
    fn test_bind_conflict_is_an_error() {
        let config = test_config();
        let processors = vec![Arc::new(Processor::new("Processor0", &config).unwrap())];
        let factory: Arc<dyn ConnectionFactory> = Arc::new(FrontendConnectionFactory::new(
            config,
            Arc::new(RecordingSession::default()),
        ));
        let first = NioAcceptor::bind(
            "First",
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&factory),
            processors.clone(),
            Arc::new(IdGenerator::new()),
        )
        .unwrap();

        let second = NioAcceptor::bind(
            "Second",
            first.local_addr(),
            factory,
            processors,
            Arc::new(IdGenerator::new()),
        );
        assert!(second.is_err());
    }
}
