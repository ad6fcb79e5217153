//! Reactor
//!
//! Each processor owns one reactor, which runs two threads:
//!
//! ```text
//! post_register ──> register queue ──wake──> R-loop ── poll(timeout) ──┐
//!                                              │                       │
//!                                              ├─ register pending     │
//!                                              ├─ READABLE  -> read()  │
//!                                              └─ WRITABLE  -> write_by_event()
//!
//! post_write ─────> write queue ───────────> W-loop ── write_by_queue()
//! ```
//!
//! The R-loop waits at most `poll_timeout`, so pending registrations are
//! picked up even if a wake is lost. Closed connections leave the R-loop's
//! table at least once per `poll_timeout`, busy or not. The W-loop blocks on
//! its queue.
//!
//! Connections share the reactor's single `Registry` handle for interest
//! changes.
//! Per-connection failures go to the connection's error callback; a panic
//! inside a connection callback is logged and the loop keeps running.

use crate::net::connection::{ErrorKind, NioConnection};
use crate::net::{guarded, lock};
use mio::{Events, Poll, Registry, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, trace, warn};

const WAKE_TOKEN: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;

type ConnectionQueue = UnboundedReceiver<Arc<dyn NioConnection>>;

/// Event loops of one processor.
pub struct Reactor {
    name: String,
    poll_timeout: Duration,
    waker: Waker,
    register_tx: UnboundedSender<Arc<dyn NioConnection>>,
    write_tx: UnboundedSender<Arc<dyn NioConnection>>,
    /// Taken by `startup`
    pending: Mutex<Option<(Poll, ConnectionQueue, ConnectionQueue)>>,
    registry: Arc<Registry>,
    event_count: Arc<AtomicU64>,
    tracked: Arc<AtomicUsize>,
}

impl Reactor {
    pub fn new(name: impl Into<String>, poll_timeout: Duration) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let registry = Arc::new(poll.registry().try_clone()?);
        let (register_tx, register_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();

        Ok(Self {
            name: name.into(),
            poll_timeout,
            waker,
            register_tx,
            write_tx,
            pending: Mutex::new(Some((poll, register_rx, write_rx))),
            registry,
            event_count: Arc::new(AtomicU64::new(0)),
            tracked: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of R-loop iterations so far.
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    /// Connections currently held by the R-loop.
    pub fn connection_count(&self) -> usize {
        self.tracked.load(Ordering::Relaxed)
    }

    /// Spawns the `{name}-R` and `{name}-W` threads.
    pub fn startup(&self) -> io::Result<()> {
        let (poll, register_rx, write_rx) = lock(&self.pending)
            .take()
            .ok_or_else(|| io::Error::other(format!("reactor {} already started", self.name)))?;

        let reader = ReaderLoop {
            name: format!("{}-R", self.name),
            poll,
            registry: Arc::clone(&self.registry),
            register_rx,
            poll_timeout: self.poll_timeout,
            event_count: Arc::clone(&self.event_count),
            tracked: Arc::clone(&self.tracked),
            connections: HashMap::new(),
            next_token: 1,
            last_prune: Instant::now(),
        };
        thread::Builder::new()
            .name(reader.name.clone())
            .spawn(move || reader.run())?;

        let writer_name = format!("{}-W", self.name);
        thread::Builder::new()
            .name(writer_name.clone())
            .spawn(move || run_writer(writer_name, write_rx))?;

        info!(reactor = %self.name, "Reactor started");
        Ok(())
    }

    /// Queues `conn` for registration on the R-loop and wakes it.
    pub fn post_register(&self, conn: Arc<dyn NioConnection>) {
        if let Err(e) = self.register_tx.send(conn) {
            warn!(reactor = %self.name, conn = e.0.id(), "Register queue is gone");
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!(reactor = %self.name, error = %e, "Failed to wake reactor");
        }
    }

    /// Queues `conn` for a queue-driven flush on the W-loop.
    pub fn post_write(&self, conn: Arc<dyn NioConnection>) {
        if let Err(e) = self.write_tx.send(conn) {
            warn!(reactor = %self.name, conn = e.0.id(), "Write queue is gone");
        }
    }
}

struct ReaderLoop {
    name: String,
    poll: Poll,
    registry: Arc<Registry>,
    register_rx: ConnectionQueue,
    poll_timeout: Duration,
    event_count: Arc<AtomicU64>,
    tracked: Arc<AtomicUsize>,
    connections: HashMap<Token, Arc<dyn NioConnection>>,
    next_token: usize,
    last_prune: Instant,
}

impl ReaderLoop {
    fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            if let Err(e) = self.poll.poll(&mut events, Some(self.poll_timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    warn!(reactor = %self.name, error = %e, "Poll failed");
                }
                continue;
            }
            self.event_count.fetch_add(1, Ordering::Relaxed);

            self.register_pending();

            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                let conn = match self.connections.get(&token) {
                    Some(conn) => Arc::clone(conn),
                    None => continue,
                };
                if conn.is_closed() {
                    self.connections.remove(&token);
                    continue;
                }

                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    guarded(&self.name, || {
                        if let Err(e) = conn.read() {
                            conn.error(ErrorKind::Read, &e);
                        }
                    });
                }
                if event.is_writable() && !conn.is_closed() {
                    guarded(&self.name, || {
                        if let Err(e) = conn.write_by_event() {
                            conn.error(ErrorKind::WriteByEvent, &e);
                        }
                    });
                }
            }

            if events.is_empty() || self.last_prune.elapsed() >= self.poll_timeout {
                self.prune_closed();
            }
            self.tracked.store(self.connections.len(), Ordering::Relaxed);
        }
    }

    /// Drops closed connections; their sockets are deregistered and will not
    /// produce another event.
    fn prune_closed(&mut self) {
        self.connections.retain(|_, conn| !conn.is_closed());
        self.last_prune = Instant::now();
    }

    fn register_pending(&mut self) {
        while let Ok(conn) = self.register_rx.try_recv() {
            if conn.is_closed() {
                continue;
            }
            let token = self.allocate_token();
            let registry = &self.registry;
            let mut registered = false;
            guarded(&self.name, || match conn.register(registry, token) {
                Ok(()) => registered = true,
                Err(e) => conn.error(ErrorKind::Register, &e),
            });
            if registered {
                trace!(reactor = %self.name, conn = conn.id(), token = token.0, "Registered");
                self.connections.insert(token, conn);
            }
        }
    }

    fn allocate_token(&mut self) -> Token {
        loop {
            let token = Token(self.next_token);
            self.next_token = self.next_token.wrapping_add(1).max(1);
            if !self.connections.contains_key(&token) {
                return token;
            }
        }
    }
}

fn run_writer(name: String, mut queue: ConnectionQueue) {
    while let Some(conn) = queue.blocking_recv() {
        if conn.is_closed() {
            continue;
        }
        guarded(&name, || {
            if let Err(e) = conn.write_by_queue() {
                conn.error(ErrorKind::WriteByQueue, &e);
            }
        });
    }
    debug!(reactor = %name, "Write queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ConnectionError;
    use std::error::Error as StdError;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct FakeConnection {
        registered: AtomicBool,
        closed: AtomicBool,
        fail_register: bool,
        queue_writes: AtomicUsize,
        errors: Mutex<Vec<ErrorKind>>,
        panic_on_write: bool,
    }

    impl NioConnection for FakeConnection {
        fn id(&self) -> u32 {
            7
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
        fn register(&self, _registry: &Arc<Registry>, _token: Token) -> Result<(), ConnectionError> {
            if self.fail_register {
                return Err(ConnectionError::Closed);
            }
            self.registered.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn read(&self) -> Result<(), ConnectionError> {
            Ok(())
        }
        fn write_by_event(&self) -> Result<(), ConnectionError> {
            Ok(())
        }
        fn write_by_queue(&self) -> Result<(), ConnectionError> {
            self.queue_writes.fetch_add(1, Ordering::SeqCst);
            if self.panic_on_write {
                panic!("boom");
            }
            Ok(())
        }
        fn error(&self, kind: ErrorKind, _cause: &(dyn StdError + 'static)) {
            lock(&self.errors).push(kind);
        }
        fn close(&self) -> bool {
            true
        }
        fn cleanup(&self) {}
        fn idle_check(&self) {}
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_post_register_is_serviced() {
        let reactor = Reactor::new("Test", Duration::from_millis(50)).unwrap();
        reactor.startup().unwrap();

        let conn = Arc::new(FakeConnection::default());
        reactor.post_register(conn.clone());

        assert!(wait_until(|| conn.registered.load(Ordering::SeqCst)));
        assert!(reactor.event_count() > 0);
    }

    #[test]
    fn test_register_failure_goes_to_error_callback() {
        let reactor = Reactor::new("Test", Duration::from_millis(50)).unwrap();
        reactor.startup().unwrap();

        let conn = Arc::new(FakeConnection {
            fail_register: true,
            ..Default::default()
        });
        reactor.post_register(conn.clone());

        assert!(wait_until(|| lock(&conn.errors).contains(&ErrorKind::Register)));
    }

    #[test]
    fn test_write_loop_survives_panics() {
        let reactor = Reactor::new("Test", Duration::from_millis(50)).unwrap();
        reactor.startup().unwrap();

        let faulty = Arc::new(FakeConnection {
            panic_on_write: true,
            ..Default::default()
        });
        let healthy = Arc::new(FakeConnection::default());
        reactor.post_write(faulty.clone());
        reactor.post_write(healthy.clone());

        assert!(wait_until(|| healthy.queue_writes.load(Ordering::SeqCst) == 1));
        assert_eq!(faulty.queue_writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_startup_twice_fails() {
        let reactor = Reactor::new("Test", Duration::from_millis(50)).unwrap();
        reactor.startup().unwrap();
        assert!(reactor.startup().is_err());
    }

    #[test]
    fn test_closed_connections_pruned_while_busy() {
        let reactor = Reactor::new("Test", Duration::from_millis(20)).unwrap();
        reactor.startup().unwrap();

        let conns: Vec<Arc<FakeConnection>> = (0..3).map(|_| Arc::new(FakeConnection::default())).collect();
        for conn in &conns {
            reactor.post_register(conn.clone());
        }
        assert!(wait_until(|| reactor.connection_count() == 3));

        for conn in &conns {
            conn.closed.store(true, Ordering::SeqCst);
        }

        // keep every poll busy with wake-ups
        let pruned = wait_until(|| {
            let closed = FakeConnection::default();
            closed.closed.store(true, Ordering::SeqCst);
            reactor.post_register(Arc::new(closed));
            reactor.connection_count() == 0
        });
        assert!(pruned);
        for conn in &conns {
            assert_eq!(Arc::strong_count(conn), 1);
        }
    }
}
