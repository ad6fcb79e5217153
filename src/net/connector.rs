//! Backend Connector
//!
//! Completes non-blocking connects to backend nodes on a dedicated thread.
//! Once a socket is connected it gets an id, is bound to the next processor,
//! enters that processor's backend registry and is posted for reactor
//! registration. A failed connect goes to the connection's error callback
//! with [`ErrorKind::Connect`].

use crate::net::acceptor::{IdGenerator, RoundRobin};
use crate::net::backend::BackendConnection;
use crate::net::connection::{ConnectionError, ErrorKind, NioConnection};
use crate::net::processor::Processor;
use crate::net::{guarded, lock};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

const WAKE_TOKEN: Token = Token(0);
const CONNECT_POLL_TIMEOUT: Duration = Duration::from_millis(1000);

type ConnectQueue = UnboundedReceiver<Arc<BackendConnection>>;

/// Hands connected backend links to processors.
pub struct Connector {
    name: String,
    waker: Waker,
    connect_tx: UnboundedSender<Arc<BackendConnection>>,
    pending: Mutex<Option<(Poll, ConnectQueue)>>,
    processors: RoundRobin<Processor>,
    ids: Arc<IdGenerator>,
    connect_count: AtomicU64,
}

impl Connector {
    pub fn new(
        name: impl Into<String>,
        processors: Vec<Arc<Processor>>,
        ids: Arc<IdGenerator>,
    ) -> io::Result<Arc<Self>> {
        let processors = RoundRobin::new(processors).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "connector needs at least one processor")
        })?;
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let (connect_tx, connect_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            name: name.into(),
            waker,
            connect_tx,
            pending: Mutex::new(Some((poll, connect_rx))),
            processors,
            ids,
            connect_count: AtomicU64::new(0),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Links handed to processors so far.
    pub fn connect_count(&self) -> u64 {
        self.connect_count.load(Ordering::Relaxed)
    }

    /// Spawns the connector thread.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        let (poll, queue) = lock(&self.pending)
            .take()
            .ok_or_else(|| io::Error::other(format!("connector {} already started", self.name)))?;

        let connector = Arc::clone(self);
        thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || connector.run(poll, queue))?;
        info!(connector = %self.name, "Connector started");
        Ok(())
    }

    /// Queues a connection whose non-blocking connect is in flight.
    pub fn post_connect(&self, conn: Arc<BackendConnection>) {
        if let Err(e) = self.connect_tx.send(conn) {
            let conn = e.0;
            warn!(connector = %self.name, node = %conn.addr(), "Connect queue is gone");
            conn.error(ErrorKind::Connect, &ConnectionError::NotRegistered);
            return;
        }
        if let Err(e) = self.waker.wake() {
            warn!(connector = %self.name, error = %e, "Failed to wake connector");
        }
    }

    fn run(&self, mut poll: Poll, mut queue: ConnectQueue) {
        let mut events = Events::with_capacity(256);
        let mut connecting: HashMap<Token, Arc<BackendConnection>> = HashMap::new();
        let mut next_token = 1usize;

        loop {
            if let Err(e) = poll.poll(&mut events, Some(CONNECT_POLL_TIMEOUT)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    warn!(connector = %self.name, error = %e, "Poll failed");
                }
                continue;
            }

            while let Ok(conn) = queue.try_recv() {
                let token = loop {
                    let token = Token(next_token);
                    next_token = next_token.wrapping_add(1).max(1);
                    if !connecting.contains_key(&token) {
                        break token;
                    }
                };
                let registry = poll.registry();
                guarded(&self.name, || {
                    match conn.core().with_socket(|s| registry.register(s, token, Interest::WRITABLE)) {
                        Ok(()) => {
                            connecting.insert(token, Arc::clone(&conn));
                        }
                        Err(e) => conn.error(ErrorKind::Connect, &e),
                    }
                });
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                let conn = match connecting.get(&token) {
                    Some(conn) => Arc::clone(conn),
                    None => continue,
                };
                guarded(&self.name, || match conn.finish_connect() {
                    Ok(false) => {}
                    Ok(true) => {
                        connecting.remove(&token);
                        deregister(poll.registry(), &conn);
                        self.complete(conn);
                    }
                    Err(e) => {
                        connecting.remove(&token);
                        deregister(poll.registry(), &conn);
                        conn.error(ErrorKind::Connect, &e);
                    }
                });
            }
        }
    }

    /// Binds a connected link to a processor and queues its registration.
    fn complete(&self, conn: Arc<BackendConnection>) {
        let core = conn.core();
        core.set_id(self.ids.next_id());

        let processor = self.processors.next();
        if !core.set_processor(Arc::clone(processor)) {
            conn.error(ErrorKind::Connect, &ConnectionError::NotRegistered);
            return;
        }
        processor.add_backend(Arc::clone(&conn));
        processor.post_register(conn.clone());

        self.connect_count.fetch_add(1, Ordering::Relaxed);
        debug!(
            connector = %self.name,
            conn = conn.id(),
            processor = processor.name(),
            node = %conn.addr(),
            "Backend connected"
        );
    }
}

fn deregister(registry: &Registry, conn: &BackendConnection) {
    if let Err(e) = conn.core().with_socket(|s| registry.deregister(s)) {
        debug!(conn = conn.id(), error = %e, "Deregister after connect failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::backend::tests::{credentials, spawn_fake_node, RecordingBackend};
    use crate::net::processor::tests::test_config;
    use crate::protocol::types::Command;
    use std::net::TcpListener;
    use std::time::Instant;

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

    fn started_processors(n: usize) -> Vec<Arc<Processor>> {
        (0..n)
            .map(|i| {
                let p = Arc::new(Processor::new(format!("Processor{}", i), &test_config()).unwrap());
                p.startup().unwrap();
                p
            })
            .collect()
    }

    #[test]
    fn test_connected_link_reaches_a_processor() {
        let processors = started_processors(2);
        let connector = Connector::new("Connector", processors.clone(), Arc::new(IdGenerator::new())).unwrap();
        connector.start().unwrap();

        let (addr, node) = spawn_fake_node("node-secret");
        let handler = Arc::new(RecordingBackend::default());
        let conn =
            BackendConnection::connect(addr, credentials("node-secret"), handler.clone(), &test_config()).unwrap();
        connector.post_connect(Arc::clone(&conn));

        assert!(wait_until(|| handler.connected.load(Ordering::SeqCst)));
        assert_eq!(conn.id(), 1);
        assert_eq!(connector.connect_count(), 1);
        assert_eq!(processors[0].backend_count(), 1);
        assert_eq!(processors[1].backend_count(), 0);

        conn.query("SELECT 1");
        assert!(wait_until(|| !lock(&handler.frames).is_empty()));

        conn.send_command(Command::Quit, Vec::new());
        let commands = node.join().unwrap();
        assert_eq!(commands.len(), 2);
    }

    #[test]
    fn test_refused_connect_is_reported() {
        let processors = started_processors(1);
        let connector = Connector::new("Connector", processors.clone(), Arc::new(IdGenerator::new())).unwrap();
        connector.start().unwrap();

        // a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let handler = Arc::new(RecordingBackend::default());
        let conn = match BackendConnection::connect(addr, credentials("pw"), handler.clone(), &test_config()) {
            Ok(conn) => conn,
            // refused before the connect could go asynchronous
            Err(_) => return,
        };
        connector.post_connect(Arc::clone(&conn));

        assert!(wait_until(|| conn.is_closed()));
        assert_eq!(*lock(&handler.errors), vec![ErrorKind::Connect]);
        assert_eq!(processors[0].backend_count(), 0);
        assert_eq!(connector.connect_count(), 0);
    }

    #[test]
    fn test_start_twice_fails() {
        let connector = Connector::new("Connector", started_processors(1), Arc::new(IdGenerator::new())).unwrap();
        connector.start().unwrap();
        assert!(connector.start().is_err());
    }
}
