//! Server Context
//!
//! Built once at startup and owned by the binary. Holds the processors, the
//! connection-id generator shared by the acceptor and the connector, the
//! timer and the network endpoints.
//!
//! ## Startup Order
//!
//! 1. processors (reactor threads)
//! 2. the processor sweep on the timer
//! 3. the backend connector
//! 4. the server acceptor; a bind failure aborts startup

use crate::config::SystemConfig;
use crate::net::connection::current_millis;
use crate::net::{
    Connector, FrontendConnectionFactory, IdGenerator, NioAcceptor, Processor, SessionHandler,
};
use crate::timer::Timer;
use anyhow::{Context, Result};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::info;

/// Name of the periodic registry sweep.
pub const PROCESSOR_CHECK_TASK: &str = "processor-check";

/// The running proxy.
pub struct Server {
    config: SystemConfig,
    ids: Arc<IdGenerator>,
    processors: Vec<Arc<Processor>>,
    timer: Timer,
    connector: OnceLock<Arc<Connector>>,
    acceptor: OnceLock<Arc<NioAcceptor>>,
    online: AtomicBool,
    startup_time: AtomicU64,
}

impl Server {
    /// Creates the processors and the timer. Nothing runs until
    /// [`startup`](Self::startup).
    pub fn new(config: SystemConfig) -> Result<Self> {
        let processors = (0..config.processors.max(1))
            .map(|i| Processor::new(format!("Processor{}", i), &config).map(Arc::new))
            .collect::<std::io::Result<Vec<_>>>()
            .context("failed to create processors")?;
        let timer = Timer::new("Timer").context("failed to create timer")?;

        Ok(Self {
            config,
            ids: Arc::new(IdGenerator::new()),
            processors,
            timer,
            connector: OnceLock::new(),
            acceptor: OnceLock::new(),
            online: AtomicBool::new(true),
            startup_time: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn processors(&self) -> &[Arc<Processor>] {
        &self.processors
    }

    /// The backend connector, once started.
    pub fn connector(&self) -> Option<&Arc<Connector>> {
        self.connector.get()
    }

    pub fn timer(&self) -> &Timer {
        &self.timer
    }

    /// Address the server acceptor listens on, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.get().map(|a| a.local_addr())
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub fn online(&self) {
        self.online.store(true, Ordering::Release);
    }

    pub fn offline(&self) {
        self.online.store(false, Ordering::Release);
    }

    /// Milliseconds since the epoch when startup finished; 0 before.
    pub fn startup_time(&self) -> u64 {
        self.startup_time.load(Ordering::Acquire)
    }

    /// Registers a periodic hook on the server timer.
    pub fn schedule<C>(&self, name: &str, period: Duration, ctx: Arc<C>, task: fn(&C))
    where
        C: Send + Sync + 'static,
    {
        self.timer.schedule(name, period, ctx, task);
    }

    /// Starts every component. Client sessions are served by `session`.
    pub fn startup(&self, session: Arc<dyn SessionHandler>) -> Result<()> {
        info!(
            processors = self.processors.len(),
            handlers = self.config.processor_handler,
            executors = self.config.processor_executor,
            "Starting server"
        );

        for processor in &self.processors {
            processor
                .startup()
                .with_context(|| format!("failed to start {}", processor.name()))?;
        }

        self.schedule(
            PROCESSOR_CHECK_TASK,
            self.config.processor_check_period,
            Arc::new(self.processors.clone()),
            check_processors,
        );

        let connector = Connector::new("Connector", self.processors.clone(), Arc::clone(&self.ids))
            .context("failed to create connector")?;
        connector.start().context("failed to start connector")?;
        let _ = self.connector.set(connector);

        let addr = resolve(&self.config.bind_address())?;
        let factory = Arc::new(FrontendConnectionFactory::new(self.config.clone(), session));
        let acceptor = NioAcceptor::bind(
            "Server",
            addr,
            factory,
            self.processors.clone(),
            Arc::clone(&self.ids),
        )
        .with_context(|| format!("failed to bind {}", addr))?;
        acceptor.start().context("failed to start acceptor")?;
        let local_addr = acceptor.local_addr();
        let _ = self.acceptor.set(acceptor);

        self.startup_time.store(current_millis(), Ordering::Release);
        info!(addr = %local_addr, "Server started");
        Ok(())
    }
}

fn check_processors(processors: &Vec<Arc<Processor>>) {
    for processor in processors {
        processor.check();
    }
}

fn resolve(address: &str) -> Result<SocketAddr> {
    address
        .to_socket_addrs()
        .with_context(|| format!("invalid address {}", address))?
        .next()
        .with_context(|| format!("{} did not resolve", address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::frontend::tests::RecordingSession;
    use crate::net::processor::tests::test_config;
    use crate::net::lock;
    use crate::protocol::security::scramble_native_password;
    use crate::protocol::types::capabilities;
    use crate::protocol::{AuthPacket, CommandPacket, HandshakePacket, MySqlPacket};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::{sleep, Instant};

    fn local_config() -> SystemConfig {
        SystemConfig {
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            processors: 2,
            processor_handler: 2,
            processor_executor: 1,
            processor_check_period: Duration::from_millis(20),
            ..test_config()
        }
    }

    async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await.unwrap();
        let len = usize::from(header[0]) | usize::from(header[1]) << 8 | usize::from(header[2]) << 16;
        let mut frame = header.to_vec();
        frame.resize(4 + len, 0);
        stream.read_exact(&mut frame[4..]).await.unwrap();
        frame
    }

    async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn frontend_count(server: &Server) -> usize {
        server.processors().iter().map(|p| p.frontend_count()).sum()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_client_session_end_to_end() {
        let server = Server::new(local_config()).unwrap();
        let session = Arc::new(RecordingSession::default());
        tokio_test::assert_ok!(server.startup(session.clone()));
        assert!(server.startup_time() > 0);
        assert!(server.connector().is_some());
        assert_eq!(server.timer().tasks(), vec![PROCESSOR_CHECK_TASK.to_string()]);

        let mut client = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        let handshake = HandshakePacket::decode(&read_frame(&mut client).await).unwrap();
        assert_eq!(handshake.thread_id, 1);

        let auth = AuthPacket {
            client_flags: capabilities::BACKEND_CLIENT_FLAGS,
            max_packet_size: 1 << 24,
            charset_index: 33,
            user: "root".to_string(),
            password: scramble_native_password(b"secret", &handshake.seed),
            database: Some("orders".to_string()),
        };
        client.write_all(&MySqlPacket::Auth(auth).to_bytes(1)).await.unwrap();
        let reply = read_frame(&mut client).await;
        assert_eq!((reply[3], reply[4]), (2, 0x00));

        let query = MySqlPacket::from(CommandPacket::new(0x03, b"SELECT 1".to_vec())).to_bytes(0);
        client.write_all(&query).await.unwrap();
        let reply = read_frame(&mut client).await;
        assert_eq!((reply[3], reply[4]), (1, 0x00));
        assert_eq!(*lock(&session.queries), vec!["SELECT 1".to_string()]);
        assert_eq!(frontend_count(&server), 1);

        // the sweep reaps the connection once the client leaves
        drop(client);
        assert!(eventually(|| frontend_count(&server) == 0).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connections_spread_over_processors() {
        let server = Server::new(local_config()).unwrap();
        server.startup(Arc::new(RecordingSession::default())).unwrap();
        let addr = server.local_addr().unwrap();

        let mut clients = Vec::new();
        for _ in 0..4 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            read_frame(&mut client).await;
            clients.push(client);
        }
        for processor in server.processors() {
            assert_eq!(processor.frontend_count(), 2);
        }
    }

    #[test]
    fn test_bind_failure_aborts_startup() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let server = Server::new(SystemConfig {
            server_port: taken.local_addr().unwrap().port(),
            ..local_config()
        })
        .unwrap();

        let err = server.startup(Arc::new(RecordingSession::default())).unwrap_err();
        assert!(err.to_string().contains("failed to bind"));
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn test_online_flag() {
        let server = Server::new(local_config()).unwrap();
        assert!(server.is_online());
        server.offline();
        assert!(!server.is_online());
        server.online();
        assert!(server.is_online());
        assert_eq!(server.startup_time(), 0);
    }
}
