//! Connection Factories
//!
//! Turn an accepted socket into a connection object, applying the socket
//! options from [`SystemConfig`] on the way.

use crate::config::SystemConfig;
use crate::net::connection::ConnectionError;
use crate::net::frontend::{FrontendConnection, SessionHandler};
use mio::net::TcpStream;
use socket2::SockRef;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::trace;

/// Builds connections for an acceptor.
pub trait ConnectionFactory: Send + Sync {
    fn make(&self, stream: TcpStream, peer: SocketAddr)
        -> Result<Arc<FrontendConnection>, ConnectionError>;
}

/// Produces client connections served by one [`SessionHandler`].
pub struct FrontendConnectionFactory {
    config: SystemConfig,
    session: Arc<dyn SessionHandler>,
}

impl FrontendConnectionFactory {
    pub fn new(config: SystemConfig, session: Arc<dyn SessionHandler>) -> Self {
        Self { config, session }
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }
}

impl ConnectionFactory for FrontendConnectionFactory {
    fn make(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<Arc<FrontendConnection>, ConnectionError> {
        configure_socket(&stream, &self.config)?;
        trace!(peer = %peer, "Socket configured");
        Ok(FrontendConnection::new(
            stream,
            peer,
            Arc::clone(&self.session),
            &self.config,
        ))
    }
}

/// Applies buffer sizes and `TCP_NODELAY`.
pub(crate) fn configure_socket(stream: &TcpStream, config: &SystemConfig) -> std::io::Result<()> {
    let socket = SockRef::from(stream);
    socket.set_recv_buffer_size(config.socket_recv_buffer)?;
    socket.set_send_buffer_size(config.socket_send_buffer)?;
    stream.set_nodelay(config.no_delay)?;
    Ok(())
}
