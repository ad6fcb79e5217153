//! System Configuration
//!
//! Every tunable of the network core, with defaults matching a stock
//! deployment. The binary fills this from command-line flags.

use crate::buffer::{DEFAULT_BUFFER_SIZE, DEFAULT_CHUNK_SIZE};
use crate::protocol::types::{charset, DEFAULT_MAX_PACKET_SIZE};
use crate::DEFAULT_PORT;
use std::time::Duration;

/// Number of CPUs, falling back to 1.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration for the server, its processors and its sockets.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Host the server acceptor binds to
    pub server_host: String,
    /// Port the server acceptor binds to (default: 8066)
    pub server_port: u16,

    /// Number of processors
    pub processors: usize,
    /// Threads in each processor's handler pool (0 runs inline)
    pub processor_handler: usize,
    /// Threads in each processor's executor pool (0 runs inline)
    pub processor_executor: usize,
    /// Total bytes pre-allocated per processor buffer pool
    pub processor_buffer_pool: usize,
    /// Size of each pooled chunk
    pub processor_buffer_chunk: usize,
    /// Interval between registry sweeps
    pub processor_check_period: Duration,

    /// Idle time after which a connection is closed by the sweep
    pub idle_timeout: Duration,
    /// Upper bound of each multiplexer wait
    pub poll_timeout: Duration,

    /// Charset name advertised in the handshake
    pub charset: String,
    /// SO_RCVBUF for accepted sockets
    pub socket_recv_buffer: usize,
    /// SO_SNDBUF for accepted sockets
    pub socket_send_buffer: usize,
    /// TCP_NODELAY for accepted sockets
    pub no_delay: bool,
    /// Largest inbound frame accepted, header included
    pub max_packet_size: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        let cpus = default_parallelism();
        Self {
            server_host: "0.0.0.0".to_string(),
            server_port: DEFAULT_PORT,
            processors: cpus,
            processor_handler: cpus,
            processor_executor: cpus,
            processor_buffer_pool: DEFAULT_BUFFER_SIZE,
            processor_buffer_chunk: DEFAULT_CHUNK_SIZE,
            processor_check_period: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(8 * 3600),
            poll_timeout: Duration::from_secs(1),
            charset: "utf8".to_string(),
            socket_recv_buffer: 8 * 1024,
            socket_send_buffer: 16 * 1024,
            no_delay: true,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl SystemConfig {
    /// `host:port` of the server acceptor.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    /// Collation index for the configured charset, utf8 when unknown.
    pub fn charset_index(&self) -> u8 {
        charset::index_of(&self.charset).unwrap_or(charset::UTF8_GENERAL_CI)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SystemConfig::default();
        assert_eq!(config.server_port, 8066);
        assert_eq!(config.bind_address(), "0.0.0.0:8066");
        assert!(config.processors >= 1);
        assert_eq!(config.processor_buffer_chunk, 4096);
        assert_eq!(config.idle_timeout, Duration::from_secs(28_800));
        assert_eq!(config.charset_index(), charset::UTF8_GENERAL_CI);
    }

    #[test]
    fn test_unknown_charset_falls_back() {
        let config = SystemConfig {
            charset: "ebcdic".to_string(),
            ..Default::default()
        };
        assert_eq!(config.charset_index(), charset::UTF8_GENERAL_CI);
    }
}
