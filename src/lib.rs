//! # mysqlmux - The Network Core of a MySQL Proxy
//!
//! mysqlmux accepts MySQL client connections, multiplexes thousands of
//! sockets over a handful of threads, frames the MySQL client/server packet
//! protocol, dispatches decoded commands to a session collaborator, and
//! manages links to backend nodes.
//!
//! ## Features
//!
//! - **Readiness-driven I/O**: one acceptor thread, two reactor threads per
//!   processor, built on `mio`
//! - **Workload isolation**: every processor owns its buffer pool, worker
//!   pools and connection registries
//! - **Bounded memory**: fixed-size chunks recycled through a per-processor
//!   pool, with transient fallback when the pool runs dry
//! - **Ordered output**: bytes leave each socket in submission order
//!   whichever thread flushes them
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                Server                                   │
//! │                                                                         │
//! │  ┌─────────────┐   round-robin   ┌──────────────────────────────────┐   │
//! │  │ NioAcceptor │────────────────>│ Processor 0..N                   │   │
//! │  └─────────────┘                 │  Reactor (R + W threads)         │   │
//! │  ┌─────────────┐                 │  BufferPool                      │   │
//! │  │  Connector  │────────────────>│  handler / executor WorkerPools  │   │
//! │  └─────────────┘                 │  frontend / backend registries   │   │
//! │                                  └────────────────▲─────────────────┘   │
//! │  ┌─────────────┐  check() every period            │                     │
//! │  │    Timer    │──────────────────────────────────┘                     │
//! │  └─────────────┘                                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use mysqlmux::config::SystemConfig;
//! use mysqlmux::net::{FrontendConnection, SessionHandler};
//! use mysqlmux::protocol::types::error_code;
//! use mysqlmux::protocol::{AuthPacket, ErrorPacket};
//! use mysqlmux::server::Server;
//! use std::sync::Arc;
//!
//! struct Reject;
//!
//! impl SessionHandler for Reject {
//!     fn authenticate(&self, _auth: &AuthPacket, _seed: &[u8]) -> Result<(), ErrorPacket> {
//!         Ok(())
//!     }
//!
//!     fn query(&self, conn: &FrontendConnection, _sql: &str) -> anyhow::Result<()> {
//!         conn.write_err_message(1, error_code::ER_NOT_SUPPORTED_YET, "No route");
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let server = Server::new(SystemConfig::default())?;
//!     server.startup(Arc::new(Reject))?;
//!     std::thread::park();
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`buffer`]: per-processor pool of fixed-size byte chunks
//! - [`protocol`]: MySQL packet framing, codecs and the login scramble
//! - [`net`]: acceptor, connector, reactor, processors and connections
//! - [`commands`]: command dispatch and per-processor counters
//! - [`timer`]: periodic tasks with explicit context
//! - [`server`]: the server context that wires everything together
//! - [`config`]: system configuration

pub mod buffer;
pub mod commands;
pub mod config;
pub mod net;
pub mod protocol;
pub mod server;
pub mod timer;

// Re-export commonly used types for convenience
pub use buffer::BufferPool;
pub use config::SystemConfig;
pub use net::{BackendHandler, FrontendConnection, Processor, SessionHandler};
pub use protocol::{MySqlPacket, ParseError};
pub use server::Server;

/// The default port mysqlmux listens on
pub const DEFAULT_PORT: u16 = 8066;

/// The default host mysqlmux binds to
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Version of mysqlmux
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server version advertised in the handshake
pub const SERVER_VERSION: &str = concat!("5.1.48-mysqlmux-", env!("CARGO_PKG_VERSION"));
