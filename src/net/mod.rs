//! Non-blocking Network Engine
//!
//! Thousands of sockets multiplexed over a handful of threads.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  accept   ┌────────────────────────────────────────────┐
//! │ NioAcceptor  │──────────>│ ConnectionFactory::make(stream)            │
//! │ (1 thread)   │           └──────────────────┬─────────────────────────┘
//! └──────────────┘                              │ id, round-robin processor
//!                                               ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Processor N                                  │
//! │                                                                         │
//! │  registries: frontends / backends     BufferPool     CommandCount       │
//! │                                                                         │
//! │  ┌──────────────── Reactor ─────────────────┐                           │
//! │  │ R-loop: poll -> register / read / flush  │──frames──> handler pool   │
//! │  │ W-loop: write queue -> flush             │<─output─── executor pool  │
//! │  └──────────────────────────────────────────┘                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                               ▲
//! ┌──────────────┐  connected                   │
//! │  Connector   │──────────────────────────────┘
//! │ (1 thread)   │
//! └──────────────┘
//! ```
//!
//! A periodic sweep (`Processor::check`) removes closed connections from the
//! registries, cleans them up and enforces idle timeouts.

pub mod acceptor;
pub mod backend;
pub mod connection;
pub mod connector;
pub mod factory;
pub mod frontend;
pub mod processor;
pub mod reactor;

pub use acceptor::{IdGenerator, NioAcceptor, RoundRobin};
pub use backend::{BackendConnection, BackendCredentials, BackendHandler};
pub use connection::{
    ConnectionCore, ConnectionError, ConnectionState, ErrorKind, NioConnection, ReadOutcome,
};
pub use connector::Connector;
pub use factory::{ConnectionFactory, FrontendConnectionFactory};
pub use frontend::{FrontendConnection, SessionHandler};
pub use processor::{Processor, WorkerPool};
pub use reactor::Reactor;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Locks `mutex`, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Runs `f`, logging instead of unwinding if it panics. Keeps event loops
/// alive across faulty callbacks.
pub(crate) fn guarded<F: FnOnce()>(loop_name: &str, f: F) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        warn!(thread = loop_name, panic = panic_message(payload.as_ref()), "Event loop callback panicked");
    }
}
