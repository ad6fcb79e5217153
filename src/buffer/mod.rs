//! Buffer Pool Module
//!
//! Every processor owns one [`BufferPool`]. Connections draw their inbound
//! staging buffer and their outbound chunks from it and hand them back once
//! the bytes have been consumed or flushed.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       BufferPool                         │
//! │                                                          │
//! │   take ─▶ ┌────┬────┬────┬────┬────┬────┐ ◀─ put        │
//! │           │ 4K │ 4K │ 4K │    │    │ 4K │   (ring)      │
//! │           └────┴────┴────┴────┴────┴────┘                │
//! │                                                          │
//! │   empty ring ─▶ transient chunk (counted, never blocks)  │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod pool;

pub use pool::{BufferPool, DEFAULT_BUFFER_SIZE, DEFAULT_CHUNK_SIZE};
