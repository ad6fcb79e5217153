//! Command Dispatch
//!
//! ```text
//! Client frame
//!       │
//!       ▼
//! ┌──────────────────────────┐
//! │ FrontendConnection       │  (net module)
//! │  authenticated?          │
//! └────────────┬─────────────┘
//!              │
//!              ▼
//! ┌──────────────────────────┐
//! │ FrontendCommandHandler   │  (this module)
//! │  - count                 │
//! │  - dispatch on frame[4]  │
//! └────────────┬─────────────┘
//!              │
//!              ▼
//! ┌──────────────────────────┐
//! │ SessionHandler           │  (collaborator)
//! └──────────────────────────┘
//! ```

pub mod count;
pub mod handler;

pub use count::CommandCount;
pub use handler::FrontendCommandHandler;
