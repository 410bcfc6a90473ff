//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     Load config → Validate → Logging → Metrics → Server + watcher
//!
//! Shutdown (shutdown.rs):
//!     Ctrl+C / SIGTERM → Shutdown::trigger → stop accepting
//!     → in-flight calls finish → pooled connections drain → exit
//! ```
//!
//! # Design Decisions
//! - One broadcast channel; every long-running task subscribes
//! - Ordered shutdown: stop accept, drain, close

pub mod shutdown;

pub use shutdown::{wait_for_signal, Shutdown};
