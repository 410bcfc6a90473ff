//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Downstream call:
//!     → circuit_breaker.rs (permission before acquire, outcome afterwards)
//!     → timeouts.rs (idle supervision on the connection loop)
//!         active call:  no downstream traffic for too long → call fails
//!         pooled idle:  unused for too long → connection evicted
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every downstream connection is supervised
//! - No internal retries; retry policy belongs to the caller
//! - Circuit breaker prevents cascading failures

pub mod circuit_breaker;
pub mod timeouts;
