//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, catch-all handler)
//!     → request.rs (request ID, head/body split)
//!     → state.rs (ProcessingState for the exchange)
//!     → [proxy orchestrator runs the downstream call]
//!     → response.rs (ResponseSender: head, chunks, trailers)
//!     → Send to client
//!
//! message.rs: the outbound message kinds both directions share
//! body.rs:    channel-fed bodies for streaming
//! ```

pub mod body;
pub mod message;
pub mod request;
pub mod response;
pub mod server;
pub mod state;

pub use message::{OutboundMessage, RequestHead, ResponseHead};
pub use request::{RequestIdExt, X_REQUEST_ID};
pub use server::HttpServer;
