//! Proxy core: one inbound exchange mapped onto one downstream call.
//!
//! # Data Flow
//! ```text
//! Inbound request (head + streaming body)
//!     → orchestrator.rs (routing, breaker permission, subspan)
//!         → pool acquire → channel.rs (attach, active-call supervisor)
//!         → inbound frames → StreamingChannel::stream_chunk → connection loop
//!         → DownstreamEvent (head, data, end, failure) → ResponseSender
//!     → release (clean) or close + discard (any failure)
//! ```
//!
//! # Design Decisions
//! - Call flags are the only state shared with the pool machinery
//! - Socket work always runs on the connection's own loop task

pub mod channel;
pub mod orchestrator;

pub use channel::{ChannelError, ChunkSendSignal, StreamingChannel};
pub use orchestrator::StreamingProxyOrchestrator;
