//! Streaming HTTP gateway engine.
//!
//! Every inbound request is proxied to one downstream service over a pooled
//! HTTP/1.1 connection, streaming the request body down and the response
//! body up chunk by chunk as it arrives.

// Core subsystems
pub mod config;
pub mod error;
pub mod http;
pub mod net;
pub mod pool;
pub mod proxy;
pub mod routing;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::GatewayConfig;
pub use error::ProxyError;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
