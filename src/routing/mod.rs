//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! RequestInfo (method, host, path, headers)
//!     → contract.rs (ProxyRoutingContract::first_chunk_info)
//!         → router.rs (first matching route)
//!             → matcher.rs (host, method, path template)
//!         → rewrite path with captured variables, keep query
//!         → strip hop-by-hop headers, set Host
//!         → pick breaker policy
//!     → DownstreamRequestFirstChunkInfo or RoutingError
//!
//! Route compilation (startup and reload):
//!     RouteConfig[] → CompiledRoute[] → RouteTable → ArcSwap
//! ```
//!
//! # Design Decisions
//! - Tables are immutable; reload swaps the whole table atomically
//! - No regex in the hot path
//! - First match wins, in configuration order

pub mod contract;
pub mod matcher;
pub mod router;

pub use contract::{DownstreamRequestFirstChunkInfo, PassThroughRouting, ProxyRoutingContract, RoutingError};
pub use router::{parse_downstream, RouteTable};
