//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound request:
//!     → tracer.rs (root span, continues remote traceparent)
//!     → context.rs (snapshot linked around every step of the call)
//!     → logging.rs (every event carries trace_id/span_id)
//!
//! Downstream call:
//!     → tracer.rs (client subspan, traceparent header)
//!     → metrics.rs (outcome counters, pool events)
//! ```
//!
//! # Design Decisions
//! - Trace context is passed explicitly and linked per poll, never inherited
//! - Metrics are cheap (atomic increments) and optional

pub mod context;
pub mod logging;
pub mod metrics;
pub mod tracer;

pub use context::{Span, SpanPurpose, TracingContext};
pub use tracer::{LocalTracer, TraceParent, Tracer};
