//! Distributed tracing support.
//!
//! # Responsibilities
//! - Extract trace context from incoming requests (W3C `traceparent`)
//! - Create root spans for inbound requests and subspans for downstream calls
//! - Propagate trace context to downstream requests
//!
//! # Design Decisions
//! - The `Tracer` trait is the seam to a tracing backend; `LocalTracer`
//!   keeps span stacks in the thread-local context and exports completed
//!   spans as structured log events
//! - Ids are random; a remote parent keeps its trace id and sampling flag

use std::fmt;
use std::time::Instant;

use axum::http::{HeaderMap, HeaderValue};

use crate::observability::context::{self, Span, SpanPurpose, TracingContext};

/// W3C trace context header.
pub const TRACEPARENT: &str = "traceparent";

/// A parsed `traceparent` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceParent {
    pub trace_id: u128,
    pub parent_id: u64,
    pub sampled: bool,
}

impl TraceParent {
    /// Parse `00-<32 hex>-<16 hex>-<2 hex>`. Anything else yields `None`.
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let parent_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some()
            || version != "00"
            || trace_id.len() != 32
            || parent_id.len() != 16
            || flags.len() != 2
        {
            return None;
        }
        let trace_id = u128::from_str_radix(trace_id, 16).ok()?;
        let parent_id = u64::from_str_radix(parent_id, 16).ok()?;
        let flags = u8::from_str_radix(flags, 16).ok()?;
        if trace_id == 0 || parent_id == 0 {
            return None;
        }
        Some(Self {
            trace_id,
            parent_id,
            sampled: flags & 0x01 == 0x01,
        })
    }

    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        headers
            .get(TRACEPARENT)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse)
    }

    /// The header to send downstream so `span` becomes the remote parent.
    pub fn header_for(span: &Span) -> HeaderValue {
        let value = format!(
            "00-{}-{}-{:02x}",
            span.trace_id_hex(),
            span.span_id_hex(),
            u8::from(span.sampled)
        );
        // Only hex digits and dashes, always a valid header value.
        HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static(""))
    }
}

/// Tracing backend operating on the calling thread's linked context.
pub trait Tracer: Send + Sync + fmt::Debug {
    /// Start a new trace (or continue a remote one) and link it as the only span.
    fn start_root_span(&self, name: &str, remote_parent: Option<TraceParent>) -> Span;

    /// Push a child of the current innermost span; starts a root span if none is active.
    fn start_child_span(&self, name: &str, purpose: SpanPurpose) -> Span;

    /// Pop and export the innermost span.
    fn complete_current_span(&self) -> Option<Span>;

    /// Snapshot of the calling thread's span stack and MDC.
    fn current_span_stack_snapshot(&self) -> TracingContext {
        context::current_context()
    }
}

/// Tracer that keeps spans in the thread-local context and exports via `tracing`.
#[derive(Debug, Default, Clone)]
pub struct LocalTracer;

impl LocalTracer {
    pub fn new() -> Self {
        Self
    }

    fn replace_current(next: TracingContext) {
        // The prior value is intentionally discarded: the span stack itself
        // is the state being advanced.
        let _prior = context::link_context(&next);
    }
}

fn random_span_id() -> u64 {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

fn random_trace_id() -> u128 {
    loop {
        let id: u128 = rand::random();
        if id != 0 {
            return id;
        }
    }
}

impl Tracer for LocalTracer {
    fn start_root_span(&self, name: &str, remote_parent: Option<TraceParent>) -> Span {
        let span = Span {
            trace_id: remote_parent.map_or_else(random_trace_id, |p| p.trace_id),
            span_id: random_span_id(),
            parent_span_id: remote_parent.map(|p| p.parent_id),
            name: name.to_string(),
            purpose: SpanPurpose::Server,
            sampled: remote_parent.map_or(true, |p| p.sampled),
            started_at: Instant::now(),
        };
        let mdc = context::current_context().mdc().clone();
        let base = TracingContext::new(Vec::new(), mdc);
        Self::replace_current(base.with_span_pushed(span.clone()));
        span
    }

    fn start_child_span(&self, name: &str, purpose: SpanPurpose) -> Span {
        let current = context::current_context();
        let Some(parent) = current.current_span() else {
            let mut root = self.start_root_span(name, None);
            root.purpose = purpose;
            let (without, _) = context::current_context().with_span_popped();
            Self::replace_current(without.with_span_pushed(root.clone()));
            return root;
        };
        let span = Span {
            trace_id: parent.trace_id,
            span_id: random_span_id(),
            parent_span_id: Some(parent.span_id),
            name: name.to_string(),
            purpose,
            sampled: parent.sampled,
            started_at: Instant::now(),
        };
        Self::replace_current(current.with_span_pushed(span.clone()));
        span
    }

    fn complete_current_span(&self) -> Option<Span> {
        let (remaining, completed) = context::current_context().with_span_popped();
        let span = completed?;
        let duration = span.started_at.elapsed();
        if span.sampled {
            tracing::debug!(
                span_name = %span.name,
                trace_id = %span.trace_id_hex(),
                span_id = %span.span_id_hex(),
                parent_id = ?span.parent_span_id.map(|id| format!("{:016x}", id)),
                purpose = ?span.purpose,
                duration_us = duration.as_micros() as u64,
                "Span completed"
            );
        }
        Self::replace_current(remaining);
        Some(span)
    }
}
