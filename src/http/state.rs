//! Per-exchange processing state.
//!
//! # Responsibilities
//! - Hold the inbound request metadata captured from the first chunk
//! - Track which kind of response (full or chunked) is in flight
//! - Own the call flags shared with the streaming channel
//! - Enforce the downstream call state machine
//!
//! # Design Decisions
//! - Exactly one owner per exchange; steps may run on different worker
//!   threads but never concurrently
//! - Flags are atomics behind one `Arc` so the channel and the connection
//!   loop observe the same cells; readers treat a stale value as "stop"

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::http::{HeaderMap, Method, Uri, Version};

use crate::http::message::{RequestHead, ResponseHead};
use crate::observability::TracingContext;

/// Inbound request metadata, immutable once the first chunk is seen.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// `None` only when the first chunk was malformed.
    pub method: Option<Method>,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub path_params: HashMap<String, String>,
}

impl RequestInfo {
    pub fn from_head(head: &RequestHead) -> Self {
        Self {
            method: Some(head.method.clone()),
            uri: head.uri.clone(),
            version: head.version,
            headers: head.headers.clone(),
            path_params: HashMap::new(),
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(axum::http::header::HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| self.uri.host())
    }
}

/// Flags shared between the orchestrator, the streaming channel and the
/// connection loop for the lifetime of one downstream call.
#[derive(Debug)]
pub struct CallFlags {
    call_active: AtomicBool,
    last_chunk_sent: AtomicBool,
    unrecoverable_error: AtomicBool,
}

impl CallFlags {
    /// Flags for a call that may receive data.
    pub fn new_active() -> Arc<Self> {
        Arc::new(Self {
            call_active: AtomicBool::new(true),
            last_chunk_sent: AtomicBool::new(false),
            unrecoverable_error: AtomicBool::new(false),
        })
    }

    pub fn is_call_active(&self) -> bool {
        self.call_active.load(Ordering::Acquire)
    }

    pub fn mark_call_inactive(&self) {
        self.call_active.store(false, Ordering::Release);
    }

    pub fn is_last_chunk_sent(&self) -> bool {
        self.last_chunk_sent.load(Ordering::Acquire)
    }

    /// Returns true if this call made the false→true transition.
    pub fn mark_last_chunk_sent(&self) -> bool {
        !self.last_chunk_sent.swap(true, Ordering::AcqRel)
    }

    pub fn is_unrecoverable(&self) -> bool {
        self.unrecoverable_error.load(Ordering::Acquire)
    }

    /// Set the unrecoverable flag; returns whether it was already set.
    pub fn mark_unrecoverable(&self) -> bool {
        self.unrecoverable_error.swap(true, Ordering::AcqRel)
    }
}

/// Phase of one proxied call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPhase {
    Routing,
    Connecting,
    StreamingRequest,
    StreamingResponse,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl CallPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallPhase::Completed | CallPhase::Failed | CallPhase::TimedOut | CallPhase::Cancelled
        )
    }

    fn rank(self) -> u8 {
        match self {
            CallPhase::Routing => 0,
            CallPhase::Connecting => 1,
            CallPhase::StreamingRequest => 2,
            CallPhase::StreamingResponse => 3,
            _ => 4,
        }
    }

    /// Label used for metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            CallPhase::Routing => "routing",
            CallPhase::Connecting => "connecting",
            CallPhase::StreamingRequest => "streaming_request",
            CallPhase::StreamingResponse => "streaming_response",
            CallPhase::Completed => "completed",
            CallPhase::Failed => "failed",
            CallPhase::TimedOut => "timed_out",
            CallPhase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state machine transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid call transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: CallPhase,
    pub to: CallPhase,
}

/// The response currently being sent upstream.
#[derive(Debug, Clone)]
pub enum ResponseKind {
    Full(ResponseHead),
    Chunked(ResponseHead),
}

/// Mutable state of one inbound exchange.
#[derive(Debug)]
pub struct ProcessingState {
    request: RequestInfo,
    response: Option<ResponseKind>,
    flags: Arc<CallFlags>,
    phase: CallPhase,
    tracing_context: TracingContext,
    request_id: String,
    route_name: Option<String>,
    started_at: Instant,
    lifecycle_logging: bool,
}

impl ProcessingState {
    pub fn new(request: RequestInfo, request_id: String, tracing_context: TracingContext) -> Self {
        Self {
            request,
            response: None,
            flags: CallFlags::new_active(),
            phase: CallPhase::Routing,
            tracing_context,
            request_id,
            route_name: None,
            started_at: Instant::now(),
            lifecycle_logging: false,
        }
    }

    /// Log every phase transition at DEBUG.
    pub fn with_lifecycle_logging(mut self, enabled: bool) -> Self {
        self.lifecycle_logging = enabled;
        self
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub fn set_path_params(&mut self, params: HashMap<String, String>) {
        self.request.path_params = params;
    }

    pub fn flags(&self) -> &Arc<CallFlags> {
        &self.flags
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn tracing_context(&self) -> &TracingContext {
        &self.tracing_context
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn route_name(&self) -> &str {
        self.route_name.as_deref().unwrap_or("none")
    }

    pub fn set_route_name(&mut self, name: impl Into<String>) {
        self.route_name = Some(name.into());
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn response(&self) -> Option<&ResponseKind> {
        self.response.as_ref()
    }

    /// Record the response being sent. A second head is ignored.
    pub fn set_response(&mut self, response: ResponseKind) -> bool {
        if self.response.is_some() {
            tracing::warn!(request_id = %self.request_id, "Response head already recorded, ignoring");
            return false;
        }
        self.response = Some(response);
        true
    }

    /// Move the call forward. Terminal phases are final; non-terminal phases
    /// only move forward, except that streaming the request may overlap with
    /// streaming the response.
    pub fn transition(&mut self, to: CallPhase) -> Result<(), InvalidTransition> {
        let from = self.phase;
        let allowed = !from.is_terminal() && (to.is_terminal() || to.rank() > from.rank());
        if !allowed {
            return Err(InvalidTransition { from, to });
        }
        if to.is_terminal() {
            self.flags.mark_call_inactive();
        }
        if self.lifecycle_logging {
            tracing::debug!(
                request_id = %self.request_id,
                from = %from,
                to = %to,
                elapsed_ms = self.started_at.elapsed().as_millis() as u64,
                "Downstream call phase transition"
            );
        }
        self.phase = to;
        Ok(())
    }
}
