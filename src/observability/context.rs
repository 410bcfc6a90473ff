//! Tracing context carrier.
//!
//! # Responsibilities
//! - Hold an immutable snapshot of the span stack and the MDC map
//! - Link a snapshot to the executing thread and restore the prior one
//! - Keep every log line emitted under a linked context inside a `tracing`
//!   span that carries the trace and span ids
//!
//! # Design Decisions
//! - Snapshots are passed explicitly (captured by channels, calls, tasks);
//!   the thread-local is only the "currently linked" view
//! - Link and unlink are always paired: `LinkGuard` restores on drop, so the
//!   pairing holds across early returns and panics
//! - `WithTracingContext` links around every poll, which is the async
//!   equivalent of "link on whatever I/O thread runs this callback"

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use pin_project_lite::pin_project;

/// MDC key holding the active trace id.
pub const MDC_TRACE_ID: &str = "traceId";

/// MDC key holding the inbound request id.
pub const MDC_REQUEST_ID: &str = "requestId";

/// What a span represents relative to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanPurpose {
    /// Work done on behalf of an inbound request.
    Server,
    /// An outbound call to a downstream service.
    Client,
    /// Purely local work.
    LocalOnly,
}

/// One unit of traced work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub trace_id: u128,
    pub span_id: u64,
    pub parent_span_id: Option<u64>,
    pub name: String,
    pub purpose: SpanPurpose,
    pub sampled: bool,
    pub started_at: Instant,
}

impl Span {
    /// Trace id as 32 lowercase hex digits.
    pub fn trace_id_hex(&self) -> String {
        format!("{:032x}", self.trace_id)
    }

    /// Span id as 16 lowercase hex digits.
    pub fn span_id_hex(&self) -> String {
        format!("{:016x}", self.span_id)
    }
}

/// Immutable snapshot of a span stack (innermost last) and MDC map.
#[derive(Clone)]
pub struct TracingContext {
    spans: Arc<[Span]>,
    mdc: Arc<BTreeMap<String, String>>,
    log_span: tracing::Span,
}

impl TracingContext {
    /// Build a snapshot from its parts.
    pub fn new(spans: Vec<Span>, mdc: BTreeMap<String, String>) -> Self {
        let log_span = match spans.last() {
            Some(span) => tracing::info_span!(
                "trace",
                trace_id = %span.trace_id_hex(),
                span_id = %span.span_id_hex(),
                mdc = ?mdc,
            ),
            None if mdc.is_empty() => tracing::Span::none(),
            None => tracing::info_span!("trace", mdc = ?mdc),
        };
        Self {
            spans: spans.into(),
            mdc: Arc::new(mdc),
            log_span,
        }
    }

    /// A context with no spans and an empty MDC.
    pub fn empty() -> Self {
        Self {
            spans: Arc::from(Vec::new()),
            mdc: Arc::new(BTreeMap::new()),
            log_span: tracing::Span::none(),
        }
    }

    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    pub fn mdc(&self) -> &BTreeMap<String, String> {
        &self.mdc
    }

    /// The innermost span, if any.
    pub fn current_span(&self) -> Option<&Span> {
        self.spans.last()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty() && self.mdc.is_empty()
    }

    /// A copy of this snapshot with `span` pushed as the innermost span.
    pub fn with_span_pushed(&self, span: Span) -> Self {
        let mut spans = self.spans.to_vec();
        let mut mdc = (*self.mdc).clone();
        mdc.insert(MDC_TRACE_ID.to_string(), span.trace_id_hex());
        spans.push(span);
        Self::new(spans, mdc)
    }

    /// A copy of this snapshot with the innermost span removed.
    pub fn with_span_popped(&self) -> (Self, Option<Span>) {
        let mut spans = self.spans.to_vec();
        let popped = spans.pop();
        let mut mdc = (*self.mdc).clone();
        match spans.last() {
            Some(outer) => {
                mdc.insert(MDC_TRACE_ID.to_string(), outer.trace_id_hex());
            }
            None => {
                mdc.remove(MDC_TRACE_ID);
            }
        }
        (Self::new(spans, mdc), popped)
    }

    /// A copy of this snapshot with one MDC entry set.
    pub fn with_mdc(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut mdc = (*self.mdc).clone();
        mdc.insert(key.into(), value.into());
        Self::new(self.spans.to_vec(), mdc)
    }

    /// The `tracing` span log lines are recorded under while this snapshot is linked.
    pub fn log_span(&self) -> &tracing::Span {
        &self.log_span
    }

    /// Link this snapshot around every poll of `future`.
    pub fn instrument<F: Future>(&self, future: F) -> WithTracingContext<F> {
        WithTracingContext {
            inner: future,
            context: self.clone(),
        }
    }
}

impl Default for TracingContext {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for TracingContext {
    fn eq(&self, other: &Self) -> bool {
        self.spans == other.spans && self.mdc == other.mdc
    }
}

impl Eq for TracingContext {}

impl fmt::Debug for TracingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TracingContext")
            .field("spans", &self.spans)
            .field("mdc", &self.mdc)
            .finish()
    }
}

thread_local! {
    static CURRENT: RefCell<TracingContext> = RefCell::new(TracingContext::empty());
}

/// Snapshot of the context linked to the calling thread.
pub fn current_context() -> TracingContext {
    CURRENT.with(|current| current.borrow().clone())
}

/// Replace the calling thread's context, returning the prior one.
///
/// Must be paired with [`unlink_context`] using the returned value.
pub fn link_context(context: &TracingContext) -> TracingContext {
    CURRENT.with(|current| current.replace(context.clone()))
}

/// Restore a context previously returned by [`link_context`].
pub fn unlink_context(prior: TracingContext) {
    CURRENT.with(|current| {
        current.replace(prior);
    });
}

/// Scoped link: the prior context is restored when the guard drops.
#[must_use = "the context is unlinked as soon as the guard is dropped"]
pub struct LinkGuard {
    prior: Option<TracingContext>,
    _entered: tracing::span::EnteredSpan,
}

/// Link `context` to the calling thread until the returned guard drops.
pub fn link(context: &TracingContext) -> LinkGuard {
    let prior = link_context(context);
    LinkGuard {
        prior: Some(prior),
        _entered: context.log_span.clone().entered(),
    }
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        if let Some(prior) = self.prior.take() {
            unlink_context(prior);
        }
    }
}

/// Run `f` with `context` linked, restoring the prior context afterwards
/// even if `f` panics.
pub fn with_context<R>(context: &TracingContext, f: impl FnOnce() -> R) -> R {
    let _guard = link(context);
    f()
}

/// Set an MDC entry on the calling thread's context.
pub fn mdc_put(key: &str, value: &str) {
    CURRENT.with(|current| {
        let next = current.borrow().with_mdc(key, value);
        current.replace(next);
    });
}

pub fn mdc_get(key: &str) -> Option<String> {
    CURRENT.with(|current| current.borrow().mdc.get(key).cloned())
}

pub fn mdc_remove(key: &str) {
    CURRENT.with(|current| {
        let snapshot = current.borrow().clone();
        if snapshot.mdc.contains_key(key) {
            let mut mdc = (*snapshot.mdc).clone();
            mdc.remove(key);
            current.replace(TracingContext::new(snapshot.spans.to_vec(), mdc));
        }
    });
}

pin_project! {
    /// Future that links a [`TracingContext`] around each poll of its inner future.
    pub struct WithTracingContext<F> {
        #[pin]
        inner: F,
        context: TracingContext,
    }
}

impl<F: Future> Future for WithTracingContext<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _guard = link(this.context);
        this.inner.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(name: &str, trace_id: u128, span_id: u64) -> Span {
        Span {
            trace_id,
            span_id,
            parent_span_id: None,
            name: name.to_string(),
            purpose: SpanPurpose::Server,
            sampled: true,
            started_at: Instant::now(),
        }
    }

    #[test]
    fn link_returns_prior_and_unlink_restores() {
        let outer = TracingContext::empty().with_span_pushed(span("outer", 1, 1));
        let inner = outer.with_span_pushed(span("inner", 1, 2));

        let before = link_context(&outer);
        assert_eq!(before, TracingContext::empty());

        let prior = link_context(&inner);
        assert_eq!(prior, outer);
        assert_eq!(current_context(), inner);

        unlink_context(prior);
        assert_eq!(current_context(), outer);
        unlink_context(before);
        assert_eq!(current_context(), TracingContext::empty());
    }

    #[test]
    fn guard_restores_on_panic() {
        let baseline = TracingContext::empty().with_mdc("user", "a");
        let _outer = link(&baseline);

        let linked = TracingContext::empty().with_span_pushed(span("work", 7, 7));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            with_context(&linked, || {
                assert_eq!(current_context(), linked);
                panic!("boom");
            })
        }));

        assert!(result.is_err());
        assert_eq!(current_context(), baseline);
    }

    #[test]
    fn nested_links_unwind_symmetrically() {
        let contexts: Vec<TracingContext> = (0..4u64)
            .map(|i| TracingContext::empty().with_span_pushed(span("s", 9, i)))
            .collect();

        let mut history = vec![current_context()];
        let mut guards = Vec::new();
        for ctx in &contexts {
            guards.push(link(ctx));
            history.push(current_context());
        }
        while let Some(guard) = guards.pop() {
            history.pop();
            drop(guard);
            assert_eq!(Some(&current_context()), history.last());
        }
    }

    #[test]
    fn span_push_and_pop_track_trace_id_in_mdc() {
        let ctx = TracingContext::empty().with_span_pushed(span("root", 0xabc, 1));
        assert_eq!(ctx.mdc().get(MDC_TRACE_ID).map(String::as_str), Some("00000000000000000000000000000abc"));

        let (popped_ctx, popped) = ctx.with_span_popped();
        assert_eq!(popped.map(|s| s.name), Some("root".to_string()));
        assert!(popped_ctx.mdc().get(MDC_TRACE_ID).is_none());
        assert!(popped_ctx.is_empty());
    }

    #[test]
    fn mdc_helpers_edit_current_context() {
        let baseline = current_context();
        let prior = link_context(&TracingContext::empty());
        mdc_put("route", "r1");
        assert_eq!(mdc_get("route").as_deref(), Some("r1"));
        mdc_remove("route");
        assert!(mdc_get("route").is_none());
        unlink_context(prior);
        assert_eq!(current_context(), baseline);
    }

    #[tokio::test]
    async fn instrumented_future_sees_context_only_while_polled() {
        let ctx = TracingContext::empty().with_span_pushed(span("call", 5, 5));
        let seen = ctx
            .instrument(async {
                tokio::task::yield_now().await;
                current_context()
            })
            .await;
        assert_eq!(seen, ctx);
        assert_eq!(current_context(), TracingContext::empty());
    }
}
