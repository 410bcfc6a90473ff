//! Drives one proxied call from routing to its terminal phase.
//!
//! # Call Flow
//! ```text
//! Routing ──fail──────────────────────────────────────────────→ Failed
//!    │ breaker permission ──open─────────────────────────────→ Failed
//!    ▼
//! Connecting (acquire) ──fail────────────────────────────────→ Failed / TimedOut
//!    ▼
//! StreamingRequest  (inbound frames → stream_chunk)
//!    ▼  downstream head
//! StreamingResponse (downstream events → ResponseSender)
//!    ▼
//! Completed | Failed | TimedOut | Cancelled
//! ```
//!
//! # Design Decisions
//! - The request pump and the response relay share one task; the relay is
//!   always polled first so downstream events never queue behind a write
//! - On failure the channel is closed before the terminal transition,
//!   because a terminal phase marks the call inactive and closing an
//!   inactive call is a no-op
//! - Every call that got breaker permission reports exactly one outcome

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http_body::Body as _;
use http_body_util::BodyExt;
use tokio::sync::mpsc;

use crate::config::TimeoutConfig;
use crate::error::ProxyError;
use crate::http::message::{OutboundMessage, RequestHead, ResponseHead};
use crate::http::response::{self, ResponseError, ResponseSender};
use crate::http::state::{CallPhase, ProcessingState, ResponseKind};
use crate::observability::context;
use crate::observability::metrics;
use crate::observability::tracer::TRACEPARENT;
use crate::observability::{SpanPurpose, TraceParent, Tracer, TracingContext};
use crate::pool::{ConnectionPool, Destination, DownstreamError, DownstreamEvent, PoolError};
use crate::proxy::channel::StreamingChannel;
use crate::resilience::circuit_breaker::{notify_failure, notify_success, BreakerRegistry, CircuitBreaker};
use crate::routing::contract::strip_hop_by_hop;
use crate::routing::ProxyRoutingContract;

/// Name of the subspan covering one downstream call.
const DOWNSTREAM_SPAN: &str = "downstream_call";

/// Runs proxied calls: routing, connection, streaming both ways, outcome.
pub struct StreamingProxyOrchestrator {
    routing: Arc<dyn ProxyRoutingContract>,
    pool: Arc<dyn ConnectionPool>,
    breakers: Arc<BreakerRegistry>,
    tracer: Arc<dyn Tracer>,
    active_call_timeout: Duration,
}

impl StreamingProxyOrchestrator {
    pub fn new(
        routing: Arc<dyn ProxyRoutingContract>,
        pool: Arc<dyn ConnectionPool>,
        breakers: Arc<BreakerRegistry>,
        tracer: Arc<dyn Tracer>,
        timeouts: &TimeoutConfig,
    ) -> Self {
        Self {
            routing,
            pool,
            breakers,
            tracer,
            active_call_timeout: Duration::from_millis(timeouts.active_call_idle_ms),
        }
    }

    /// Proxy one inbound exchange. Resolves with the response head as soon
    /// as it is known; the body keeps streaming from a background task.
    pub async fn proxy(self: &Arc<Self>, state: ProcessingState, body: Body) -> Response {
        let (sender, pending) = response::channel();
        let this = Arc::clone(self);
        let call_context = state.tracing_context().clone();
        tokio::spawn(call_context.instrument(async move { this.run(state, body, sender).await }));
        pending.into_response().await
    }

    async fn run(&self, mut state: ProcessingState, body: Body, mut response: ResponseSender) {
        let result = self.execute(&mut state, body, &mut response).await;
        if let Err(error) = &result {
            report_failure(&mut state, &mut response, error);
        }

        let status = response.status().map_or(0, |s| s.as_u16());
        metrics::record_call_outcome(state.route_name(), state.phase().as_str(), status, state.started_at());
        tracing::debug!(
            request_id = %state.request_id(),
            route = %state.route_name(),
            outcome = %state.phase(),
            status,
            elapsed_ms = state.started_at().elapsed().as_millis() as u64,
            "Proxy call finished"
        );
        context::with_context(state.tracing_context(), || self.tracer.complete_current_span());
    }

    async fn execute(
        &self,
        state: &mut ProcessingState,
        body: Body,
        response: &mut ResponseSender,
    ) -> Result<(), ProxyError> {
        let info = match self.routing.first_chunk_info(state.request(), state.tracing_context()).await {
            Ok(info) => info,
            Err(error) => {
                advance(state, CallPhase::Failed);
                return Err(error.into());
            }
        };
        state.set_route_name(info.route_name.clone());
        state.set_path_params(info.path_params.clone());
        let destination = info.destination();

        let breaker = info.circuit_breaker_selection.resolve(&self.breakers, destination.host());
        if let Some(breaker) = &breaker {
            if let Err(open) = breaker.check_permission() {
                tracing::info!(destination = %destination, breaker = %open.name, "Circuit open, call refused");
                metrics::record_breaker_rejection(destination.host());
                advance(state, CallPhase::Failed);
                return Err(open.into());
            }
        }

        let (span, call_context) = context::with_context(state.tracing_context(), || {
            let span = self.tracer.start_child_span(DOWNSTREAM_SPAN, SpanPurpose::Client);
            (span, self.tracer.current_span_stack_snapshot())
        });
        let mut head = info.first_chunk_request;
        head.headers.insert(TRACEPARENT, TraceParent::header_for(&span));

        let call = DownstreamCall {
            destination,
            head,
            breaker: breaker.as_deref(),
            context: call_context.clone(),
        };
        let result = call_context
            .instrument(self.call_downstream(state, call, body, response))
            .await;
        context::with_context(&call_context, || self.tracer.complete_current_span());
        result
    }

    async fn call_downstream(
        &self,
        state: &mut ProcessingState,
        call: DownstreamCall<'_>,
        body: Body,
        response: &mut ResponseSender,
    ) -> Result<(), ProxyError> {
        advance(state, CallPhase::Connecting);
        let connection = match self.pool.acquire(&call.destination).await {
            Ok(connection) => connection,
            Err(error) => return Err(fail_without_channel(state, call.breaker, error.into())),
        };

        let description = format!(
            "{} {}{}",
            call.head.method,
            call.destination,
            call.head.uri.path_and_query().map_or("", |pq| pq.as_str())
        );
        let (channel, mut events) = match StreamingChannel::attach(
            Arc::clone(&self.pool),
            connection,
            Arc::clone(state.flags()),
            call.context.clone(),
            self.active_call_timeout,
            description,
        ) {
            Ok(attached) => attached,
            Err(rejected) => {
                let error = ProxyError::Channel(rejected.into());
                return Err(fail_without_channel(state, call.breaker, error));
            }
        };
        advance(state, CallPhase::StreamingRequest);
        tracing::debug!(
            connection_id = %channel.connection_id(),
            destination = %channel.destination(),
            "Downstream call started"
        );

        match stream_call(
            &channel,
            &mut events,
            state,
            call.head,
            body,
            response,
            self.active_call_timeout,
        )
        .await {
            Ok(downstream_head) => {
                channel.supervisor().disable_timeout_handling();
                advance(state, CallPhase::Completed);
                if let Some(breaker) = call.breaker {
                    notify_success(breaker, &downstream_head);
                }
                channel.release();
                Ok(())
            }
            Err(error) => {
                channel.close_channel_due_to_unrecoverable_error(&error);
                advance(state, failure_phase(&error));
                if let Some(breaker) = call.breaker {
                    notify_failure(breaker, &error);
                }
                channel.discard();
                Err(error)
            }
        }
    }
}

/// Parameters of one downstream call once routing and breaker checks passed.
struct DownstreamCall<'a> {
    destination: Destination,
    head: RequestHead,
    breaker: Option<&'a dyn CircuitBreaker>,
    context: TracingContext,
}

/// Tell the caller about `error` and record any error response on the call.
fn report_failure(state: &mut ProcessingState, response: &mut ResponseSender, error: &ProxyError) {
    if let Some(head) = response.fail(error) {
        state.set_response(ResponseKind::Full(head));
    }
}

fn fail_without_channel(
    state: &mut ProcessingState,
    breaker: Option<&dyn CircuitBreaker>,
    error: ProxyError,
) -> ProxyError {
    advance(state, failure_phase(&error));
    if let Some(breaker) = breaker {
        notify_failure(breaker, &error);
    }
    error
}

/// Terminal phase for a failed call.
fn failure_phase(error: &ProxyError) -> CallPhase {
    match error {
        ProxyError::Downstream(DownstreamError::IdleTimeout(_)) => CallPhase::TimedOut,
        ProxyError::Pool(PoolError::ConnectTimeout { .. }) => CallPhase::TimedOut,
        ProxyError::Channel(e) if e.is_write_stall() => CallPhase::TimedOut,
        ProxyError::ClientStalled { .. } => CallPhase::TimedOut,
        ProxyError::InboundBody(_) | ProxyError::ClientGone => CallPhase::Cancelled,
        _ => CallPhase::Failed,
    }
}

fn advance(state: &mut ProcessingState, to: CallPhase) {
    if let Err(e) = state.transition(to) {
        tracing::warn!(request_id = %state.request_id(), error = %e, "Ignoring call phase transition");
    }
}

fn relay_error(error: ResponseError, idle: Duration) -> ProxyError {
    match error {
        ResponseError::Stalled => ProxyError::ClientStalled { idle },
        _ => ProxyError::ClientGone,
    }
}

/// Pump the request body down while relaying response events up, until
/// the downstream response ends or something fails.
async fn stream_call(
    channel: &StreamingChannel,
    events: &mut mpsc::Receiver<DownstreamEvent>,
    state: &mut ProcessingState,
    head: RequestHead,
    body: Body,
    response: &mut ResponseSender,
    timeout: Duration,
) -> Result<ResponseHead, ProxyError> {
    // A caller that stops reading for as long as the downstream may stay
    // quiet ends the call; otherwise the relay would block the connection.
    response.set_write_timeout(timeout);
    let pump = pump_request(channel, head, body);
    tokio::pin!(pump);
    let mut pump_done = false;
    let mut downstream_head: Option<ResponseHead> = None;

    loop {
        tokio::select! {
            biased;

            event = events.recv() => match event {
                Some(DownstreamEvent::Head(head)) => {
                    advance(state, CallPhase::StreamingResponse);
                    state.set_response(ResponseKind::Chunked(head.clone()));
                    let upstream = ResponseHead {
                        status: head.status,
                        version: head.version,
                        headers: strip_hop_by_hop(&head.headers),
                    };
                    response
                        .send(OutboundMessage::Headers(upstream))
                        .await
                        .map_err(|e| relay_error(e, timeout))?;
                    downstream_head = Some(head);
                }
                Some(DownstreamEvent::Data(data)) => {
                    response
                        .send(OutboundMessage::Content(data))
                        .await
                        .map_err(|e| relay_error(e, timeout))?;
                }
                Some(DownstreamEvent::End(trailers)) => {
                    let Some(head) = downstream_head.take() else {
                        return Err(DownstreamError::ClosedUnexpectedly {
                            connection_id: channel.connection_id(),
                        }
                        .into());
                    };
                    response
                        .send(OutboundMessage::LastContent { body: Bytes::new(), trailers })
                        .await
                        .map_err(|e| relay_error(e, timeout))?;
                    if !pump_done {
                        tracing::debug!(
                            connection_id = %channel.connection_id(),
                            "Downstream answered before the request body was fully sent"
                        );
                    }
                    return Ok(head);
                }
                Some(DownstreamEvent::Failed(error)) => return Err(error.into()),
                None => {
                    return Err(DownstreamError::ClosedUnexpectedly {
                        connection_id: channel.connection_id(),
                    }
                    .into())
                }
            },

            result = &mut pump, if !pump_done => {
                pump_done = true;
                result?;
            }

            _ = response.closed() => return Err(ProxyError::ClientGone),
        }
    }
}

/// Forward the inbound body as it arrives. A request known to have no body
/// goes out as one full message.
async fn pump_request(channel: &StreamingChannel, head: RequestHead, mut body: Body) -> Result<(), ProxyError> {
    if body.is_end_stream() {
        channel
            .stream_chunk(OutboundMessage::Full { head, body: Bytes::new() })
            .await?;
        return Ok(());
    }

    channel.stream_chunk(OutboundMessage::Headers(head)).await?;
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| ProxyError::InboundBody(e.to_string()))?;
        let chunk = match frame.into_data() {
            Ok(data) => OutboundMessage::Content(data),
            Err(frame) => match frame.into_trailers() {
                Ok(trailers) => OutboundMessage::LastContent {
                    body: Bytes::new(),
                    trailers: Some(trailers),
                },
                Err(_) => continue,
            },
        };
        channel.stream_chunk(chunk).await?;
    }
    // Suppressed by the channel if trailers already ended the request.
    channel.stream_chunk(OutboundMessage::last()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, RouteConfig};
    use crate::http::state::RequestInfo;
    use crate::observability::LocalTracer;
    use crate::pool::testing::{memory_connection, MemoryDownstream, MemoryPool};
    use crate::pool::{ResponseFrame, TransportError};
    use crate::resilience::circuit_breaker::CircuitBreakerOpen;
    use crate::routing::PassThroughRouting;
    use axum::http::{HeaderMap, Method, StatusCode, Version};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingBreaker {
        open: AtomicBool,
        permissions: AtomicUsize,
        successes: AtomicUsize,
        failures: AtomicUsize,
    }

    impl CountingBreaker {
        fn counts(&self) -> (usize, usize, usize) {
            (
                self.permissions.load(Ordering::SeqCst),
                self.successes.load(Ordering::SeqCst),
                self.failures.load(Ordering::SeqCst),
            )
        }
    }

    impl CircuitBreaker for CountingBreaker {
        fn check_permission(&self) -> Result<(), CircuitBreakerOpen> {
            self.permissions.fetch_add(1, Ordering::SeqCst);
            if self.open.load(Ordering::SeqCst) {
                Err(CircuitBreakerOpen { name: "counting".into() })
            } else {
                Ok(())
            }
        }

        fn record_success(&self, _response: &ResponseHead) {
            self.successes.fetch_add(1, Ordering::SeqCst);
        }

        fn record_failure(&self, _error: &(dyn std::error::Error + Send + Sync)) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        orchestrator: Arc<StreamingProxyOrchestrator>,
        pool: Arc<MemoryPool>,
        downstream: MemoryDownstream,
        breaker: Arc<CountingBreaker>,
    }

    fn harness(active_call_idle_ms: u64) -> Harness {
        let (handle, downstream, _tracker) = memory_connection(Duration::from_secs(60));
        let pool = Arc::new(MemoryPool::with_connection(handle));
        let breaker = Arc::new(CountingBreaker::default());
        let route = RouteConfig {
            name: "items".into(),
            host: None,
            path: "/proxy/{id}".into(),
            methods: vec![],
            downstream: "http://backend:9000".into(),
            downstream_path: "/backend/{id}".into(),
            disable_breaker: false,
        };
        let routing = PassThroughRouting::new(&[route])
            .unwrap()
            .with_custom_breaker("items", breaker.clone());
        let timeouts = TimeoutConfig {
            active_call_idle_ms,
            ..TimeoutConfig::default()
        };
        let orchestrator = Arc::new(StreamingProxyOrchestrator::new(
            Arc::new(routing),
            pool.clone(),
            Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default())),
            Arc::new(LocalTracer::new()),
            &timeouts,
        ));
        Harness {
            orchestrator,
            pool,
            downstream,
            breaker,
        }
    }

    fn call(method: Option<Method>, uri: &str) -> ProcessingState {
        let info = RequestInfo {
            method,
            uri: uri.parse().unwrap(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            path_params: Default::default(),
        };
        ProcessingState::new(info, "req-1".into(), TracingContext::empty()).with_lifecycle_logging(true)
    }

    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    async fn error_code(response: Response) -> String {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        json["errors"][0]["code"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn streams_three_chunks_and_records_one_success() {
        let h = harness(5_000);
        let orchestrator = h.orchestrator.clone();
        let request = tokio::spawn(async move { orchestrator.proxy(call(Some(Method::GET), "/proxy/42"), Body::empty()).await });

        eventually(|| h.downstream.written_kinds() == vec!["full"]).await;
        {
            let written = h.downstream.written.lock().unwrap();
            let OutboundMessage::Full { head, .. } = &written[0] else {
                panic!("expected a full request");
            };
            assert_eq!(head.uri, "/backend/42");
            assert!(head.headers.contains_key(TRACEPARENT));
        }

        h.downstream.send(ResponseFrame::Head(ResponseHead::new(StatusCode::OK)));
        for part in ["c1", "c2", "c3"] {
            h.downstream.send(ResponseFrame::Data(Bytes::from(part)));
        }
        h.downstream.send(ResponseFrame::End(None));

        let response = request.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"c1c2c3"));

        eventually(|| h.pool.counts() == (1, 1, 0)).await;
        assert_eq!(h.breaker.counts(), (1, 1, 0));
    }

    #[tokio::test]
    async fn request_body_is_streamed_as_chunks() {
        let h = harness(5_000);
        let orchestrator = h.orchestrator.clone();
        let parts: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from("p1")), Ok(Bytes::from("p2"))];
        let body = Body::from_stream(futures_util::stream::iter(parts));
        let request = tokio::spawn(async move { orchestrator.proxy(call(Some(Method::POST), "/proxy/7"), body).await });

        eventually(|| h.downstream.written_kinds().last() == Some(&"last_content")).await;
        assert_eq!(
            h.downstream.written_kinds(),
            vec!["headers", "content", "content", "last_content"]
        );
        assert_eq!(
            h.downstream.written_bodies(),
            vec![Bytes::from("p1"), Bytes::from("p2"), Bytes::new()]
        );

        h.downstream.send(ResponseFrame::Head(ResponseHead::new(StatusCode::CREATED)));
        h.downstream.send(ResponseFrame::End(None));
        assert_eq!(request.await.unwrap().status(), StatusCode::CREATED);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_downstream_times_out_and_is_discarded() {
        let h = harness(500);
        let response = h
            .orchestrator
            .proxy(call(Some(Method::GET), "/proxy/42"), Body::empty())
            .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_code(response).await, "DOWNSTREAM_TIMEOUT");
        eventually(|| h.pool.counts() == (1, 0, 1)).await;
        assert_eq!(h.breaker.counts(), (1, 0, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn unread_response_times_out_and_is_discarded() {
        let h = harness(500);
        let orchestrator = h.orchestrator.clone();
        let request = tokio::spawn(async move { orchestrator.proxy(call(Some(Method::GET), "/proxy/42"), Body::empty()).await });

        eventually(|| !h.downstream.written_kinds().is_empty()).await;
        h.downstream.send(ResponseFrame::Head(ResponseHead::new(StatusCode::OK)));
        for _ in 0..100 {
            h.downstream.send(ResponseFrame::Data(Bytes::from_static(b"chunk")));
        }

        // Hold the response without reading its body.
        let response = request.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        tokio::time::sleep(Duration::from_secs(3600)).await;

        assert_eq!(h.pool.counts(), (1, 0, 1));
        assert_eq!(h.breaker.counts(), (1, 0, 1));
        assert!(h.downstream.shutdowns.load(Ordering::SeqCst) >= 1);
        assert!(response.into_body().collect().await.is_err());
    }

    #[tokio::test]
    async fn error_response_is_recorded_on_the_call() {
        let (mut sender, pending) = response::channel();
        let mut state = call(None, "/proxy/42");
        report_failure(&mut state, &mut sender, &crate::routing::RoutingError::MissingMethod.into());

        assert!(matches!(
            state.response(),
            Some(ResponseKind::Full(head)) if head.status == StatusCode::INTERNAL_SERVER_ERROR
        ));
        assert_eq!(pending.into_response().await.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn unexpected_close_fails_the_call() {
        let h = harness(5_000);
        let orchestrator = h.orchestrator.clone();
        let request = tokio::spawn(async move { orchestrator.proxy(call(Some(Method::GET), "/proxy/42"), Body::empty()).await });

        eventually(|| !h.downstream.written_kinds().is_empty()).await;
        h.downstream.fail(TransportError::Closed);

        let response = request.await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_code(response).await, "DOWNSTREAM_CLOSED");
        eventually(|| h.pool.counts() == (1, 0, 1)).await;
        assert_eq!(h.breaker.counts(), (1, 0, 1));
    }

    #[tokio::test]
    async fn missing_method_never_touches_pool_or_breaker() {
        let h = harness(5_000);
        let response = h.orchestrator.proxy(call(None, "/proxy/42"), Body::empty()).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_code(response).await, "INTERNAL_ERROR");
        assert_eq!(h.pool.counts(), (0, 0, 0));
        assert_eq!(h.breaker.counts(), (0, 0, 0));
        assert!(h.downstream.written_kinds().is_empty());
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let h = harness(5_000);
        let response = h.orchestrator.proxy(call(Some(Method::GET), "/elsewhere"), Body::empty()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(h.pool.counts(), (0, 0, 0));
    }

    #[tokio::test]
    async fn open_breaker_refuses_before_acquiring() {
        let h = harness(5_000);
        h.breaker.open.store(true, Ordering::SeqCst);
        let response = h.orchestrator.proxy(call(Some(Method::GET), "/proxy/42"), Body::empty()).await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_code(response).await, "CIRCUIT_OPEN");
        assert_eq!(h.pool.counts(), (0, 0, 0));
        assert_eq!(h.breaker.counts(), (1, 0, 0));
    }

    #[test]
    fn failure_phases() {
        let closed = DownstreamError::ClosedUnexpectedly {
            connection_id: crate::net::connection::ConnectionId::new(),
        };
        assert_eq!(failure_phase(&closed.into()), CallPhase::Failed);
        assert_eq!(failure_phase(&ProxyError::ClientGone), CallPhase::Cancelled);
        assert_eq!(failure_phase(&ProxyError::InboundBody("reset".into())), CallPhase::Cancelled);
        let stalled = ProxyError::ClientStalled { idle: Duration::from_millis(500) };
        assert_eq!(failure_phase(&stalled), CallPhase::TimedOut);
    }
}
