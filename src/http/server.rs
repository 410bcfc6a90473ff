//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create the Axum router with the catch-all proxy handler
//! - Wire up middleware (tracing, request ID)
//! - Build the downstream pool, breakers and orchestrator from config
//! - Serve on the bounded listener (or bounded TLS acceptor) until shutdown
//! - Apply route reloads pushed by the config watcher

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::response::Response;
use axum::routing::any;
use axum::Router;
use axum_server::tls_rustls::RustlsAcceptor;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::trace::TraceLayer;

use crate::config::GatewayConfig;
use crate::http::request::{propagate_request_id_layer, set_request_id_layer, split_request, RequestIdExt};
use crate::http::state::{ProcessingState, RequestInfo};
use crate::net::listener::Listener;
use crate::net::tls::{self, BoundedAcceptor};
use crate::observability::context::{self, MDC_REQUEST_ID};
use crate::observability::{LocalTracer, TraceParent, Tracer, TracingContext};
use crate::pool::{Connector, DownstreamPool, HyperConnector, TransportError};
use crate::proxy::StreamingProxyOrchestrator;
use crate::resilience::circuit_breaker::BreakerRegistry;
use crate::routing::router::RouteError;
use crate::routing::PassThroughRouting;

/// Time in-flight requests get to finish after shutdown on the TLS path.
const TLS_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Server construction or run failure.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid route configuration: {0}")]
    Routes(#[from] RouteError),
    #[error("downstream connector: {0}")]
    Connector(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<StreamingProxyOrchestrator>,
    tracer: Arc<dyn Tracer>,
    lifecycle_logging: bool,
}

/// HTTP server for the streaming gateway.
pub struct HttpServer {
    config: GatewayConfig,
    routing: Arc<PassThroughRouting>,
    pool: Arc<DownstreamPool>,
    router: Router,
}

impl HttpServer {
    /// Build the server with pass-through routing over `config.routes`.
    pub fn new(config: GatewayConfig) -> Result<Self, ServerError> {
        let routing = PassThroughRouting::new(&config.routes)?;
        Self::with_routing(config, routing)
    }

    /// Build the server around a prepared routing table, e.g. one with
    /// custom circuit breakers attached.
    pub fn with_routing(config: GatewayConfig, routing: PassThroughRouting) -> Result<Self, ServerError> {
        let connector: Arc<dyn Connector> = Arc::new(HyperConnector::new()?);
        let pool = Arc::new(DownstreamPool::new(connector, &config.pool, &config.timeouts));
        let routing = Arc::new(routing);
        let tracer: Arc<dyn Tracer> = Arc::new(LocalTracer::new());

        let orchestrator = Arc::new(StreamingProxyOrchestrator::new(
            routing.clone(),
            pool.clone(),
            Arc::new(BreakerRegistry::new(config.circuit_breaker.clone())),
            tracer.clone(),
            &config.timeouts,
        ));
        let state = AppState {
            orchestrator,
            tracer,
            lifecycle_logging: config.observability.debug_lifecycle_logging,
        };

        Ok(Self {
            router: Self::build_router(state),
            config,
            routing,
            pool,
        })
    }

    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(state)
            .layer(propagate_request_id_layer())
            .layer(TraceLayer::new_for_http())
            .layer(set_request_id_layer())
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn routing(&self) -> &Arc<PassThroughRouting> {
        &self.routing
    }

    /// Serve until `shutdown` fires, then wait for downstream connections
    /// to drain.
    pub async fn run(
        self,
        listener: TcpListener,
        config_updates: mpsc::UnboundedReceiver<GatewayConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, routes = self.config.routes.len(), "HTTP server starting");

        let reloads = tokio::spawn(apply_route_reloads(self.routing.clone(), config_updates));

        match &self.config.listener.tls {
            Some(tls_config) => {
                let rustls = tls::load_tls_config(tls_config).await?;
                let handle = axum_server::Handle::new();
                let shutdown_handle = handle.clone();
                tokio::spawn(async move {
                    let _ = shutdown.recv().await;
                    shutdown_handle.graceful_shutdown(Some(TLS_SHUTDOWN_GRACE));
                });
                let acceptor = BoundedAcceptor::new(RustlsAcceptor::new(rustls), self.config.listener.max_connections);
                axum_server::from_tcp(listener.into_std()?)
                    .acceptor(acceptor)
                    .handle(handle)
                    .serve(self.router.into_make_service())
                    .await?;
            }
            None => {
                let listener = Listener::from_tcp(listener, self.config.listener.max_connections);
                axum::serve(listener, self.router)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.recv().await;
                        tracing::info!("Shutdown signal received");
                    })
                    .await?;
            }
        }

        reloads.abort();
        self.pool.shutdown().await;
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn apply_route_reloads(
    routing: Arc<PassThroughRouting>,
    mut updates: mpsc::UnboundedReceiver<GatewayConfig>,
) {
    while let Some(config) = updates.recv().await {
        if let Err(e) = routing.reload(&config.routes) {
            tracing::error!(error = %e, "Route reload rejected, keeping current routes");
        }
    }
}

/// Catch-all handler: every inbound request becomes one proxied call.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let (head, body) = split_request(request);
    let request_id = head.headers.request_id().unwrap_or("unknown").to_string();
    let remote_parent = TraceParent::from_headers(&head.headers);

    let call_context = context::with_context(&TracingContext::empty(), || {
        state
            .tracer
            .start_root_span(&format!("{} {}", head.method, head.uri.path()), remote_parent);
        context::mdc_put(MDC_REQUEST_ID, &request_id);
        state.tracer.current_span_stack_snapshot()
    });

    let call = ProcessingState::new(RequestInfo::from_head(&head), request_id, call_context)
        .with_lifecycle_logging(state.lifecycle_logging);
    state.orchestrator.proxy(call, body).await
}
