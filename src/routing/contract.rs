//! Routing contract: inbound request in, downstream call parameters out.
//!
//! # Responsibilities
//! - Resolve the destination for an inbound request, once per call
//! - Prepare the first downstream chunk (method, rewritten path, headers)
//! - Choose the circuit breaker policy for the call
//!
//! # Design Decisions
//! - Failures come back as `Err`, never as a panic; a request without a
//!   method is an internal bug and is logged as one
//! - The pass-through table sits behind `ArcSwap` so reloads never block
//!   routing

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Uri, Version};

use crate::config::RouteConfig;
use crate::http::message::RequestHead;
use crate::http::state::RequestInfo;
use crate::observability::context;
use crate::observability::TracingContext;
use crate::pool::Destination;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerSelection};
use crate::routing::router::{RouteError, RouteTable};

/// Why routing produced no downstream call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("inbound request has no HTTP method")]
    MissingMethod,
    #[error("malformed inbound request: {0}")]
    Malformed(String),
    #[error("no route for {method} {path}")]
    NoRoute { method: String, path: String },
}

impl RoutingError {
    /// True when the failure points at a bug rather than at the client.
    pub fn is_internal(&self) -> bool {
        !matches!(self, RoutingError::NoRoute { .. })
    }
}

/// Everything needed to start one downstream call.
#[derive(Debug, Clone)]
pub struct DownstreamRequestFirstChunkInfo {
    pub host: String,
    pub port: u16,
    pub use_https: bool,
    pub first_chunk_request: RequestHead,
    pub circuit_breaker_selection: CircuitBreakerSelection,
    pub route_name: String,
    pub path_params: HashMap<String, String>,
}

impl DownstreamRequestFirstChunkInfo {
    pub fn destination(&self) -> Destination {
        Destination::new(self.host.clone(), self.port, self.use_https)
    }
}

/// Produces downstream call parameters for inbound requests.
#[async_trait]
pub trait ProxyRoutingContract: Send + Sync + 'static {
    /// Called once per call with the request head; the body may still be
    /// arriving.
    async fn first_chunk_info(
        &self,
        request: &RequestInfo,
        context: &TracingContext,
    ) -> Result<DownstreamRequestFirstChunkInfo, RoutingError>;
}

/// Headers that describe one connection and never cross a proxy.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Copy `headers` without hop-by-hop headers, including any the
/// `Connection` header names.
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || named.contains(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Routes by the configured route table and rewrites the path.
///
/// Breaker policy per route: `disable_breaker` wins, then a custom breaker
/// registered for the route name, then the default breaker for the
/// destination host.
pub struct PassThroughRouting {
    table: ArcSwap<RouteTable>,
    custom_breakers: HashMap<String, Arc<dyn CircuitBreaker>>,
}

impl PassThroughRouting {
    pub fn new(routes: &[RouteConfig]) -> Result<Self, RouteError> {
        Ok(Self {
            table: ArcSwap::from_pointee(RouteTable::from_config(routes)?),
            custom_breakers: HashMap::new(),
        })
    }

    /// Use `breaker` for calls on the route named `route`.
    pub fn with_custom_breaker(mut self, route: impl Into<String>, breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.custom_breakers.insert(route.into(), breaker);
        self
    }

    /// Swap in a new route table. The old table stays in place on error.
    pub fn reload(&self, routes: &[RouteConfig]) -> Result<(), RouteError> {
        let table = RouteTable::from_config(routes)?;
        let count = table.len();
        self.table.store(Arc::new(table));
        tracing::info!(routes = count, "Route table reloaded");
        Ok(())
    }

    fn breaker_selection(&self, route_name: &str, disable_breaker: bool) -> CircuitBreakerSelection {
        if disable_breaker {
            return CircuitBreakerSelection::disabled();
        }
        match self.custom_breakers.get(route_name) {
            Some(breaker) => CircuitBreakerSelection::custom(Arc::clone(breaker)),
            None => CircuitBreakerSelection::default(),
        }
    }
}

#[async_trait]
impl ProxyRoutingContract for PassThroughRouting {
    async fn first_chunk_info(
        &self,
        request: &RequestInfo,
        context: &TracingContext,
    ) -> Result<DownstreamRequestFirstChunkInfo, RoutingError> {
        let _link = context::link(context);

        let Some(method) = request.method.clone() else {
            tracing::error!(
                uri = %request.uri,
                "BUG: inbound request reached routing without an HTTP method"
            );
            return Err(RoutingError::MissingMethod);
        };

        let table = self.table.load();
        let Some(matched) = table.find(request) else {
            tracing::debug!(method = %method, path = %request.path(), "No route matched");
            return Err(RoutingError::NoRoute {
                method: method.to_string(),
                path: request.path().to_string(),
            });
        };
        let route = matched.route;

        let mut target = route.downstream_path.render(&matched.params).map_err(|e| {
            tracing::error!(route = %route.name, error = %e, "BUG: validated route failed to render");
            RoutingError::Malformed(e.to_string())
        })?;
        if let Some(query) = request.uri.query() {
            target.push('?');
            target.push_str(query);
        }
        let uri: Uri = target
            .parse()
            .map_err(|e: axum::http::uri::InvalidUri| RoutingError::Malformed(e.to_string()))?;

        let mut headers = strip_hop_by_hop(&request.headers);
        let authority = HeaderValue::from_str(&route.destination.authority())
            .map_err(|e| RoutingError::Malformed(e.to_string()))?;
        headers.insert(header::HOST, authority);

        tracing::debug!(
            route = %route.name,
            destination = %route.destination,
            target = %uri,
            "Routed request"
        );

        Ok(DownstreamRequestFirstChunkInfo {
            host: route.destination.host().to_string(),
            port: route.destination.port(),
            use_https: route.destination.use_https(),
            first_chunk_request: RequestHead {
                method,
                uri,
                version: Version::HTTP_11,
                headers,
            },
            circuit_breaker_selection: self.breaker_selection(&route.name, route.disable_breaker),
            route_name: route.name.clone(),
            path_params: matched.params,
        })
    }
}
