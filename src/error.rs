//! Gateway error taxonomy and its HTTP mapping.
//!
//! Every subsystem error that can end a call funnels into [`ProxyError`],
//! which decides the status code and the JSON body the caller sees.

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use uuid::Uuid;

use crate::pool::{DownstreamError, PoolError};
use crate::proxy::channel::ChannelError;
use crate::resilience::circuit_breaker::CircuitBreakerOpen;
use crate::routing::RoutingError;

/// Header carrying the id of an error response.
pub const ERROR_UID: HeaderName = HeaderName::from_static("error_uid");

/// Why a proxied call did not complete.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    CircuitOpen(#[from] CircuitBreakerOpen),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Downstream(#[from] DownstreamError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("reading the inbound request body failed: {0}")]
    InboundBody(String),
    #[error("caller went away before the response completed")]
    ClientGone,
    #[error("caller stopped reading the response for {}ms", idle.as_millis())]
    ClientStalled { idle: std::time::Duration },
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Routing(RoutingError::NoRoute { .. }) => StatusCode::NOT_FOUND,
            ProxyError::Routing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::CircuitOpen(_)
            | ProxyError::Pool(_)
            | ProxyError::Downstream(_)
            | ProxyError::Channel(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::InboundBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::ClientStalled { .. } => StatusCode::REQUEST_TIMEOUT,
            // Nobody reads this one; it only shows up in metrics.
            ProxyError::ClientGone => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        }
    }

    /// Stable machine-readable code for the error body.
    pub fn code(&self) -> &'static str {
        match self {
            ProxyError::Routing(RoutingError::NoRoute { .. }) => "NO_ROUTE",
            ProxyError::Routing(_) => "INTERNAL_ERROR",
            ProxyError::CircuitOpen(_) => "CIRCUIT_OPEN",
            ProxyError::Pool(_) => "DOWNSTREAM_UNAVAILABLE",
            ProxyError::Downstream(DownstreamError::IdleTimeout(_)) => "DOWNSTREAM_TIMEOUT",
            ProxyError::Downstream(DownstreamError::ClosedUnexpectedly { .. }) => "DOWNSTREAM_CLOSED",
            ProxyError::Downstream(DownstreamError::Transport { .. }) => "DOWNSTREAM_ERROR",
            ProxyError::Channel(e) if e.is_write_stall() => "DOWNSTREAM_TIMEOUT",
            ProxyError::Channel(_) => "DOWNSTREAM_ERROR",
            ProxyError::InboundBody(_) => "BAD_REQUEST",
            ProxyError::ClientGone => "CLIENT_CLOSED_REQUEST",
            ProxyError::ClientStalled { .. } => "CLIENT_TIMEOUT",
        }
    }

    /// The message shown to the caller. Internal failures stay generic.
    fn public_message(&self) -> String {
        match self {
            ProxyError::Routing(e) if e.is_internal() => "Internal server error".to_string(),
            ProxyError::Downstream(_) | ProxyError::Channel(_) | ProxyError::Pool(_) => {
                "Downstream service unavailable".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorEntry {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error_id: String,
    errors: Vec<ErrorEntry>,
}

impl ProxyError {
    /// Render the error response without consuming the error.
    pub fn to_response(&self) -> Response {
        let error_id = Uuid::new_v4().to_string();
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(error_id = %error_id, status = status.as_u16(), error = %self, "Proxy call failed");
        } else {
            tracing::debug!(error_id = %error_id, status = status.as_u16(), error = %self, "Proxy call rejected");
        }

        let body = ErrorBody {
            error_id: error_id.clone(),
            errors: vec![ErrorEntry {
                code: self.code(),
                message: self.public_message(),
            }],
        };
        let mut response = (status, Json(body)).into_response();
        if let Ok(value) = HeaderValue::from_str(&error_id) {
            response.headers_mut().insert(ERROR_UID, value);
        }
        response
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.to_response()
    }
}
