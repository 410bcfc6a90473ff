//! Transport seam between the connection loop and an HTTP/1.1 codec.
//!
//! A transport is split into a writer (request side) and a reader (response
//! side) so the connection loop can wait for response frames while it
//! still accepts writes.

use async_trait::async_trait;
use axum::http::HeaderMap;
use bytes::Bytes;

use crate::http::message::{OutboundMessage, RequestHead, ResponseHead};
use crate::pool::Destination;

/// Failure inside the transport/codec layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("no request in flight to attach body data to")]
    NoRequestInFlight,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("downstream accepted no request data for {waited_ms}ms")]
    WriteStalled { waited_ms: u64 },
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

/// One piece of a downstream response.
#[derive(Debug)]
pub enum ResponseFrame {
    Head(ResponseHead),
    Data(Bytes),
    /// End of the response body, with trailers if the downstream sent any.
    End(Option<HeaderMap>),
}

/// Request side of a connection.
#[async_trait]
pub trait TransportWriter: Send {
    /// Write one request message. Messages arrive in call order.
    async fn write(&mut self, message: OutboundMessage<RequestHead>) -> Result<(), TransportError>;

    /// True when no request is in flight and the connection can take another.
    fn is_reusable(&self) -> bool;

    /// Tear the connection down. Idempotent.
    fn shutdown(&mut self);
}

/// Response side of a connection.
#[async_trait]
pub trait TransportReader: Send {
    /// Next response frame; `Err(Closed)` once the peer hung up.
    ///
    /// Must be cancel safe: the connection loop drops this future whenever
    /// another event wins the race.
    async fn read_frame(&mut self) -> Result<ResponseFrame, TransportError>;
}

/// An established connection, split into its two halves.
pub struct Transport {
    pub writer: Box<dyn TransportWriter>,
    pub reader: Box<dyn TransportReader>,
}

/// Opens transports to destinations.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, destination: &Destination) -> Result<Transport, TransportError>;
}
