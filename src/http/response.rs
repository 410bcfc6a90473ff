//! Sending the proxied response back to the inbound caller.
//!
//! # Responsibilities
//! - Turn outbound response messages into one axum `Response` plus a
//!   streaming body
//! - Guarantee the caller gets exactly one response head
//! - Notice when the caller went away
//!
//! # Design Decisions
//! - The handler waits on a [`PendingResponse`]; the call itself runs in its
//!   own task and feeds a [`ResponseSender`]
//! - A failure after the head went out aborts the body instead of sending a
//!   second response
//! - Body frames the caller does not take within the write timeout fail the
//!   send, so a caller that stops reading cannot pin the call

use std::io;
use std::time::Duration;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::Response;
use bytes::Bytes;
use http_body::Frame;
use tokio::sync::oneshot;

use crate::error::ProxyError;
use crate::http::body::{BodyAbort, BodySender, ChannelBody};
use crate::http::message::{OutboundMessage, ResponseHead};

/// The response could not be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResponseError {
    #[error("caller is gone")]
    ClientGone,
    #[error("caller stopped reading the response body")]
    Stalled,
    #[error("response head was already sent")]
    HeadAlreadySent,
    #[error("response body sent before its head")]
    HeadNotSent,
    #[error("response already finished")]
    Finished,
}

enum SenderState {
    AwaitingHead(oneshot::Sender<Response>),
    Streaming { tx: BodySender, abort: BodyAbort },
    Finished,
}

/// Write side of one inbound exchange's response.
pub struct ResponseSender {
    state: SenderState,
    status: Option<StatusCode>,
    write_timeout: Option<Duration>,
}

/// Resolves to the response the handler returns.
pub struct PendingResponse {
    rx: oneshot::Receiver<Response>,
}

/// A connected sender/pending pair.
pub fn channel() -> (ResponseSender, PendingResponse) {
    let (tx, rx) = oneshot::channel();
    (
        ResponseSender {
            state: SenderState::AwaitingHead(tx),
            status: None,
            write_timeout: None,
        },
        PendingResponse { rx },
    )
}

/// Queue one body frame, giving up once `limit` passes without the caller
/// taking anything.
async fn push(tx: &BodySender, frame: Frame<Bytes>, limit: Option<Duration>) -> Result<(), ResponseError> {
    let send = tx.send(Ok(frame));
    let sent = match limit {
        Some(limit) => tokio::time::timeout(limit, send)
            .await
            .map_err(|_| ResponseError::Stalled)?,
        None => send.await,
    };
    sent.map_err(|_| ResponseError::ClientGone)
}

fn build(head: ResponseHead, body: ChannelBody) -> Response {
    let mut response = Response::new(Body::new(body));
    *response.status_mut() = head.status;
    *response.headers_mut() = head.headers;
    response
}

impl ResponseSender {
    /// Status of the head sent so far.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    pub fn is_head_sent(&self) -> bool {
        !matches!(self.state, SenderState::AwaitingHead(_))
    }

    /// Fail body sends the caller does not drain within `timeout`.
    pub fn set_write_timeout(&mut self, timeout: Duration) {
        self.write_timeout = Some(timeout);
    }

    /// Send one message towards the caller.
    pub async fn send(&mut self, message: OutboundMessage<ResponseHead>) -> Result<(), ResponseError> {
        match message {
            OutboundMessage::Full { head, body } => {
                let tx = self.take_head_sender()?;
                self.status = Some(head.status);
                tx.send(build(head, ChannelBody::full(body)))
                    .map_err(|_| ResponseError::ClientGone)
            }
            OutboundMessage::Headers(head) => {
                let tx = self.take_head_sender()?;
                let (body_tx, abort, body) = ChannelBody::abortable_channel();
                self.status = Some(head.status);
                tx.send(build(head, body)).map_err(|_| ResponseError::ClientGone)?;
                self.state = SenderState::Streaming { tx: body_tx, abort };
                Ok(())
            }
            OutboundMessage::Content(bytes) => {
                if bytes.is_empty() {
                    return Ok(());
                }
                push(self.body_sender()?, Frame::data(bytes), self.write_timeout).await
            }
            OutboundMessage::LastContent { body, trailers } => {
                let tx = self.body_sender()?;
                if !body.is_empty() {
                    push(tx, Frame::data(body), self.write_timeout).await?;
                }
                if let Some(trailers) = trailers.filter(|t| !t.is_empty()) {
                    push(tx, Frame::trailers(trailers), self.write_timeout).await?;
                }
                // Dropping the sender ends the body.
                self.state = SenderState::Finished;
                Ok(())
            }
        }
    }

    /// End the exchange with `error`: an error response if nothing was sent
    /// yet, otherwise an aborted body. Returns the head of the error
    /// response when one went out.
    pub fn fail(&mut self, error: &ProxyError) -> Option<ResponseHead> {
        match std::mem::replace(&mut self.state, SenderState::Finished) {
            SenderState::AwaitingHead(tx) => {
                let response = error.to_response();
                let head = ResponseHead {
                    status: response.status(),
                    version: response.version(),
                    headers: response.headers().clone(),
                };
                self.status = Some(head.status);
                let _ = tx.send(response);
                Some(head)
            }
            SenderState::Streaming { tx, abort } => {
                // Abort first so the body never sees a clean end.
                let _ = abort.send(io::Error::other(error.to_string()));
                drop(tx);
                None
            }
            SenderState::Finished => None,
        }
    }

    /// Resolves when the caller stops listening. Never resolves once the
    /// response finished.
    pub async fn closed(&mut self) {
        match &mut self.state {
            SenderState::AwaitingHead(tx) => tx.closed().await,
            SenderState::Streaming { tx, .. } => tx.closed().await,
            SenderState::Finished => std::future::pending().await,
        }
    }

    fn take_head_sender(&mut self) -> Result<oneshot::Sender<Response>, ResponseError> {
        match std::mem::replace(&mut self.state, SenderState::Finished) {
            SenderState::AwaitingHead(tx) => Ok(tx),
            other => {
                let finished = matches!(other, SenderState::Finished);
                self.state = other;
                Err(if finished {
                    ResponseError::Finished
                } else {
                    ResponseError::HeadAlreadySent
                })
            }
        }
    }

    fn body_sender(&self) -> Result<&BodySender, ResponseError> {
        match &self.state {
            SenderState::Streaming { tx, .. } => Ok(tx),
            SenderState::AwaitingHead(_) => Err(ResponseError::HeadNotSent),
            SenderState::Finished => Err(ResponseError::Finished),
        }
    }
}

impl PendingResponse {
    /// Wait for the response head. If the call ended without producing one
    /// the caller gets a generic server error.
    pub async fn into_response(self) -> Response {
        match self.rx.await {
            Ok(response) => response,
            Err(_) => {
                tracing::error!("Proxy call ended without a response, sending 500");
                let mut response = Response::new(Body::from(Bytes::from_static(b"Internal server error")));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }
}
