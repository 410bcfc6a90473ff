//! HTTP/1.1 transport built on hyper client connections.
//!
//! # Responsibilities
//! - Open TCP (and TLS for https destinations) connections
//! - Drive one hyper `http1` connection per transport on its own task
//! - Translate request messages into a streaming hyper request and the
//!   hyper response into response frames
//!
//! # Design Decisions
//! - The writer hands each pending response future to the reader over a
//!   channel; the reader owns the response from head to end of body
//! - Request bodies are fed through a bounded channel so a slow downstream
//!   pushes back on the writer

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderValue, Request, Response, Version};
use http_body::Frame;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use crate::http::body::{BodySender, ChannelBody};
use crate::http::message::{OutboundMessage, RequestHead, ResponseHead};
use crate::pool::transport::{Connector, ResponseFrame, Transport, TransportError, TransportReader, TransportWriter};
use crate::pool::Destination;

type ResponseFuture = Pin<Box<dyn Future<Output = hyper::Result<Response<Incoming>>> + Send>>;

/// Connects with hyper over plain TCP or rustls.
#[derive(Clone)]
pub struct HyperConnector {
    tls: TlsConnector,
}

impl HyperConnector {
    /// A connector trusting the webpki root set for https destinations.
    pub fn new() -> Result<Self, TransportError> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl Connector for HyperConnector {
    async fn connect(&self, destination: &Destination) -> Result<Transport, TransportError> {
        let stream = TcpStream::connect((destination.host(), destination.port())).await?;
        stream.set_nodelay(true)?;

        if destination.use_https() {
            let server_name = ServerName::try_from(destination.host().to_string())
                .map_err(|e| TransportError::Tls(e.to_string()))?;
            let tls = self.tls.connect(server_name, stream).await?;
            handshake(tls, destination).await
        } else {
            handshake(stream, destination).await
        }
    }
}

async fn handshake<S>(io: S, destination: &Destination) -> Result<Transport, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = http1::handshake::<_, ChannelBody>(TokioIo::new(io)).await?;

    let (closed_tx, closed_rx) = oneshot::channel();
    let target = destination.to_string();
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(destination = %target, error = %e, "Downstream connection ended with error");
        }
        let _ = closed_tx.send(());
    });

    let (responses_tx, responses_rx) = mpsc::unbounded_channel();
    let authority = HeaderValue::from_str(&destination.authority())
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

    Ok(Transport {
        writer: Box::new(HyperWriter {
            sender,
            body: None,
            responses: responses_tx,
            driver,
            authority,
        }),
        reader: Box::new(HyperReader {
            responses: responses_rx,
            state: ReadState::Idle,
            closed: Some(closed_rx),
        }),
    })
}

struct HyperWriter {
    sender: SendRequest<ChannelBody>,
    body: Option<BodySender>,
    responses: mpsc::UnboundedSender<ResponseFuture>,
    driver: JoinHandle<()>,
    authority: HeaderValue,
}

impl HyperWriter {
    async fn start_request(&mut self, head: RequestHead, body: ChannelBody) -> Result<(), TransportError> {
        if self.body.is_some() {
            return Err(TransportError::InvalidRequest(
                "previous request body is still streaming".to_string(),
            ));
        }
        self.sender.ready().await?;

        let mut builder = Request::builder()
            .method(head.method)
            .uri(head.uri)
            .version(Version::HTTP_11);
        if let Some(headers) = builder.headers_mut() {
            *headers = head.headers;
            if !headers.contains_key(header::HOST) {
                headers.insert(header::HOST, self.authority.clone());
            }
        }
        let request = builder
            .body(body)
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        let response = self.sender.send_request(request);
        self.responses
            .send(Box::pin(response))
            .map_err(|_| TransportError::Closed)
    }

    async fn send_frame(&mut self, frame: Frame<bytes::Bytes>) -> Result<(), TransportError> {
        let body = self.body.as_ref().ok_or(TransportError::NoRequestInFlight)?;
        body.send(Ok(frame)).await.map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl TransportWriter for HyperWriter {
    async fn write(&mut self, message: OutboundMessage<RequestHead>) -> Result<(), TransportError> {
        match message {
            OutboundMessage::Full { head, body } => self.start_request(head, ChannelBody::full(body)).await,
            OutboundMessage::Headers(head) => {
                let (tx, body) = ChannelBody::channel();
                self.start_request(head, body).await?;
                self.body = Some(tx);
                Ok(())
            }
            OutboundMessage::Content(data) => {
                if data.is_empty() {
                    return Ok(());
                }
                self.send_frame(Frame::data(data)).await
            }
            OutboundMessage::LastContent { body, trailers } => {
                if self.body.is_none() && body.is_empty() && trailers.is_none() {
                    return Ok(());
                }
                if !body.is_empty() {
                    self.send_frame(Frame::data(body)).await?;
                }
                if let Some(trailers) = trailers {
                    self.send_frame(Frame::trailers(trailers)).await?;
                }
                // Dropping the sender ends the request body.
                self.body = None;
                Ok(())
            }
        }
    }

    fn is_reusable(&self) -> bool {
        self.body.is_none() && !self.sender.is_closed()
    }

    fn shutdown(&mut self) {
        self.body = None;
        self.driver.abort();
    }
}

impl Drop for HyperWriter {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

enum ReadState {
    Idle,
    AwaitingHead(ResponseFuture),
    Body(Incoming),
}

struct HyperReader {
    responses: mpsc::UnboundedReceiver<ResponseFuture>,
    state: ReadState,
    closed: Option<oneshot::Receiver<()>>,
}

#[async_trait]
impl TransportReader for HyperReader {
    async fn read_frame(&mut self) -> Result<ResponseFrame, TransportError> {
        loop {
            if let ReadState::Idle = self.state {
                let closed = &mut self.closed;
                let next = tokio::select! {
                    biased;
                    next = self.responses.recv() => next,
                    _ = async {
                        match closed.as_mut() {
                            Some(rx) => {
                                let _ = rx.await;
                            }
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        self.closed = None;
                        None
                    }
                };
                match next {
                    Some(response) => self.state = ReadState::AwaitingHead(response),
                    None => return Err(TransportError::Closed),
                }
            }

            if let ReadState::AwaitingHead(response) = &mut self.state {
                let result = response.as_mut().await;
                match result {
                    Ok(response) => {
                        let (parts, body) = response.into_parts();
                        self.state = ReadState::Body(body);
                        return Ok(ResponseFrame::Head(ResponseHead {
                            status: parts.status,
                            version: parts.version,
                            headers: parts.headers,
                        }));
                    }
                    Err(e) => {
                        self.state = ReadState::Idle;
                        return Err(e.into());
                    }
                }
            }

            if let ReadState::Body(body) = &mut self.state {
                match body.frame().await {
                    Some(Ok(frame)) => match frame.into_data() {
                        Ok(data) if data.is_empty() => continue,
                        Ok(data) => return Ok(ResponseFrame::Data(data)),
                        Err(frame) => {
                            if let Ok(trailers) = frame.into_trailers() {
                                self.state = ReadState::Idle;
                                return Ok(ResponseFrame::End(Some(trailers)));
                            }
                        }
                    },
                    Some(Err(e)) => {
                        self.state = ReadState::Idle;
                        return Err(e.into());
                    }
                    None => {
                        self.state = ReadState::Idle;
                        return Ok(ResponseFrame::End(None));
                    }
                }
            }
        }
    }
}
