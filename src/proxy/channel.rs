//! Streaming channel: one pooled connection bound to one downstream call.
//!
//! # Responsibilities
//! - Send request chunks in order, from any task, with a completion signal
//! - Apply the chunk policy (inactive call, closed channel, duplicate
//!   terminal chunk) on the connection's own loop
//! - Close the connection after an unrecoverable error, at most once
//! - Hand the connection back to the pool, or discard it
//!
//! # Design Decisions
//! - Every chunk ends up either written or dropped; the signal reports
//!   which, and is always resolved (a lost job resolves it as abandoned)
//! - The unrecoverable flag is set synchronously; the socket work is queued
//!   behind any writes already in flight

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::http::message::{OutboundMessage, RequestHead};
use crate::http::state::CallFlags;
use crate::net::connection::ConnectionId;
use crate::observability::TracingContext;
use crate::pool::{
    ConnectionHandle, ConnectionIo, ConnectionJob, ConnectionPool, Destination, DownstreamEvent, JobRejected,
    TransportError,
};
use crate::resilience::timeouts::IdleTimeoutSupervisor;

/// Response events buffered between the connection loop and the call.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Why a chunk was not written.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("call on connection {connection_id} is no longer active, chunk dropped")]
    CallInactive { connection_id: ConnectionId },
    #[error("connection {connection_id} was closed after an unrecoverable error, chunk dropped")]
    ClosedDueToError { connection_id: ConnectionId },
    #[error("writing to connection {connection_id} failed: {source}")]
    Write {
        connection_id: ConnectionId,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Rejected(#[from] JobRejected),
    #[error("chunk write on connection {connection_id} was abandoned")]
    Abandoned { connection_id: ConnectionId },
}

impl ChannelError {
    /// The downstream stopped reading for longer than the idle timeout.
    pub fn is_write_stall(&self) -> bool {
        matches!(
            self,
            ChannelError::Write {
                source: TransportError::WriteStalled { .. },
                ..
            }
        )
    }
}

/// Resolves once the chunk was written or dropped.
#[derive(Debug)]
#[must_use = "a chunk send signal reports whether the chunk was written"]
pub struct ChunkSendSignal {
    connection_id: ConnectionId,
    rx: oneshot::Receiver<Result<(), ChannelError>>,
}

impl ChunkSendSignal {
    fn resolved(connection_id: ConnectionId, result: Result<(), ChannelError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { connection_id, rx }
    }
}

impl Future for ChunkSendSignal {
    type Output = Result<(), ChannelError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ChannelError::Abandoned {
                connection_id: this.connection_id,
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A pooled connection scoped to one downstream call.
pub struct StreamingChannel {
    connection: ConnectionHandle,
    pool: Arc<dyn ConnectionPool>,
    flags: Arc<CallFlags>,
    context: TracingContext,
    supervisor: Arc<IdleTimeoutSupervisor>,
}

impl StreamingChannel {
    /// Bind `connection` to the call owning `flags`. The connection loop
    /// starts forwarding response events to the returned receiver and
    /// supervises the call in active-call mode.
    pub fn attach(
        pool: Arc<dyn ConnectionPool>,
        connection: ConnectionHandle,
        flags: Arc<CallFlags>,
        context: TracingContext,
        active_call_timeout: Duration,
        description: impl Into<String>,
    ) -> Result<(Self, mpsc::Receiver<DownstreamEvent>), JobRejected> {
        let watched = Arc::clone(&flags);
        let supervisor = Arc::new(IdleTimeoutSupervisor::active_call(
            active_call_timeout,
            move || watched.is_call_active(),
            description,
        ));
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        connection.attach_call(events_tx, Arc::clone(&supervisor))?;

        Ok((
            Self {
                connection,
                pool,
                flags,
                context,
                supervisor,
            },
            events_rx,
        ))
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn destination(&self) -> &Destination {
        self.connection.destination()
    }

    pub fn flags(&self) -> &Arc<CallFlags> {
        &self.flags
    }

    pub fn supervisor(&self) -> &Arc<IdleTimeoutSupervisor> {
        &self.supervisor
    }

    /// Queue `chunk` for the connection. Safe to call from any task; chunks
    /// are written in call order.
    pub fn stream_chunk(&self, chunk: OutboundMessage<RequestHead>) -> ChunkSendSignal {
        let connection_id = self.connection_id();

        if !self.flags.is_call_active() {
            return ChunkSendSignal::resolved(connection_id, Err(ChannelError::CallInactive { connection_id }));
        }
        if self.flags.is_unrecoverable() {
            return ChunkSendSignal::resolved(connection_id, Err(ChannelError::ClosedDueToError { connection_id }));
        }
        if self.flags.is_last_chunk_sent() && chunk.is_empty_terminal() {
            tracing::trace!(connection_id = %connection_id, "Duplicate terminal chunk suppressed");
            return ChunkSendSignal::resolved(connection_id, Ok(()));
        }

        let (tx, rx) = oneshot::channel();
        self.connection.execute(Box::new(WriteChunkJob {
            chunk,
            flags: Arc::clone(&self.flags),
            context: self.context.clone(),
            completion: tx,
        }));
        ChunkSendSignal { connection_id, rx }
    }

    /// Mark the call failed and close the connection. The flag is set
    /// before this returns; closing happens on the connection loop after any
    /// writes already queued. Calling it again does nothing more.
    pub fn close_channel_due_to_unrecoverable_error(&self, cause: &(dyn std::error::Error + Send + Sync)) {
        let already_closed = self.flags.mark_unrecoverable();
        let _link = crate::observability::context::link(&self.context);

        if already_closed || !self.flags.is_call_active() {
            tracing::debug!(
                connection_id = %self.connection_id(),
                cause = %cause,
                "Channel already closed or call inactive, nothing to close"
            );
            return;
        }

        tracing::debug!(connection_id = %self.connection_id(), cause = %cause, "Closing channel after unrecoverable error");
        self.connection.poison();
        self.connection.execute(Box::new(CloseJob {
            flags: Arc::clone(&self.flags),
            context: self.context.clone(),
            cause: cause.to_string(),
        }));
    }

    /// Clean completion: stop supervising and return the connection.
    pub fn release(self) {
        self.supervisor.disable_timeout_handling();
        self.pool.release(self.connection);
    }

    /// Return path after an error: the connection is never reused.
    pub fn discard(self) {
        self.supervisor.disable_timeout_handling();
        self.pool.discard(self.connection);
    }
}

struct WriteChunkJob {
    chunk: OutboundMessage<RequestHead>,
    flags: Arc<CallFlags>,
    context: TracingContext,
    completion: oneshot::Sender<Result<(), ChannelError>>,
}

async fn write_chunk(
    chunk: OutboundMessage<RequestHead>,
    flags: &CallFlags,
    io: &mut ConnectionIo<'_>,
) -> Result<(), ChannelError> {
    let connection_id = io.connection_id();

    if !flags.is_call_active() {
        return Err(ChannelError::CallInactive { connection_id });
    }
    if flags.is_unrecoverable() || io.is_closed() {
        return Err(ChannelError::ClosedDueToError { connection_id });
    }
    if flags.is_last_chunk_sent() {
        if chunk.is_empty_terminal() {
            tracing::trace!(connection_id = %connection_id, "Duplicate terminal chunk suppressed");
            return Ok(());
        }
        tracing::warn!(
            connection_id = %connection_id,
            kind = chunk.kind(),
            bytes = chunk.body_len(),
            "Chunk arrived after the last chunk was sent, forwarding it"
        );
    }

    let terminal = chunk.is_terminal();
    io.write(chunk)
        .await
        .map_err(|source| ChannelError::Write { connection_id, source })?;
    if terminal {
        flags.mark_last_chunk_sent();
    }
    Ok(())
}

#[async_trait]
impl ConnectionJob for WriteChunkJob {
    async fn run(self: Box<Self>, io: &mut ConnectionIo<'_>) {
        let WriteChunkJob {
            chunk,
            flags,
            context,
            completion,
        } = *self;
        let result = context.instrument(write_chunk(chunk, &flags, io)).await;
        if let Err(e) = &result {
            tracing::debug!(error = %e, "Chunk not written");
        }
        let _ = completion.send(result);
    }

    fn reject(self: Box<Self>, reason: JobRejected) {
        let _ = self.completion.send(Err(ChannelError::Rejected(reason)));
    }
}

struct CloseJob {
    flags: Arc<CallFlags>,
    context: TracingContext,
    cause: String,
}

#[async_trait]
impl ConnectionJob for CloseJob {
    async fn run(self: Box<Self>, io: &mut ConnectionIo<'_>) {
        let _link = crate::observability::context::link(&self.context);
        io.poison();
        self.flags.mark_call_inactive();
        if io.close() {
            tracing::info!(
                connection_id = %io.connection_id(),
                cause = %self.cause,
                "Closed downstream connection after unrecoverable error"
            );
        }
    }

    fn reject(self: Box<Self>, reason: JobRejected) {
        self.flags.mark_call_inactive();
        tracing::debug!(connection_id = %reason.connection_id, "Connection already gone, nothing to close");
    }
}
