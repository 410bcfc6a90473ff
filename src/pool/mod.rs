//! Downstream connection pool.
//!
//! # Data Flow
//! ```text
//! acquire(destination)
//!     → idle handle for destination (skipping dead ones)
//!     → or connect (per-destination cap, connect timeout)
//!         → spawn connection loop task
//!
//! ConnectionHandle ──LoopTask──→ connection loop ──→ TransportWriter
//!                                      │
//!                  DownstreamEvent ←───┴──── TransportReader
//!
//! release(handle) → reusable? → pool-eviction supervisor → idle list
//! discard(handle) → poison → shutdown
//! ```
//!
//! # Design Decisions
//! - Every connection is driven by exactly one loop task; anything that
//!   touches the connection is queued onto that task, so the task queue
//!   orders all writes
//! - Handles are cheap clones of a queue sender and shared atomic flags

pub mod connection_loop;
pub mod downstream;
pub mod hyper_transport;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::HeaderMap;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::http::message::{OutboundMessage, RequestHead, ResponseHead};
use crate::net::connection::ConnectionId;
use crate::resilience::timeouts::{DownstreamIdleTimeout, IdleTimeoutSupervisor};

pub use downstream::DownstreamPool;
pub use hyper_transport::HyperConnector;
pub use transport::{Connector, ResponseFrame, Transport, TransportError, TransportReader, TransportWriter};

/// Where a downstream call goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    host: String,
    port: u16,
    use_https: bool,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16, use_https: bool) -> Self {
        Self {
            host: host.into().to_ascii_lowercase(),
            port,
            use_https,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn use_https(&self) -> bool {
        self.use_https
    }

    /// Value for the `Host` header: the port is omitted when it is the
    /// scheme default.
    pub fn authority(&self) -> String {
        let default_port = if self.use_https { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.use_https { "https" } else { "http" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// Failure to hand out a connection.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to connect to {destination}: {source}")]
    Connect {
        destination: Destination,
        #[source]
        source: TransportError,
    },
    #[error("timed out connecting to {destination} after {}ms", timeout.as_millis())]
    ConnectTimeout { destination: Destination, timeout: Duration },
    #[error("connection pool for {0} is closed")]
    Closed(Destination),
}

/// Something the downstream connection did while serving a call.
#[derive(Debug)]
pub enum DownstreamEvent {
    Head(ResponseHead),
    Data(Bytes),
    End(Option<HeaderMap>),
    Failed(DownstreamError),
}

/// Downstream failure observed by the connection loop.
#[derive(Debug, thiserror::Error)]
pub enum DownstreamError {
    #[error(transparent)]
    IdleTimeout(#[from] DownstreamIdleTimeout),
    #[error("downstream connection {connection_id} closed unexpectedly")]
    ClosedUnexpectedly { connection_id: ConnectionId },
    #[error("downstream connection {connection_id} failed: {source}")]
    Transport {
        connection_id: ConnectionId,
        #[source]
        source: TransportError,
    },
}

/// The connection loop stopped before it could run a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection {connection_id} is no longer accepting work")]
pub struct JobRejected {
    pub connection_id: ConnectionId,
}

/// Work that must run on a connection's own loop.
///
/// Exactly one of `run` or `reject` is called for every job handed to
/// [`ConnectionHandle::execute`].
#[async_trait]
pub trait ConnectionJob: Send + 'static {
    async fn run(self: Box<Self>, io: &mut ConnectionIo<'_>);

    /// The loop is gone; release whatever the job holds.
    fn reject(self: Box<Self>, reason: JobRejected);
}

/// What a job may do with the connection while it runs on the loop.
pub struct ConnectionIo<'a> {
    shared: &'a ConnectionShared,
    writer: &'a mut Box<dyn TransportWriter>,
    write_timeout: Duration,
    request_completed: bool,
    stalled: bool,
}

impl<'a> ConnectionIo<'a> {
    pub(crate) fn new(
        shared: &'a ConnectionShared,
        writer: &'a mut Box<dyn TransportWriter>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            shared,
            writer,
            write_timeout,
            request_completed: false,
            stalled: false,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Write one request message to the downstream. A write that cannot
    /// make progress within the idle timeout fails with `WriteStalled`.
    pub async fn write(&mut self, message: OutboundMessage<RequestHead>) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }
        let terminal = message.is_terminal();
        match tokio::time::timeout(self.write_timeout, self.writer.write(message)).await {
            Ok(result) => result?,
            Err(_) => {
                self.stalled = true;
                return Err(TransportError::WriteStalled {
                    waited_ms: self.write_timeout.as_millis() as u64,
                });
            }
        }
        if terminal {
            self.request_completed = true;
        }
        Ok(())
    }

    /// Never hand this connection out again.
    pub fn poison(&self) {
        self.shared.poison();
    }

    /// Close the connection. Returns false if it was already closed.
    pub fn close(&mut self) -> bool {
        if self.shared.mark_closed() {
            self.writer.shutdown();
            true
        } else {
            false
        }
    }

    pub(crate) fn request_completed(&self) -> bool {
        self.request_completed
    }

    pub(crate) fn stalled(&self) -> bool {
        self.stalled
    }
}

/// State of one connection visible outside its loop.
#[derive(Debug)]
pub struct ConnectionShared {
    id: ConnectionId,
    destination: Destination,
    poisoned: AtomicBool,
    closed: AtomicBool,
    reusable: AtomicBool,
}

impl ConnectionShared {
    pub(crate) fn new(id: ConnectionId, destination: Destination) -> Self {
        Self {
            id,
            destination,
            poisoned: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            reusable: AtomicBool::new(false),
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub(crate) fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
        self.reusable.store(false, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns true if this call closed it.
    pub(crate) fn mark_closed(&self) -> bool {
        self.reusable.store(false, Ordering::Release);
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_reusable(&self) -> bool {
        self.reusable.load(Ordering::Acquire)
    }

    pub(crate) fn set_reusable(&self, reusable: bool) {
        self.reusable.store(reusable, Ordering::Release);
    }
}

/// Tasks accepted by a connection loop, processed strictly in order.
pub(crate) enum LoopTask {
    Execute(Box<dyn ConnectionJob>),
    AttachCall {
        events: mpsc::Sender<DownstreamEvent>,
        supervisor: Arc<IdleTimeoutSupervisor>,
    },
    ReturnToPool {
        supervisor: Arc<IdleTimeoutSupervisor>,
    },
    Shutdown,
}

/// A pooled connection as seen by callers.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
    tasks: mpsc::UnboundedSender<LoopTask>,
}

impl ConnectionHandle {
    pub(crate) fn new(shared: Arc<ConnectionShared>, tasks: mpsc::UnboundedSender<LoopTask>) -> Self {
        Self { shared, tasks }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn destination(&self) -> &Destination {
        &self.shared.destination
    }

    pub fn is_poisoned(&self) -> bool {
        self.shared.is_poisoned()
    }

    /// Mark the connection so the pool never hands it out again.
    pub fn poison(&self) {
        self.shared.poison();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// The last call finished cleanly and the connection can serve another.
    pub fn is_reusable(&self) -> bool {
        self.shared.is_reusable() && !self.shared.is_poisoned()
    }

    /// The loop is still running and the connection open.
    pub fn is_alive(&self) -> bool {
        !self.shared.is_closed() && !self.tasks.is_closed()
    }

    /// Queue `job` on the connection loop. If the loop is gone the job is
    /// rejected before this returns.
    pub fn execute(&self, job: Box<dyn ConnectionJob>) {
        if let Err(mpsc::error::SendError(task)) = self.tasks.send(LoopTask::Execute(job)) {
            if let LoopTask::Execute(job) = task {
                job.reject(JobRejected {
                    connection_id: self.id(),
                });
            }
        }
    }

    /// Bind a call to this connection: response events go to `events` and
    /// `supervisor` watches for a stalled downstream.
    pub fn attach_call(
        &self,
        events: mpsc::Sender<DownstreamEvent>,
        supervisor: Arc<IdleTimeoutSupervisor>,
    ) -> Result<(), JobRejected> {
        self.tasks
            .send(LoopTask::AttachCall { events, supervisor })
            .map_err(|_| JobRejected {
                connection_id: self.id(),
            })
    }

    pub(crate) fn return_to_pool(&self, supervisor: Arc<IdleTimeoutSupervisor>) -> bool {
        self.tasks.send(LoopTask::ReturnToPool { supervisor }).is_ok()
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tasks.send(LoopTask::Shutdown);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("destination", &self.shared.destination)
            .field("poisoned", &self.shared.is_poisoned())
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

/// Pooled-connection provider consumed by the proxy.
#[async_trait]
pub trait ConnectionPool: Send + Sync + 'static {
    /// An idle connection to `destination`, or a new one.
    async fn acquire(&self, destination: &Destination) -> Result<ConnectionHandle, PoolError>;

    /// Return a connection after a clean call. Connections that cannot be
    /// reused are discarded instead.
    fn release(&self, handle: ConnectionHandle);

    /// Close a connection; it is never handed out again.
    fn discard(&self, handle: ConnectionHandle);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_omits_default_port() {
        assert_eq!(Destination::new("Backend.local", 80, false).authority(), "backend.local");
        assert_eq!(Destination::new("backend.local", 443, true).authority(), "backend.local");
        assert_eq!(Destination::new("backend.local", 8080, false).authority(), "backend.local:8080");
        assert_eq!(
            Destination::new("backend.local", 8443, true).to_string(),
            "https://backend.local:8443"
        );
    }

    #[test]
    fn closing_clears_reusable_and_reports_first_close_only() {
        let shared = ConnectionShared::new(ConnectionId::new(), Destination::new("a", 80, false));
        shared.set_reusable(true);
        assert!(shared.mark_closed());
        assert!(!shared.mark_closed());
        assert!(!shared.is_reusable());
    }
}
