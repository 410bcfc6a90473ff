//! In-memory transport and pool used by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};

use crate::http::message::{OutboundMessage, RequestHead};
use crate::net::connection::{ConnectionId, ConnectionTracker};
use crate::pool::connection_loop;
use crate::pool::transport::{ResponseFrame, Transport, TransportError, TransportReader, TransportWriter};
use crate::pool::{ConnectionHandle, ConnectionPool, Destination, PoolError};
use crate::resilience::timeouts::IdleTimeoutSupervisor;

/// The far side of an in-memory connection.
#[derive(Clone)]
pub(crate) struct MemoryDownstream {
    pub written: Arc<Mutex<Vec<OutboundMessage<RequestHead>>>>,
    pub frames: mpsc::UnboundedSender<Result<ResponseFrame, TransportError>>,
    pub shutdowns: Arc<AtomicUsize>,
    /// While set, writes never complete.
    pub stall: Arc<AtomicBool>,
}

impl MemoryDownstream {
    pub fn written_kinds(&self) -> Vec<&'static str> {
        self.written.lock().unwrap().iter().map(|m| m.kind()).collect()
    }

    pub fn written_bodies(&self) -> Vec<bytes::Bytes> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                OutboundMessage::Content(b) | OutboundMessage::LastContent { body: b, .. } => Some(b.clone()),
                OutboundMessage::Full { body, .. } => Some(body.clone()),
                OutboundMessage::Headers(_) => None,
            })
            .collect()
    }

    pub fn send(&self, frame: ResponseFrame) {
        let _ = self.frames.send(Ok(frame));
    }

    pub fn fail(&self, error: TransportError) {
        let _ = self.frames.send(Err(error));
    }
}

struct MemoryWriter {
    downstream: MemoryDownstream,
}

#[async_trait]
impl TransportWriter for MemoryWriter {
    async fn write(&mut self, message: OutboundMessage<RequestHead>) -> Result<(), TransportError> {
        if self.downstream.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.downstream.written.lock().unwrap().push(message);
        Ok(())
    }

    fn is_reusable(&self) -> bool {
        true
    }

    fn shutdown(&mut self) {
        self.downstream.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

struct MemoryReader {
    frames: mpsc::UnboundedReceiver<Result<ResponseFrame, TransportError>>,
}

#[async_trait]
impl TransportReader for MemoryReader {
    async fn read_frame(&mut self) -> Result<ResponseFrame, TransportError> {
        match self.frames.recv().await {
            Some(frame) => frame,
            None => std::future::pending().await,
        }
    }
}

pub(crate) fn memory_transport() -> (Transport, MemoryDownstream) {
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    let downstream = MemoryDownstream {
        written: Arc::default(),
        frames: frames_tx,
        shutdowns: Arc::default(),
        stall: Arc::default(),
    };
    let transport = Transport {
        writer: Box::new(MemoryWriter {
            downstream: downstream.clone(),
        }),
        reader: Box::new(MemoryReader { frames: frames_rx }),
    };
    (transport, downstream)
}

/// A running connection loop over an in-memory transport.
pub(crate) fn memory_connection(pool_idle: Duration) -> (ConnectionHandle, MemoryDownstream, ConnectionTracker) {
    let (transport, downstream) = memory_transport();
    let tracker = ConnectionTracker::new();
    let permit = Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap();
    let handle = connection_loop::spawn(
        Destination::new("backend", 9000, false),
        transport,
        Arc::new(IdleTimeoutSupervisor::pool_eviction(pool_idle)),
        permit,
        tracker.track(ConnectionId::new()),
    );
    (handle, downstream, tracker)
}

/// Pool handing out pre-built connections and counting returns.
#[derive(Default)]
pub(crate) struct MemoryPool {
    connections: Mutex<VecDeque<ConnectionHandle>>,
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
    pub discarded: AtomicUsize,
}

impl MemoryPool {
    pub fn with_connection(handle: ConnectionHandle) -> Self {
        let pool = Self::default();
        pool.connections.lock().unwrap().push_back(handle);
        pool
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.acquired.load(Ordering::SeqCst),
            self.released.load(Ordering::SeqCst),
            self.discarded.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl ConnectionPool for MemoryPool {
    async fn acquire(&self, destination: &Destination) -> Result<ConnectionHandle, PoolError> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.connections
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| PoolError::Closed(destination.clone()))
    }

    fn release(&self, _handle: ConnectionHandle) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn discard(&self, handle: ConnectionHandle) {
        self.discarded.fetch_add(1, Ordering::SeqCst);
        handle.poison();
        handle.shutdown();
    }
}
