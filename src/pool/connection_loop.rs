//! The per-connection loop task.
//!
//! # Responsibilities
//! - Run queued jobs against the transport, one at a time, in queue order
//! - Read response frames and forward them to the attached call
//! - Fire the idle timer and ask the current supervisor what it means
//! - Track whether the connection can be reused after a call
//!
//! # Design Decisions
//! - Queued tasks win over reads and timers (`biased` select) so a job
//!   queued before a timer fires always runs first
//! - A panicking job poisons and closes the connection; the loop itself
//!   keeps going until it can reject the rest of the queue
//! - The loop owns the per-destination permit and the tracker guard, so a
//!   connection counts against limits exactly as long as it is open

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::time::Instant;

use crate::net::connection::{ConnectionGuard, ConnectionId};
use crate::observability::metrics;
use crate::pool::transport::{ResponseFrame, Transport, TransportError};
use crate::pool::{
    ConnectionHandle, ConnectionIo, ConnectionShared, Destination, DownstreamError, DownstreamEvent,
    JobRejected, LoopTask,
};
use crate::resilience::timeouts::{IdleTimeoutSupervisor, TimeoutMode};

/// Start the loop for a freshly connected transport.
pub(crate) fn spawn(
    destination: Destination,
    transport: Transport,
    supervisor: Arc<IdleTimeoutSupervisor>,
    permit: OwnedSemaphorePermit,
    guard: ConnectionGuard,
) -> ConnectionHandle {
    let shared = Arc::new(ConnectionShared::new(guard.id(), destination));
    let (tx, rx) = mpsc::unbounded_channel();

    let connection_loop = ConnectionLoop {
        shared: Arc::clone(&shared),
        transport,
        tasks: rx,
        call: None,
        supervisor,
        last_activity: Instant::now(),
        request_complete: true,
        response_complete: true,
        _permit: permit,
        _guard: guard,
    };
    tokio::spawn(connection_loop.run());

    ConnectionHandle::new(shared, tx)
}

enum Step {
    Task(LoopTask),
    Frame(Result<ResponseFrame, TransportError>),
    Idle,
    Exit,
}

struct ConnectionLoop {
    shared: Arc<ConnectionShared>,
    transport: Transport,
    tasks: mpsc::UnboundedReceiver<LoopTask>,
    call: Option<mpsc::Sender<DownstreamEvent>>,
    supervisor: Arc<IdleTimeoutSupervisor>,
    last_activity: Instant,
    request_complete: bool,
    response_complete: bool,
    _permit: OwnedSemaphorePermit,
    _guard: ConnectionGuard,
}

impl ConnectionLoop {
    fn id(&self) -> ConnectionId {
        self.shared.id
    }

    async fn run(mut self) {
        tracing::debug!(
            connection_id = %self.id(),
            destination = %self.shared.destination,
            "Downstream connection loop started"
        );

        loop {
            let deadline = self.last_activity + self.supervisor.idle_timeout();
            let step = tokio::select! {
                biased;
                task = self.tasks.recv() => match task {
                    Some(task) => Step::Task(task),
                    None => Step::Exit,
                },
                frame = self.transport.reader.read_frame() => Step::Frame(frame),
                _ = tokio::time::sleep_until(deadline) => Step::Idle,
            };

            match step {
                Step::Task(task) => self.handle_task(task).await,
                Step::Frame(frame) => self.handle_frame(frame).await,
                Step::Idle => self.handle_idle().await,
                Step::Exit => self.close(),
            }

            if self.shared.is_closed() {
                break;
            }
        }

        self.finish();
    }

    async fn handle_task(&mut self, task: LoopTask) {
        match task {
            LoopTask::Execute(job) => {
                let write_timeout = self.supervisor.idle_timeout();
                let mut io = ConnectionIo::new(&self.shared, &mut self.transport.writer, write_timeout);
                let outcome = AssertUnwindSafe(job.run(&mut io)).catch_unwind().await;
                let request_completed = io.request_completed();
                let stalled = io.stalled();
                if outcome.is_err() {
                    tracing::error!(connection_id = %self.id(), "Connection job panicked, closing connection");
                    self.shared.poison();
                    self.close();
                    return;
                }
                if stalled {
                    tracing::info!(
                        connection_id = %self.id(),
                        idle_ms = write_timeout.as_millis() as u64,
                        "Downstream stopped accepting request data, closing connection"
                    );
                    self.shared.poison();
                    self.close();
                    return;
                }
                if request_completed {
                    self.request_complete = true;
                }
                self.last_activity = Instant::now();
                self.refresh_reusable();
            }
            LoopTask::AttachCall { events, supervisor } => {
                if self.call.is_some() {
                    tracing::warn!(connection_id = %self.id(), "Call attached to a busy connection, closing it");
                    self.shared.poison();
                    self.close();
                    return;
                }
                self.call = Some(events);
                self.supervisor = supervisor;
                self.request_complete = false;
                self.response_complete = false;
                self.shared.set_reusable(false);
                self.last_activity = Instant::now();
            }
            LoopTask::ReturnToPool { supervisor } => {
                self.call = None;
                self.supervisor = supervisor;
                self.last_activity = Instant::now();
            }
            LoopTask::Shutdown => self.close(),
        }
    }

    async fn handle_frame(&mut self, frame: Result<ResponseFrame, TransportError>) {
        self.last_activity = Instant::now();

        let call_in_progress = self.call.is_some() && !self.response_complete;
        let event = match frame {
            Ok(_) if !call_in_progress => {
                tracing::warn!(connection_id = %self.id(), "Unsolicited data from downstream, closing connection");
                self.shared.poison();
                self.close();
                return;
            }
            Ok(ResponseFrame::Head(head)) => DownstreamEvent::Head(head),
            Ok(ResponseFrame::Data(data)) => DownstreamEvent::Data(data),
            Ok(ResponseFrame::End(trailers)) => {
                self.response_complete = true;
                self.refresh_reusable();
                DownstreamEvent::End(trailers)
            }
            Err(error) => {
                self.shared.poison();
                self.close();
                if !call_in_progress {
                    tracing::debug!(connection_id = %self.id(), error = %error, "Idle downstream connection closed");
                    return;
                }
                DownstreamEvent::Failed(self.classify(error))
            }
        };

        self.emit(event).await;
    }

    async fn handle_idle(&mut self) {
        match self.supervisor.on_idle(self.id()) {
            Some(timeout) => match timeout.mode {
                TimeoutMode::ActiveCall => {
                    self.last_activity = Instant::now();
                    self.emit(DownstreamEvent::Failed(DownstreamError::IdleTimeout(timeout))).await;
                }
                TimeoutMode::PoolEviction => {
                    metrics::record_pool_event(self.shared.destination.host(), "evicted");
                    self.shared.poison();
                    self.close();
                }
            },
            None => self.last_activity = Instant::now(),
        }
    }

    fn classify(&self, error: TransportError) -> DownstreamError {
        let closed = match &error {
            TransportError::Closed => true,
            TransportError::Http(e) => e.is_incomplete_message() || e.is_closed() || e.is_canceled(),
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        };
        if closed {
            DownstreamError::ClosedUnexpectedly {
                connection_id: self.id(),
            }
        } else {
            DownstreamError::Transport {
                connection_id: self.id(),
                source: error,
            }
        }
    }

    /// Forward an event to the attached call. A call that stopped listening
    /// leaves the connection in an unknown state.
    ///
    /// Nothing is read from the downstream while the call is not draining
    /// events, so the idle timer keeps running here too. Once it fires for an
    /// active call the connection is closed and the loop only waits for the
    /// call to let go of its events.
    async fn emit(&mut self, event: DownstreamEvent) {
        let Some(events) = self.call.clone() else {
            return;
        };
        let send = events.send(event);
        tokio::pin!(send);

        let delivered = loop {
            if self.shared.is_closed() {
                break (&mut send).await.is_ok();
            }
            let deadline = self.last_activity + self.supervisor.idle_timeout();
            tokio::select! {
                biased;
                result = &mut send => break result.is_ok(),
                _ = tokio::time::sleep_until(deadline) => self.handle_blocked_idle(),
            }
        };

        if !delivered {
            tracing::debug!(connection_id = %self.id(), "Call stopped listening, closing connection");
            self.call = None;
            self.shared.poison();
            self.close();
        }
    }

    /// The idle timer fired while an event was waiting for the call.
    fn handle_blocked_idle(&mut self) {
        self.last_activity = Instant::now();
        if let Some(timeout) = self.supervisor.on_idle(self.id()) {
            if timeout.mode == TimeoutMode::ActiveCall {
                tracing::debug!(
                    connection_id = %self.id(),
                    idle_ms = timeout.idle.as_millis() as u64,
                    "Call stopped draining downstream events"
                );
                self.shared.poison();
                self.close();
            }
        }
    }

    fn refresh_reusable(&self) {
        let reusable = self.call.is_some()
            && self.request_complete
            && self.response_complete
            && self.transport.writer.is_reusable()
            && !self.shared.is_poisoned()
            && !self.shared.is_closed();
        self.shared.set_reusable(reusable);
    }

    fn close(&mut self) {
        if self.shared.mark_closed() {
            self.transport.writer.shutdown();
        }
    }

    fn finish(mut self) {
        self.close();
        self.tasks.close();
        let reason = JobRejected {
            connection_id: self.id(),
        };
        while let Ok(task) = self.tasks.try_recv() {
            if let LoopTask::Execute(job) = task {
                job.reject(reason);
            }
        }
        tracing::debug!(
            connection_id = %self.id(),
            destination = %self.shared.destination,
            "Downstream connection loop stopped"
        );
    }
}
