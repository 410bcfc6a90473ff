//! Default pooled-connection provider.
//!
//! # Responsibilities
//! - Keep idle connections per destination and hand them out LIFO
//! - Cap open connections per destination
//! - Put returned connections under pool-eviction supervision
//!
//! # Design Decisions
//! - A caller waiting on the cap is woken either by a freed permit (a
//!   connection closed) or by a release (an idle connection appeared)
//! - Dead or non-reusable idle entries are dropped lazily on acquire

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Notify, Semaphore};

use crate::config::{PoolConfig, TimeoutConfig};
use crate::net::connection::{ConnectionId, ConnectionTracker};
use crate::observability::metrics;
use crate::pool::connection_loop;
use crate::pool::transport::Connector;
use crate::pool::{ConnectionHandle, ConnectionPool, Destination, PoolError};
use crate::resilience::timeouts::IdleTimeoutSupervisor;

#[derive(Debug)]
struct DestinationSlot {
    limit: Arc<Semaphore>,
    released: Notify,
}

/// Connection pool keyed by destination.
pub struct DownstreamPool {
    connector: Arc<dyn Connector>,
    idle: Mutex<HashMap<Destination, Vec<ConnectionHandle>>>,
    slots: DashMap<Destination, Arc<DestinationSlot>>,
    max_per_destination: usize,
    connect_timeout: Duration,
    pool_idle_timeout: Duration,
    tracker: ConnectionTracker,
}

impl DownstreamPool {
    pub fn new(connector: Arc<dyn Connector>, pool: &PoolConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            connector,
            idle: Mutex::new(HashMap::new()),
            slots: DashMap::new(),
            max_per_destination: pool.max_connections_per_destination,
            connect_timeout: Duration::from_millis(timeouts.connect_ms),
            pool_idle_timeout: Duration::from_millis(timeouts.pool_idle_ms),
            tracker: ConnectionTracker::new(),
        }
    }

    /// Open downstream connections, idle or busy.
    pub fn open_connections(&self) -> u64 {
        self.tracker.open_count()
    }

    /// Idle connections currently held for `destination`.
    pub fn idle_count(&self, destination: &Destination) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(destination)
            .map_or(0, |list| list.iter().filter(|h| h.is_alive()).count())
    }

    /// Close every idle connection and wait until all connections are gone.
    pub async fn shutdown(&self) {
        let idle: Vec<ConnectionHandle> = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .flat_map(|(_, list)| list)
            .collect();
        for handle in idle {
            handle.shutdown();
        }
        self.tracker.wait_until_drained().await;
    }

    fn slot(&self, destination: &Destination) -> Arc<DestinationSlot> {
        self.slots
            .entry(destination.clone())
            .or_insert_with(|| {
                Arc::new(DestinationSlot {
                    limit: Arc::new(Semaphore::new(self.max_per_destination)),
                    released: Notify::new(),
                })
            })
            .value()
            .clone()
    }

    fn take_idle(&self, destination: &Destination) -> Option<ConnectionHandle> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let list = idle.get_mut(destination)?;
        while let Some(handle) = list.pop() {
            if handle.is_alive() && handle.is_reusable() {
                return Some(handle);
            }
            tracing::trace!(connection_id = %handle.id(), "Skipping stale pooled connection");
        }
        None
    }
}

#[async_trait]
impl ConnectionPool for DownstreamPool {
    async fn acquire(&self, destination: &Destination) -> Result<ConnectionHandle, PoolError> {
        let slot = self.slot(destination);

        let permit = loop {
            let released = slot.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(handle) = self.take_idle(destination) {
                tracing::debug!(connection_id = %handle.id(), destination = %destination, "Reusing pooled connection");
                metrics::record_pool_event(destination.host(), "reused");
                return Ok(handle);
            }

            tokio::select! {
                permit = Arc::clone(&slot.limit).acquire_owned() => {
                    break permit.map_err(|_| PoolError::Closed(destination.clone()))?;
                }
                _ = &mut released => continue,
            }
        };

        let transport = tokio::time::timeout(self.connect_timeout, self.connector.connect(destination))
            .await
            .map_err(|_| PoolError::ConnectTimeout {
                destination: destination.clone(),
                timeout: self.connect_timeout,
            })?
            .map_err(|source| PoolError::Connect {
                destination: destination.clone(),
                source,
            })?;

        let id = ConnectionId::new();
        let handle = connection_loop::spawn(
            destination.clone(),
            transport,
            Arc::new(IdleTimeoutSupervisor::pool_eviction(self.pool_idle_timeout)),
            permit,
            self.tracker.track(id),
        );
        tracing::debug!(connection_id = %id, destination = %destination, "Opened downstream connection");
        metrics::record_pool_event(destination.host(), "created");
        Ok(handle)
    }

    fn release(&self, handle: ConnectionHandle) {
        if !handle.is_alive() || !handle.is_reusable() {
            tracing::debug!(connection_id = %handle.id(), "Connection not reusable, discarding");
            self.discard(handle);
            return;
        }
        let supervisor = Arc::new(IdleTimeoutSupervisor::pool_eviction(self.pool_idle_timeout));
        if !handle.return_to_pool(supervisor) {
            return;
        }

        let destination = handle.destination().clone();
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(destination.clone())
            .or_default()
            .push(handle);
        self.slot(&destination).released.notify_one();
        metrics::record_pool_event(destination.host(), "released");
    }

    fn discard(&self, handle: ConnectionHandle) {
        handle.poison();
        handle.shutdown();
        tracing::debug!(connection_id = %handle.id(), destination = %handle.destination(), "Discarded downstream connection");
        metrics::record_pool_event(handle.destination().host(), "discarded");
    }
}
