//! Idle timeout supervision for downstream connections.
//!
//! # Responsibilities
//! - Decide what a quiet downstream connection means: a stalled call
//!   (active-call mode) or an unused pooled connection (pool-eviction mode)
//! - Produce a typed timeout the caller turns into closing the channel
//!
//! # Design Decisions
//! - The connection loop owns the timer (scheduled, not polled) and asks the
//!   supervisor what to do when it fires
//! - Disabling is a plain atomic store so any thread can detach the
//!   supervisor without going through the connection loop

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::net::connection::ConnectionId;

/// What the supervisor is watching for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutMode {
    /// A call is outstanding and the downstream went quiet.
    ActiveCall,
    /// A pooled connection sat unused.
    PoolEviction,
}

/// The downstream connection saw no traffic for the configured duration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("downstream connection {connection_id} idle for {}ms ({mode:?}): {description}", idle.as_millis())]
pub struct DownstreamIdleTimeout {
    pub connection_id: ConnectionId,
    pub idle: Duration,
    pub mode: TimeoutMode,
    pub description: String,
}

/// Watches one downstream connection for idle gaps.
pub struct IdleTimeoutSupervisor {
    mode: TimeoutMode,
    idle_timeout: Duration,
    call_outstanding: Box<dyn Fn() -> bool + Send + Sync>,
    disabled: AtomicBool,
    description: String,
}

impl IdleTimeoutSupervisor {
    /// Fires while `call_outstanding` still returns true.
    pub fn active_call(
        idle_timeout: Duration,
        call_outstanding: impl Fn() -> bool + Send + Sync + 'static,
        description: impl Into<String>,
    ) -> Self {
        Self {
            mode: TimeoutMode::ActiveCall,
            idle_timeout,
            call_outstanding: Box::new(call_outstanding),
            disabled: AtomicBool::new(false),
            description: description.into(),
        }
    }

    /// Fires on any idle gap.
    pub fn pool_eviction(idle_timeout: Duration) -> Self {
        Self {
            mode: TimeoutMode::PoolEviction,
            idle_timeout,
            call_outstanding: Box::new(|| true),
            disabled: AtomicBool::new(false),
            description: "idle pooled connection".to_string(),
        }
    }

    pub fn mode(&self) -> TimeoutMode {
        self.mode
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Make every future firing a no-op. Safe from any thread.
    pub fn disable_timeout_handling(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    /// Called by the connection loop when `idle_timeout` elapsed without traffic.
    pub fn on_idle(&self, connection_id: ConnectionId) -> Option<DownstreamIdleTimeout> {
        if self.is_disabled() || !(self.call_outstanding)() {
            return None;
        }
        let timeout = DownstreamIdleTimeout {
            connection_id,
            idle: self.idle_timeout,
            mode: self.mode,
            description: self.description.clone(),
        };
        match self.mode {
            TimeoutMode::ActiveCall => tracing::info!(
                connection_id = %connection_id,
                idle_ms = self.idle_timeout.as_millis() as u64,
                call = %self.description,
                "Downstream call timed out waiting for data, closing connection"
            ),
            TimeoutMode::PoolEviction => tracing::debug!(
                connection_id = %connection_id,
                idle_ms = self.idle_timeout.as_millis() as u64,
                "Evicting idle pooled connection"
            ),
        }
        Some(timeout)
    }
}

impl fmt::Debug for IdleTimeoutSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdleTimeoutSupervisor")
            .field("mode", &self.mode)
            .field("idle_timeout", &self.idle_timeout)
            .field("disabled", &self.is_disabled())
            .field("description", &self.description)
            .finish()
    }
}
