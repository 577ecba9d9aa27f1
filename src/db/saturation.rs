//! Connection-saturation tracking.
//!
//! Each endpoint pool counts the physical connections it has handed out. A driver
//! takes a [`ConnectionLease`] as soon as it holds a connection and drops it when the
//! connection goes back to the pool. Before every attempt the call wrapper asks
//! [`SaturationState::check`] whether the endpoint is at its configured maximum.
//!
//! Tracking is advisory only: it never blocks or rejects an acquisition.
//!
//! # Concurrency
//!
//! - The active count is an `AtomicUsize`; release saturates at 0.
//! - "Waiting since" is a `std::sync::Mutex` that is never held across an await.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Count of connections currently checked out of one endpoint pool.
#[derive(Debug, Default)]
pub struct ActiveConnections {
    count: AtomicUsize,
}

impl ActiveConnections {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record that a connection was handed out. The returned lease releases it on drop.
    pub fn acquired(self: &Arc<Self>) -> ConnectionLease {
        self.count.fetch_add(1, Ordering::AcqRel);
        ConnectionLease {
            active: Arc::clone(self),
        }
    }

    /// Get current active connection count.
    pub fn current(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn release(&self) {
        let result = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_sub(1))
            });

        if let Ok(0) = result {
            tracing::warn!("Active connection count underflow detected - extra release");
        }
    }
}

/// RAII marker for one checked-out connection.
#[derive(Debug)]
pub struct ConnectionLease {
    active: Arc<ActiveConnections>,
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.active.release();
    }
}

/// What the saturation check observed for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaturationOutcome {
    /// Below the configured maximum
    Clear,
    /// At the maximum, still within the allowed wait
    Waiting,
    /// At the maximum for longer than the allowed wait
    MaxExceeded {
        /// True only for the first check that crossed the threshold
        first_report: bool,
    },
}

impl SaturationOutcome {
    pub fn is_saturated(&self) -> bool {
        !matches!(self, Self::Clear)
    }
}

/// Saturation state for one endpoint key.
#[derive(Debug, Default)]
pub struct SaturationState {
    active: Arc<ActiveConnections>,
    waiting_since: Mutex<Option<Instant>>,
    max_reported: AtomicBool,
}

impl SaturationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter shared with the driver's acquire/release hooks.
    pub fn active(&self) -> &Arc<ActiveConnections> {
        &self.active
    }

    /// When the current saturation episode started, if one is in progress.
    pub fn waiting_since(&self) -> Option<Instant> {
        *self.lock_waiting()
    }

    fn lock_waiting(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        match self.waiting_since.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Compare the active count with `max` and update the waiting timestamp.
    pub fn check(&self, max: u32, max_wait: Duration) -> SaturationOutcome {
        let active = self.active.current();
        let mut waiting_since = self.lock_waiting();

        if active < max as usize {
            if waiting_since.take().is_some() {
                self.max_reported.store(false, Ordering::Release);
                tracing::debug!(active, max, "Connection saturation cleared");
            }
            return SaturationOutcome::Clear;
        }

        let Some(since) = *waiting_since else {
            *waiting_since = Some(Instant::now());
            return SaturationOutcome::Waiting;
        };

        if since.elapsed() > max_wait {
            let first_report = !self.max_reported.swap(true, Ordering::AcqRel);
            SaturationOutcome::MaxExceeded { first_report }
        } else {
            SaturationOutcome::Waiting
        }
    }
}
