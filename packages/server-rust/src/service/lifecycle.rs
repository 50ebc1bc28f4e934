//! Broker run state and cooperative stop signalling.
//!
//! Uses `ArcSwap` for lock-free state reads and checked transitions, a
//! `watch` channel to tell pollers to stop, and an atomic counter with RAII
//! guards for in-flight handler tracking.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::MqError;

/// Broker run state.
///
/// State machine: Stopped -> Starting -> Polling -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerState {
    /// No pollers running. Registrations are accepted.
    Stopped,
    /// Pollers are being spawned.
    Starting,
    /// Pollers are consuming queues.
    Polling,
    /// Stop requested; pollers finish their current envelope and exit.
    Draining,
}

impl BrokerState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BrokerState::Stopped => "stopped",
            BrokerState::Starting => "starting",
            BrokerState::Polling => "polling",
            BrokerState::Draining => "draining",
        }
    }
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owns the broker state and the stop signal shared with pollers.
#[derive(Debug)]
pub struct Lifecycle {
    state: ArcSwap<BrokerState>,
    stop_signal: watch::Sender<bool>,
    in_flight: Arc<AtomicU64>,
}

impl Lifecycle {
    /// Creates a lifecycle in the `Stopped` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            state: ArcSwap::from_pointee(BrokerState::Stopped),
            stop_signal: tx,
            in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn state(&self) -> BrokerState {
        **self.state.load()
    }

    /// Moves from `from` to `to`, failing if another transition got there first.
    ///
    /// # Errors
    ///
    /// Returns `MqError::InvalidState` if the current state is not `from`.
    pub fn transition(&self, from: BrokerState, to: BrokerState) -> Result<(), MqError> {
        let current = self.state.load();
        if **current != from {
            return Err(MqError::InvalidState {
                expected: from.as_str(),
                found: current.as_str(),
            });
        }
        let previous = self.state.compare_and_swap(&current, Arc::new(to));
        if Arc::ptr_eq(&previous, &current) {
            Ok(())
        } else {
            Err(MqError::InvalidState {
                expected: from.as_str(),
                found: previous.as_str(),
            })
        }
    }

    /// Returns a receiver that flips to `true` when stop is requested.
    #[must_use]
    pub fn stop_receiver(&self) -> watch::Receiver<bool> {
        self.stop_signal.subscribe()
    }

    /// Moves `Polling` to `Draining` and signals every poller.
    ///
    /// # Errors
    ///
    /// Returns `MqError::InvalidState` unless the broker is polling.
    pub fn trigger_stop(&self) -> Result<(), MqError> {
        self.transition(BrokerState::Polling, BrokerState::Draining)?;
        self.stop_signal.send_replace(true);
        Ok(())
    }

    /// Marks the broker stopped and re-arms the stop signal for the next start.
    pub fn set_stopped(&self) {
        self.stop_signal.send_replace(false);
        self.state.store(Arc::new(BrokerState::Stopped));
    }

    /// Creates an RAII guard that tracks an in-flight handler invocation.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicU64>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
