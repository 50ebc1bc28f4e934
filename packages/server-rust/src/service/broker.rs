//! Message broker with a start/stop lifecycle.
//!
//! `new()` wires the broker to a pool, `register()` adds one worker per
//! message type while stopped, `start()` spawns the pollers, and `stop()`
//! waits for every poller to finish the envelope it holds.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::client::{MqClient, QueueDepths};
use super::config::BrokerConfig;
use super::lifecycle::{BrokerState, Lifecycle};
use super::registry::{BrokerStats, WorkerRegistration, WorkerRegistry};
use super::worker::Poller;
use crate::error::MqError;
use crate::network::ConnectionPool;

/// Runs registered handlers against their queues.
///
/// The broker holds no queue state: everything it consumes and produces
/// lives in the store behind the pool, so several brokers may share the
/// same queues.
pub struct MessageBroker {
    client: MqClient,
    config: Arc<BrokerConfig>,
    registry: WorkerRegistry,
    lifecycle: Arc<Lifecycle>,
    pollers: Mutex<Vec<JoinHandle<()>>>,
    times_started: AtomicU64,
}

impl MessageBroker {
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>, config: BrokerConfig) -> Self {
        Self {
            client: MqClient::with_config(pool, config.client.clone()),
            config: Arc::new(config),
            registry: WorkerRegistry::new(),
            lifecycle: Arc::new(Lifecycle::new()),
            pollers: Mutex::new(Vec::new()),
            times_started: AtomicU64::new(0),
        }
    }

    /// The client the broker publishes replies and dead letters with.
    #[must_use]
    pub fn client(&self) -> &MqClient {
        &self.client
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> BrokerState {
        self.lifecycle.state()
    }

    /// Adds the worker for one message type.
    ///
    /// # Errors
    ///
    /// Returns `MqError::InvalidState` unless the broker is stopped,
    /// `MqError::AlreadyRegistered` for a duplicate type, and
    /// `MqError::InvalidQueueName` for an unusable type name.
    pub fn register(&self, registration: WorkerRegistration) -> Result<(), MqError> {
        let state = self.lifecycle.state();
        if state != BrokerState::Stopped {
            return Err(MqError::InvalidState {
                expected: BrokerState::Stopped.as_str(),
                found: state.as_str(),
            });
        }
        info!(
            message_type = %registration.type_name,
            concurrency = registration.concurrency,
            retry_limit = registration.retry_limit,
            "worker registered"
        );
        self.registry.register(registration)
    }

    /// Spawns `concurrency` pollers per registered type.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `MqError::InvalidState` unless the broker is stopped.
    pub fn start(&self) -> Result<(), MqError> {
        self.lifecycle
            .transition(BrokerState::Stopped, BrokerState::Starting)?;

        let workers = self.registry.all();
        let mut handles = Vec::new();
        for worker in &workers {
            for slot in 0..worker.registration.concurrency.max(1) {
                let poller = Poller::new(
                    slot,
                    Arc::clone(worker),
                    self.client.clone(),
                    Arc::clone(&self.config),
                    Arc::clone(&self.lifecycle),
                );
                handles.push(poller.spawn());
            }
        }
        let count = handles.len();
        self.pollers.lock().extend(handles);
        self.times_started.fetch_add(1, Ordering::Relaxed);

        self.lifecycle
            .transition(BrokerState::Starting, BrokerState::Polling)?;
        info!(types = workers.len(), pollers = count, "broker started");
        Ok(())
    }

    /// Signals every poller and waits until all of them have exited.
    ///
    /// Pollers finish the envelope they are handling and abandon nothing
    /// mid-pop, so this takes up to `poll_timeout` plus the longest running
    /// handler. A stopped broker returns immediately.
    ///
    /// # Errors
    ///
    /// Returns `MqError::InvalidState` if the broker is starting or another
    /// `stop()` is already draining it.
    pub async fn stop(&self) -> Result<(), MqError> {
        if self.lifecycle.state() == BrokerState::Stopped {
            return Ok(());
        }
        self.lifecycle.trigger_stop()?;
        info!("broker draining");

        let handles = std::mem::take(&mut *self.pollers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "poller exited abnormally");
            }
        }

        self.lifecycle.set_stopped();
        info!("broker stopped");
        Ok(())
    }

    /// Handler invocations currently running.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.lifecycle.in_flight_count()
    }

    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        self.registry.stats()
    }

    /// Queue lengths for every registered type, in registration order.
    ///
    /// # Errors
    ///
    /// Returns any pool or store error.
    pub async fn queue_depths(&self) -> Result<Vec<QueueDepths>, MqError> {
        let mut depths = Vec::new();
        for worker in self.registry.all() {
            depths.push(self.client.queue_depths(&worker.names.type_name).await?);
        }
        Ok(depths)
    }

    /// Human-readable status and per-type counters.
    #[must_use]
    pub fn stats_description(&self) -> String {
        let workers = self.registry.all();
        let stats = self.stats();
        let listening: Vec<&str> = workers.iter().flat_map(|w| w.poll_queues()).collect();

        let mut out = String::from("# MQ SERVER STATS:\n");
        out.push_str("===============\n");
        let _ = writeln!(out, "Current Status: {}", self.state());
        let _ = writeln!(out, "Listening On: {}", listening.join(", "));
        let _ = writeln!(
            out,
            "Times Started: {}",
            self.times_started.load(Ordering::Relaxed)
        );
        let _ = writeln!(out, "Num of Errors: {}", stats.total_failed());
        let _ = writeln!(out, "In Flight: {}", self.in_flight());
        out.push_str("===============\n");
        for t in &stats.types {
            let _ = writeln!(out, "{}:", t.type_name);
            let _ = writeln!(out, "  Processed: {}", t.processed);
            let _ = writeln!(out, "  Failed: {}", t.failed);
            let _ = writeln!(out, "  Retried: {}", t.retried);
            let _ = writeln!(out, "  Dead Lettered: {}", t.dead_lettered);
            let _ = writeln!(
                out,
                "  Last Error: {}",
                t.last_error.as_deref().unwrap_or("-")
            );
            out.push_str("---------------\n");
        }
        out
    }
}

impl Drop for MessageBroker {
    fn drop(&mut self) {
        // Pollers hold their own handles to the lifecycle; tell them to exit.
        if self.lifecycle.state() == BrokerState::Polling {
            let _ = self.lifecycle.trigger_stop();
        }
    }
}

impl std::fmt::Debug for MessageBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBroker")
            .field("state", &self.state())
            .field("types", &self.registry.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
