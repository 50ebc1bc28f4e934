use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use redmq_core::QueueNames;
use serde::Serialize;

use crate::error::MqError;
use crate::traits::MessageHandler;

// ---------------------------------------------------------------------------
// WorkerRegistration
// ---------------------------------------------------------------------------

/// How one message type is consumed.
#[derive(Clone)]
pub struct WorkerRegistration {
    pub type_name: String,
    pub handler: Arc<dyn MessageHandler>,
    /// Number of poller tasks for this type.
    pub concurrency: usize,
    /// Attempts an envelope gets before it is dead-lettered.
    pub retry_limit: u32,
    /// Poll `{Type}.priorityq` ahead of `{Type}.inq`. Without it both are
    /// still polled, `{Type}.inq` first.
    pub priority: bool,
    /// Publish replies to `{Type}.outq` when the envelope has no `reply_to`.
    pub publish_to_outq: bool,
}

impl WorkerRegistration {
    /// One poller, two attempts, no priority queue, replies dropped unless
    /// the envelope asks for them.
    #[must_use]
    pub fn new(type_name: impl Into<String>, handler: impl MessageHandler) -> Self {
        Self {
            type_name: type_name.into(),
            handler: Arc::new(handler),
            concurrency: 1,
            retry_limit: 2,
            priority: false,
            publish_to_outq: false,
        }
    }

    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    #[must_use]
    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_publish_to_outq(mut self, publish_to_outq: bool) -> Self {
        self.publish_to_outq = publish_to_outq;
        self
    }
}

impl std::fmt::Debug for WorkerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistration")
            .field("type_name", &self.type_name)
            .field("concurrency", &self.concurrency)
            .field("retry_limit", &self.retry_limit)
            .field("priority", &self.priority)
            .field("publish_to_outq", &self.publish_to_outq)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// HandlerStats
// ---------------------------------------------------------------------------

/// Live counters for one message type, shared by its pollers.
#[derive(Debug)]
pub struct HandlerStats {
    type_name: String,
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    last_error: ArcSwapOption<String>,
}

impl HandlerStats {
    #[must_use]
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            last_error: ArcSwapOption::empty(),
        }
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("redmq_messages_processed_total", "type" => self.type_name.clone())
            .increment(1);
    }

    pub fn record_failure(&self, error: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.last_error.store(Some(Arc::new(error.to_string())));
        metrics::counter!("redmq_messages_failed_total", "type" => self.type_name.clone())
            .increment(1);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("redmq_messages_dead_lettered_total", "type" => self.type_name.clone())
            .increment(1);
    }

    #[must_use]
    pub fn snapshot(&self) -> TypeStats {
        TypeStats {
            type_name: self.type_name.clone(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            last_error: self.last_error.load_full().map(|e| (*e).clone()),
        }
    }
}

/// Immutable copy of one type's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeStats {
    pub type_name: String,
    /// Envelopes handled successfully.
    pub processed: u64,
    /// Failed attempts, including ones that were later retried.
    pub failed: u64,
    /// Failed attempts that put the envelope back on its work queue.
    pub retried: u64,
    pub dead_lettered: u64,
    pub last_error: Option<String>,
}

/// Snapshot of every registered type, in registration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub types: Vec<TypeStats>,
}

impl BrokerStats {
    #[must_use]
    pub fn get(&self, type_name: &str) -> Option<&TypeStats> {
        self.types.iter().find(|t| t.type_name == type_name)
    }

    #[must_use]
    pub fn total_processed(&self) -> u64 {
        self.types.iter().map(|t| t.processed).sum()
    }

    #[must_use]
    pub fn total_failed(&self) -> u64 {
        self.types.iter().map(|t| t.failed).sum()
    }

    #[must_use]
    pub fn total_dead_lettered(&self) -> u64 {
        self.types.iter().map(|t| t.dead_lettered).sum()
    }
}

// ---------------------------------------------------------------------------
// WorkerRegistry
// ---------------------------------------------------------------------------

/// A registration with its precomputed queue names and counters.
#[derive(Debug)]
pub struct RegisteredWorker {
    pub registration: WorkerRegistration,
    pub names: QueueNames,
    pub stats: Arc<HandlerStats>,
}

impl RegisteredWorker {
    /// Queues its pollers pop from, highest precedence first.
    ///
    /// Both work queues are always listened on so nothing published with a
    /// priority, or requeued onto `{Type}.priorityq`, is stranded.
    #[must_use]
    pub fn poll_queues(&self) -> [&str; 2] {
        let names = &self.names;
        if self.registration.priority {
            [names.priority.as_str(), names.inbound.as_str()]
        } else {
            [names.inbound.as_str(), names.priority.as_str()]
        }
    }
}

/// Registrations keyed by message type.
///
/// Iteration follows registration order, so pollers start and statistics
/// are reported in a stable order.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    by_type: DashMap<String, Arc<RegisteredWorker>>,
    order: RwLock<Vec<String>>,
}

impl WorkerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// Returns `MqError::InvalidQueueName` for an unusable type name and
    /// `MqError::AlreadyRegistered` if the type already has a worker.
    pub fn register(&self, registration: WorkerRegistration) -> Result<(), MqError> {
        let names = QueueNames::new(&registration.type_name)?;
        let type_name = registration.type_name.clone();

        match self.by_type.entry(type_name.clone()) {
            Entry::Occupied(_) => Err(MqError::AlreadyRegistered(type_name)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(RegisteredWorker {
                    stats: Arc::new(HandlerStats::new(&type_name)),
                    registration,
                    names,
                }));
                self.order.write().push(type_name);
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn get(&self, type_name: &str) -> Option<Arc<RegisteredWorker>> {
        self.by_type.get(type_name).map(|entry| Arc::clone(entry.value()))
    }

    /// All registrations, in registration order.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<RegisteredWorker>> {
        self.order
            .read()
            .iter()
            .filter_map(|name| self.get(name))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            types: self.all().iter().map(|w| w.stats.snapshot()).collect(),
        }
    }
}
