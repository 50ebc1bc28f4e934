//! Poller tasks that consume one message type.
//!
//! Each poller loops on a bounded blocking pop, hands the envelope to the
//! registered handler in its own task, and then routes the outcome: reply
//! on success, requeue or dead-letter on failure. The stop signal is only
//! checked between iterations, so a popped envelope is always finished.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use redmq_core::Envelope;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::client::MqClient;
use super::config::BrokerConfig;
use super::handler::is_serialization_error;
use super::lifecycle::Lifecycle;
use super::registry::RegisteredWorker;
use crate::error::MqError;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What happened to one popped envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Processed,
    /// Dropped by the request filter before the handler ran.
    Filtered,
    Requeued,
    DeadLettered,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Processed => "processed",
            Outcome::Filtered => "filtered",
            Outcome::Requeued => "requeued",
            Outcome::DeadLettered => "dead_lettered",
        }
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

/// One polling loop for one registered type.
pub(crate) struct Poller {
    slot: usize,
    worker: Arc<RegisteredWorker>,
    client: MqClient,
    config: Arc<BrokerConfig>,
    lifecycle: Arc<Lifecycle>,
}

impl Poller {
    pub(crate) fn new(
        slot: usize,
        worker: Arc<RegisteredWorker>,
        client: MqClient,
        config: Arc<BrokerConfig>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            slot,
            worker,
            client,
            config,
            lifecycle,
        }
    }

    /// Spawns the loop. The returned handle completes once a stop has been
    /// observed and the current envelope, if any, is finished.
    pub(crate) fn spawn(self) -> tokio::task::JoinHandle<()> {
        let span = info_span!(
            "poller",
            message_type = %self.worker.registration.type_name,
            poller = self.slot,
        );
        tokio::spawn(self.run().instrument(span))
    }

    async fn run(self) {
        let mut stop = self.lifecycle.stop_receiver();
        let queues = self.worker.poll_queues();
        let policy = &self.config.retry_policy;
        let mut failures: u32 = 0;

        debug!(?queues, "poller started");
        loop {
            if *stop.borrow_and_update() {
                break;
            }

            match self.client.get_any(&queues, self.config.poll_timeout).await {
                Ok(Some((queue, raw))) => {
                    failures = 0;
                    self.process(&queue, raw).await;
                }
                Ok(None) => failures = 0,
                Err(e) => {
                    failures += 1;
                    if policy.exhausted(failures) {
                        error!(error = %e, attempts = failures, "polling keeps failing");
                        failures = 0;
                    } else if e.is_transient() {
                        warn!(error = %e, attempts = failures, "poll failed, backing off");
                    } else {
                        error!(error = %e, attempts = failures, "poll failed, backing off");
                    }
                    if backoff(&mut stop, policy.backoff_for(failures.max(1))).await {
                        break;
                    }
                }
            }
        }
        debug!("poller stopped");
    }

    /// Handles one popped entry from `queue` to completion.
    pub(crate) async fn process(&self, queue: &str, raw: Bytes) -> Outcome {
        let _guard = self.lifecycle.in_flight_guard();
        let stats = &self.worker.stats;

        let envelope = match Envelope::from_bytes(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                let message = MqError::from(e).to_string();
                warn!(queue, error = %message, "undecodable envelope, dead-lettering");
                stats.record_failure(&message);
                self.deliver(&self.worker.names.dead_letter, raw).await;
                stats.record_dead_lettered();
                return Outcome::DeadLettered;
            }
        };

        let envelope = match &self.config.request_filter {
            Some(filter) => match filter(envelope) {
                Some(envelope) => envelope,
                None => {
                    debug!(queue, "envelope dropped by request filter");
                    return Outcome::Filtered;
                }
            },
            None => envelope,
        };

        let span = info_span!(
            "envelope",
            envelope_id = %envelope.id,
            attempt = envelope.retry_attempts + 1,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        async move {
            let start = Instant::now();
            let outcome = match self.invoke(&envelope).await {
                Ok(reply) => {
                    stats.record_processed();
                    if let Some(body) = reply {
                        self.reply(&envelope, body).await;
                    }
                    Outcome::Processed
                }
                Err(e) => self.fail(envelope, raw, &e).await,
            };

            #[allow(clippy::cast_possible_truncation)]
            let duration_ms = start.elapsed().as_millis() as u64;
            tracing::Span::current().record("duration_ms", duration_ms);
            tracing::Span::current().record("outcome", outcome.as_str());
            debug!(queue, duration_ms, outcome = outcome.as_str(), "envelope done");
            outcome
        }
        .instrument(span)
        .await
    }

    /// Runs the handler in its own task so a panic fails only this attempt.
    async fn invoke(&self, envelope: &Envelope) -> anyhow::Result<Option<Vec<u8>>> {
        let handler = Arc::clone(&self.worker.registration.handler);
        let owned = envelope.clone();
        let mut task = tokio::spawn(async move { handler.handle(&owned).await });

        let joined = match self.config.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    task.abort();
                    return Err(MqError::Timeout {
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    }
                    .into());
                }
            },
            None => task.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(MqError::HandlerFailure(format!(
                "handler panicked: {}",
                panic_message(e.into_panic().as_ref())
            ))
            .into()),
            Err(e) => Err(MqError::HandlerFailure(e.to_string()).into()),
        }
    }

    async fn reply(&self, request: &Envelope, body: Vec<u8>) {
        let body = match &self.config.response_filter {
            Some(filter) => filter(body),
            None => body,
        };
        let reply = request.reply(body);
        let registration = &self.worker.registration;
        let result = match &request.reply_to {
            Some(queue) => self.client.publish_to(queue, &reply).await,
            None if registration.publish_to_outq
                && self.config.publishes_responses(&registration.type_name) =>
            {
                self.client
                    .notify_envelope(&self.worker.names.outbound, &reply)
                    .await
            }
            None => return,
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to publish reply");
        }
    }

    /// Records a failed attempt and requeues or dead-letters the envelope.
    async fn fail(&self, mut envelope: Envelope, raw: Bytes, err: &anyhow::Error) -> Outcome {
        let stats = &self.worker.stats;
        let message = format!("{err:#}");
        envelope.record_failure(&message);
        stats.record_failure(&message);

        let retry_limit = self.worker.registration.retry_limit;
        let retry = !is_serialization_error(err) && envelope.retry_attempts < retry_limit;
        let bytes = match envelope.to_bytes() {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => {
                error!(error = %e, "failed to re-encode envelope, keeping original bytes");
                raw
            }
        };

        if retry {
            let queue = self.worker.names.publish_target(envelope.priority);
            warn!(
                error = %message,
                attempts = envelope.retry_attempts,
                retry_limit,
                "handler failed, requeueing"
            );
            self.deliver(queue, bytes).await;
            stats.record_retried();
            Outcome::Requeued
        } else {
            warn!(
                error = %message,
                attempts = envelope.retry_attempts,
                retry_limit,
                "handler failed, dead-lettering"
            );
            self.deliver(&self.worker.names.dead_letter, bytes).await;
            stats.record_dead_lettered();
            Outcome::DeadLettered
        }
    }

    /// Pushes `bytes` onto `queue`, backing off on transient errors.
    ///
    /// The envelope has already been popped, so this keeps trying for the
    /// whole retry policy before giving up.
    async fn deliver(&self, queue: &str, bytes: Bytes) {
        let policy = &self.config.retry_policy;
        let mut attempt: u32 = 0;
        loop {
            match self.client.push(queue, bytes.clone()).await {
                Ok(()) => return,
                Err(e) => {
                    attempt += 1;
                    if !e.is_transient() || policy.exhausted(attempt) {
                        error!(queue, error = %e, attempts = attempt, "envelope lost");
                        return;
                    }
                    info!(queue, error = %e, attempts = attempt, "push failed, retrying");
                    tokio::time::sleep(policy.backoff_for(attempt)).await;
                }
            }
        }
    }
}

/// Sleeps for `delay` unless a stop arrives first. Returns `true` on stop.
async fn backoff(stop: &mut watch::Receiver<bool>, delay: std::time::Duration) -> bool {
    tokio::select! {
        () = tokio::time::sleep(delay) => false,
        changed = stop.changed() => changed.is_err() || *stop.borrow(),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
