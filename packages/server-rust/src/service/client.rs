//! Producer and consumer operations over the shared pool.
//!
//! The client keeps no queue state of its own: every call checks out a
//! connection, runs one pipeline, and releases it. Envelopes are pushed
//! with `LPUSH` and taken with `RPOP`/`BRPOP`, so each queue is FIFO.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use redmq_core::{queue_name, Command, Envelope, QueueNames, QueueRole};
use serde::Serialize;
use tracing::debug;

use super::config::ClientConfig;
use crate::error::MqError;
use crate::network::{ConnectionPool, Pipeline, Reply, ReplyShape};

/// Queue lengths for one message type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepths {
    pub type_name: String,
    pub inbound: u64,
    pub priority: u64,
    /// Replies waiting on `{Type}.outq`.
    pub outbound: u64,
    pub dead_letter: u64,
}

/// Cheap-to-clone handle for publishing and consuming messages.
#[derive(Debug, Clone)]
pub struct MqClient {
    pool: Arc<ConnectionPool>,
    config: ClientConfig,
}

impl MqClient {
    #[must_use]
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self::with_config(pool, ClientConfig::default())
    }

    #[must_use]
    pub fn with_config(pool: Arc<ConnectionPool>, config: ClientConfig) -> Self {
        Self { pool, config }
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Checks out a connection and runs the commands `build` queues.
    async fn run(&self, build: impl FnOnce(&mut Pipeline<'_>)) -> Result<Vec<Reply>, MqError> {
        let mut conn = self.pool.acquire().await?;
        let mut pipe = Pipeline::new(&mut conn);
        build(&mut pipe);
        pipe.execute().await
    }

    async fn run_one(&self, cmd: &Command, shape: ReplyShape) -> Result<Reply, MqError> {
        self.run(|pipe| {
            pipe.enqueue(cmd, shape);
        })
        .await?
        .pop()
        .ok_or(MqError::PipelineState("missing reply"))
    }

    // -- Producing ------------------------------------------------------------

    /// Publishes `envelope` to the work queue of `type_name`.
    ///
    /// Envelopes with a positive priority go to the priority queue instead.
    ///
    /// # Errors
    ///
    /// Returns `MqError::InvalidQueueName` for an unusable type name,
    /// `MqError::Serialization` if the envelope cannot be encoded, and any
    /// pool or store error from the push itself.
    pub async fn publish(&self, type_name: &str, envelope: &Envelope) -> Result<(), MqError> {
        let role = if envelope.priority > 0 {
            QueueRole::Priority
        } else {
            QueueRole::Inbound
        };
        self.publish_to(&queue_name(type_name, role)?, envelope).await
    }

    /// Publishes `envelope` to an explicit queue.
    ///
    /// # Errors
    ///
    /// See [`MqClient::publish`].
    pub async fn publish_to(&self, queue: &str, envelope: &Envelope) -> Result<(), MqError> {
        self.push(queue, envelope.to_bytes()?).await?;
        debug!(queue, envelope_id = %envelope.id, "published");
        Ok(())
    }

    /// Pushes raw bytes onto `queue`, unbounded.
    ///
    /// # Errors
    ///
    /// Returns any pool or store error.
    pub async fn push(&self, queue: &str, message: impl Into<Bytes>) -> Result<(), MqError> {
        self.run_one(&Command::lpush(queue, message.into()), ReplyShape::Int)
            .await?;
        Ok(())
    }

    /// Publishes several envelopes for `type_name` in a single round trip.
    ///
    /// # Errors
    ///
    /// See [`MqClient::publish`]. Encoding failures are reported before
    /// anything is sent.
    pub async fn publish_many(
        &self,
        type_name: &str,
        envelopes: &[Envelope],
    ) -> Result<usize, MqError> {
        let inbound = queue_name(type_name, QueueRole::Inbound)?;
        let priority = queue_name(type_name, QueueRole::Priority)?;
        let commands = envelopes
            .iter()
            .map(|env| {
                let queue = if env.priority > 0 { &priority } else { &inbound };
                Ok(Command::lpush(queue, Bytes::from(env.to_bytes()?)))
            })
            .collect::<Result<Vec<_>, MqError>>()?;
        if commands.is_empty() {
            return Ok(0);
        }

        self.run(|pipe| {
            for cmd in &commands {
                pipe.enqueue(cmd, ReplyShape::Int);
            }
        })
        .await?;
        Ok(commands.len())
    }

    /// Pushes `message` onto `queue` and trims it to the newest
    /// `notify_max_len` entries, in one round trip.
    ///
    /// # Errors
    ///
    /// Returns any pool or store error.
    pub async fn notify(&self, queue: &str, message: impl Into<Bytes>) -> Result<(), MqError> {
        let bound = i64::try_from(self.config.notify_max_len.max(1)).unwrap_or(i64::MAX);
        let push = Command::lpush(queue, message.into());
        let trim = Command::ltrim(queue, 0, bound - 1);
        self.run(|pipe| {
            pipe.enqueue(&push, ReplyShape::Int)
                .enqueue(&trim, ReplyShape::Ok);
        })
        .await?;
        Ok(())
    }

    /// `notify` with an encoded envelope.
    ///
    /// # Errors
    ///
    /// See [`MqClient::notify`]; also `MqError::Serialization`.
    pub async fn notify_envelope(&self, queue: &str, envelope: &Envelope) -> Result<(), MqError> {
        self.notify(queue, envelope.to_bytes()?).await
    }

    // -- Consuming ------------------------------------------------------------

    /// Takes the oldest entry of `queue` without waiting.
    ///
    /// # Errors
    ///
    /// Returns any pool or store error.
    pub async fn get_async(&self, queue: &str) -> Result<Option<Bytes>, MqError> {
        self.run_one(&Command::rpop(queue), ReplyShape::Bulk)
            .await?
            .into_bulk()
    }

    /// Takes the oldest entry of `queue`, waiting up to `timeout` for one.
    ///
    /// # Errors
    ///
    /// Returns `MqError::Timeout` if the queue stays empty, and any pool or
    /// store error.
    pub async fn get(&self, queue: &str, timeout: Duration) -> Result<Bytes, MqError> {
        match self.get_any(&[queue], timeout).await? {
            Some((_, value)) => Ok(value),
            None => Err(MqError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Takes the oldest entry from the first non-empty queue in `queues`,
    /// waiting up to `timeout`. Returns the queue it came from.
    ///
    /// # Errors
    ///
    /// Returns any pool or store error.
    pub async fn get_any<K: AsRef<str>>(
        &self,
        queues: &[K],
        timeout: Duration,
    ) -> Result<Option<(String, Bytes)>, MqError> {
        let cmd = Command::brpop(queues, timeout);
        let reply = self
            .run(|pipe| {
                pipe.enqueue_blocking(&cmd, ReplyShape::MultiBulk, timeout);
            })
            .await?
            .pop()
            .ok_or(MqError::PipelineState("missing reply"))?;

        match reply.into_multi_bulk()? {
            None => Ok(None),
            Some(items) => match <[Bytes; 2]>::try_from(items) {
                Ok([key, value]) => Ok(Some((String::from_utf8_lossy(&key).into_owned(), value))),
                Err(items) => Err(MqError::ProtocolDesync(format!(
                    "BRPOP returned {} elements",
                    items.len()
                ))),
            },
        }
    }

    /// Takes and decodes the oldest envelope of `queue`, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// See [`MqClient::get`]; also `MqError::Serialization`.
    pub async fn get_envelope(&self, queue: &str, timeout: Duration) -> Result<Envelope, MqError> {
        let bytes = self.get(queue, timeout).await?;
        Ok(Envelope::from_bytes(&bytes)?)
    }

    /// Acknowledges a processed envelope.
    ///
    /// Envelopes leave the store when they are popped, so there is nothing
    /// to do; kept for symmetry with [`MqClient::nak`].
    pub fn ack(&self, _envelope: &Envelope) {}

    /// Rejects an envelope: back onto its type's work queue when `requeue`
    /// is set, otherwise onto the dead-letter queue.
    ///
    /// # Errors
    ///
    /// See [`MqClient::publish`].
    pub async fn nak(
        &self,
        type_name: &str,
        envelope: &Envelope,
        requeue: bool,
    ) -> Result<(), MqError> {
        if requeue {
            self.publish(type_name, envelope).await
        } else {
            self.publish_to(&queue_name(type_name, QueueRole::DeadLetter)?, envelope)
                .await
        }
    }

    // -- Inspection -----------------------------------------------------------

    /// Number of entries in `queue`.
    ///
    /// # Errors
    ///
    /// Returns any pool or store error.
    pub async fn queue_len(&self, queue: &str) -> Result<u64, MqError> {
        let len = self
            .run_one(&Command::llen(queue), ReplyShape::Int)
            .await?
            .into_int()?;
        Ok(u64::try_from(len).unwrap_or(0))
    }

    /// Lengths of every queue of `type_name`, read in one round trip.
    ///
    /// # Errors
    ///
    /// Returns `MqError::InvalidQueueName` for an unusable type name and
    /// any pool or store error.
    pub async fn queue_depths(&self, type_name: &str) -> Result<QueueDepths, MqError> {
        let names = QueueNames::new(type_name)?;
        let commands = [
            Command::llen(&names.inbound),
            Command::llen(&names.priority),
            Command::llen(&names.outbound),
            Command::llen(&names.dead_letter),
        ];
        let replies = self
            .run(|pipe| {
                for cmd in &commands {
                    pipe.enqueue(cmd, ReplyShape::Int);
                }
            })
            .await?;

        let mut lens = replies
            .into_iter()
            .map(|r| r.into_int().map(|n| u64::try_from(n).unwrap_or(0)));
        let mut next = || lens.next().unwrap_or(Ok(0));
        Ok(QueueDepths {
            type_name: names.type_name.clone(),
            inbound: next()?,
            priority: next()?,
            outbound: next()?,
            dead_letter: next()?,
        })
    }

    /// Up to `count` of the oldest entries, next-to-be-taken first, without
    /// removing them.
    ///
    /// # Errors
    ///
    /// Returns any pool or store error.
    pub async fn peek(&self, queue: &str, count: usize) -> Result<Vec<Bytes>, MqError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let count = i64::try_from(count).unwrap_or(i64::MAX);
        let mut items = self
            .run_one(&Command::lrange(queue, -count, -1), ReplyShape::MultiBulk)
            .await?
            .into_multi_bulk()?
            .unwrap_or_default();
        items.reverse();
        Ok(items)
    }

    /// Deletes `queue`. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns any pool or store error.
    pub async fn clear(&self, queue: &str) -> Result<bool, MqError> {
        let removed = self
            .run_one(&Command::del(&[queue]), ReplyShape::Int)
            .await?
            .into_int()?;
        Ok(removed > 0)
    }

    /// Moves every entry from `from` to `to`, oldest first. Returns the count.
    ///
    /// Entries move one at a time: popped from `from`, then pushed to `to`.
    ///
    /// # Errors
    ///
    /// Returns any pool or store error. Entries already moved stay moved.
    pub async fn move_all(&self, from: &str, to: &str) -> Result<u64, MqError> {
        let mut moved = 0;
        while let Some(value) = self.get_async(from).await? {
            self.push(to, value).await?;
            moved += 1;
        }
        Ok(moved)
    }

    /// Puts every dead letter of `type_name` back to work with a clean
    /// retry count. Returns the count.
    ///
    /// Decoded envelopes lose their `retry_attempts` and `error` and are
    /// republished, so a poller gives each one its full retry limit again.
    /// Entries that do not decode are moved to the work queue unchanged.
    ///
    /// # Errors
    ///
    /// Returns `MqError::InvalidQueueName` for an unusable type name and
    /// any pool or store error. Entries already replayed stay replayed.
    pub async fn replay_dead_letters(&self, type_name: &str) -> Result<u64, MqError> {
        let names = QueueNames::new(type_name)?;
        let mut replayed = 0;
        while let Some(raw) = self.get_async(&names.dead_letter).await? {
            match Envelope::from_bytes(&raw) {
                Ok(mut envelope) => {
                    envelope.retry_attempts = 0;
                    envelope.error = None;
                    self.publish(type_name, &envelope).await?;
                }
                Err(err) => {
                    debug!(queue = %names.dead_letter, error = %err, "replaying undecodable entry as is");
                    self.push(&names.inbound, raw).await?;
                }
            }
            replayed += 1;
        }
        Ok(replayed)
    }

    /// A fresh, uniquely named queue for one-off replies.
    #[must_use]
    pub fn temp_queue_name(&self) -> String {
        redmq_core::temp_queue_name()
    }
}
