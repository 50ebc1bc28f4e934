//! The message envelope: a payload plus its delivery metadata.
//!
//! Envelopes travel through the store as MessagePack maps produced by
//! `rmp_serde::to_vec_named()`, with camelCase field names. The body is an
//! opaque binary blob; callers choose its serialization (JSON helpers are
//! provided for the common case).

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Errors raised while converting envelopes to and from their wire form.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode envelope: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("failed to convert envelope body: {0}")]
    Body(#[from] serde_json::Error),
}

/// Unit of work on a queue.
///
/// An envelope is owned by exactly one party at a time: the producer before
/// publish, the store while queued, and the worker while processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique identifier, a v4 UUID unless set explicitly.
    pub id: String,

    /// Serialized payload.
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,

    /// Creation time in milliseconds since the Unix epoch.
    pub created_at: u64,

    /// Number of failed processing attempts so far.
    #[serde(default)]
    pub retry_attempts: u32,

    /// Envelopes with a positive priority are published to the priority queue.
    #[serde(default)]
    pub priority: i64,

    /// Queue the handler's reply should be published to.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reply_to: Option<String>,

    /// Identifier threaded through a request/response exchange.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<String>,

    /// Description of the most recent failure.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,

    /// Free-form string headers.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub meta: BTreeMap<String, String>,
}

impl Envelope {
    /// Wraps `body` in a fresh envelope with a new id and the current time.
    #[must_use]
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            body: body.into(),
            created_at: now_millis(),
            retry_attempts: 0,
            priority: 0,
            reply_to: None,
            correlation_id: None,
            error: None,
            meta: BTreeMap::new(),
        }
    }

    /// Wraps a value serialized as JSON.
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError::Body` if `value` cannot be serialized.
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, EnvelopeError> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Encodes the envelope into its MessagePack wire form.
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError::Encode` if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decodes an envelope from its MessagePack wire form.
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError::Decode` if `bytes` is not a valid envelope.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Deserializes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns `EnvelopeError::Body` if the body is not valid JSON for `T`.
    pub fn body_json<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// The body as UTF-8 text, if it is valid UTF-8.
    #[must_use]
    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }

    /// Records a failed attempt: bumps `retry_attempts` and keeps the error text.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.retry_attempts = self.retry_attempts.saturating_add(1);
        self.error = Some(error.into());
    }

    /// Builds the reply to this envelope.
    ///
    /// The reply carries this envelope's correlation id, or its id when the
    /// request had none, so the requester can match it up.
    #[must_use]
    pub fn reply(&self, body: impl Into<Vec<u8>>) -> Envelope {
        let mut reply = Envelope::new(body);
        reply.correlation_id = Some(
            self.correlation_id
                .clone()
                .unwrap_or_else(|| self.id.clone()),
        );
        reply
    }
}

/// Milliseconds since the Unix epoch, saturating on overflow and 0 before 1970.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_envelope_has_fresh_id_and_no_failures() {
        let a = Envelope::new("incr:5");
        let b = Envelope::new("incr:5");
        assert_ne!(a.id, b.id);
        assert_eq!(a.retry_attempts, 0);
        assert!(a.error.is_none());
        assert!(a.created_at > 0);
        assert_eq!(a.body_str(), Some("incr:5"));
    }

    #[test]
    fn wire_form_keeps_every_field() {
        let env = Envelope::new(vec![0u8, 159, 146, 150])
            .with_id("1")
            .with_reply_to("Order.outq")
            .with_correlation_id("c-1")
            .with_priority(3)
            .with_meta("tenant", "acme");

        let decoded = Envelope::from_bytes(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn wire_form_uses_camel_case_names() {
        let env = Envelope::new("x").with_reply_to("q");
        let wire = env.to_bytes().unwrap();
        let text = String::from_utf8_lossy(&wire);
        assert!(text.contains("replyTo"));
        assert!(text.contains("retryAttempts"));
        // Unset optional fields are omitted entirely.
        assert!(!text.contains("correlationId"));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(matches!(
            Envelope::from_bytes(b"incr:5"),
            Err(EnvelopeError::Decode(_))
        ));
    }

    #[test]
    fn record_failure_counts_attempts() {
        let mut env = Envelope::new("x");
        env.record_failure("boom");
        env.record_failure("boom again");
        assert_eq!(env.retry_attempts, 2);
        assert_eq!(env.error.as_deref(), Some("boom again"));
    }

    #[test]
    fn reply_correlates_with_request() {
        let req = Envelope::new("ping").with_id("42");
        assert_eq!(req.reply("pong").correlation_id.as_deref(), Some("42"));

        let req = req.with_correlation_id("conv-7");
        assert_eq!(req.reply("pong").correlation_id.as_deref(), Some("conv-7"));
    }

    #[test]
    fn json_body_helpers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Incr {
            by: i64,
        }

        let env = Envelope::from_json(&Incr { by: 5 }).unwrap();
        assert_eq!(env.body_json::<Incr>().unwrap(), Incr { by: 5 });
        assert!(matches!(
            Envelope::new("nope").body_json::<Incr>(),
            Err(EnvelopeError::Body(_))
        ));
    }
}
