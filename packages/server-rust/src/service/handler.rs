//! Adapters from plain async functions to [`MessageHandler`].

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use redmq_core::Envelope;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::MqError;
use crate::traits::MessageHandler;

/// Handler backed by an async closure over the envelope.
pub struct FnHandler<F> {
    f: F,
}

/// Wraps `f` as a handler. The closure gets its own copy of the envelope.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Vec<u8>>>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<Vec<u8>>>> + Send + 'static,
{
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<Option<Vec<u8>>> {
        (self.f)(envelope.clone()).await
    }
}

/// Handler that decodes the body as JSON `T` and encodes its reply `R` as JSON.
pub struct JsonHandler<T, R, F> {
    f: F,
    _types: PhantomData<fn(T) -> R>,
}

/// Wraps a typed closure as a handler.
///
/// A body that does not decode as `T` fails with `MqError::Serialization`,
/// which the broker dead-letters without retrying.
pub fn json_handler<T, R, F, Fut>(f: F) -> JsonHandler<T, R, F>
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<R>>> + Send + 'static,
{
    JsonHandler {
        f,
        _types: PhantomData,
    }
}

#[async_trait]
impl<T, R, F, Fut> MessageHandler for JsonHandler<T, R, F>
where
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<R>>> + Send + 'static,
{
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<Option<Vec<u8>>> {
        let body: T = envelope
            .body_json()
            .map_err(|e| MqError::Serialization(e.to_string()))?;
        match (self.f)(body).await? {
            Some(reply) => Ok(Some(
                serde_json::to_vec(&reply).map_err(|e| MqError::Serialization(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }
}

/// Whether a handler failure means the envelope can never be processed.
#[must_use]
pub fn is_serialization_error(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<MqError>(), Some(MqError::Serialization(_)))
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Incr {
        by: i64,
    }

    #[tokio::test]
    async fn fn_handler_sees_the_envelope() {
        let handler = handler_fn(|env: Envelope| async move {
            Ok(Some(format!("got {}", env.body_str().unwrap_or("?")).into_bytes()))
        });
        let reply = handler.handle(&Envelope::new("hi")).await.unwrap();
        assert_eq!(reply.as_deref(), Some(&b"got hi"[..]));
    }

    #[tokio::test]
    async fn json_handler_round_trips_typed_bodies() {
        let handler = json_handler(|incr: Incr| async move { Ok(Some(incr.by * 2)) });
        let env = Envelope::from_json(&Incr { by: 21 }).unwrap();
        let reply = handler.handle(&env).await.unwrap().unwrap();
        assert_eq!(reply, b"42");
    }

    #[tokio::test]
    async fn undecodable_body_is_a_serialization_error() {
        let handler = json_handler(|_: Incr| async move { Ok(None::<()>) });
        let err = handler.handle(&Envelope::new("not json")).await.unwrap_err();
        assert!(is_serialization_error(&err));
    }

    #[tokio::test]
    async fn ordinary_failures_are_not_serialization_errors() {
        let handler = handler_fn(|_| async move {
            Err::<Option<Vec<u8>>, _>(anyhow::anyhow!("downstream unavailable"))
        });
        let err = handler.handle(&Envelope::new("x")).await.unwrap_err();
        assert!(!is_serialization_error(&err));
    }
}
