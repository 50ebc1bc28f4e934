use std::sync::Arc;
use std::time::Duration;

use redmq_core::Envelope;

use super::retry::RetryPolicy;

/// Runs on every decoded envelope before its handler. Returning `None`
/// drops the envelope without calling the handler.
pub type RequestFilter = Arc<dyn Fn(Envelope) -> Option<Envelope> + Send + Sync>;

/// Rewrites a handler's reply body before it is published.
pub type ResponseFilter = Arc<dyn Fn(Vec<u8>) -> Vec<u8> + Send + Sync>;

/// Settings for [`MqClient`](super::client::MqClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Length bound applied by `notify`; older entries are trimmed away.
    pub notify_max_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            notify_max_len: 1000,
        }
    }
}

/// Broker-wide settings for polling, shutdown and reply publishing.
#[derive(Clone)]
pub struct BrokerConfig {
    /// How long one blocking pop waits before the poller re-checks for stop.
    /// Also the worst-case latency of `stop()`.
    pub poll_timeout: Duration,
    /// Maximum time a single handler invocation may take. A timed-out
    /// invocation counts as a failed attempt. `None` means unbounded.
    pub handler_timeout: Option<Duration>,
    /// Backoff applied when popping fails with a transient error.
    pub retry_policy: RetryPolicy,
    /// Client settings used for replies and dead-lettering.
    pub client: ClientConfig,
    pub request_filter: Option<RequestFilter>,
    pub response_filter: Option<ResponseFilter>,
    /// Types allowed to publish replies to their `.outq`. `None` allows
    /// every type that opted in; an empty list silences them all. Replies
    /// to an explicit `reply_to` are always sent.
    pub publish_responses_whitelist: Option<Vec<String>>,
}

impl BrokerConfig {
    #[must_use]
    pub fn with_request_filter(
        mut self,
        filter: impl Fn(Envelope) -> Option<Envelope> + Send + Sync + 'static,
    ) -> Self {
        self.request_filter = Some(Arc::new(filter));
        self
    }

    #[must_use]
    pub fn with_response_filter(
        mut self,
        filter: impl Fn(Vec<u8>) -> Vec<u8> + Send + Sync + 'static,
    ) -> Self {
        self.response_filter = Some(Arc::new(filter));
        self
    }

    /// Stops every type from publishing to its `.outq`.
    #[must_use]
    pub fn disable_publishing_responses(mut self) -> Self {
        self.publish_responses_whitelist = Some(Vec::new());
        self
    }

    /// Whether `type_name` may publish replies to its `.outq`.
    #[must_use]
    pub fn publishes_responses(&self, type_name: &str) -> bool {
        self.publish_responses_whitelist
            .as_ref()
            .map_or(true, |allowed| allowed.iter().any(|t| t == type_name))
    }
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("poll_timeout", &self.poll_timeout)
            .field("handler_timeout", &self.handler_timeout)
            .field("retry_policy", &self.retry_policy)
            .field("client", &self.client)
            .field("request_filter", &self.request_filter.is_some())
            .field("response_filter", &self.response_filter.is_some())
            .field("publish_responses_whitelist", &self.publish_responses_whitelist)
            .finish()
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            handler_timeout: None,
            retry_policy: RetryPolicy::default(),
            client: ClientConfig::default(),
            request_filter: None,
            response_filter: None,
            publish_responses_whitelist: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_defaults() {
        assert_eq!(ClientConfig::default().notify_max_len, 1000);
    }

    #[test]
    fn broker_config_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.poll_timeout, Duration::from_secs(1));
        assert!(config.handler_timeout.is_none());
        assert_eq!(config.retry_policy, RetryPolicy::default());
        assert!(config.request_filter.is_none());
        assert!(config.publishes_responses("Anything"));
    }

    #[test]
    fn response_whitelist_gates_outq_publishing() {
        let config = BrokerConfig {
            publish_responses_whitelist: Some(vec!["Report".into()]),
            ..BrokerConfig::default()
        };
        assert!(config.publishes_responses("Report"));
        assert!(!config.publishes_responses("Incr"));

        let silent = BrokerConfig::default().disable_publishing_responses();
        assert!(!silent.publishes_responses("Report"));
        assert!(format!("{silent:?}").contains("publish_responses_whitelist: Some([])"));
    }
}
