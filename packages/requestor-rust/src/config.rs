use std::time::Duration;

use serde::{Deserialize, Serialize};

use replywire_core::DEFAULT_PURGE_INTERVAL;

/// Header that carries the correlation id when none is configured.
pub const DEFAULT_CORRELATION_HEADER: &str = "correlation-id";

/// How the correlation key of an outbound request is chosen when the caller
/// did not supply one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum CorrelationStrategy {
    /// Generate a prefixed correlation id and send it in the request headers.
    /// The remote side echoes it back on the reply.
    #[default]
    CorrelationId,
    /// Register under a provisional key, then rebind to the message id the
    /// transport assigns once the request is physically sent.
    MessageId,
}

/// Requestor-level configuration for request/reply correlation.
///
/// Supplied once at construction; there is no live reconfiguration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Name of the correlation manager; also prefixes its pending map's name.
    pub name: String,
    /// Interval between purge cycles of the pending map in milliseconds.
    pub purge_interval_ms: u64,
    /// Reply timeout in milliseconds for requests that do not override it.
    pub default_request_timeout_ms: u64,
    /// Correlation key strategy for requests without an explicit id.
    pub strategy: CorrelationStrategy,
    /// Header that carries the correlation id on requests and replies.
    pub correlation_header: String,
}

impl CorrelationConfig {
    #[must_use]
    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }

    #[must_use]
    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let purge_interval_ms = DEFAULT_PURGE_INTERVAL.as_millis() as u64;
        Self {
            name: "replywire".to_string(),
            purge_interval_ms,
            default_request_timeout_ms: 20_000,
            strategy: CorrelationStrategy::default(),
            correlation_header: DEFAULT_CORRELATION_HEADER.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_config_defaults() {
        let config = CorrelationConfig::default();
        assert_eq!(config.name, "replywire");
        assert_eq!(config.purge_interval(), Duration::from_millis(1000));
        assert_eq!(config.default_request_timeout(), Duration::from_secs(20));
        assert_eq!(config.strategy, CorrelationStrategy::CorrelationId);
        assert_eq!(config.correlation_header, "correlation-id");
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: CorrelationConfig =
            serde_json::from_str(r#"{ "strategy": "message-id", "purge_interval_ms": 250 }"#)
                .unwrap();
        assert_eq!(config.strategy, CorrelationStrategy::MessageId);
        assert_eq!(config.purge_interval(), Duration::from_millis(250));
        assert_eq!(config.default_request_timeout_ms, 20_000);
        assert_eq!(config.correlation_header, DEFAULT_CORRELATION_HEADER);
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let result: Result<CorrelationConfig, _> =
            serde_json::from_str(r#"{ "strategy": "carrier-pigeon" }"#);
        assert!(result.is_err());
    }
}
