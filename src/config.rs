use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::filesync::INVALIDATE_CHANNEL;

/// Outbox queueing settings. A host's config loader deserializes this
/// directly; every field has a sensible default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub enabled: bool,
    pub allowlist: Vec<String>,
    pub flush_period_seconds: u64,
    pub max_batch_size: usize,
    pub max_age_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowlist: vec![INVALIDATE_CHANNEL.to_string()],
            flush_period_seconds: 2,
            max_batch_size: 200,
            max_age_seconds: 300,
        }
    }
}

impl QueueConfig {
    pub fn flush_period(&self) -> Duration {
        Duration::from_secs(self.flush_period_seconds.max(1))
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_expected_policy() {
        let config = QueueConfig::default();
        assert!(config.enabled);
        assert_eq!(config.allowlist, vec![INVALIDATE_CHANNEL.to_string()]);
        assert_eq!(config.flush_period(), Duration::from_secs(2));
        assert_eq!(config.max_batch_size, 200);
        assert_eq!(config.max_age(), Duration::from_secs(300));
    }

    #[test]
    fn deserializes_partial_documents() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"allowlist": ["db.cache_event"], "max_batch_size": 5}"#)
                .unwrap();
        assert_eq!(config.allowlist, vec!["db.cache_event".to_string()]);
        assert_eq!(config.max_batch_size, 5);
        assert!(config.enabled);
        assert_eq!(config.flush_period_seconds, 2);
    }

    #[test]
    fn clamps_zero_flush_period() {
        let clamped = QueueConfig {
            flush_period_seconds: 0,
            ..QueueConfig::default()
        };
        assert_eq!(clamped.flush_period(), Duration::from_secs(1));
    }
}
