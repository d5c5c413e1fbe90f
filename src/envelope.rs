use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Routing scope of an [`Envelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Target {
    Proxy,
    All,
    Server,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Proxy => "PROXY",
            Target::All => "ALL",
            Target::Server => "SERVER",
        }
    }

    pub fn parse(raw: &str) -> Option<Target> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PROXY" => Some(Target::Proxy),
            "ALL" => Some(Target::All),
            "SERVER" => Some(Target::Server),
            _ => None,
        }
    }
}

/// The wire message shape shared by every transport.
///
/// `target_server` is set iff `target == Target::Server`. Envelopes are not
/// mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub channel: String,
    pub data: String,
    pub target: Target,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_server: Option<String>,
    #[serde(default)]
    pub source_server: String,
    #[serde(default)]
    pub created_at: i64,
}

impl Envelope {
    pub fn new(
        channel: impl Into<String>,
        data: impl Into<String>,
        target: Target,
        target_server: Option<String>,
        source_server: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            data: data.into(),
            target,
            target_server,
            source_server: source_server.into(),
            created_at: now_millis(),
        }
    }
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
