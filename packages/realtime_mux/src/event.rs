use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of row change carried by a [`ChangeEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// A database change delivered over a realtime channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub schema: String,
    pub table: String,
    #[serde(rename = "eventType")]
    pub change: ChangeType,
    /// Row after the change (`null` for deletes)
    #[serde(default)]
    pub new: serde_json::Value,
    /// Row before the change (`null` for inserts)
    #[serde(default)]
    pub old: serde_json::Value,
    pub commit_timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn insert(schema: &str, table: &str, new: serde_json::Value) -> Self {
        Self::build(schema, table, ChangeType::Insert, new, serde_json::Value::Null)
    }

    pub fn update(
        schema: &str,
        table: &str,
        old: serde_json::Value,
        new: serde_json::Value,
    ) -> Self {
        Self::build(schema, table, ChangeType::Update, new, old)
    }

    pub fn delete(schema: &str, table: &str, old: serde_json::Value) -> Self {
        Self::build(schema, table, ChangeType::Delete, serde_json::Value::Null, old)
    }

    fn build(
        schema: &str,
        table: &str,
        change: ChangeType,
        new: serde_json::Value,
        old: serde_json::Value,
    ) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
            change,
            new,
            old,
            commit_timestamp: Utc::now(),
        }
    }

    /// The row a row filter is evaluated against: `old` for deletes, `new` otherwise.
    pub fn record(&self) -> &serde_json::Value {
        match self.change {
            ChangeType::Delete => &self.old,
            _ => &self.new,
        }
    }
}

/// Connection state reported by a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Higher is less healthy.
    pub fn severity(&self) -> u8 {
        match self {
            Self::Open => 0,
            Self::Connecting => 1,
            Self::Closing => 2,
            Self::Closed => 3,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Result of the subscription handshake, reported asynchronously.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscribeStatus {
    Subscribed,
    TimedOut,
    Closed,
    ChannelError(String),
}

impl fmt::Display for SubscribeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subscribed => f.write_str("SUBSCRIBED"),
            Self::TimedOut => f.write_str("TIMED_OUT"),
            Self::Closed => f.write_str("CLOSED"),
            Self::ChannelError(msg) => write!(f, "CHANNEL_ERROR: {}", msg),
        }
    }
}

/// Out-of-band notice from the realtime transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SystemEvent {
    Ok { message: String },
    Error { message: String },
}

/// A channel-level failure fanned out to error listeners.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error, Serialize)]
#[error("realtime channel {topic} reported an error: {message}")]
pub struct ChannelError {
    pub topic: String,
    pub message: String,
}
