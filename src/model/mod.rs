//! Core data model.
//!
//! A record is a key plus an opaque payload travelling through the bridge.
//! Entities stored in the cache identify themselves through [`Keyed`].

pub mod job;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Keyed entities
// ---------------------------------------------------------------------------

/// Anything that can produce a stable string key from its own fields.
pub trait Keyed {
    fn key(&self) -> String;
}

/// A message routed through the bridge and cached by uid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "UID")]
    pub uid: String,
    #[serde(rename = "Message")]
    pub message: String,
}

impl Message {
    pub const KEY_PREFIX: &'static str = "message:";

    pub fn new(uid: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            message: message.into(),
        }
    }

    /// A message with a freshly generated uid.
    pub fn generated(message: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), message)
    }

    /// Cache key for a given uid.
    pub fn key_for(uid: &str) -> String {
        format!("{}{uid}", Self::KEY_PREFIX)
    }
}

impl Keyed for Message {
    fn key(&self) -> String {
        Self::key_for(&self.uid)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A record as handed to the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub payload: Bytes,
}

impl Record {
    pub fn new(key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
        }
    }
}

/// Position of a record within its partition. Starts at 0.
pub type Offset = i64;

/// A record read back from the durable log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub offset: Offset,
    pub key: String,
    pub payload: Bytes,
    pub produced_at: DateTime<Utc>,
}

/// Topic name plus partition index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Where a subscriber begins reading when it attaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOffset {
    #[default]
    Oldest,
    Newest,
}

impl std::str::FromStr for StartOffset {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oldest" => Ok(StartOffset::Oldest),
            "newest" => Ok(StartOffset::Newest),
            other => Err(crate::error::Error::Config(format!(
                "invalid start offset: {other} (expected oldest|newest)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// What `publish` hands back to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Accepted into the send channel; the outcome goes to the outcome handler.
    Enqueued,
    /// Acknowledged by the log at this offset.
    Acknowledged(Offset),
}

/// Result of delivering one record to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { key: String, offset: Offset },
    Failed { key: String, error: String },
}

impl DeliveryOutcome {
    pub fn key(&self) -> &str {
        match self {
            DeliveryOutcome::Delivered { key, .. } | DeliveryOutcome::Failed { key, .. } => key,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_key_is_prefixed_uid() {
        let msg = Message::new("abc", "hello");
        assert_eq!(msg.key(), "message:abc");
        assert_eq!(Message::key_for("abc"), msg.key());
    }

    #[test]
    fn message_uses_upper_case_field_names() {
        let json = serde_json::to_value(Message::new("u1", "hi")).unwrap();
        assert_eq!(json, serde_json::json!({"UID": "u1", "Message": "hi"}));
    }

    #[test]
    fn start_offset_parses() {
        assert_eq!("oldest".parse::<StartOffset>().unwrap(), StartOffset::Oldest);
        assert_eq!("newest".parse::<StartOffset>().unwrap(), StartOffset::Newest);
        assert!("latest".parse::<StartOffset>().is_err());
    }
}
