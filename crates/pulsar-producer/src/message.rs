use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A message to publish. The producer interprets `key` (partition routing)
/// and `value` (payload); properties and event time ride along untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    /// Optional routing/partition key.
    pub key: Option<Bytes>,
    /// Message payload.
    pub value: Bytes,
    /// User-defined properties attached to the message.
    pub properties: Vec<(String, String)>,
    /// Application-supplied event time (UTC millis).
    pub event_time: Option<u64>,
}

impl Message {
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_key(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: Some(key.into()),
            value: value.into(),
            ..Default::default()
        }
    }
}

/// One spooled queue item: the messages of a single publish call together
/// with their enqueue timestamp, so retention decisions remain possible when
/// the item is drained later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct QueueItem {
    pub enqueued_at_ms: u64,
    pub messages: Vec<Message>,
}

impl QueueItem {
    pub(crate) fn encode(&self) -> crate::Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub(crate) fn decode(bytes: &[u8]) -> crate::Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
