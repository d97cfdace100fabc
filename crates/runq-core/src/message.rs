use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque message body. The broker never inspects `data`; `content_type` is a
/// declared tag for consumers (e.g. `application/json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payload {
    pub content_type: String,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new(content_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.into(),
            data: data.into(),
        }
    }

    pub fn json(data: impl Into<Vec<u8>>) -> Self {
        Self::new("application/json", data)
    }
}

/// Core message domain type, stored as the message body in the `messages`
/// column family. `timestamp` is the message's score in its queue; it is
/// rewritten on nack-with-retry and replace, and kept on plain redelivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    pub queue: String,
    pub parent_queue: String,
    pub concurrency_key: Option<String>,
    pub organization_id: String,
    pub environment_id: String,
    pub payload: Payload,
    pub timestamp: u64,
    /// Number of times this message has been nacked or reclaimed.
    pub attempt: u32,
}

impl Message {
    /// Generate a new UUIDv7 message ID.
    pub fn new_id() -> Uuid {
        Uuid::now_v7()
    }
}
