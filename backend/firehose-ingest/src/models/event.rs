use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A decoded, validated event ready for persistence.
///
/// Only the decoder builds these, so every `Event` in the pipeline has already
/// passed validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    user_id: i64,
    timestamp: DateTime<Utc>,
    metadata: Map<String, Value>,
}

impl Event {
    pub(crate) fn new(user_id: i64, timestamp: DateTime<Utc>, metadata: Map<String, Value>) -> Self {
        Self {
            user_id,
            timestamp,
            metadata,
        }
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }
}

/// Wire shape written by producers into the `payload` field of a stream entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    pub user_id: i64,
    pub timestamp: String,
    pub metadata: Map<String, Value>,
}

impl EventPayload {
    pub fn new(user_id: i64, timestamp: DateTime<Utc>, metadata: Map<String, Value>) -> Self {
        Self {
            user_id,
            timestamp: timestamp.to_rfc3339(),
            metadata,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
