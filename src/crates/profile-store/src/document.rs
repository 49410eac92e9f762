//! Stored document layout and its codec
//!
//! Every key holds one [`Document`]: the application payload, session
//! metadata, the bounded message queue and the associated user ids.
//!
//! ```text
//! {
//!   "data": { ... },                         application payload
//!   "metadata": {
//!     "activeSession": {"ownerId", "instanceId"} | null,
//!     "releaseRequest": {"requestedBy", "requestedAt"} | null,
//!     "firstSessionTime": "2024-01-01T12:00:00Z",
//!     "sessionLoadCount": 3,
//!     "lastUpdate": "2024-01-01T12:05:00Z",  owner heartbeat
//!     "extraTags": { ... }
//!   },
//!   "messageQueue": [{"id", "message", "sentAt", "deliveredTo": [..]}],
//!   "userIds": [1, 2]
//! }
//! ```
//!
//! Decoding never fails: components with the wrong shape are replaced by
//! defaults and reported as issues so the caller can fire an overwrite
//! notification, while every component that did decode is kept.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

/// Identity of a session owner written into the document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMarker {
    /// Stable name of the owning process group
    pub owner_id: String,
    /// Unique id of the owning process instance
    pub instance_id: String,
}

impl SessionMarker {
    pub fn new(owner_id: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl std::fmt::Display for SessionMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.instance_id)
    }
}

/// Marker left by a process that wants the current owner to let go
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub requested_by: SessionMarker,
    pub requested_at: DateTime<Utc>,
}

/// Session bookkeeping stored next to the payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    #[serde(default)]
    pub active_session: Option<SessionMarker>,

    #[serde(default)]
    pub release_request: Option<ReleaseRequest>,

    pub first_session_time: DateTime<Utc>,

    #[serde(default)]
    pub session_load_count: u64,

    /// Time of the last write by the active owner
    pub last_update: DateTime<Utc>,

    #[serde(default)]
    pub extra_tags: Map<String, Value>,
}

impl DocumentMetadata {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            active_session: None,
            release_request: None,
            first_session_time: now,
            session_load_count: 0,
            last_update: now,
            extra_tags: Map::new(),
        }
    }

    /// Current lease, if any owner is recorded
    pub fn lease(&self) -> Option<Lease<'_>> {
        self.active_session.as_ref().map(|owner| Lease {
            owner,
            heartbeat: self.last_update,
        })
    }
}

/// Ownership marker paired with the owner's last heartbeat.
///
/// Liveness is recomputed from the current time on every observation.
#[derive(Debug, Clone, Copy)]
pub struct Lease<'a> {
    pub owner: &'a SessionMarker,
    pub heartbeat: DateTime<Utc>,
}

impl Lease<'_> {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.heartbeat).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_alive(&self, now: DateTime<Utc>, assume_dead: Duration) -> bool {
        self.age(now) < assume_dead
    }
}

/// One queued inter-session message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: Uuid,
    pub message: Value,
    pub sent_at: DateTime<Utc>,
    /// Handler generations that were offered this message without acknowledging it
    #[serde(default)]
    pub delivered_to: BTreeSet<String>,
}

impl QueuedMessage {
    pub fn new(message: Value, sent_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            message,
            sent_at,
            delivered_to: BTreeSet::new(),
        }
    }
}

/// Full value stored under one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub data: Value,
    pub metadata: DocumentMetadata,
    #[serde(default)]
    pub message_queue: Vec<QueuedMessage>,
    #[serde(default)]
    pub user_ids: Vec<i64>,
}

impl Document {
    /// Fresh document for a key that holds nothing yet
    pub fn new(data: Value, now: DateTime<Utc>) -> Self {
        Self {
            data,
            metadata: DocumentMetadata::new(now),
            message_queue: Vec::new(),
            user_ids: Vec::new(),
        }
    }

    /// Append a message, evicting the oldest entries beyond `max_len`.
    /// Returns the number of evicted messages.
    pub fn push_message(&mut self, message: QueuedMessage, max_len: usize) -> usize {
        self.message_queue.push(message);
        self.trim_queue(max_len)
    }

    pub fn trim_queue(&mut self, max_len: usize) -> usize {
        let overflow = self.message_queue.len().saturating_sub(max_len);
        if overflow > 0 {
            self.message_queue.drain(..overflow);
        }
        overflow
    }
}

/// Result of decoding a stored value
#[derive(Debug, Clone)]
pub struct Decoded {
    pub document: Document,
    /// Shape problems found; non-empty means part of the value was replaced
    pub issues: Vec<String>,
}

impl Decoded {
    pub fn is_corrupt(&self) -> bool {
        !self.issues.is_empty()
    }
}

/// Serialize a document for storage
pub fn encode(document: &Document) -> Result<Value> {
    Ok(serde_json::to_value(document)?)
}

/// Decode a stored value, salvaging every well-formed component.
///
/// `default_data` seeds the payload when it is missing entirely.
pub fn decode(value: &Value, default_data: &Value, now: DateTime<Utc>) -> Decoded {
    let mut issues = Vec::new();

    let object = match value.as_object() {
        Some(object) => object,
        None => {
            issues.push(format!("stored value is {}, not an object", kind(value)));
            return Decoded {
                document: Document::new(default_data.clone(), now),
                issues,
            };
        }
    };

    let data = match object.get("data") {
        Some(Value::Null) | None => {
            issues.push("missing data".to_string());
            default_data.clone()
        }
        Some(data) => data.clone(),
    };

    let metadata = match object.get("metadata") {
        Some(raw) => match serde_json::from_value::<DocumentMetadata>(raw.clone()) {
            Ok(metadata) => metadata,
            Err(e) => {
                issues.push(format!("invalid metadata: {}", e));
                DocumentMetadata::new(now)
            }
        },
        None => {
            issues.push("missing metadata".to_string());
            DocumentMetadata::new(now)
        }
    };

    let message_queue = match object.get("messageQueue") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => {
            let mut queue = Vec::with_capacity(items.len());
            for item in items {
                match serde_json::from_value::<QueuedMessage>(item.clone()) {
                    Ok(message) => queue.push(message),
                    Err(e) => issues.push(format!("dropped invalid queued message: {}", e)),
                }
            }
            queue
        }
        Some(other) => {
            issues.push(format!("messageQueue is {}, not an array", kind(other)));
            Vec::new()
        }
    };

    let user_ids = match object.get("userIds") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => {
            let mut ids: Vec<i64> = Vec::with_capacity(items.len());
            for item in items {
                match item.as_i64() {
                    Some(id) if !ids.contains(&id) => ids.push(id),
                    Some(_) => {}
                    None => issues.push(format!("dropped invalid user id {}", item)),
                }
            }
            ids
        }
        Some(other) => {
            issues.push(format!("userIds is {}, not an array", kind(other)));
            Vec::new()
        }
    };

    Decoded {
        document: Document {
            data,
            metadata,
            message_queue,
            user_ids,
        },
        issues,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_encode_decode_document() {
        let mut document = Document::new(json!({"coins": 10}), now());
        document.metadata.active_session = Some(SessionMarker::new("place-1", "job-a"));
        document.metadata.session_load_count = 2;
        document.user_ids.push(42);
        document.push_message(QueuedMessage::new(json!({"gift": "sword"}), now()), 10);

        let encoded = encode(&document).unwrap();
        assert_eq!(encoded["metadata"]["sessionLoadCount"], json!(2));
        assert_eq!(encoded["metadata"]["activeSession"]["ownerId"], json!("place-1"));

        let decoded = decode(&encoded, &json!({}), now());
        assert!(!decoded.is_corrupt());
        assert_eq!(decoded.document, document);
    }

    #[test]
    fn test_decode_non_object_is_corrupt() {
        let decoded = decode(&json!("oops"), &json!({"coins": 0}), now());
        assert!(decoded.is_corrupt());
        assert_eq!(decoded.document.data, json!({"coins": 0}));
        assert_eq!(decoded.document.metadata.session_load_count, 0);
    }

    #[test]
    fn test_decode_salvages_valid_components() {
        let stamp = now();
        let mut good = encode(&Document::new(json!({"level": 7}), stamp)).unwrap();
        good["metadata"]["sessionLoadCount"] = json!(5);
        good["userIds"] = json!([1, "two", 3, 1]);
        good["messageQueue"] = json!([{"bad": true}]);

        let decoded = decode(&good, &json!({}), stamp);
        assert!(decoded.is_corrupt());
        assert_eq!(decoded.issues.len(), 2);
        assert_eq!(decoded.document.data, json!({"level": 7}));
        assert_eq!(decoded.document.metadata.session_load_count, 5);
        assert_eq!(decoded.document.user_ids, vec![1, 3]);
        assert!(decoded.document.message_queue.is_empty());
    }

    #[test]
    fn test_push_message_evicts_oldest() {
        let mut document = Document::new(json!({}), now());
        for i in 0..5 {
            document.push_message(QueuedMessage::new(json!(i), now()), 3);
        }
        let kept: Vec<_> = document
            .message_queue
            .iter()
            .map(|m| m.message.clone())
            .collect();
        assert_eq!(kept, vec![json!(2), json!(3), json!(4)]);
    }

    #[test]
    fn test_lease_liveness() {
        let stamp = now();
        let mut metadata = DocumentMetadata::new(stamp);
        assert!(metadata.lease().is_none());

        metadata.active_session = Some(SessionMarker::new("place", "job"));
        let lease = metadata.lease().unwrap();
        let threshold = Duration::from_secs(60);
        assert!(lease.is_alive(stamp + chrono::Duration::seconds(59), threshold));
        assert!(!lease.is_alive(stamp + chrono::Duration::seconds(60), threshold));
    }
}
