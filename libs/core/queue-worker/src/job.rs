//! Work items and the dead-letter envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Adapter-defined handle used to acknowledge or return an item.
///
/// Deliberately not `Clone`: exactly one holder per delivery.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct AckToken(String);

impl AckToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A unit of work delivered by a [`JobSource`](crate::JobSource).
///
/// Owned by the processing loop while it is being processed. `requeue` and
/// `dead_letter` consume it, handing ownership back to the source.
#[derive(Debug)]
pub struct WorkItem {
    id: String,
    payload: Vec<u8>,
    attempts: u32,
    token: AckToken,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, payload: Vec<u8>, attempts: u32, token: AckToken) -> Self {
        Self {
            id: id.into(),
            payload,
            attempts,
            token,
        }
    }

    /// Stable identifier used for logging and attempt tracking
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as UTF-8, if it is valid UTF-8
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Number of failed processing attempts before this delivery
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn ack_token(&self) -> &AckToken {
        &self.token
    }
}

/// Content-derived item id (hex SHA-256), for sources without native ids
pub fn content_id(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

/// Entry written to the dead-letter destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Item id
    pub id: String,

    /// Original payload (lossy UTF-8)
    pub payload: String,

    /// Why the item was dead-lettered
    pub reason: String,

    /// Failed attempts including the final one
    pub attempts: u32,

    /// Queue or stream the item came from
    pub source: String,

    /// When the item was dead-lettered
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(item: &WorkItem, reason: &str, source: &str) -> Self {
        Self {
            id: item.id().to_string(),
            payload: String::from_utf8_lossy(item.payload()).into_owned(),
            reason: reason.to_string(),
            attempts: item.attempts() + 1,
            source: source.to_string(),
            failed_at: Utc::now(),
        }
    }
}
