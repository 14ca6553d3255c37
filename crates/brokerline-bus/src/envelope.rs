use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::QueueError;

/// AMQP header carrying the envelope type.
pub const AMQP_TYPE_HEADER: &str = "messageType";
/// SQS message attribute carrying the envelope type.
pub const SQS_TYPE_ATTRIBUTE: &str = "MessageType";
/// SQS message attribute carrying the publish time (RFC 3339).
pub const SQS_TIMESTAMP_ATTRIBUTE: &str = "Timestamp";
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Typed message unit exchanged between publishers and subscribers.
///
/// On the wire the envelope is plain JSON:
/// `{"type": "...", "payload": {...}, "messageId": "...", "correlationId": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: None,
            message_id: None,
            correlation_id: None,
        }
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Rejects envelopes whose `type` is empty or whitespace.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.kind.trim().is_empty() {
            return Err(QueueError::InvalidEnvelope(
                "type must be a non-empty string".into(),
            ));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, QueueError> {
        serde_json::to_vec(self).map_err(QueueError::Encode)
    }

    pub fn to_json(&self) -> Result<String, QueueError> {
        serde_json::to_string(self).map_err(QueueError::Encode)
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, QueueError> {
        serde_json::from_slice(body).map_err(QueueError::Decode)
    }
}
