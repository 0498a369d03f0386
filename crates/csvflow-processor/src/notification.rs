//! Object-created notifications
//!
//! A delivery payload is either a push envelope whose `message.data` holds the
//! base64-encoded event, or the bare event JSON.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use csvflow_common::types::ObjectRef;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::ProcessingError;

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
}

#[derive(Debug, Deserialize)]
struct PushMessage {
    data: Option<String>,
    #[serde(default, rename = "messageId")]
    message_id: Option<String>,
    #[serde(default)]
    attributes: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ObjectEvent {
    #[serde(default)]
    bucket: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, rename = "eventType")]
    event_type: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default, rename = "contentType")]
    content_type: Option<String>,
    #[serde(default, rename = "mediaType")]
    media_type: Option<String>,
    /// Object stores report size as a number or a decimal string
    #[serde(default)]
    size: Option<Value>,
}

/// Decoded object event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub message_id: Option<String>,
    pub bucket: Option<String>,
    pub name: Option<String>,
    pub event_type: Option<String>,
    pub content_type: Option<String>,
    pub size: Option<u64>,
}

/// Why a notification is acknowledged without processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Envelope carried no event data
    NoData,
    OtherBucket(String),
    MissingName,
    NotCsv(String),
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::NoData => f.write_str("notification has no data"),
            SkipReason::OtherBucket(bucket) => write!(f, "object is in another bucket ({})", bucket),
            SkipReason::MissingName => f.write_str("notification has no object name"),
            SkipReason::NotCsv(name) => write!(f, "{} is not a .csv file", name),
        }
    }
}

/// Outcome of decoding a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Event(Notification),
    Skip(SkipReason),
}

impl Notification {
    /// Decode a delivery payload.
    ///
    /// Fails only when the payload cannot be parsed at all.
    pub fn decode(payload: &[u8]) -> Result<Decoded, ProcessingError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| ProcessingError::Notification(format!("payload is not JSON: {}", e)))?;

        let (event, message_id) = if value.get("message").is_some() {
            let envelope: PushEnvelope = serde_json::from_value(value)
                .map_err(|e| ProcessingError::Notification(format!("bad envelope: {}", e)))?;
            let Some(data) = envelope.message.data else {
                return Ok(Decoded::Skip(SkipReason::NoData));
            };
            let raw = STANDARD
                .decode(data.trim())
                .map_err(|e| ProcessingError::Notification(format!("data is not base64: {}", e)))?;
            let event: ObjectEvent = serde_json::from_slice(&raw)
                .map_err(|e| ProcessingError::Notification(format!("bad event: {}", e)))?;
            let message_id = envelope
                .message
                .message_id
                .or_else(|| envelope.message.attributes.get("messageId").cloned());
            (event, message_id)
        } else {
            let event: ObjectEvent = serde_json::from_value(value)
                .map_err(|e| ProcessingError::Notification(format!("bad event: {}", e)))?;
            (event, None)
        };

        Ok(Decoded::Event(Notification {
            message_id,
            bucket: event.bucket.filter(|b| !b.is_empty()),
            name: event.name,
            event_type: event.event_type.or(event.kind),
            content_type: event.content_type.or(event.media_type),
            size: event.size.as_ref().and_then(parse_size),
        }))
    }

    /// Reason to skip this event, if any. `expected_bucket` of `None` accepts any bucket.
    pub fn skip_reason(&self, expected_bucket: Option<&str>) -> Option<SkipReason> {
        if let (Some(bucket), Some(expected)) = (self.bucket.as_deref(), expected_bucket) {
            if bucket != expected {
                return Some(SkipReason::OtherBucket(bucket.to_string()));
            }
        }
        match self.name.as_deref() {
            None | Some("") => Some(SkipReason::MissingName),
            Some(name) if !name.to_ascii_lowercase().ends_with(".csv") => {
                Some(SkipReason::NotCsv(name.to_string()))
            },
            Some(_) => None,
        }
    }

    /// Object the event refers to, falling back to `default_bucket` when the
    /// event omits its bucket.
    pub fn object(&self, default_bucket: Option<&str>) -> Result<ObjectRef, ProcessingError> {
        let bucket = self
            .bucket
            .as_deref()
            .or(default_bucket)
            .ok_or_else(|| ProcessingError::Notification("notification has no bucket".into()))?;
        let name = self
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ProcessingError::Notification("notification has no object name".into()))?;
        Ok(ObjectRef::new(bucket, name))
    }

    /// Encode `object` as a push envelope, the form the notification bridge delivers.
    pub fn envelope_for(object: &ObjectRef) -> Vec<u8> {
        let event = serde_json::json!({
            "bucket": object.bucket,
            "name": object.name,
            "eventType": "OBJECT_FINALIZE",
            "contentType": "text/csv",
        });
        let envelope = serde_json::json!({
            "message": { "data": STANDARD.encode(event.to_string()) }
        });
        envelope.to_string().into_bytes()
    }
}

fn parse_size(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
