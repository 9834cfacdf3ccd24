use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EnvelopeError;

/// Dynamic payload of an event. Keys are kept sorted so the same event always
/// serializes to the same bytes.
pub type Payload = Map<String, Value>;

const OK_SUFFIX: &str = "_ok";
const FAIL_SUFFIX: &str = "_fail";

/// The message unit exchanged between clients, the bus, the replicated log
/// and the game handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub method: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Payload,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(method: impl Into<String>, payload: Payload) -> Self {
        Self::at(method, Utc::now(), payload)
    }

    pub fn at(method: impl Into<String>, timestamp: DateTime<Utc>, payload: Payload) -> Self {
        Self {
            method: method.into(),
            timestamp,
            payload,
        }
    }

    /// Serialize to the exact bytes stored in the replicated log.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)
    }

    /// Successful reply to this event. The reply reuses the request timestamp
    /// so every replica produces an identical reply.
    pub fn reply_ok(&self, payload: Payload) -> Event {
        Event::at(format!("{}{OK_SUFFIX}", self.method), self.timestamp, payload)
    }

    /// Failure reply carrying `{error}`.
    pub fn reply_fail(&self, error: impl Into<String>) -> Event {
        let mut payload = Payload::new();
        payload.insert("error".to_string(), Value::String(error.into()));
        Event::at(format!("{}{FAIL_SUFFIX}", self.method), self.timestamp, payload)
    }

    /// Whether this event is itself a reply (`*_ok` / `*_fail`).
    pub fn is_reply(&self) -> bool {
        self.method.ends_with(OK_SUFFIX) || self.method.ends_with(FAIL_SUFFIX)
    }

    pub fn is_failure(&self) -> bool {
        self.method.ends_with(FAIL_SUFFIX)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// The `error` field of a failure reply.
    pub fn error_message(&self) -> Option<&str> {
        self.str_field("error")
    }
}

/// Build a payload from a `serde_json::json!` object literal.
pub fn payload_from(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}
