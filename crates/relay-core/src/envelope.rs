//! Payloads carried on the shared message bus.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::FrameError;
use crate::ids::InstanceId;
use crate::message::{now_timestamp, MessageRecord};

/// A chat record published for other relay instances.
///
/// `origin` names the publishing process so it can skip its own echo.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub from: String,
    pub to: String,
    pub text: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<InstanceId>,
}

/// A decoded bus payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusPayload {
    /// Diagnostic traffic such as the subscribe self-test. Never delivered.
    System { text: String },
    Chat(BusEnvelope),
}

impl BusEnvelope {
    pub fn from_record(record: &MessageRecord, origin: &InstanceId) -> Self {
        Self {
            from: record.from.clone(),
            to: record.to.clone(),
            text: record.text.clone(),
            timestamp: record.timestamp.clone(),
            origin: Some(origin.clone()),
        }
    }

    pub fn into_record(self) -> MessageRecord {
        MessageRecord {
            from: self.from,
            to: self.to,
            text: self.text,
            timestamp: self.timestamp,
        }
    }

    /// Whether `instance` published this envelope.
    pub fn is_from(&self, instance: &InstanceId) -> bool {
        self.origin.as_ref() == Some(instance)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl BusPayload {
    /// The self-test notice published after each successful subscribe.
    pub fn system_self_test(text: impl Into<String>) -> String {
        json!({
            "type": "system",
            "text": text.into(),
            "timestamp": now_timestamp(),
        })
        .to_string()
    }

    pub fn decode(raw: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(raw)?;
        let Value::Object(ref obj) = value else {
            return Err(FrameError::NotAnObject);
        };

        if obj.get("type").and_then(Value::as_str) == Some("system") {
            let text = obj
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned();
            return Ok(Self::System { text });
        }

        for key in ["from", "to", "text", "timestamp"] {
            if !obj.get(key).is_some_and(Value::is_string) {
                return Err(FrameError::MissingField(key));
            }
        }

        let envelope: BusEnvelope = serde_json::from_value(value)?;
        Ok(Self::Chat(envelope))
    }
}
