//! Client-facing WebSocket frames.
//!
//! Inbound: `{"type":"ping"}` or `{"to", "text", "timestamp"?}`.
//! Outbound: chat `{"from","text","timestamp"}` (system notices use
//! `from = "system"`) and pong `{"type":"pong","timestamp"}`.

use serde_json::{json, Map, Value};

use crate::errors::FrameError;
use crate::message::{now_timestamp, MessageDraft, MessageRecord, SYSTEM_SENDER};

/// A classified inbound client frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundFrame {
    Ping,
    Chat(ChatFrame),
}

/// A chat frame addressed to another identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatFrame {
    pub to: String,
    pub text: String,
    pub timestamp: Option<String>,
}

impl ChatFrame {
    /// Attach the sender identity. Any client-supplied `from` is never consulted.
    pub fn into_draft(self, from: impl Into<String>) -> MessageDraft {
        MessageDraft {
            from: from.into(),
            to: self.to,
            text: self.text,
            timestamp: self.timestamp,
        }
    }
}

impl InboundFrame {
    /// Classify raw frame text.
    ///
    /// Malformed JSON and non-objects are `Malformed`/`NotAnObject`; a non-ping
    /// object without string `to` and `text` is `MissingField`.
    pub fn classify(raw: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(raw)?;
        let Value::Object(obj) = value else {
            return Err(FrameError::NotAnObject);
        };

        if obj.get("type").and_then(Value::as_str) == Some("ping") {
            return Ok(Self::Ping);
        }

        let to = required_str(&obj, "to")?;
        let text = required_str(&obj, "text")?;
        let timestamp = obj
            .get("timestamp")
            .and_then(Value::as_str)
            .map(str::to_owned);

        Ok(Self::Chat(ChatFrame { to, text, timestamp }))
    }
}

fn required_str(obj: &Map<String, Value>, key: &'static str) -> Result<String, FrameError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(FrameError::MissingField(key))
}

/// A frame written to a client socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutboundFrame {
    Chat {
        from: String,
        text: String,
        timestamp: String,
    },
    Pong {
        timestamp: String,
    },
}

impl OutboundFrame {
    /// The recipient-facing view of a record: `to` is dropped.
    pub fn chat(record: &MessageRecord) -> Self {
        Self::Chat {
            from: record.from.clone(),
            text: record.text.clone(),
            timestamp: record.timestamp.clone(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::Chat {
            from: SYSTEM_SENDER.to_string(),
            text: text.into(),
            timestamp: now_timestamp(),
        }
    }

    pub fn pong() -> Self {
        Self::Pong {
            timestamp: now_timestamp(),
        }
    }

    pub fn welcome(user_id: &str) -> Self {
        Self::system(format!("Welcome User {user_id}! You are now connected."))
    }

    pub fn user_online(user_id: &str) -> Self {
        Self::system(format!("User {user_id} is now online and ready to chat!"))
    }

    pub fn user_offline(user_id: &str) -> Self {
        Self::system(format!("User {user_id} has gone offline."))
    }

    pub fn recipient_offline(recipient: &str) -> Self {
        Self::system(format!(
            "User {recipient} is not currently online. They will receive your message when they connect."
        ))
    }

    pub fn delivery_failed(recipient: &str) -> Self {
        Self::system(format!("Failed to deliver your message to User {recipient}"))
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Chat {
                from,
                text,
                timestamp,
            } => json!({ "from": from, "text": text, "timestamp": timestamp }),
            Self::Pong { timestamp } => json!({ "type": "pong", "timestamp": timestamp }),
        }
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}
