use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Sender name used on every server-originated notice.
pub const SYSTEM_SENDER: &str = "system";

/// Current time as an RFC 3339 / ISO-8601 string with microsecond precision.
///
/// Fixed width, so lexical order matches chronological order.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// A chat message before the relay has assigned its timestamp.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub from: String,
    pub to: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl MessageDraft {
    pub fn new(from: impl Into<String>, to: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            text: text.into(),
            timestamp: None,
        }
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Freeze the draft, keeping a client-supplied timestamp or assigning now.
    pub fn stamp(self) -> MessageRecord {
        MessageRecord {
            from: self.from,
            to: self.to,
            text: self.text,
            timestamp: self.timestamp.unwrap_or_else(now_timestamp),
        }
    }
}

/// An immutable chat message as persisted and relayed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub from: String,
    pub to: String,
    pub text: String,
    pub timestamp: String,
}
