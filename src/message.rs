//! Wire message model.

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};

/// Kind of a realtime message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Event,
    Subscribe,
    Unsubscribe,
    Error,
    Ping,
    Pong,
}

/// An immutable realtime message.
///
/// Serialize-then-deserialize preserves every non-null field and produces
/// an equal value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp_ns: u64,
}

impl Message {
    /// Build a message stamped with the given clock.
    pub fn with_clock(kind: MessageKind, clock: &dyn Clock) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            channel: None,
            event: None,
            data: serde_json::Value::Null,
            timestamp_ns: clock.now_ns(),
        }
    }

    pub fn new(kind: MessageKind) -> Self {
        Self::with_clock(kind, &SystemClock)
    }

    /// An `event` message bound to a channel.
    pub fn event(
        channel: impl Into<String>,
        event: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        let mut msg = Self::new(MessageKind::Event);
        msg.channel = Some(channel.into());
        msg.event = Some(event.into());
        msg.data = data;
        msg
    }

    /// An `error` message surfaced to a client.
    pub fn error(reason: impl Into<String>) -> Self {
        let mut msg = Self::new(MessageKind::Error);
        msg.data = serde_json::json!({ "message": reason.into() });
        msg
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_fields() {
        let msg = Message::event("orders", "created", serde_json::json!({"id": 7}));
        let raw = msg.to_json().expect("serialize");
        let back = Message::from_json(&raw).expect("deserialize");
        assert_eq!(msg, back);
    }

    #[test]
    fn optional_fields_absent_when_null() {
        let msg = Message::new(MessageKind::Ping);
        let raw = msg.to_json().expect("serialize");
        assert!(!raw.contains("channel"));
        assert!(!raw.contains("event"));
        let back = Message::from_json(&raw).expect("deserialize");
        assert_eq!(msg, back);
    }
}
