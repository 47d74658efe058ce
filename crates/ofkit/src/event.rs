use std::fmt;

use serde_json::{Map, Value};

/// A single record exchanged with the protocol engine.
///
/// Events are schemaless maps at the wire. The framework inspects only the
/// discriminator fields: `type` marks an OpenFlow message or channel
/// notification, `event` marks a synthetic internal event, and `id` marks an
/// RPC reply. Everything else is opaque payload owned by the sender.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Event(Map<String, Value>);

/// Shape of an [`Event`], decided by which discriminator field is present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind<'a> {
    /// OpenFlow message or channel notification (`type`).
    Message(&'a str),
    /// Synthetic internal event (`event`).
    Internal(&'a str),
    /// Reply to an outstanding RPC request (`id`).
    RpcReply(u32),
    /// No recognized discriminator.
    Unknown,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a synthetic internal event, e.g. `EXIT` or `START`.
    pub fn synthetic(name: &str) -> Self {
        let mut map = Map::new();
        map.insert("event".to_string(), Value::String(name.to_string()));
        Self(map)
    }

    /// Builds an OpenFlow message event of the given type.
    pub fn message(message_type: &str) -> Self {
        let mut map = Map::new();
        map.insert("type".to_string(), Value::String(message_type.to_string()));
        Self(map)
    }

    /// Wraps a JSON value; returns `None` unless the value is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Parses one JSON line from the engine.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Map<String, Value>>(line).map(Self)
    }

    pub fn kind(&self) -> EventKind<'_> {
        if let Some(message_type) = self.get_str("type") {
            return EventKind::Message(message_type);
        }
        if let Some(name) = self.get_str("event") {
            return EventKind::Internal(name);
        }
        if let Some(id) = self.get("id").and_then(Value::as_u64) {
            return EventKind::RpcReply(id as u32);
        }
        EventKind::Unknown
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.0.get_mut(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    /// The `type` discriminator, when this is a message event.
    pub fn event_type(&self) -> Option<&str> {
        self.get_str("type")
    }

    /// The `event` discriminator, when this is a synthetic event.
    pub fn internal_name(&self) -> Option<&str> {
        self.get_str("event")
    }

    pub fn conn_id(&self) -> Option<u64> {
        self.get_u64("conn_id")
    }

    pub fn datapath_id(&self) -> Option<&str> {
        self.get_str("datapath_id")
    }

    pub fn xid(&self) -> Option<u32> {
        self.get_u64("xid").map(|xid| xid as u32)
    }

    /// True when this message is a non-terminal multipart reply chunk: its
    /// type starts with `REPLY.` and the flags carry `MORE`.
    pub(crate) fn has_more(&self) -> bool {
        let type_is_reply = self
            .get_str("type")
            .is_some_and(|t| t.starts_with("REPLY."));
        type_is_reply && flags_have_more(self.get("flags"))
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Multipart test for a bare reply payload (an RPC `result` object).
pub(crate) fn value_has_more(value: &Value) -> bool {
    let type_is_reply = value
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.starts_with("REPLY."));
    type_is_reply && flags_have_more(value.get("flags"))
}

fn flags_have_more(flags: Option<&Value>) -> bool {
    flags
        .and_then(Value::as_array)
        .is_some_and(|flags| flags.iter().any(|flag| flag.as_str() == Some("MORE")))
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Value::Object(self.0.clone()).fmt(f)
    }
}

impl From<Event> for Value {
    fn from(event: Event) -> Self {
        event.into_value()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn kind_follows_discriminator() {
        let event = Event::parse(r#"{"type":"PACKET_IN","conn_id":7}"#).expect("parse");
        assert_eq!(event.kind(), EventKind::Message("PACKET_IN"));
        assert_eq!(event.conn_id(), Some(7));

        let event = Event::synthetic("EXIT");
        assert_eq!(event.kind(), EventKind::Internal("EXIT"));

        let event = Event::parse(r#"{"id":8093,"result":{}}"#).expect("parse");
        assert_eq!(event.kind(), EventKind::RpcReply(8093));

        let event = Event::parse(r#"{"conn_id":1}"#).expect("parse");
        assert_eq!(event.kind(), EventKind::Unknown);
    }

    #[test]
    fn non_object_lines_are_rejected() {
        assert!(Event::parse("[1,2,3]").is_err());
        assert!(Event::parse("not json").is_err());
    }

    #[test]
    fn multipart_requires_reply_prefix_and_more_flag() {
        let chunk = Event::message("REPLY.FLOW_DESC").with("flags", json!(["MORE"]));
        assert!(chunk.has_more());

        let terminal = Event::message("REPLY.FLOW_DESC").with("flags", json!([]));
        assert!(!terminal.has_more());

        let unrelated = Event::message("PACKET_IN").with("flags", json!(["MORE"]));
        assert!(!unrelated.has_more());

        assert!(value_has_more(
            &json!({"type": "REPLY.PORT_STATS", "flags": ["MORE"]})
        ));
        assert!(!value_has_more(&json!({"type": "REPLY.PORT_STATS"})));
    }
}
