//! PACKET_IN payload normalization, run before dispatch.

use serde_json::Value;

use crate::{event::Event, ofmatch};

/// Folds the engine's `_pkt` field list into a `pkt` map keyed by field
/// name, and records the payload length of the hex-encoded `data`.
/// Messages without a `_pkt` list pass through untouched.
pub(crate) fn normalize_packet_in(event: &mut Event) {
    let Some(Value::Object(msg)) = event.get_mut("msg") else {
        return;
    };

    if let Some(fields) = msg.get("_pkt").and_then(Value::as_array).cloned() {
        let mut pkt = ofmatch::to_map(&fields);
        if let Some(data) = msg.get("data").and_then(Value::as_str) {
            pkt.insert("payload_len".to_string(), Value::from(data.len() / 2));
        }
        msg.remove("_pkt");
        msg.insert("pkt".to_string(), Value::Object(pkt));
    }
}
