//! Wire codec for the assistant socket.
//!
//! Outbound frames are always the typed envelope
//! `{"type":"message","data":{"content":"..."}}`. Inbound frames are accepted
//! in three JSON shapes plus plain text; see [`decode_inbound`].

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
struct OutboundEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    data: OutboundData<'a>,
}

#[derive(Debug, Serialize)]
struct OutboundData<'a> {
    content: &'a str,
}

/// Wrap user text in the typed envelope.
pub fn encode_user_message(text: &str) -> String {
    let envelope = OutboundEnvelope {
        kind: "message",
        data: OutboundData { content: text },
    };
    // A struct of two string fields cannot fail to serialize.
    serde_json::to_string(&envelope).unwrap_or_default()
}

/// Extract the user-visible text from an inbound frame.
///
/// Priority: typed envelope `data.content`, then legacy `message`/`text`,
/// then top-level `content`. Non-JSON payloads are taken verbatim. JSON that
/// matches none of these (keepalives, protocol frames) yields `None`.
pub fn decode_inbound(raw: &str) -> Option<String> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return non_empty(raw),
    };
    let obj = value.as_object()?;

    if obj.get("type").and_then(Value::as_str) == Some("message") {
        if let Some(content) = obj
            .get("data")
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
            .and_then(non_empty)
        {
            return Some(content);
        }
    }

    ["message", "text", "content"]
        .iter()
        .find_map(|field| obj.get(*field).and_then(Value::as_str).and_then(non_empty))
}

fn non_empty(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_typed_envelope() {
        let frame = encode_user_message("hello");
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "message");
        assert_eq!(value["data"]["content"], "hello");
    }

    #[test]
    fn encoded_frame_decodes_back() {
        assert_eq!(decode_inbound(&encode_user_message("hello")).as_deref(), Some("hello"));
    }

    #[test]
    fn legacy_and_flat_shapes() {
        assert_eq!(decode_inbound(r#"{"message":"hi"}"#).as_deref(), Some("hi"));
        assert_eq!(decode_inbound(r#"{"text":"hi"}"#).as_deref(), Some("hi"));
        assert_eq!(decode_inbound(r#"{"content":"hi"}"#).as_deref(), Some("hi"));
    }

    #[test]
    fn raw_text_is_verbatim() {
        assert_eq!(decode_inbound("hi").as_deref(), Some("hi"));
        assert_eq!(
            decode_inbound("Thanks {for} waiting").as_deref(),
            Some("Thanks {for} waiting")
        );
    }

    #[test]
    fn unrecognized_envelopes_are_ignored() {
        assert_eq!(decode_inbound(r#"{"type":"ping"}"#), None);
        assert_eq!(decode_inbound(r#"{"type":"message","data":{}}"#), None);
        assert_eq!(decode_inbound(r#"{"message":42}"#), None);
        assert_eq!(decode_inbound("[1,2,3]"), None);
        assert_eq!(decode_inbound("17"), None);
        assert_eq!(decode_inbound("   "), None);
    }

    #[test]
    fn typed_envelope_wins_over_legacy_fields() {
        let raw = r#"{"type":"message","data":{"content":"typed"},"message":"legacy"}"#;
        assert_eq!(decode_inbound(raw).as_deref(), Some("typed"));
    }

    #[test]
    fn message_field_wins_over_content() {
        let raw = r#"{"content":"flat","message":"legacy"}"#;
        assert_eq!(decode_inbound(raw).as_deref(), Some("legacy"));
    }

    #[test]
    fn envelope_without_content_falls_through_to_legacy() {
        let raw = r#"{"type":"message","data":{},"text":"legacy"}"#;
        assert_eq!(decode_inbound(raw).as_deref(), Some("legacy"));
    }
}
