//! # Control Protocol
//!
//! JSON text messages exchanged with the ordering server on the session
//! WebSocket. Audio travels separately as binary messages.
//!
//! ## Inbound Messages:
//! ```json
//! {"messageType": "SERVER_READY"}
//! {"messageType": "OUTPUT_TEXT_CHUNK", "content": {"text": "Would you"}}
//! {"messageType": "OUTPUT_TEXT_RESULT", "content": {"text": "Would you like fries?"}}
//! {"messageType": "UPDATE_SHOPPING_CART", "content": { ... }}
//! {"messageType": "CHANGE_STATE", "content": {"to": "PAYMENT_CONFIRMATION"}}
//! ```
//!
//! ## Outbound Messages:
//! ```json
//! {"messageType": "PROCESS_PAYMENT"}
//! ```

use super::state::SessionState;
use crate::error::{AppResult, KioskError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// A decoded server control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlEvent {
    /// The server is ready to receive audio
    SessionReady,
    /// Incremental caption text
    CaptionChunk { text: String },
    /// Final caption for the current utterance
    CaptionResult { text: String },
    /// Cart snapshot, forwarded to the UI untouched
    CartUpdate(Value),
    /// Authoritative state directive
    ChangeState { to: SessionState },
}

#[derive(Debug, Deserialize)]
struct RawControlMessage {
    #[serde(rename = "messageType")]
    message_type: String,
    #[serde(default)]
    content: Value,
}

#[derive(Debug, Deserialize)]
struct TextContent {
    text: String,
}

#[derive(Debug, Deserialize)]
struct StateChangeContent {
    to: SessionState,
}

/// Parse one inbound text message.
///
/// Returns `Ok(None)` for a well-formed message of an unknown type. Invalid JSON,
/// a missing field or an unknown state name is a `MalformedControlMessage`.
pub fn parse_control(text: &str) -> AppResult<Option<ControlEvent>> {
    let raw: RawControlMessage = serde_json::from_str(text)?;

    let event = match raw.message_type.as_str() {
        "SERVER_READY" => ControlEvent::SessionReady,
        "OUTPUT_TEXT_CHUNK" => ControlEvent::CaptionChunk {
            text: content::<TextContent>(&raw)?.text,
        },
        "OUTPUT_TEXT_RESULT" => ControlEvent::CaptionResult {
            text: content::<TextContent>(&raw)?.text,
        },
        "UPDATE_SHOPPING_CART" => ControlEvent::CartUpdate(raw.content),
        "CHANGE_STATE" => ControlEvent::ChangeState {
            to: content::<StateChangeContent>(&raw)?.to,
        },
        other => {
            warn!(message_type = other, "Unknown control message type, ignoring");
            return Ok(None);
        }
    };

    Ok(Some(event))
}

fn content<T: for<'de> Deserialize<'de>>(raw: &RawControlMessage) -> AppResult<T> {
    T::deserialize(&raw.content).map_err(|e| {
        KioskError::MalformedControlMessage(format!("{}: {}", raw.message_type, e))
    })
}

/// Outbound control message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundType {
    ProcessPayment,
}

#[derive(Debug, Serialize)]
struct OutboundMessage {
    #[serde(rename = "messageType")]
    message_type: OutboundType,
}

/// Serialize an outbound control message.
pub fn outbound(message_type: OutboundType) -> AppResult<String> {
    Ok(serde_json::to_string(&OutboundMessage { message_type })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_known_messages() {
        assert_eq!(
            parse_control(r#"{"messageType":"SERVER_READY"}"#).unwrap(),
            Some(ControlEvent::SessionReady)
        );
        assert_eq!(
            parse_control(r#"{"messageType":"OUTPUT_TEXT_CHUNK","content":{"text":"Hi"}}"#)
                .unwrap(),
            Some(ControlEvent::CaptionChunk {
                text: "Hi".to_string()
            })
        );
        assert_eq!(
            parse_control(r#"{"messageType":"CHANGE_STATE","content":{"to":"COMPLETED"}}"#)
                .unwrap(),
            Some(ControlEvent::ChangeState {
                to: SessionState::Completed
            })
        );
    }

    #[test]
    fn test_cart_content_is_forwarded_untouched() {
        let text = r#"{"messageType":"UPDATE_SHOPPING_CART","content":{"items":[{"name":"Latte","qty":2}],"total":9000}}"#;
        assert_eq!(
            parse_control(text).unwrap(),
            Some(ControlEvent::CartUpdate(json!({
                "items": [{"name": "Latte", "qty": 2}],
                "total": 9000
            })))
        );
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        assert_eq!(
            parse_control(r#"{"messageType":"PING","content":{}}"#).unwrap(),
            None
        );
    }

    #[test]
    fn test_malformed_messages() {
        for text in [
            "not json",
            r#"{"content":{}}"#,
            r#"{"messageType":"OUTPUT_TEXT_RESULT"}"#,
            r#"{"messageType":"CHANGE_STATE","content":{"to":"CART_CONFIRMATION"}}"#,
        ] {
            assert!(
                matches!(parse_control(text), Err(KioskError::MalformedControlMessage(_))),
                "{}",
                text
            );
        }
    }

    #[test]
    fn test_payment_request_message() {
        assert_eq!(
            outbound(OutboundType::ProcessPayment).unwrap(),
            r#"{"messageType":"PROCESS_PAYMENT"}"#
        );
    }
}
