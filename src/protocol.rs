//! Action Cable wire protocol
//!
//! Client commands arrive as JSON envelopes; server frames are JSON strings
//! transmitted verbatim. Pub/sub payloads come in two flavors: stream
//! broadcasts and remote disconnect commands.
//!
//! ## Client Commands
//! - `subscribe`: join a channel
//! - `unsubscribe`: leave a channel
//! - `message`: perform an action on a channel
//!
//! ## Server Frames
//! - `welcome`: connection authenticated
//! - `ping`: heartbeat with a unix timestamp
//! - `confirm_subscription` / `reject_subscription`
//! - `disconnect`: connection closing (with reason and reconnect hint)
//! - stream message: `{"identifier":...,"message":...}`

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// WebSocket subprotocols offered during the handshake, in order.
pub const ACTION_CABLE_V1_JSON: &str = "actioncable-v1-json";
pub const ACTION_CABLE_UNSUPPORTED: &str = "actioncable-unsupported";

pub const SUBPROTOCOLS: [&str; 2] = [ACTION_CABLE_V1_JSON, ACTION_CABLE_UNSUPPORTED];

/// Close codes (RFC 6455).
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_INTERNAL_SERVER_ERR: u16 = 1011;

/// Disconnect frame reasons.
pub const SERVER_RESTART_REASON: &str = "server_restart";
pub const REMOTE_DISCONNECT_REASON: &str = "remote";
pub const UNAUTHORIZED_REASON: &str = "unauthorized";

/// Client-to-server command envelope.
///
/// `data` stays a raw JSON value: a non-string `data` on a `message`
/// command is a perform error, not a parse error.
#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub command: String,
    pub identifier: String,
    #[serde(default)]
    pub data: Value,
}

/// Parse a client command from a raw frame.
pub fn parse_command(raw: &[u8]) -> Result<Message, ProtocolError> {
    serde_json::from_slice(raw).map_err(ProtocolError::Parse)
}

#[derive(Serialize)]
struct TypeOnlyFrame {
    #[serde(rename = "type")]
    frame_type: &'static str,
}

#[derive(Serialize)]
struct SubscriptionFrame<'a> {
    identifier: &'a str,
    #[serde(rename = "type")]
    frame_type: &'static str,
}

#[derive(Serialize)]
struct DisconnectFrame<'a> {
    #[serde(rename = "type")]
    frame_type: &'static str,
    reason: &'a str,
    reconnect: bool,
}

#[derive(Serialize)]
struct PingFrame {
    #[serde(rename = "type")]
    frame_type: &'static str,
    message: i64,
}

pub fn welcome_message() -> String {
    serde_json::to_string(&TypeOnlyFrame { frame_type: "welcome" }).unwrap()
}

pub fn confirmation_message(identifier: &str) -> String {
    serde_json::to_string(&SubscriptionFrame {
        identifier,
        frame_type: "confirm_subscription",
    })
    .unwrap()
}

pub fn rejection_message(identifier: &str) -> String {
    serde_json::to_string(&SubscriptionFrame {
        identifier,
        frame_type: "reject_subscription",
    })
    .unwrap()
}

pub fn disconnect_message(reason: &str, reconnect: bool) -> String {
    serde_json::to_string(&DisconnectFrame {
        frame_type: "disconnect",
        reason,
        reconnect,
    })
    .unwrap()
}

pub fn ping_message(timestamp: i64) -> String {
    serde_json::to_string(&PingFrame {
        frame_type: "ping",
        message: timestamp,
    })
    .unwrap()
}

/// Build the broadcast envelope for a stream message.
///
/// `data` is the opaque payload published to the stream; it is spliced in
/// verbatim so whatever the application broadcast reaches the client
/// byte-for-byte.
pub fn stream_envelope(identifier: &str, data: &str) -> String {
    let quoted = serde_json::to_string(identifier).unwrap();
    format!("{{\"identifier\":{},\"message\":{}}}", quoted, data)
}

/// A broadcast published to a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub stream: String,
    pub data: String,
}

/// A command to close every session bound to an identifiers string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDisconnectMessage {
    pub identifier: String,
    pub reconnect: bool,
}

/// A parsed pub/sub payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubMessage {
    Stream(StreamMessage),
    Disconnect(RemoteDisconnectMessage),
}

#[derive(Serialize, Deserialize)]
struct RemoteCommandEnvelope {
    command: String,
    payload: RemoteDisconnectMessage,
}

/// Parse a raw pub/sub payload into one of the two variants.
///
/// The disconnect variant is distinguished by a `"command": "disconnect"`
/// field; everything else must carry a `"stream"`.
pub fn parse_pubsub(raw: &[u8]) -> Result<PubSubMessage, ProtocolError> {
    let value: Value = serde_json::from_slice(raw).map_err(ProtocolError::Parse)?;

    if value.get("command").and_then(Value::as_str) == Some("disconnect") {
        let envelope: RemoteCommandEnvelope =
            serde_json::from_value(value).map_err(ProtocolError::Parse)?;
        return Ok(PubSubMessage::Disconnect(envelope.payload));
    }

    if value.get("stream").is_some() {
        let msg: StreamMessage = serde_json::from_value(value).map_err(ProtocolError::Parse)?;
        return Ok(PubSubMessage::Stream(msg));
    }

    Err(ProtocolError::UnknownPubSubPayload)
}

impl PubSubMessage {
    /// Encode back to the wire representation. Used by the in-process
    /// subscriber and by tests.
    pub fn to_json(&self) -> String {
        match self {
            PubSubMessage::Stream(msg) => serde_json::to_string(msg).unwrap(),
            PubSubMessage::Disconnect(msg) => serde_json::to_string(&RemoteCommandEnvelope {
                command: "disconnect".to_string(),
                payload: msg.clone(),
            })
            .unwrap(),
        }
    }
}

/// Wire protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to parse payload: {0}")]
    Parse(#[source] serde_json::Error),
    #[error("unrecognized pub/sub payload")]
    UnknownPubSubPayload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe() {
        let raw = br#"{"command":"subscribe","identifier":"{\"channel\":\"ChatChannel\"}"}"#;
        let msg = parse_command(raw).unwrap();
        assert_eq!(msg.command, "subscribe");
        assert_eq!(msg.identifier, r#"{"channel":"ChatChannel"}"#);
        assert!(msg.data.is_null());
    }

    #[test]
    fn test_parse_message_with_string_data() {
        let raw = br#"{"command":"message","identifier":"chat_1","data":"{\"action\":\"speak\"}"}"#;
        let msg = parse_command(raw).unwrap();
        assert_eq!(msg.command, "message");
        assert_eq!(msg.data.as_str().unwrap(), r#"{"action":"speak"}"#);
    }

    #[test]
    fn test_parse_message_with_non_string_data() {
        let raw = br#"{"command":"message","identifier":"chat_1","data":{"action":"speak"}}"#;
        let msg = parse_command(raw).unwrap();
        assert!(msg.data.is_object());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_command(b"not json").is_err());
    }

    #[test]
    fn test_server_frames() {
        assert_eq!(welcome_message(), r#"{"type":"welcome"}"#);
        assert_eq!(
            confirmation_message("chat_1"),
            r#"{"identifier":"chat_1","type":"confirm_subscription"}"#
        );
        assert_eq!(
            rejection_message("chat_1"),
            r#"{"identifier":"chat_1","type":"reject_subscription"}"#
        );
        assert_eq!(
            disconnect_message(SERVER_RESTART_REASON, true),
            r#"{"type":"disconnect","reason":"server_restart","reconnect":true}"#
        );
        assert_eq!(ping_message(1234567890), r#"{"type":"ping","message":1234567890}"#);
    }

    #[test]
    fn test_stream_envelope_splices_data_verbatim() {
        let envelope = stream_envelope(r#"{"channel":"ChatChannel"}"#, r#"{"text":"hi"}"#);
        let parsed: Value = serde_json::from_str(&envelope).unwrap();
        assert_eq!(parsed["identifier"], r#"{"channel":"ChatChannel"}"#);
        assert_eq!(parsed["message"]["text"], "hi");
    }

    #[test]
    fn test_parse_pubsub_stream() {
        let raw = br#"{"stream":"room_1","data":"{\"text\":\"hi\"}"}"#;
        let msg = parse_pubsub(raw).unwrap();
        assert_eq!(
            msg,
            PubSubMessage::Stream(StreamMessage {
                stream: "room_1".to_string(),
                data: r#"{"text":"hi"}"#.to_string(),
            })
        );
    }

    #[test]
    fn test_parse_pubsub_disconnect() {
        let raw = br#"{"command":"disconnect","payload":{"identifier":"user/42","reconnect":true}}"#;
        let msg = parse_pubsub(raw).unwrap();
        assert_eq!(
            msg,
            PubSubMessage::Disconnect(RemoteDisconnectMessage {
                identifier: "user/42".to_string(),
                reconnect: true,
            })
        );
    }

    #[test]
    fn test_parse_pubsub_unknown() {
        assert!(matches!(
            parse_pubsub(br#"{"foo":"bar"}"#),
            Err(ProtocolError::UnknownPubSubPayload)
        ));
        assert!(parse_pubsub(b"nope").is_err());
    }

    #[test]
    fn test_pubsub_roundtrip() {
        let stream = PubSubMessage::Stream(StreamMessage {
            stream: "room_1".to_string(),
            data: r#"{"text":"hi"}"#.to_string(),
        });
        assert_eq!(parse_pubsub(stream.to_json().as_bytes()).unwrap(), stream);

        let disconnect = PubSubMessage::Disconnect(RemoteDisconnectMessage {
            identifier: "user/42".to_string(),
            reconnect: false,
        });
        assert_eq!(parse_pubsub(disconnect.to_json().as_bytes()).unwrap(), disconnect);
    }
}
