//! Frames peer and rendezvous messages as one JSON object per line.
//!
//! Each [`Message`] carries a `msg_id` and `ttl` common to every type, plus
//! a [`MessageBody`] tagged by `type`. A line is never emitted or accepted
//! past [`MAX_LINE_BYTES`].

use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::msgid;

/// Hard cap on an encoded or decoded line, in bytes.
pub const MAX_LINE_BYTES: usize = 32_768;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub msg_id: String,
    #[serde(default = "default_ttl")]
    pub ttl: i64,
    #[serde(flatten)]
    pub body: MessageBody,
}

fn default_ttl() -> i64 {
    1
}

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MessageBody {
    HELLO {
        #[serde(alias = "peer_id")]
        src: String,
        version: String,
        features: Vec<String>,
    },
    HELLO_OK {
        #[serde(alias = "peer_id")]
        src: String,
        version: String,
        features: Vec<String>,
    },
    PING {
        timestamp: String,
    },
    PONG {
        timestamp: String,
    },
    SEND {
        src: String,
        dst: String,
        payload: String,
        #[serde(default)]
        require_ack: bool,
    },
    ACK,
    PUB {
        src: String,
        dst: String,
        payload: String,
    },
    RELAY {
        src: String,
        dst: String,
        payload: String,
    },
    BYE {
        src: String,
        dst: String,
        reason: String,
    },
    BYE_OK {
        src: String,
        dst: String,
    },
}

impl Message {
    pub fn type_name(&self) -> &'static str {
        match &self.body {
            MessageBody::HELLO { .. } => "HELLO",
            MessageBody::HELLO_OK { .. } => "HELLO_OK",
            MessageBody::PING { .. } => "PING",
            MessageBody::PONG { .. } => "PONG",
            MessageBody::SEND { .. } => "SEND",
            MessageBody::ACK => "ACK",
            MessageBody::PUB { .. } => "PUB",
            MessageBody::RELAY { .. } => "RELAY",
            MessageBody::BYE { .. } => "BYE",
            MessageBody::BYE_OK { .. } => "BYE_OK",
        }
    }

    pub fn hello(src: impl Into<String>) -> Self {
        Message {
            msg_id: msgid::generate(),
            ttl: 1,
            body: MessageBody::HELLO {
                src: src.into(),
                version: "1.0".to_string(),
                features: vec!["ack".to_string(), "metrics".to_string()],
            },
        }
    }

    pub fn hello_ok(src: impl Into<String>) -> Self {
        Message {
            msg_id: msgid::generate(),
            ttl: 1,
            body: MessageBody::HELLO_OK {
                src: src.into(),
                version: "1.0".to_string(),
                features: vec!["ack".to_string(), "metrics".to_string()],
            },
        }
    }

    pub fn ping(timestamp: impl Into<String>) -> Self {
        Message {
            msg_id: msgid::generate(),
            ttl: 1,
            body: MessageBody::PING {
                timestamp: timestamp.into(),
            },
        }
    }

    /// Echoes the originating PING's `msg_id`, per the wire contract.
    pub fn pong(echo_msg_id: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Message {
            msg_id: echo_msg_id.into(),
            ttl: 1,
            body: MessageBody::PONG {
                timestamp: timestamp.into(),
            },
        }
    }

    pub fn send(
        src: impl Into<String>,
        dst: impl Into<String>,
        payload: impl Into<String>,
        require_ack: bool,
    ) -> Self {
        Message {
            msg_id: msgid::generate(),
            ttl: 1,
            body: MessageBody::SEND {
                src: src.into(),
                dst: dst.into(),
                payload: payload.into(),
                require_ack,
            },
        }
    }

    /// Echoes the acknowledged SEND's `msg_id`.
    pub fn ack(echo_msg_id: impl Into<String>) -> Self {
        Message {
            msg_id: echo_msg_id.into(),
            ttl: 1,
            body: MessageBody::ACK,
        }
    }

    /// Shares one `msg_id` across a publish fan-out.
    pub fn publish(
        msg_id: impl Into<String>,
        src: impl Into<String>,
        scope: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Message {
            msg_id: msg_id.into(),
            ttl: 1,
            body: MessageBody::PUB {
                src: src.into(),
                dst: scope.into(),
                payload: payload.into(),
            },
        }
    }

    pub fn relay(
        src: impl Into<String>,
        dst: impl Into<String>,
        payload: impl Into<String>,
        ttl: i64,
    ) -> Self {
        Message {
            msg_id: msgid::generate(),
            ttl,
            body: MessageBody::RELAY {
                src: src.into(),
                dst: dst.into(),
                payload: payload.into(),
            },
        }
    }

    pub fn bye(src: impl Into<String>, dst: impl Into<String>, reason: impl Into<String>) -> Self {
        Message {
            msg_id: msgid::generate(),
            ttl: 1,
            body: MessageBody::BYE {
                src: src.into(),
                dst: dst.into(),
                reason: reason.into(),
            },
        }
    }

    pub fn bye_ok(
        echo_msg_id: impl Into<String>,
        src: impl Into<String>,
        dst: impl Into<String>,
    ) -> Self {
        Message {
            msg_id: echo_msg_id.into(),
            ttl: 1,
            body: MessageBody::BYE_OK {
                src: src.into(),
                dst: dst.into(),
            },
        }
    }

    pub fn src(&self) -> Option<&str> {
        match &self.body {
            MessageBody::HELLO { src, .. }
            | MessageBody::HELLO_OK { src, .. }
            | MessageBody::SEND { src, .. }
            | MessageBody::PUB { src, .. }
            | MessageBody::RELAY { src, .. }
            | MessageBody::BYE { src, .. }
            | MessageBody::BYE_OK { src, .. } => Some(src),
            MessageBody::PING { .. } | MessageBody::PONG { .. } | MessageBody::ACK => None,
        }
    }

    pub fn dst(&self) -> Option<&str> {
        match &self.body {
            MessageBody::SEND { dst, .. }
            | MessageBody::PUB { dst, .. }
            | MessageBody::RELAY { dst, .. }
            | MessageBody::BYE { dst, .. }
            | MessageBody::BYE_OK { dst, .. } => Some(dst),
            _ => None,
        }
    }
}

/// Encodes a message as a single line, without the trailing `\n`.
pub fn encode(msg: &Message) -> Result<String, WireError> {
    let json = serde_json::to_string(msg)?;
    if json.len() > MAX_LINE_BYTES {
        return Err(WireError::OversizeLine {
            max: MAX_LINE_BYTES,
            actual: json.len(),
        });
    }
    Ok(json)
}

/// Decodes a single line (without its trailing `\n`).
pub fn decode(line: &str) -> Result<Message, WireError> {
    if line.len() > MAX_LINE_BYTES {
        return Err(WireError::OversizeLine {
            max: MAX_LINE_BYTES,
            actual: line.len(),
        });
    }
    let msg: Message = serde_json::from_str(line)?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_round_trips() {
        let msg = Message::hello("alice@room1");
        let line = encode(&msg).unwrap();
        let decoded = decode(&line).unwrap();
        assert_eq!(decoded.msg_id, msg.msg_id);
        assert_eq!(decoded.type_name(), "HELLO");
        assert_eq!(decoded.src(), Some("alice@room1"));
    }

    #[test]
    fn legacy_peer_id_alias_decodes_as_src() {
        let line = r#"{"type":"HELLO","msg_id":"m1","peer_id":"a@ns","version":"1.0","features":["ack"],"ttl":1}"#;
        let decoded = decode(line).unwrap();
        assert_eq!(decoded.src(), Some("a@ns"));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let line = r#"{"type":"PING","msg_id":"p1","timestamp":"now","ttl":1,"bogus":42}"#;
        let decoded = decode(line).unwrap();
        assert_eq!(decoded.type_name(), "PING");
    }

    #[test]
    fn oversize_line_is_rejected_on_encode_and_decode() {
        let huge_payload = "x".repeat(MAX_LINE_BYTES);
        let msg = Message::send("a@ns", "b@ns", huge_payload, false);
        assert!(matches!(encode(&msg), Err(WireError::OversizeLine { .. })));

        let huge_line = "y".repeat(MAX_LINE_BYTES + 1);
        assert!(matches!(
            decode(&huge_line),
            Err(WireError::OversizeLine { .. })
        ));
    }

    #[test]
    fn ack_echoes_given_msg_id() {
        let ack = Message::ack("s1");
        assert_eq!(ack.msg_id, "s1");
        assert_eq!(ack.type_name(), "ACK");
    }

    #[test]
    fn malformed_json_is_a_wire_error() {
        assert!(decode("not json").is_err());
    }
}
