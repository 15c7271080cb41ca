//! Engine.IO v4 / Socket.IO v5 text frame codec.
//!
//! Frames are an Engine.IO packet type digit, optionally followed by a
//! Socket.IO packet for type 4 (message):
//!
//! - `0{json}` open, `1` close, `2` ping, `3` pong, `6` noop
//! - `40` / `40{json}` namespace connect, `41` disconnect
//! - `42["event",payload]` event, `42<ack>["event",payload]` event with ack id
//! - `44{json}` connect error
//!
//! Binary attachments and non-default namespaces are not used by the
//! storefront server and are rejected.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;

/// Client frame answering a server ping.
pub const PONG: &str = "3";

/// Client frame connecting to the default namespace.
pub const CONNECT: &str = "40";

/// Handshake parameters from the `0` open packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Open(OpenInfo),
    Close,
    Ping,
    Pong,
    Noop,
    Connected,
    Disconnected,
    Event {
        name: String,
        payload: Value,
        ack_id: Option<u64>,
    },
    ConnectError(Value),
}

/// Decode one text frame.
pub fn decode(frame: &str) -> Result<Frame> {
    let mut chars = frame.chars();
    let kind = chars.next().context("Empty frame")?;
    let rest = chars.as_str();

    match kind {
        '0' => {
            let info: OpenInfo =
                serde_json::from_str(rest).context("Invalid open packet payload")?;
            Ok(Frame::Open(info))
        }
        '1' => Ok(Frame::Close),
        '2' => Ok(Frame::Ping),
        '3' => Ok(Frame::Pong),
        '6' => Ok(Frame::Noop),
        '4' => decode_message(rest),
        other => bail!("Unsupported engine.io packet type {:?}", other),
    }
}

fn decode_message(packet: &str) -> Result<Frame> {
    let mut chars = packet.chars();
    let kind = chars.next().context("Empty socket.io packet")?;
    let rest = chars.as_str();

    if rest.starts_with('/') {
        bail!("Namespaced packets are not supported: {}", packet);
    }

    match kind {
        '0' => Ok(Frame::Connected),
        '1' => Ok(Frame::Disconnected),
        '2' => {
            let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
            let ack_id = if digits > 0 {
                Some(rest[..digits].parse().context("Invalid ack id")?)
            } else {
                None
            };
            let array: Vec<Value> =
                serde_json::from_str(&rest[digits..]).context("Invalid event array")?;
            let mut items = array.into_iter();
            let name = match items.next() {
                Some(Value::String(name)) => name,
                _ => bail!("Event array does not start with a name"),
            };
            let payload = items.next().unwrap_or(Value::Null);
            Ok(Frame::Event {
                name,
                payload,
                ack_id,
            })
        }
        '4' => {
            let payload = serde_json::from_str(rest).unwrap_or(Value::Null);
            Ok(Frame::ConnectError(payload))
        }
        '5' | '6' => bail!("Binary socket.io packets are not supported"),
        other => bail!("Unsupported socket.io packet type {:?}", other),
    }
}

/// Encode an event for the default namespace.
pub fn encode_event(name: &str, payload: &Value) -> String {
    let array = Value::Array(vec![Value::String(name.to_string()), payload.clone()]);
    format!("42{}", array)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_open() {
        let frame =
            decode(r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":5000}"#)
                .unwrap();
        assert_eq!(
            frame,
            Frame::Open(OpenInfo {
                sid: "abc".into(),
                ping_interval: 25000,
                ping_timeout: 5000
            })
        );
    }

    #[test]
    fn test_decode_control_frames() {
        assert_eq!(decode("2").unwrap(), Frame::Ping);
        assert_eq!(decode("3").unwrap(), Frame::Pong);
        assert_eq!(decode("40").unwrap(), Frame::Connected);
        assert_eq!(decode(r#"40{"sid":"x"}"#).unwrap(), Frame::Connected);
        assert_eq!(decode("41").unwrap(), Frame::Disconnected);
        assert_eq!(decode("1").unwrap(), Frame::Close);
    }

    #[test]
    fn test_decode_event() {
        let frame = decode(r#"42["newMessage",{"id":"m1"}]"#).unwrap();
        assert_eq!(
            frame,
            Frame::Event {
                name: "newMessage".into(),
                payload: json!({ "id": "m1" }),
                ack_id: None
            }
        );
    }

    #[test]
    fn test_decode_event_with_ack_and_no_payload() {
        let frame = decode(r#"4217["callEnded"]"#).unwrap();
        assert_eq!(
            frame,
            Frame::Event {
                name: "callEnded".into(),
                payload: Value::Null,
                ack_id: Some(17)
            }
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("").is_err());
        assert!(decode("9").is_err());
        assert!(decode("42[1,2]").is_err());
        assert!(decode(r#"42/admin,["x"]"#).is_err());
    }

    #[test]
    fn test_encode_event() {
        let frame = encode_event("typing", &json!({ "chatId": "c1" }));
        assert_eq!(frame, r#"42["typing",{"chatId":"c1"}]"#);
        match decode(&frame).unwrap() {
            Frame::Event { name, .. } => assert_eq!(name, "typing"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
