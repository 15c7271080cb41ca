//! Typed signaling events.
//!
//! Event names and payload shapes match the socket.io protocol spoken by the
//! storefront server. Message events and call events share one connection
//! but are owned by different components, see [`Namespace`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{ChatStatus, RawMessage, TypingUser};

/// Inbound message-namespace event names.
pub const MESSAGE_EVENTS: [&str; 3] = ["newMessage", "userTyping", "chatStatusUpdated"];

/// Inbound call-namespace event names.
pub const CALL_EVENTS: [&str; 4] = ["callOffer", "callAnswer", "iceCandidate", "callEnded"];

/// Which component owns an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Message,
    Call,
}

impl Namespace {
    pub fn of(event: &str) -> Option<Self> {
        if MESSAGE_EVENTS.contains(&event) {
            Some(Namespace::Message)
        } else if CALL_EVENTS.contains(&event) {
            Some(Namespace::Call)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description in the browser's `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
}

/// Payload could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed {event} payload: {reason}")]
pub struct ProtocolViolation {
    pub event: String,
    pub reason: String,
}

/// Events received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    NewMessage(RawMessage),
    UserTyping(TypingUser),
    /// Broadcast to every socket, not only the chat's room.
    ChatStatusUpdated {
        chat_id: String,
        status: ChatStatus,
    },
    CallOffer {
        offer: SessionDescription,
        from: String,
    },
    CallAnswer {
        answer: SessionDescription,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
    CallEnded,
}

#[derive(Deserialize)]
struct StatusPayload {
    id: String,
    status: ChatStatus,
}

#[derive(Deserialize)]
struct OfferPayload {
    offer: SessionDescription,
    from: String,
}

#[derive(Deserialize)]
struct AnswerPayload {
    answer: SessionDescription,
}

#[derive(Deserialize)]
struct CandidatePayload {
    candidate: Option<IceCandidate>,
}

impl InboundEvent {
    /// Parse a named event.
    ///
    /// Returns `Ok(None)` for events this client does not handle and for
    /// end-of-candidates markers (`candidate: null`).
    pub fn parse(event: &str, payload: &Value) -> Result<Option<Self>, ProtocolViolation> {
        let violation = |e: serde_json::Error| ProtocolViolation {
            event: event.to_string(),
            reason: e.to_string(),
        };

        let parsed = match event {
            "newMessage" => InboundEvent::NewMessage(
                serde_json::from_value(payload.clone()).map_err(violation)?,
            ),
            "userTyping" => {
                // Either the bare user or `{ user }`.
                let user = payload
                    .get("user")
                    .filter(|u| u.is_object())
                    .unwrap_or(payload);
                InboundEvent::UserTyping(serde_json::from_value(user.clone()).map_err(violation)?)
            }
            "chatStatusUpdated" => {
                let p: StatusPayload =
                    serde_json::from_value(payload.clone()).map_err(violation)?;
                InboundEvent::ChatStatusUpdated {
                    chat_id: p.id,
                    status: p.status,
                }
            }
            "callOffer" => {
                let p: OfferPayload = serde_json::from_value(payload.clone()).map_err(violation)?;
                InboundEvent::CallOffer {
                    offer: p.offer,
                    from: p.from,
                }
            }
            "callAnswer" => {
                let p: AnswerPayload =
                    serde_json::from_value(payload.clone()).map_err(violation)?;
                InboundEvent::CallAnswer { answer: p.answer }
            }
            "iceCandidate" => {
                let p: CandidatePayload =
                    serde_json::from_value(payload.clone()).map_err(violation)?;
                match p.candidate {
                    Some(candidate) => InboundEvent::IceCandidate { candidate },
                    None => return Ok(None),
                }
            }
            "callEnded" => InboundEvent::CallEnded,
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }

    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::NewMessage(_) => "newMessage",
            InboundEvent::UserTyping(_) => "userTyping",
            InboundEvent::ChatStatusUpdated { .. } => "chatStatusUpdated",
            InboundEvent::CallOffer { .. } => "callOffer",
            InboundEvent::CallAnswer { .. } => "callAnswer",
            InboundEvent::IceCandidate { .. } => "iceCandidate",
            InboundEvent::CallEnded => "callEnded",
        }
    }
}

/// Events sent to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    /// Subscribe this socket to the conversation's room.
    JoinChat { chat_id: String },
    Typing {
        chat_id: String,
        user: TypingUser,
    },
    CallOffer {
        chat_id: String,
        offer: SessionDescription,
    },
    CallAnswer {
        chat_id: String,
        answer: SessionDescription,
        to: String,
    },
    IceCandidate {
        chat_id: String,
        candidate: IceCandidate,
        to: Option<String>,
    },
    CallEnded { chat_id: String },
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::JoinChat { .. } => "joinChat",
            OutboundEvent::Typing { .. } => "typing",
            OutboundEvent::CallOffer { .. } => "callOffer",
            OutboundEvent::CallAnswer { .. } => "callAnswer",
            OutboundEvent::IceCandidate { .. } => "iceCandidate",
            OutboundEvent::CallEnded { .. } => "callEnded",
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            // The server's joinChat handler takes the bare id.
            OutboundEvent::JoinChat { chat_id } => Value::String(chat_id.clone()),
            OutboundEvent::Typing { chat_id, user } => serde_json::json!({
                "chatId": chat_id,
                "user": user,
            }),
            OutboundEvent::CallOffer { chat_id, offer } => serde_json::json!({
                "chatId": chat_id,
                "offer": offer,
            }),
            OutboundEvent::CallAnswer {
                chat_id,
                answer,
                to,
            } => serde_json::json!({
                "chatId": chat_id,
                "answer": answer,
                "to": to,
            }),
            OutboundEvent::IceCandidate {
                chat_id,
                candidate,
                to,
            } => serde_json::json!({
                "chatId": chat_id,
                "candidate": candidate,
                "to": to,
            }),
            OutboundEvent::CallEnded { chat_id } => serde_json::json!({ "chatId": chat_id }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_namespaces_are_disjoint() {
        for e in MESSAGE_EVENTS {
            assert_eq!(Namespace::of(e), Some(Namespace::Message));
        }
        for e in CALL_EVENTS {
            assert_eq!(Namespace::of(e), Some(Namespace::Call));
        }
        assert_eq!(Namespace::of("chatCreated"), None);
    }

    #[test]
    fn test_parse_call_offer() {
        let payload = json!({
            "offer": { "type": "offer", "sdp": "v=0\r\n" },
            "from": "user-2"
        });
        let event = InboundEvent::parse("callOffer", &payload).unwrap().unwrap();
        assert_eq!(
            event,
            InboundEvent::CallOffer {
                offer: SessionDescription::offer("v=0\r\n"),
                from: "user-2".into()
            }
        );
    }

    #[test]
    fn test_parse_ice_candidate_and_end_marker() {
        let payload = json!({
            "candidate": {
                "candidate": "candidate:1 1 UDP 2130706431 10.0.0.1 5000 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        });
        let event = InboundEvent::parse("iceCandidate", &payload).unwrap().unwrap();
        match event {
            InboundEvent::IceCandidate { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_m_line_index, Some(0));
            }
            other => panic!("unexpected {:?}", other),
        }

        let end = InboundEvent::parse("iceCandidate", &json!({ "candidate": null })).unwrap();
        assert!(end.is_none());
    }

    #[test]
    fn test_parse_malformed_is_violation() {
        let err = InboundEvent::parse("callAnswer", &json!({ "answer": 3 })).unwrap_err();
        assert_eq!(err.event, "callAnswer");

        let err = InboundEvent::parse("userTyping", &json!("bob")).unwrap_err();
        assert_eq!(err.event, "userTyping");
    }

    #[test]
    fn test_unknown_event_ignored() {
        assert!(InboundEvent::parse("chatCreated", &json!({}))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_status_update_from_chat() {
        let payload = json!({ "id": "c1", "status": "RESOLVED", "customerId": "u5" });
        let event = InboundEvent::parse("chatStatusUpdated", &payload)
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            InboundEvent::ChatStatusUpdated {
                chat_id: "c1".into(),
                status: ChatStatus::Resolved
            }
        );
    }

    #[test]
    fn test_outbound_payload_shapes() {
        let ev = OutboundEvent::CallAnswer {
            chat_id: "c1".into(),
            answer: SessionDescription::answer("v=0"),
            to: "u2".into(),
        };
        assert_eq!(ev.name(), "callAnswer");
        assert_eq!(
            ev.payload(),
            json!({
                "chatId": "c1",
                "answer": { "type": "answer", "sdp": "v=0" },
                "to": "u2"
            })
        );

        let ev = OutboundEvent::IceCandidate {
            chat_id: "c1".into(),
            candidate: IceCandidate {
                candidate: "candidate:x".into(),
                sdp_mid: None,
                sdp_m_line_index: None,
            },
            to: None,
        };
        assert_eq!(ev.payload()["to"], Value::Null);

        let ev = OutboundEvent::JoinChat {
            chat_id: "c9".into(),
        };
        assert_eq!(ev.payload(), json!("c9"));
    }
}
