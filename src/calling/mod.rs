//! Call session state machine and its media/peer collaborators.
//!
//! Signaling goes over the conversation's [`crate::signaling`] channel; the
//! media plane is whatever [`peer::PeerConnector`] the controller was built
//! with.

pub mod controller;
pub mod media;
pub mod peer;
pub mod sdp;
pub mod signal_only;

use std::collections::VecDeque;
use std::fmt;

pub use controller::CallSessionController;

use crate::signaling::events::{IceCandidate, SessionDescription};
use crate::signaling::ChannelError;
use media::{LocalTracks, MediaError};
use peer::PeerEvent;

/// Call lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    /// Local side initiated, offer sent or being built, awaiting answer.
    Outgoing,
    /// Received an offer, answer being built or sent.
    Answering,
    Active,
    Ending,
    /// Display-only state before returning to `Idle`.
    Ended,
}

impl CallState {
    pub fn label(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Outgoing => "calling",
            CallState::Answering => "answering",
            CallState::Active => "in call",
            CallState::Ending => "ending",
            CallState::Ended => "ended",
        }
    }

    /// Negotiating or connected.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            CallState::Outgoing | CallState::Answering | CallState::Active
        )
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    None,
    Caller,
    Callee,
}

/// What to do with an inbound offer while a call of our own is starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GlarePolicy {
    /// The lexicographically smaller user id keeps the caller role.
    #[default]
    TieBreak,
    /// Ignore every offer while not idle.
    Reject,
}

/// Per-conversation call state.
#[derive(Debug)]
pub struct CallSession {
    pub chat_id: String,
    pub role: CallRole,
    pub state: CallState,
    pub local_description_set: bool,
    pub remote_description_set: bool,
    pub pending_remote_candidates: VecDeque<IceCandidate>,
    /// User id of the other party, once known.
    pub remote_party: Option<String>,
}

impl CallSession {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            role: CallRole::None,
            state: CallState::Idle,
            local_description_set: false,
            remote_description_set: false,
            pending_remote_candidates: VecDeque::new(),
            remote_party: None,
        }
    }

    /// Drop per-call negotiation state, keeping `state` as is.
    fn clear_negotiation(&mut self) {
        self.local_description_set = false;
        self.remote_description_set = false;
        self.pending_remote_candidates.clear();
    }

    fn reset(&mut self) {
        self.clear_negotiation();
        self.role = CallRole::None;
        self.state = CallState::Idle;
        self.remote_party = None;
    }
}

/// Why a call could not start or had to be torn down.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("a call is already in progress")]
    Busy,
    #[error("chat is resolved")]
    ChatClosed,
    #[error("could not access capture devices: {0}")]
    MediaAcquisition(#[from] MediaError),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("signaling failed: {0}")]
    Transport(#[from] ChannelError),
}

/// A peer and tracks ready to be committed to the call.
pub struct Negotiated {
    pub peer: std::sync::Arc<dyn peer::PeerSession>,
    pub tracks: LocalTracks,
    pub local: SessionDescription,
}

/// Results of suspended call work, fed back into the event loop.
pub enum CallInput {
    Negotiated {
        attempt: u64,
        result: Result<Negotiated, CallError>,
    },
    Peer {
        attempt: u64,
        event: PeerEvent,
    },
}

impl fmt::Debug for CallInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallInput::Negotiated { attempt, result } => f
                .debug_struct("Negotiated")
                .field("attempt", attempt)
                .field("ok", &result.is_ok())
                .finish(),
            CallInput::Peer { attempt, event } => f
                .debug_struct("Peer")
                .field("attempt", attempt)
                .field("event", event)
                .finish(),
        }
    }
}
