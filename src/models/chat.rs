//! Chat-related models

use serde::{Deserialize, Serialize};

use super::RawMessage;

/// Support chat status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChatStatus {
    Open,
    Resolved,
}

impl ChatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatStatus::Open => "OPEN",
            ChatStatus::Resolved => "RESOLVED",
        }
    }
}

/// Chat as returned by the history endpoint (`GET /chat/:id`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    pub status: Option<ChatStatus>,
    #[serde(default)]
    pub messages: Vec<RawMessage>,
}
