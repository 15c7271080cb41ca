//! Chat REST collaborators: history fetch, send-message and status update.

pub mod client;

use anyhow::Result;
use async_trait::async_trait;

pub use client::ChatClient;

use crate::models::{Chat, ChatStatus, OutgoingMessage, RawMessage};

/// Server-side chat operations the conversation runtime depends on.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Chat with its stored message history.
    async fn fetch_chat(&self, chat_id: &str) -> Result<Chat>;

    /// Persist a message. Returns the stored message.
    async fn send_message(&self, chat_id: &str, message: &OutgoingMessage) -> Result<RawMessage>;

    /// Change the chat status. Returns the status the server now reports.
    async fn update_status(&self, chat_id: &str, status: ChatStatus) -> Result<ChatStatus>;
}
