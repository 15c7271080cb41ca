//! Ordered, de-duplicated message timeline.
//!
//! History loads and live events land in the same [`MessageSynchronizer`].
//! The sequence is kept sorted by `created_at` with a stable sort, so
//! messages with equal timestamps stay in arrival order.

use std::collections::HashSet;

use crate::models::{Message, MessageError, RawMessage};

/// Result of merging a history batch.
#[derive(Debug, Default, PartialEq)]
pub struct IngestReport {
    pub added: usize,
    /// Ids that were already present and left untouched.
    pub skipped: usize,
    pub rejected: Vec<MessageError>,
}

/// What a live message did to the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveOutcome {
    Inserted,
    /// An entry with the same id was replaced in place.
    Replaced,
}

pub struct MessageSynchronizer {
    chat_id: String,
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl MessageSynchronizer {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            messages: Vec::new(),
            ids: HashSet::new(),
        }
    }

    /// Merge a fetched history batch.
    ///
    /// Only ids not already present are added, so a history load that races
    /// with live events never duplicates or overwrites them.
    pub fn ingest_history(&mut self, batch: Vec<RawMessage>) -> IngestReport {
        let mut report = IngestReport::default();

        for raw in batch {
            let message = match raw.normalize(&self.chat_id) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!("Rejected history message in {}: {}", self.chat_id, e);
                    report.rejected.push(e);
                    continue;
                }
            };
            if self.ids.contains(&message.id) {
                report.skipped += 1;
                continue;
            }
            self.ids.insert(message.id.clone());
            self.messages.push(message);
            report.added += 1;
        }

        if report.added > 0 {
            self.resort();
        }
        tracing::debug!(
            "History for {}: {} added, {} skipped, {} rejected",
            self.chat_id,
            report.added,
            report.skipped,
            report.rejected.len()
        );
        report
    }

    /// Merge one live message, replacing any entry with the same id.
    pub fn ingest_live(&mut self, raw: RawMessage) -> Result<LiveOutcome, MessageError> {
        let message = raw.normalize(&self.chat_id)?;
        Ok(self.upsert(message))
    }

    /// Insert or replace an already-normalized message.
    pub fn upsert(&mut self, message: Message) -> LiveOutcome {
        let outcome = match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => {
                *existing = message;
                LiveOutcome::Replaced
            }
            None => {
                self.ids.insert(message.id.clone());
                self.messages.push(message);
                LiveOutcome::Inserted
            }
        };
        self.resort();
        outcome
    }

    fn resort(&mut self) {
        // `sort_by_key` is stable.
        self.messages.sort_by_key(|m| m.created_at);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Copy of the current timeline for readers outside the event loop.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
