//! Message timeline, typing indicator and the local compose box.

pub mod timeline;
pub mod typing;

pub use timeline::{IngestReport, LiveOutcome, MessageSynchronizer};
pub use typing::TypingIndicatorTracker;

use crate::models::{Attachment, OutgoingMessage};

/// Local draft state.
///
/// Non-empty edits produce an outbound typing pulse; the draft is only
/// cleared once a send succeeds.
#[derive(Debug, Default)]
pub struct Composer {
    draft: String,
}

impl Composer {
    pub fn draft(&self) -> &str {
        &self.draft
    }

    /// Replace the draft. Returns true when a typing pulse should be sent.
    pub fn set_draft(&mut self, text: impl Into<String>) -> bool {
        let text = text.into();
        let pulse = !text.trim().is_empty() && text != self.draft;
        self.draft = text;
        pulse
    }

    /// Build the outgoing message, or `None` when there is nothing to send.
    pub fn outgoing(&self, attachment: Option<Attachment>) -> Option<OutgoingMessage> {
        let content = self.draft.trim();
        if content.is_empty() && attachment.is_none() {
            return None;
        }
        Some(OutgoingMessage {
            content: (!content.is_empty()).then(|| content.to_string()),
            attachment,
        })
    }

    /// Clear the draft after `sent` was delivered, unless the user has
    /// typed something else since.
    pub fn sent(&mut self, sent: &OutgoingMessage) {
        let current = self.draft.trim();
        if sent.content.as_deref().unwrap_or("") == current {
            self.draft.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typing_pulse_only_on_nonempty_change() {
        let mut composer = Composer::default();
        assert!(composer.set_draft("h"));
        assert!(composer.set_draft("hi"));
        assert!(!composer.set_draft("hi"));
        assert!(!composer.set_draft("   "));
        assert!(!composer.set_draft(""));
    }

    #[test]
    fn test_empty_draft_without_attachment_is_not_sent() {
        let mut composer = Composer::default();
        composer.set_draft("  ");
        assert!(composer.outgoing(None).is_none());

        let attachment = Attachment {
            file_name: "voice.webm".into(),
            mime_type: "audio/webm".into(),
            bytes: vec![1, 2, 3],
        };
        let out = composer.outgoing(Some(attachment)).unwrap();
        assert_eq!(out.content, None);
        assert!(out.attachment.is_some());
    }

    #[test]
    fn test_sent_clears_only_matching_draft() {
        let mut composer = Composer::default();
        composer.set_draft(" hello ");
        let out = composer.outgoing(None).unwrap();
        assert_eq!(out.content.as_deref(), Some("hello"));

        composer.set_draft("hello again");
        composer.sent(&out);
        assert_eq!(composer.draft(), "hello again");

        composer.set_draft("hello");
        composer.sent(&out);
        assert_eq!(composer.draft(), "");
    }
}
