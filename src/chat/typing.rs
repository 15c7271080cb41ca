//! Remote typing indicator.

use std::time::Duration;

use crate::models::TypingUser;
use crate::timer::{Timer, TimerKind, TimerSink, TimerToken};

/// Debounced "someone else is typing" flag for one conversation.
///
/// Every remote pulse sets the flag and restarts the clear timer, so the
/// flag drops exactly `timeout` after the most recent pulse.
pub struct TypingIndicatorTracker {
    local_user_id: String,
    is_typing: bool,
    timeout: Duration,
    timer: Timer,
}

impl TypingIndicatorTracker {
    pub fn new(local_user_id: impl Into<String>, timeout: Duration, sink: TimerSink) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            is_typing: false,
            timeout,
            timer: Timer::new(TimerKind::TypingClear, sink),
        }
    }

    /// Handle an inbound `userTyping` pulse. Returns true if the visible
    /// flag changed.
    pub fn on_pulse(&mut self, user: &TypingUser) -> bool {
        if user.id == self.local_user_id {
            return false;
        }
        let changed = !self.is_typing;
        self.is_typing = true;
        self.timer.schedule(self.timeout);
        changed
    }

    /// Handle the clear timer. Returns true if the visible flag changed.
    pub fn on_timer(&mut self, token: TimerToken) -> bool {
        if !self.timer.fire(token) {
            return false;
        }
        let changed = self.is_typing;
        self.is_typing = false;
        changed
    }

    pub fn is_typing(&self) -> bool {
        self.is_typing
    }

    /// Drop the flag and any pending clear.
    pub fn reset(&mut self) {
        self.timer.cancel();
        self.is_typing = false;
    }
}
