//! Single-flight timers that report back into an event loop.
//!
//! A [`Timer`] owns at most one pending sleep. Scheduling cancels whatever
//! was pending, and every schedule gets a fresh [`TimerToken`] so a firing
//! that was already queued when it got cancelled is recognised as stale.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Clears the remote typing indicator.
    TypingClear,
    /// Returns a finished call from `Ended` to `Idle`.
    EndedGrace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerToken(u64);

/// Delivered on the sink when a timer elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    pub token: TimerToken,
}

pub type TimerSink = mpsc::UnboundedSender<TimerFired>;

pub struct Timer {
    kind: TimerKind,
    sink: TimerSink,
    generation: u64,
    pending: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn new(kind: TimerKind, sink: TimerSink) -> Self {
        Self {
            kind,
            sink,
            generation: 0,
            pending: None,
        }
    }

    /// Cancel any pending firing and schedule a new one after `delay`.
    pub fn schedule(&mut self, delay: Duration) -> TimerToken {
        self.cancel();
        self.generation += 1;
        let token = TimerToken(self.generation);
        let fired = TimerFired {
            kind: self.kind,
            token,
        };
        let sink = self.sink.clone();
        // Deadline is fixed now, not when the task is first polled.
        let deadline = tokio::time::Instant::now() + delay;
        self.pending = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = sink.send(fired);
        }));
        token
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.pending.take() {
            handle.abort();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Accept a firing. Returns false for tokens that were cancelled or
    /// superseded; the caller must then leave its state alone.
    pub fn fire(&mut self, token: TimerToken) -> bool {
        if self.pending.is_some() && token == TimerToken(self.generation) {
            self.pending = None;
            true
        } else {
            false
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_supersedes_previous() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = Timer::new(TimerKind::TypingClear, tx);

        let first = timer.schedule(Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(50)).await;
        let second = timer.schedule(Duration::from_millis(100));
        assert_ne!(first, second);

        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err(), "first schedule must not fire");

        tokio::time::advance(Duration::from_millis(50)).await;
        tokio::task::yield_now().await;
        let fired = rx.try_recv().unwrap();
        assert_eq!(fired.token, second);
        assert!(timer.fire(fired.token));
        assert!(!timer.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_token_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut timer = Timer::new(TimerKind::EndedGrace, tx);

        let old = timer.schedule(Duration::from_millis(10));
        timer.cancel();
        assert!(!timer.fire(old));

        let old = timer.schedule(Duration::from_millis(10));
        let _new = timer.schedule(Duration::from_millis(10));
        assert!(!timer.fire(old));
        assert!(timer.is_pending());
    }
}
