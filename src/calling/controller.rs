//! Call session state machine.
//!
//! Runs inside the conversation event loop. Media acquisition and building
//! the local description can take arbitrarily long (a permission prompt),
//! so they run in a spawned task tagged with an attempt number. Ending or
//! abandoning a call bumps the attempt; a task that finishes for an old
//! attempt releases what it acquired instead of committing it, and its
//! result is disposed if it still reaches the loop.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;

use super::media::{LocalTracks, MediaError, MediaResourceManager, RemoteSink};
use super::peer::{PeerConfig, PeerConnector, PeerEvent, PeerEventSink, PeerSession};
use super::{CallError, CallInput, CallRole, CallSession, CallState, GlarePolicy, Negotiated};
use crate::conversation::Notice;
use crate::signaling::events::{IceCandidate, SessionDescription};
use crate::signaling::{ChannelHandle, InboundEvent, OutboundEvent};
use crate::timer::{Timer, TimerKind, TimerSink, TimerToken};

#[derive(Debug, Clone)]
pub struct CallSettings {
    pub peer: PeerConfig,
    pub glare: GlarePolicy,
    /// How long `Ended` is shown before returning to `Idle`.
    pub ended_grace: Duration,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            peer: PeerConfig::default(),
            glare: GlarePolicy::default(),
            ended_grace: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    /// Ended here: the remote side is told.
    Local,
    /// The remote side sent `callEnded`.
    Remote,
}

pub struct CallSessionController {
    local_user_id: String,
    channel: ChannelHandle,
    media: MediaResourceManager,
    connector: Arc<dyn PeerConnector>,
    settings: CallSettings,
    session: CallSession,
    chat_open: bool,
    peer: Option<Arc<dyn PeerSession>>,
    attempt: Arc<AtomicU64>,
    inputs: mpsc::UnboundedSender<CallInput>,
    /// Gathered before the offer/answer went out.
    pending_local_candidates: Vec<IceCandidate>,
    /// The peer reported connected before the negotiation was committed.
    connected_early: bool,
    grace_timer: Timer,
    notices: mpsc::UnboundedSender<Notice>,
}

impl CallSessionController {
    /// Create the controller and the receiver the event loop must feed back
    /// through [`handle_input`](Self::handle_input).
    pub fn new(
        local_user_id: impl Into<String>,
        channel: ChannelHandle,
        media: MediaResourceManager,
        connector: Arc<dyn PeerConnector>,
        settings: CallSettings,
        timers: TimerSink,
        notices: mpsc::UnboundedSender<Notice>,
    ) -> (Self, mpsc::UnboundedReceiver<CallInput>) {
        let (inputs, rx) = mpsc::unbounded_channel();
        let chat_id = channel.conversation_id().to_string();
        let controller = Self {
            local_user_id: local_user_id.into(),
            channel,
            media,
            connector,
            settings,
            session: CallSession::new(chat_id),
            chat_open: true,
            peer: None,
            attempt: Arc::new(AtomicU64::new(0)),
            inputs,
            pending_local_candidates: Vec::new(),
            connected_early: false,
            grace_timer: Timer::new(TimerKind::EndedGrace, timers),
            notices,
        };
        (controller, rx)
    }

    pub fn state(&self) -> CallState {
        self.session.state
    }

    pub fn role(&self) -> CallRole {
        self.session.role
    }

    pub fn session(&self) -> &CallSession {
        &self.session
    }

    pub fn remote_track_count(&self) -> usize {
        self.media.remote_track_count()
    }

    /// Calls may only start while the chat is open.
    pub fn set_chat_open(&mut self, open: bool) {
        self.chat_open = open;
    }

    pub fn attach_remote(&mut self, sink: Arc<dyn RemoteSink>) {
        self.media.attach_remote(sink);
    }

    fn current_attempt(&self) -> u64 {
        self.attempt.load(Ordering::SeqCst)
    }

    fn next_attempt(&self) -> u64 {
        self.attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Start an outgoing call.
    ///
    /// Rejected unless the controller is `Idle`; nothing is sent then.
    pub fn start_call(&mut self) -> Result<(), CallError> {
        if !self.chat_open {
            return Err(CallError::ChatClosed);
        }
        if self.session.state != CallState::Idle {
            tracing::info!(
                "startCall ignored in {}: call is {}",
                self.session.chat_id,
                self.session.state
            );
            return Err(CallError::Busy);
        }

        let attempt = self.next_attempt();
        self.session.role = CallRole::Caller;
        self.session.state = CallState::Outgoing;
        tracing::info!("Starting call in {} (attempt {})", self.session.chat_id, attempt);
        self.spawn_negotiation(attempt, None);
        Ok(())
    }

    /// End the call from this side. A no-op unless a call is live.
    pub fn end_call(&mut self) {
        self.finish(EndReason::Local);
    }

    /// Handle an inbound call event. Message events are ignored.
    pub async fn handle_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::CallOffer { offer, from } => self.on_offer(offer, from),
            InboundEvent::CallAnswer { answer } => self.on_answer(answer).await,
            InboundEvent::IceCandidate { candidate } => self.on_remote_candidate(candidate).await,
            InboundEvent::CallEnded => self.finish(EndReason::Remote),
            InboundEvent::NewMessage(_)
            | InboundEvent::UserTyping(_)
            | InboundEvent::ChatStatusUpdated { .. } => {}
        }
    }

    /// Handle the result of suspended work or a peer notification.
    pub async fn handle_input(&mut self, input: CallInput) {
        match input {
            CallInput::Negotiated { attempt, result } => {
                if attempt != self.current_attempt() {
                    tracing::debug!("Disposing result of stale call attempt {}", attempt);
                    if let Ok(negotiated) = result {
                        dispose(negotiated);
                    }
                    return;
                }
                match result {
                    Ok(negotiated) => self.commit(negotiated).await,
                    Err(e) => self.fail(e),
                }
            }
            CallInput::Peer { attempt, event } => {
                if attempt != self.current_attempt() {
                    tracing::debug!("Ignoring {:?} from stale call attempt {}", event, attempt);
                    return;
                }
                self.on_peer_event(event);
            }
        }
    }

    /// Handle a timer firing. Returns true if the call state changed.
    pub fn on_timer(&mut self, token: TimerToken) -> bool {
        if !self.grace_timer.fire(token) || self.session.state != CallState::Ended {
            return false;
        }
        self.session.reset();
        tracing::debug!("Call in {} back to idle", self.session.chat_id);
        true
    }

    /// Tear everything down when the conversation closes.
    pub fn dispose(&mut self) {
        tracing::debug!(
            "Disposing calls for {} (holding local tracks: {})",
            self.session.chat_id,
            self.media.has_local()
        );
        self.finish(EndReason::Local);
        self.grace_timer.cancel();
        self.next_attempt();
        self.media.release();
        self.session.reset();
    }

    fn on_offer(&mut self, offer: SessionDescription, from: String) {
        if from == self.local_user_id {
            tracing::debug!("Ignoring our own callOffer");
            return;
        }

        match self.session.state {
            CallState::Idle => self.begin_answer(offer, from),
            CallState::Outgoing
                if self.settings.glare == GlarePolicy::TieBreak
                    && self.session.role == CallRole::Caller =>
            {
                if self.local_user_id < from {
                    tracing::info!("Glare with {}: keeping the caller role", from);
                    return;
                }
                // The other side keeps its offer and waits for our answer.
                tracing::info!("Glare with {}: answering their offer", from);
                self.teardown();
                self.begin_answer(offer, from);
            }
            state => {
                tracing::warn!("Rejecting callOffer from {}: call is {}", from, state);
            }
        }
    }

    fn begin_answer(&mut self, offer: SessionDescription, from: String) {
        let attempt = self.next_attempt();
        self.session.clear_negotiation();
        self.session.role = CallRole::Callee;
        self.session.state = CallState::Answering;
        self.session.remote_party = Some(from.clone());
        tracing::info!(
            "Answering call from {} in {} (attempt {})",
            from,
            self.session.chat_id,
            attempt
        );
        self.spawn_negotiation(attempt, Some(offer));
    }

    async fn on_answer(&mut self, answer: SessionDescription) {
        if self.session.state != CallState::Outgoing || self.session.remote_description_set {
            tracing::warn!(
                "Ignoring callAnswer: call is {}{}",
                self.session.state,
                if self.session.remote_description_set {
                    " and already answered"
                } else {
                    ""
                }
            );
            return;
        }
        let Some(peer) = self.peer.clone().filter(|_| self.session.local_description_set) else {
            tracing::warn!("Ignoring callAnswer: offer not sent yet");
            return;
        };

        if let Err(e) = peer.set_remote_description(&answer).await {
            self.fail(CallError::Negotiation(format!("{:#}", e)));
            return;
        }
        self.session.remote_description_set = true;
        tracing::info!("Answer applied in {}", self.session.chat_id);
        self.flush_remote_candidates().await;
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.session.state.is_live() {
            tracing::debug!("Ignoring ICE candidate: call is {}", self.session.state);
            return;
        }
        match (&self.peer, self.session.remote_description_set) {
            (Some(peer), true) => {
                if let Err(e) = peer.add_ice_candidate(&candidate).await {
                    tracing::warn!("Failed to apply ICE candidate: {:#}", e);
                }
            }
            _ => {
                tracing::debug!("Buffering ICE candidate until remote description is set");
                self.session.pending_remote_candidates.push_back(candidate);
            }
        }
    }

    async fn flush_remote_candidates(&mut self) {
        let Some(peer) = self.peer.clone() else {
            return;
        };
        if !self.session.pending_remote_candidates.is_empty() {
            tracing::debug!(
                "Applying {} buffered ICE candidates",
                self.session.pending_remote_candidates.len()
            );
        }
        while let Some(candidate) = self.session.pending_remote_candidates.pop_front() {
            if let Err(e) = peer.add_ice_candidate(&candidate).await {
                tracing::warn!("Failed to apply buffered ICE candidate: {:#}", e);
            }
        }
    }

    fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if self.peer.is_none() {
                    self.pending_local_candidates.push(candidate);
                } else if let Err(e) = self.send_local_candidate(candidate) {
                    self.fail(e);
                }
            }
            PeerEvent::RemoteTrack(track) => {
                if self.session.state.is_live() {
                    self.media.push_remote_track(track);
                }
            }
            PeerEvent::Connected => {
                if self.peer.is_some() {
                    self.mark_active();
                } else {
                    self.connected_early = true;
                }
            }
            PeerEvent::Failed(reason) => {
                if self.session.state.is_live() {
                    self.fail(CallError::Negotiation(reason));
                }
            }
        }
    }

    fn send_local_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        let to = match self.session.role {
            CallRole::Callee => self.session.remote_party.clone(),
            _ => None,
        };
        self.channel.send(&OutboundEvent::IceCandidate {
            chat_id: self.session.chat_id.clone(),
            candidate,
            to,
        })?;
        Ok(())
    }

    fn mark_active(&mut self) {
        if matches!(
            self.session.state,
            CallState::Outgoing | CallState::Answering
        ) {
            self.session.state = CallState::Active;
            tracing::info!("Call in {} connected", self.session.chat_id);
        }
    }

    /// Commit a finished negotiation: adopt its resources and send the
    /// offer or answer.
    async fn commit(&mut self, negotiated: Negotiated) {
        let expected = match self.session.role {
            CallRole::Caller => CallState::Outgoing,
            CallRole::Callee => CallState::Answering,
            CallRole::None => CallState::Idle,
        };
        if self.session.state != expected || expected == CallState::Idle {
            tracing::debug!("Negotiation finished but call is {}", self.session.state);
            dispose(negotiated);
            return;
        }

        let Negotiated {
            peer,
            tracks,
            local,
        } = negotiated;
        self.media.adopt(tracks);
        self.peer = Some(peer);
        self.session.local_description_set = true;

        let chat_id = self.session.chat_id.clone();
        let event = match self.session.role {
            CallRole::Callee => {
                self.session.remote_description_set = true;
                OutboundEvent::CallAnswer {
                    chat_id,
                    answer: local,
                    to: self.session.remote_party.clone().unwrap_or_default(),
                }
            }
            _ => OutboundEvent::CallOffer {
                chat_id,
                offer: local,
            },
        };
        if let Err(e) = self.channel.send(&event) {
            self.fail(e.into());
            return;
        }
        tracing::info!("Sent {} in {}", event.name(), self.session.chat_id);

        for candidate in std::mem::take(&mut self.pending_local_candidates) {
            if let Err(e) = self.send_local_candidate(candidate) {
                self.fail(e);
                return;
            }
        }
        if self.session.remote_description_set {
            self.flush_remote_candidates().await;
        }
        if std::mem::take(&mut self.connected_early) {
            self.mark_active();
        }
    }

    fn fail(&mut self, error: CallError) {
        if !self.session.state.is_live() {
            tracing::debug!("Dropping call failure in state {}: {}", self.session.state, error);
            return;
        }
        tracing::error!("Call in {} failed: {}", self.session.chat_id, error);
        let _ = self.notices.send(Notice::CallFailed(error.to_string()));
        self.finish(EndReason::Local);
    }

    /// Common exit path for every way a call can end.
    fn finish(&mut self, reason: EndReason) {
        if !self.session.state.is_live() {
            tracing::debug!(
                "End ({:?}) ignored: call is {}",
                reason,
                self.session.state
            );
            return;
        }

        self.session.state = CallState::Ending;
        self.teardown();

        if reason == EndReason::Local {
            let ended = OutboundEvent::CallEnded {
                chat_id: self.session.chat_id.clone(),
            };
            if let Err(e) = self.channel.send(&ended) {
                tracing::warn!("callEnded may not have been delivered: {}", e);
            }
        }

        self.session.state = CallState::Ended;
        self.grace_timer.schedule(self.settings.ended_grace);
        tracing::info!("Call in {} ended ({:?})", self.session.chat_id, reason);
    }

    /// Release everything the current attempt holds, cancelling any
    /// in-flight negotiation.
    fn teardown(&mut self) {
        self.next_attempt();
        if let Some(peer) = self.peer.take() {
            peer.close();
        }
        let stopped = self.media.release();
        tracing::debug!("Released {} local tracks", stopped);
        self.session.clear_negotiation();
        self.pending_local_candidates.clear();
        self.connected_early = false;
    }

    fn spawn_negotiation(&self, attempt: u64, remote_offer: Option<SessionDescription>) {
        let acquire = self.media.acquire_local();
        let connector = Arc::clone(&self.connector);
        let config = self.settings.peer.clone();
        let events = PeerEventSink::new(attempt, self.inputs.clone());
        let current = Arc::clone(&self.attempt);
        let inputs = self.inputs.clone();

        tokio::spawn(async move {
            let outcome = negotiate(
                acquire,
                connector,
                config,
                events,
                &current,
                attempt,
                remote_offer,
            )
            .await;
            if let Some(result) = outcome {
                let _ = inputs.send(CallInput::Negotiated { attempt, result });
            }
        });
    }
}

fn dispose(negotiated: Negotiated) {
    negotiated.peer.close();
    // Dropping the tracks releases them.
}

/// Acquire media and build the local description.
///
/// Returns `None` when the attempt was cancelled along the way; anything
/// acquired has been released by then.
async fn negotiate(
    acquire: impl Future<Output = Result<LocalTracks, MediaError>>,
    connector: Arc<dyn PeerConnector>,
    config: PeerConfig,
    events: PeerEventSink,
    current: &AtomicU64,
    attempt: u64,
    remote_offer: Option<SessionDescription>,
) -> Option<Result<Negotiated, CallError>> {
    let cancelled = || current.load(Ordering::SeqCst) != attempt;

    let tracks = match acquire.await {
        Ok(tracks) => tracks,
        Err(e) => return (!cancelled()).then(|| Err(e.into())),
    };
    if cancelled() {
        tracing::info!("Call attempt {} cancelled during media acquisition", attempt);
        return None;
    }

    let peer = match connector.connect(&config, events) {
        Ok(peer) => peer,
        Err(e) => return Some(Err(CallError::Negotiation(format!("{:#}", e)))),
    };

    match build_description(peer.as_ref(), &tracks, remote_offer.as_ref()).await {
        Ok(local) if !cancelled() => Some(Ok(Negotiated {
            peer,
            tracks,
            local,
        })),
        Ok(_) => {
            tracing::info!("Call attempt {} cancelled during negotiation", attempt);
            peer.close();
            None
        }
        Err(e) => {
            peer.close();
            (!cancelled()).then(|| Err(CallError::Negotiation(format!("{:#}", e))))
        }
    }
}

async fn build_description(
    peer: &dyn PeerSession,
    tracks: &LocalTracks,
    remote_offer: Option<&SessionDescription>,
) -> anyhow::Result<SessionDescription> {
    for track in tracks.tracks() {
        peer.add_track(Arc::clone(track))?;
    }
    let local = match remote_offer {
        Some(offer) => {
            peer.set_remote_description(offer)
                .await
                .context("Failed to apply remote offer")?;
            peer.create_answer().await.context("Failed to create answer")?
        }
        None => peer.create_offer().await.context("Failed to create offer")?,
    };
    peer.set_local_description(&local)
        .await
        .context("Failed to set local description")?;
    Ok(local)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::calling::media::testing::FakeDevices;
    use crate::calling::media::{MediaConstraints, SyntheticDevices};
    use crate::calling::peer::testing::FakeConnector;
    use crate::calling::signal_only::SignalOnlyConnector;
    use crate::signaling::testing::RecordingTransport;
    use crate::signaling::SignalingChannel;
    use crate::timer::TimerFired;

    struct Harness {
        controller: CallSessionController,
        inputs: mpsc::UnboundedReceiver<CallInput>,
        timers: mpsc::UnboundedReceiver<TimerFired>,
        notices: mpsc::UnboundedReceiver<Notice>,
        transport: Arc<RecordingTransport>,
        devices: Arc<FakeDevices>,
        connector: Arc<FakeConnector>,
    }

    impl Harness {
        fn new(local_user_id: &str) -> Self {
            Self::with(local_user_id, FakeDevices::new(), CallSettings::default())
        }

        fn with(local_user_id: &str, devices: Arc<FakeDevices>, settings: CallSettings) -> Self {
            let transport = RecordingTransport::new();
            let channel = SignalingChannel::new(transport.clone());
            let handle = channel.open("c1");
            let connector = Arc::new(FakeConnector::default());
            let (timer_tx, timers) = mpsc::unbounded_channel();
            let (notice_tx, notices) = mpsc::unbounded_channel();
            let media = MediaResourceManager::new(devices.clone(), MediaConstraints::default());
            let (controller, inputs) = CallSessionController::new(
                local_user_id,
                handle,
                media,
                connector.clone(),
                settings,
                timer_tx,
                notice_tx,
            );
            Self {
                controller,
                inputs,
                timers,
                notices,
                transport,
                devices,
                connector,
            }
        }

        /// Let spawned work run and feed its results back in.
        async fn pump(&mut self) {
            for _ in 0..5 {
                tokio::task::yield_now().await;
                while let Ok(input) = self.inputs.try_recv() {
                    self.controller.handle_input(input).await;
                }
            }
        }

        async fn fire_timers(&mut self) {
            tokio::task::yield_now().await;
            while let Ok(fired) = self.timers.try_recv() {
                self.controller.on_timer(fired.token);
            }
        }

        async fn inbound(&mut self, event: &str, payload: serde_json::Value) {
            let event = InboundEvent::parse(event, &payload).unwrap().unwrap();
            self.controller.handle_inbound(event).await;
        }

        fn sent(&self, name: &str) -> Vec<serde_json::Value> {
            self.transport.sent_named(name)
        }
    }

    fn answer_payload(sdp: &str) -> serde_json::Value {
        json!({ "answer": { "type": "answer", "sdp": sdp } })
    }

    fn offer_payload(from: &str) -> serde_json::Value {
        json!({ "offer": { "type": "offer", "sdp": "v=0 remote" }, "from": from })
    }

    fn candidate_payload(c: &str) -> serde_json::Value {
        json!({ "candidate": { "candidate": c, "sdpMid": "0", "sdpMLineIndex": 0 } })
    }

    #[tokio::test]
    async fn test_start_call_sends_one_offer() {
        let mut h = Harness::new("u1");
        h.controller.start_call().unwrap();
        assert_eq!(h.controller.state(), CallState::Outgoing);
        h.pump().await;

        let offers = h.sent("callOffer");
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0]["chatId"], "c1");
        assert_eq!(offers[0]["offer"]["type"], "offer");
        assert_eq!(h.connector.peer(0).tracks.load(Ordering::SeqCst), 1);

        assert_eq!(h.controller.start_call(), Err(CallError::Busy));
        h.pump().await;
        assert_eq!(h.sent("callOffer").len(), 1);
        assert_eq!(h.connector.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_before_answer_returns_to_idle() {
        let mut h = Harness::new("u1");
        h.controller.start_call().unwrap();
        h.pump().await;

        h.controller.end_call();
        h.controller.end_call();
        assert_eq!(h.controller.state(), CallState::Ended);
        assert_eq!(h.devices.stops(), 1);
        assert_eq!(h.connector.peer(0).closed(), 1);
        assert_eq!(h.sent("callEnded"), vec![json!({ "chatId": "c1" })]);

        tokio::time::advance(Duration::from_millis(999)).await;
        h.fire_timers().await;
        assert_eq!(h.controller.state(), CallState::Ended);

        tokio::time::advance(Duration::from_millis(2)).await;
        h.fire_timers().await;
        assert_eq!(h.controller.state(), CallState::Idle);
        assert_eq!(h.controller.role(), CallRole::None);
        assert_eq!(h.devices.stops(), 1);
    }

    #[tokio::test]
    async fn test_answer_then_connected_then_second_answer_ignored() {
        let mut h = Harness::new("u1");
        h.controller.start_call().unwrap();
        h.pump().await;

        h.inbound("callAnswer", answer_payload("v=0 first")).await;
        assert_eq!(h.controller.state(), CallState::Outgoing);
        assert!(h.controller.session().remote_description_set);

        h.connector.emit_last(PeerEvent::Connected);
        h.pump().await;
        assert_eq!(h.controller.state(), CallState::Active);

        h.inbound("callAnswer", answer_payload("v=0 second")).await;
        let peer = h.connector.peer(0);
        let remote = peer.remote.lock().unwrap().clone().unwrap();
        assert_eq!(remote.sdp, "v=0 first");
        assert_eq!(h.controller.state(), CallState::Active);
    }

    #[tokio::test]
    async fn test_early_candidates_buffered_until_answer() {
        let mut h = Harness::new("u1");
        h.controller.start_call().unwrap();
        h.pump().await;

        h.inbound("iceCandidate", candidate_payload("candidate:early")).await;
        let peer = h.connector.peer(0);
        assert!(peer.applied_candidates().is_empty());
        assert_eq!(h.controller.session().pending_remote_candidates.len(), 1);

        h.inbound("callAnswer", answer_payload("v=0")).await;
        assert_eq!(peer.applied_candidates(), vec!["candidate:early"]);
        assert!(h.controller.session().pending_remote_candidates.is_empty());

        h.inbound("iceCandidate", candidate_payload("candidate:late")).await;
        assert_eq!(
            peer.applied_candidates(),
            vec!["candidate:early", "candidate:late"]
        );
    }

    #[tokio::test]
    async fn test_callee_answers_sender_and_flushes_candidates() {
        let mut h = Harness::new("u1");
        h.inbound("callOffer", offer_payload("u2")).await;
        assert_eq!(h.controller.state(), CallState::Answering);
        assert_eq!(h.controller.role(), CallRole::Callee);

        // Arrives while the answer is still being built.
        h.inbound("iceCandidate", candidate_payload("candidate:1")).await;
        h.pump().await;

        let answers = h.sent("callAnswer");
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0]["to"], "u2");
        assert_eq!(answers[0]["answer"]["type"], "answer");
        assert_eq!(h.connector.peer(0).applied_candidates(), vec!["candidate:1"]);

        h.connector.emit_last(PeerEvent::LocalCandidate(IceCandidate {
            candidate: "candidate:local".into(),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }));
        h.pump().await;
        let sent = h.sent("iceCandidate");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["to"], "u2");
        assert_eq!(sent[0]["candidate"]["candidate"], "candidate:local");
    }

    #[tokio::test]
    async fn test_end_during_acquisition_releases_late_tracks() {
        let mut h = Harness::with("u1", FakeDevices::gated(), CallSettings::default());
        h.controller.start_call().unwrap();
        h.pump().await;
        assert_eq!(h.devices.opened(), 0);

        h.controller.end_call();
        assert_eq!(h.controller.state(), CallState::Ended);

        h.devices.allow();
        h.pump().await;
        assert_eq!(h.devices.opened(), 1);
        assert_eq!(h.devices.stops(), 1);
        assert_eq!(h.connector.count(), 0);
        assert!(h.sent("callOffer").is_empty());
        assert_eq!(h.controller.state(), CallState::Ended);
    }

    #[tokio::test]
    async fn test_media_failure_surfaces_and_cleans_up() {
        let devices = FakeDevices::new();
        devices.fail_with(MediaError::PermissionDenied);
        let mut h = Harness::with("u1", devices, CallSettings::default());

        h.controller.start_call().unwrap();
        h.pump().await;

        assert_eq!(h.controller.state(), CallState::Ended);
        match h.notices.try_recv().unwrap() {
            Notice::CallFailed(reason) => assert!(reason.contains("denied")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(h.sent("callOffer").is_empty());
    }

    #[tokio::test]
    async fn test_remote_end_is_not_echoed() {
        let mut h = Harness::new("u1");
        h.controller.start_call().unwrap();
        h.pump().await;

        h.inbound("callEnded", json!({})).await;
        assert_eq!(h.controller.state(), CallState::Ended);
        assert!(h.sent("callEnded").is_empty());
        assert_eq!(h.devices.stops(), 1);

        // A local end right after is a no-op.
        h.controller.end_call();
        assert!(h.sent("callEnded").is_empty());
        assert_eq!(h.devices.stops(), 1);
    }

    #[tokio::test]
    async fn test_glare_smaller_id_keeps_caller_role() {
        let mut h = Harness::new("alice");
        h.controller.start_call().unwrap();
        h.pump().await;

        h.inbound("callOffer", offer_payload("bob")).await;
        h.pump().await;
        assert_eq!(h.controller.state(), CallState::Outgoing);
        assert_eq!(h.controller.role(), CallRole::Caller);
        assert_eq!(h.connector.count(), 1);
        assert!(h.sent("callAnswer").is_empty());
    }

    #[tokio::test]
    async fn test_glare_larger_id_yields_and_answers() {
        let mut h = Harness::new("carol");
        h.controller.start_call().unwrap();
        h.pump().await;

        h.inbound("callOffer", offer_payload("bob")).await;
        assert_eq!(h.controller.state(), CallState::Answering);
        assert_eq!(h.connector.peer(0).closed(), 1);
        assert_eq!(h.devices.stops(), 1);
        h.pump().await;

        let answers = h.sent("callAnswer");
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0]["to"], "bob");
        assert!(h.sent("callEnded").is_empty());
        assert_eq!(h.connector.count(), 2);
    }

    #[tokio::test]
    async fn test_glare_reject_policy_ignores_offer() {
        let settings = CallSettings {
            glare: GlarePolicy::Reject,
            ..CallSettings::default()
        };
        let mut h = Harness::with("carol", FakeDevices::new(), settings);
        h.controller.start_call().unwrap();
        h.pump().await;

        h.inbound("callOffer", offer_payload("bob")).await;
        assert_eq!(h.controller.state(), CallState::Outgoing);
        assert_eq!(h.connector.count(), 1);
    }

    #[tokio::test]
    async fn test_offer_send_failure_fails_call() {
        let mut h = Harness::new("u1");
        h.transport.set_connected(false);
        h.controller.start_call().unwrap();
        h.pump().await;

        assert_eq!(h.controller.state(), CallState::Ended);
        assert!(matches!(h.notices.try_recv(), Ok(Notice::CallFailed(_))));
        assert_eq!(h.devices.stops(), 1);
        assert_eq!(h.connector.peer(0).closed(), 1);
    }

    #[tokio::test]
    async fn test_negotiation_failure_fails_call() {
        let mut h = Harness::new("u1");
        h.connector.fail_remote.store(true, Ordering::SeqCst);
        h.controller.start_call().unwrap();
        h.pump().await;

        h.inbound("callAnswer", answer_payload("v=0")).await;
        assert_eq!(h.controller.state(), CallState::Ended);
        assert!(matches!(h.notices.try_recv(), Ok(Notice::CallFailed(_))));
        assert_eq!(h.sent("callEnded").len(), 1);
    }

    #[tokio::test]
    async fn test_stray_events_while_idle_are_ignored() {
        let mut h = Harness::new("u1");
        h.inbound("callAnswer", answer_payload("v=0")).await;
        h.inbound("iceCandidate", candidate_payload("candidate:x")).await;
        h.inbound("callEnded", json!({})).await;
        assert_eq!(h.controller.state(), CallState::Idle);
        assert!(h.controller.session().pending_remote_candidates.is_empty());
        assert!(h.transport.sent_named("callEnded").is_empty());
    }

    #[tokio::test]
    async fn test_resolved_chat_rejects_start() {
        let mut h = Harness::new("u1");
        h.controller.set_chat_open(false);
        assert_eq!(h.controller.start_call(), Err(CallError::ChatClosed));
        assert_eq!(h.controller.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_dispose_releases_live_call() {
        let mut h = Harness::new("u1");
        h.controller.start_call().unwrap();
        h.pump().await;

        h.controller.dispose();
        assert_eq!(h.controller.state(), CallState::Idle);
        assert_eq!(h.devices.stops(), 1);
        assert_eq!(h.sent("callEnded").len(), 1);
    }

    #[tokio::test]
    async fn test_signal_only_peer_candidates_follow_offer() {
        let transport = RecordingTransport::new();
        let channel = SignalingChannel::new(transport.clone());
        let (timer_tx, _timers) = mpsc::unbounded_channel();
        let (notice_tx, _notices) = mpsc::unbounded_channel();
        let media = MediaResourceManager::new(Arc::new(SyntheticDevices), MediaConstraints::default());
        let (mut controller, mut inputs) = CallSessionController::new(
            "u1",
            channel.open("c1"),
            media,
            Arc::new(SignalOnlyConnector),
            CallSettings::default(),
            timer_tx,
            notice_tx,
        );

        controller.start_call().unwrap();
        for _ in 0..5 {
            tokio::task::yield_now().await;
            while let Ok(input) = inputs.try_recv() {
                controller.handle_input(input).await;
            }
        }

        let names: Vec<String> = transport
            .sent()
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| name != "joinChat")
            .collect();
        assert_eq!(names, vec!["callOffer", "iceCandidate"]);
        assert_eq!(transport.sent_named("iceCandidate")[0]["to"], serde_json::Value::Null);
    }
}
