//! Peer connection abstraction.
//!
//! The call controller only ever talks to a [`PeerSession`]; how the media
//! plane is actually carried is up to the [`PeerConnector`] it was given.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::media::MediaTrack;
use super::CallInput;
use crate::signaling::events::{IceCandidate, SessionDescription};

/// Peer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// STUN/TURN URLs.
    pub ice_servers: Vec<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
        }
    }
}

/// Asynchronous notifications from a peer.
#[derive(Clone)]
pub enum PeerEvent {
    /// A local ICE candidate was gathered and should be signaled.
    LocalCandidate(IceCandidate),
    /// The remote side started sending a track.
    RemoteTrack(Arc<dyn MediaTrack>),
    /// The transport is connected.
    Connected,
    /// The transport failed permanently.
    Failed(String),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            PeerEvent::RemoteTrack(t) => f
                .debug_tuple("RemoteTrack")
                .field(&format_args!("{} {}", t.kind(), t.id()))
                .finish(),
            PeerEvent::Connected => f.write_str("Connected"),
            PeerEvent::Failed(reason) => f.debug_tuple("Failed").field(reason).finish(),
        }
    }
}

/// Routes peer events back into the owning event loop, tagged with the
/// call attempt they belong to.
#[derive(Clone)]
pub struct PeerEventSink {
    attempt: u64,
    tx: mpsc::UnboundedSender<CallInput>,
}

impl PeerEventSink {
    pub fn new(attempt: u64, tx: mpsc::UnboundedSender<CallInput>) -> Self {
        Self { attempt, tx }
    }

    pub fn emit(&self, event: PeerEvent) {
        // The loop is gone once the conversation closed; nothing to do then.
        let _ = self.tx.send(CallInput::Peer {
            attempt: self.attempt,
            event,
        });
    }
}

/// One peer-to-peer session.
#[async_trait]
pub trait PeerSession: Send + Sync {
    fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<()>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: &SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()>;
    /// Tear the session down. Idempotent.
    fn close(&self);
}

/// Creates peer sessions.
pub trait PeerConnector: Send + Sync {
    fn connect(&self, config: &PeerConfig, events: PeerEventSink) -> Result<Arc<dyn PeerSession>>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::bail;

    use super::*;

    /// Peer that records what the controller did to it.
    #[derive(Default)]
    pub struct FakePeer {
        pub tracks: AtomicUsize,
        pub local: Mutex<Option<SessionDescription>>,
        pub remote: Mutex<Option<SessionDescription>>,
        pub candidates: Mutex<Vec<IceCandidate>>,
        pub closed: AtomicUsize,
        pub fail_remote: AtomicBool,
    }

    impl FakePeer {
        pub fn applied_candidates(&self) -> Vec<String> {
            self.candidates
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.candidate.clone())
                .collect()
        }

        pub fn closed(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PeerSession for FakePeer {
        fn add_track(&self, _track: Arc<dyn MediaTrack>) -> Result<()> {
            self.tracks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn create_offer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription::offer("v=0 offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription> {
            Ok(SessionDescription::answer("v=0 answer"))
        }

        async fn set_local_description(&self, description: &SessionDescription) -> Result<()> {
            *self.local.lock().unwrap() = Some(description.clone());
            Ok(())
        }

        async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
            if self.fail_remote.load(Ordering::SeqCst) {
                bail!("rejected remote description");
            }
            *self.remote.lock().unwrap() = Some(description.clone());
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
            if self.remote.lock().unwrap().is_none() {
                bail!("candidate before remote description");
            }
            self.candidates.lock().unwrap().push(candidate.clone());
            Ok(())
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Connector that hands out [`FakePeer`]s and keeps their event sinks
    /// so tests can play the transport.
    #[derive(Default)]
    pub struct FakeConnector {
        pub peers: Mutex<Vec<(Arc<FakePeer>, PeerEventSink)>>,
        pub fail_remote: AtomicBool,
    }

    impl FakeConnector {
        pub fn peer(&self, index: usize) -> Arc<FakePeer> {
            Arc::clone(&self.peers.lock().unwrap()[index].0)
        }

        pub fn count(&self) -> usize {
            self.peers.lock().unwrap().len()
        }

        /// Emit an event from the most recent peer.
        pub fn emit_last(&self, event: PeerEvent) {
            let peers = self.peers.lock().unwrap();
            if let Some((_, sink)) = peers.last() {
                sink.emit(event);
            }
        }
    }

    impl PeerConnector for FakeConnector {
        fn connect(
            &self,
            _config: &PeerConfig,
            events: PeerEventSink,
        ) -> Result<Arc<dyn PeerSession>> {
            let peer = Arc::new(FakePeer::default());
            peer.fail_remote
                .store(self.fail_remote.load(Ordering::SeqCst), Ordering::SeqCst);
            self.peers.lock().unwrap().push((Arc::clone(&peer), events));
            Ok(peer)
        }
    }
}
