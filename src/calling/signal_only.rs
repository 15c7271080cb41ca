//! Peer that negotiates without a media plane.
//!
//! Produces and validates real SDP, gathers one host candidate and reports
//! the session connected once both descriptions are applied. Remote tracks
//! are announced as synthetic tracks for every section the remote sends.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use super::media::{MediaTrack, SyntheticTrack, TrackKind};
use super::peer::{PeerConfig, PeerConnector, PeerEvent, PeerEventSink, PeerSession};
use super::sdp::{self, Direction, LocalParams, SdpInfo};
use crate::signaling::events::{IceCandidate, SdpType, SessionDescription};

/// Discard port, as browsers advertise before ICE picks a real one.
const PLACEHOLDER_PORT: u16 = 9;

#[derive(Debug, Default)]
pub struct SignalOnlyConnector;

impl PeerConnector for SignalOnlyConnector {
    fn connect(&self, config: &PeerConfig, events: PeerEventSink) -> Result<Arc<dyn PeerSession>> {
        let params = LocalParams::generate(PLACEHOLDER_PORT)?;
        tracing::info!(
            "Peer created (ufrag={}, ice servers: {})",
            params.ice_ufrag,
            config.ice_servers.join(", ")
        );
        Ok(Arc::new(SignalOnlyPeer {
            params,
            events,
            state: Mutex::new(PeerState::default()),
        }))
    }
}

#[derive(Default)]
struct PeerState {
    kinds: Vec<TrackKind>,
    local: Option<SessionDescription>,
    remote: Option<SdpInfo>,
    remote_candidates: Vec<String>,
    connected: bool,
    closed: bool,
}

pub struct SignalOnlyPeer {
    params: LocalParams,
    events: PeerEventSink,
    state: Mutex<PeerState>,
}

impl SignalOnlyPeer {
    fn state(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open_state(&self) -> Result<MutexGuard<'_, PeerState>> {
        let state = self.state();
        if state.closed {
            bail!("Peer is closed");
        }
        Ok(state)
    }

    fn maybe_connect(&self, state: &mut PeerState) {
        if state.connected || state.local.is_none() || state.remote.is_none() {
            return;
        }
        state.connected = true;
        tracing::info!(
            "Peer connected ({} remote candidates)",
            state.remote_candidates.len()
        );
        self.events.emit(PeerEvent::Connected);
    }
}

#[async_trait]
impl PeerSession for SignalOnlyPeer {
    fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<()> {
        let mut state = self.open_state()?;
        if state.local.is_some() {
            bail!("Renegotiation is not supported");
        }
        state.kinds.push(track.kind());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let state = self.open_state()?;
        Ok(SessionDescription::offer(sdp::generate_offer(
            &self.params,
            &state.kinds,
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.open_state()?;
        let Some(remote) = &state.remote else {
            bail!("Cannot answer before the remote offer is set");
        };
        Ok(SessionDescription::answer(sdp::generate_answer(
            &self.params,
            remote,
            &state.kinds,
        )))
    }

    async fn set_local_description(&self, description: &SessionDescription) -> Result<()> {
        let info = sdp::parse_sdp(&description.sdp).context("Invalid local description")?;
        let mut state = self.open_state()?;
        state.local = Some(description.clone());

        let mid = info.media.first().and_then(|m| m.mid.clone());
        for candidate in info.candidates {
            self.events.emit(PeerEvent::LocalCandidate(IceCandidate {
                candidate,
                sdp_mid: mid.clone(),
                sdp_m_line_index: Some(0),
            }));
        }
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, description: &SessionDescription) -> Result<()> {
        let info = sdp::parse_sdp(&description.sdp).context("Invalid remote description")?;
        let mut state = self.open_state()?;
        if description.kind == SdpType::Answer && state.local.is_none() {
            bail!("Remote answer without a local offer");
        }

        for section in &info.media {
            if !matches!(section.direction, Direction::SendRecv | Direction::SendOnly) {
                continue;
            }
            let kind = match section.kind.as_str() {
                "audio" => TrackKind::Audio,
                "video" => TrackKind::Video,
                _ => continue,
            };
            self.events
                .emit(PeerEvent::RemoteTrack(Arc::new(SyntheticTrack::new(kind))));
        }
        state.remote_candidates.extend(info.candidates.iter().cloned());
        state.remote = Some(info);
        self.maybe_connect(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        let mut state = self.open_state()?;
        if state.remote.is_none() {
            bail!("ICE candidate before remote description");
        }
        tracing::debug!("Remote candidate: {}", candidate.candidate);
        state.remote_candidates.push(candidate.candidate.clone());
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state();
        if !state.closed {
            state.closed = true;
            tracing::info!("Peer closed");
        }
    }
}
