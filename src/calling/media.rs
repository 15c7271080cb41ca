//! Local capture devices and the remote playback sink.
//!
//! Local tracks are held by a [`LocalTracks`] guard that stops them exactly
//! once, either through an explicit `release()` or on drop, so every exit
//! path of a call (including a negotiation abandoned mid-flight) gives the
//! devices back.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which devices to open for a call. Audio only by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("permission to use capture devices was denied")]
    PermissionDenied,
    #[error("capture device is busy: {0}")]
    DeviceBusy(String),
    #[error("no {0} capture device available")]
    NoDevice(TrackKind),
}

/// A capture or playback track.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    /// Stop the underlying device. Only called once per track.
    fn stop(&self);
}

/// Source of local capture tracks.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open the requested devices. May suspend on a permission prompt.
    async fn open(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<dyn MediaTrack>>, MediaError>;
}

/// Where remote tracks are rendered.
pub trait RemoteSink: Send + Sync {
    fn attach(&self, track: Arc<dyn MediaTrack>);
    fn clear(&self);
}

/// Scoped ownership of acquired local tracks.
pub struct LocalTracks {
    tracks: Vec<Arc<dyn MediaTrack>>,
    released: bool,
}

impl LocalTracks {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            tracks,
            released: false,
        }
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn kinds(&self) -> Vec<TrackKind> {
        self.tracks.iter().map(|t| t.kind()).collect()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Stop every track. Idempotent: returns how many tracks this call
    /// stopped, which is zero on every call after the first.
    pub fn release(&mut self) -> usize {
        if self.released {
            return 0;
        }
        self.released = true;
        for track in &self.tracks {
            tracing::debug!("Stopping local {} track {}", track.kind(), track.id());
            track.stop();
        }
        self.tracks.len()
    }
}

impl Drop for LocalTracks {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for LocalTracks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTracks")
            .field("kinds", &self.kinds())
            .field("released", &self.released)
            .finish()
    }
}

/// Owns the local tracks and the remote sink for one call at a time.
pub struct MediaResourceManager {
    devices: Arc<dyn MediaDevices>,
    constraints: MediaConstraints,
    local: Option<LocalTracks>,
    sink: Option<Arc<dyn RemoteSink>>,
    remote_tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaResourceManager {
    pub fn new(devices: Arc<dyn MediaDevices>, constraints: MediaConstraints) -> Self {
        Self {
            devices,
            constraints,
            local: None,
            sink: None,
            remote_tracks: Vec::new(),
        }
    }

    /// Acquire local tracks.
    ///
    /// The returned future does not borrow the manager, so it can run in a
    /// task while the event loop keeps processing. The caller decides later
    /// whether to [`adopt`](Self::adopt) the tracks or drop them.
    pub fn acquire_local(
        &self,
    ) -> impl Future<Output = Result<LocalTracks, MediaError>> + Send + 'static {
        let devices = Arc::clone(&self.devices);
        let constraints = self.constraints;
        async move {
            let tracks = devices.open(&constraints).await?;
            tracing::info!("Acquired {} local tracks", tracks.len());
            Ok(LocalTracks::new(tracks))
        }
    }

    /// Take ownership of acquired tracks for the current call.
    pub fn adopt(&mut self, tracks: LocalTracks) {
        if let Some(mut previous) = self.local.replace(tracks) {
            tracing::warn!("Replacing local tracks that were still held");
            previous.release();
        }
    }

    pub fn has_local(&self) -> bool {
        self.local.as_ref().is_some_and(|l| !l.is_released())
    }

    /// Set the sink remote tracks render into. Tracks that arrived before
    /// the sink are attached immediately.
    pub fn attach_remote(&mut self, sink: Arc<dyn RemoteSink>) {
        for track in &self.remote_tracks {
            sink.attach(Arc::clone(track));
        }
        self.sink = Some(sink);
    }

    /// A remote track was announced by the peer.
    pub fn push_remote_track(&mut self, track: Arc<dyn MediaTrack>) {
        tracing::info!("Remote {} track {}", track.kind(), track.id());
        if let Some(sink) = &self.sink {
            sink.attach(Arc::clone(&track));
        }
        self.remote_tracks.push(track);
    }

    pub fn remote_track_count(&self) -> usize {
        self.remote_tracks.len()
    }

    pub fn clear_remote(&mut self) {
        self.remote_tracks.clear();
        if let Some(sink) = &self.sink {
            sink.clear();
        }
    }

    /// Stop local tracks and clear the remote sink. Safe to call any number
    /// of times; tracks are only ever stopped once.
    pub fn release(&mut self) -> usize {
        let stopped = match self.local.take() {
            Some(mut local) => local.release(),
            None => 0,
        };
        self.clear_remote();
        stopped
    }
}

/// Track backed by no real device, for headless use.
pub struct SyntheticTrack {
    id: String,
    kind: TrackKind,
}

impl SyntheticTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
        }
    }
}

impl MediaTrack for SyntheticTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        tracing::info!("Synthetic {} track {} stopped", self.kind, self.id);
    }
}

/// Devices that always succeed with synthetic tracks.
#[derive(Debug, Default)]
pub struct SyntheticDevices;

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<Vec<Arc<dyn MediaTrack>>, MediaError> {
        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(SyntheticTrack::new(TrackKind::Audio)));
        }
        if constraints.video {
            tracks.push(Arc::new(SyntheticTrack::new(TrackKind::Video)));
        }
        Ok(tracks)
    }
}

/// Remote sink that records which tracks are attached.
#[derive(Default)]
pub struct TrackListSink {
    tracks: Mutex<Vec<(String, TrackKind)>>,
}

impl TrackListSink {
    pub fn attached(&self) -> Vec<(String, TrackKind)> {
        self.tracks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl RemoteSink for TrackListSink {
    fn attach(&self, track: Arc<dyn MediaTrack>) {
        self.tracks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((track.id().to_string(), track.kind()));
    }

    fn clear(&self) {
        self.tracks.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::testing::{CountingTrack, FakeDevices};
    use super::*;

    fn counting(stops: &Arc<AtomicUsize>) -> Arc<dyn MediaTrack> {
        Arc::new(CountingTrack {
            kind: TrackKind::Audio,
            stops: Arc::clone(stops),
        })
    }

    #[test]
    fn test_local_tracks_release_is_idempotent() {
        let stops = Arc::new(AtomicUsize::new(0));
        let mut local = LocalTracks::new(vec![counting(&stops), counting(&stops)]);
        assert_eq!(local.release(), 2);
        assert_eq!(local.release(), 0);
        drop(local);
        assert_eq!(stops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dropping_unadopted_tracks_releases_them() {
        let stops = Arc::new(AtomicUsize::new(0));
        {
            let _local = LocalTracks::new(vec![counting(&stops)]);
        }
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_manager_release_twice() {
        let devices = FakeDevices::new();
        let mut manager = MediaResourceManager::new(devices.clone(), MediaConstraints::default());
        let local = manager.acquire_local().await.unwrap();
        manager.adopt(local);
        assert!(manager.has_local());

        assert_eq!(manager.release(), 1);
        assert_eq!(manager.release(), 0);
        assert_eq!(devices.stops(), 1);
        assert!(!manager.has_local());
    }

    #[tokio::test]
    async fn test_acquisition_failure_is_reported() {
        let devices = FakeDevices::new();
        devices.fail_with(MediaError::PermissionDenied);
        let manager = MediaResourceManager::new(devices, MediaConstraints::default());
        assert_eq!(
            manager.acquire_local().await.unwrap_err(),
            MediaError::PermissionDenied
        );
    }

    #[test]
    fn test_remote_sink_receives_early_tracks_and_clears() {
        let mut manager = MediaResourceManager::new(
            Arc::new(SyntheticDevices),
            MediaConstraints::default(),
        );
        manager.push_remote_track(Arc::new(SyntheticTrack::new(TrackKind::Video)));

        let sink = Arc::new(TrackListSink::default());
        manager.attach_remote(sink.clone());
        assert_eq!(sink.attached().len(), 1);

        manager.push_remote_track(Arc::new(SyntheticTrack::new(TrackKind::Audio)));
        assert_eq!(sink.attached().len(), 2);

        manager.release();
        assert!(sink.attached().is_empty());
        assert_eq!(manager.remote_track_count(), 0);
    }

    #[tokio::test]
    async fn test_synthetic_devices_follow_constraints() {
        let tracks = SyntheticDevices
            .open(&MediaConstraints {
                audio: true,
                video: false,
            })
            .await
            .unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].kind(), TrackKind::Audio);
    }
}
