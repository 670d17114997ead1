//! Local media lifecycle.
//!
//! `MediaController` owns the local camera/microphone stream and the optional
//! display-capture stream for the duration of one call. It is the only
//! component that stops tracks; peer links hold clones of track handles and
//! read them but never change their state.
//!
//! Acquisition is split in two so the coordinator can await the device layer
//! off its own loop: `request()` returns a detached future, `install()` takes
//! ownership of the resulting stream.

use crate::actors::metrics::SessionMetrics;
use crate::errors::MediaError;
use crate::observability;
use crate::peers::PeerConnectionManager;

use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Kind of media a track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Where a track's media comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
    /// Received from a remote peer.
    Remote,
}

#[derive(Debug)]
struct TrackInner {
    id: String,
    kind: TrackKind,
    source: TrackSource,
    enabled: AtomicBool,
    stop: CancellationToken,
}

/// Shared handle to one media track.
///
/// Clones refer to the same track. The device implementation watches
/// `ended()` to release hardware once the owner calls `stop()`.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    /// Create a live, enabled track.
    #[must_use]
    pub fn new(kind: TrackKind, source: TrackSource) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4().to_string(),
                kind,
                source,
                enabled: AtomicBool::new(true),
                stop: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    #[must_use]
    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Stop the track. Idempotent.
    pub fn stop(&self) {
        self.inner.stop.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Resolves once the track has been stopped, by its owner or by the
    /// device layer (e.g. the user ending a screen share from the OS).
    pub fn ended(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.inner.stop.clone();
        async move { token.cancelled().await }
    }

    /// Whether two handles refer to the same track.
    #[must_use]
    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// An ordered set of tracks acquired together.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    #[must_use]
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    #[must_use]
    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    #[must_use]
    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Stop every track; returns how many were still live.
    pub fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for track in &self.tracks {
            if !track.is_stopped() {
                track.stop();
                stopped += 1;
            }
        }
        stopped
    }
}

/// Ideal capture parameters for video.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoQuality {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for VideoQuality {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
        }
    }
}

/// Audio processing toggles requested from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioProcessing {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioProcessing {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// What to ask the device layer for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
    pub video_quality: VideoQuality,
    pub audio_processing: AudioProcessing,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::audio_video()
    }
}

impl MediaConstraints {
    /// Camera and microphone with ideal capture parameters.
    #[must_use]
    pub fn audio_video() -> Self {
        Self {
            video: true,
            audio: true,
            video_quality: VideoQuality::default(),
            audio_processing: AudioProcessing::default(),
        }
    }

    #[must_use]
    pub fn audio_only() -> Self {
        Self {
            video: false,
            ..Self::audio_video()
        }
    }

    #[must_use]
    pub fn video_only() -> Self {
        Self {
            audio: false,
            ..Self::audio_video()
        }
    }

    /// Nothing requested; such a call carries no outgoing media.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.video && !self.audio
    }

    /// Reduced constraint sets to try, in order, after a relaxable failure.
    ///
    /// Video is dropped first, then audio. Single-kind requests have nothing
    /// left to drop.
    #[must_use]
    pub fn fallbacks(&self) -> Vec<MediaConstraints> {
        if self.video && self.audio {
            vec![
                MediaConstraints {
                    video: false,
                    ..*self
                },
                MediaConstraints {
                    audio: false,
                    ..*self
                },
            ]
        } else {
            Vec::new()
        }
    }

    /// Short label for logs.
    #[must_use]
    pub fn describe(&self) -> &'static str {
        match (self.video, self.audio) {
            (true, true) => "audio_video",
            (false, true) => "audio_only",
            (true, false) => "video_only",
            (false, false) => "none",
        }
    }
}

/// A failure reported by the device API, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFailure {
    /// Error name, e.g. `NotAllowedError`.
    pub name: String,
    pub message: String,
}

impl DeviceFailure {
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Device API seam: camera, microphone and display capture.
#[async_trait]
pub trait MediaDevices: Send + Sync + 'static {
    /// Open camera and/or microphone per `constraints`.
    async fn request_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, DeviceFailure>;

    /// Open a display-capture stream (user picks the surface).
    async fn request_display_media(&self) -> Result<MediaStream, DeviceFailure>;
}

/// Tracks a peer link should send.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMedia {
    pub audio: Option<MediaTrack>,
    /// Camera track, or the display track while screen sharing.
    pub video: Option<MediaTrack>,
}

/// Read model of local media for the presentation layer.
#[derive(Debug, Clone, Default)]
pub struct LocalMediaState {
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub has_video: bool,
    pub has_audio: bool,
    pub screen_sharing: bool,
    pub local_stream: Option<MediaStream>,
}

/// Owner of local media for one call.
pub struct MediaController {
    devices: Arc<dyn MediaDevices>,
    metrics: Arc<SessionMetrics>,
    local_stream: Option<MediaStream>,
    screen_stream: Option<MediaStream>,
}

impl MediaController {
    #[must_use]
    pub fn new(devices: Arc<dyn MediaDevices>, metrics: Arc<SessionMetrics>) -> Self {
        Self {
            devices,
            metrics,
            local_stream: None,
            screen_stream: None,
        }
    }

    /// Ask the device layer for media without touching controller state.
    ///
    /// The returned future is independent of `self`; pass its stream to
    /// `install()` if it is still wanted when it resolves.
    pub fn request(
        &self,
        constraints: MediaConstraints,
    ) -> impl Future<Output = Result<MediaStream, MediaError>> + Send + 'static {
        let devices = Arc::clone(&self.devices);
        let metrics = Arc::clone(&self.metrics);
        async move {
            metrics.record_media_request();
            debug!(
                target: "mesh.session.media",
                constraints = constraints.describe(),
                "Requesting local media"
            );
            match devices.request_media(constraints).await {
                Ok(stream) if stream.is_empty() => {
                    let err = MediaError::DeviceNotFound;
                    observability::record_media_acquire(err.as_label());
                    warn!(
                        target: "mesh.session.media",
                        constraints = constraints.describe(),
                        stream_id = %stream.id(),
                        "Device layer returned a stream without tracks"
                    );
                    Err(err)
                }
                Ok(stream) => {
                    observability::record_media_acquire("success");
                    Ok(stream)
                }
                Err(failure) => {
                    let err = MediaError::classify(&failure.name, &failure.message);
                    observability::record_media_acquire(err.as_label());
                    warn!(
                        target: "mesh.session.media",
                        constraints = constraints.describe(),
                        device_error = %failure.name,
                        kind = err.as_label(),
                        "Local media request failed"
                    );
                    Err(err)
                }
            }
        }
    }

    /// Take ownership of an acquired stream as the call's local stream.
    ///
    /// A previously installed stream is stopped first.
    pub fn install(&mut self, stream: MediaStream) -> MediaStream {
        if let Some(previous) = self.local_stream.take() {
            previous.stop_all();
        }
        info!(
            target: "mesh.session.media",
            stream_id = %stream.id(),
            has_video = stream.video_track().is_some(),
            has_audio = stream.audio_track().is_some(),
            "Local media installed"
        );
        self.local_stream = Some(stream.clone());
        stream
    }

    /// Request and install in one step.
    pub async fn acquire(
        &mut self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        let stream = self.request(constraints).await?;
        Ok(self.install(stream))
    }

    #[must_use]
    pub fn local_stream(&self) -> Option<&MediaStream> {
        self.local_stream.as_ref()
    }

    #[must_use]
    pub fn is_screen_sharing(&self) -> bool {
        self.screen_stream.is_some()
    }

    /// Tracks peer links should currently send, or `None` without local media.
    #[must_use]
    pub fn outgoing(&self) -> Option<OutgoingMedia> {
        let local = self.local_stream.as_ref()?;
        Some(OutgoingMedia {
            audio: local.audio_track().cloned(),
            video: self.outgoing_video(),
        })
    }

    fn outgoing_video(&self) -> Option<MediaTrack> {
        self.screen_stream
            .as_ref()
            .and_then(MediaStream::video_track)
            .or_else(|| self.local_stream.as_ref().and_then(MediaStream::video_track))
            .cloned()
    }

    /// Set the camera track's enabled flag. Returns false without a camera track.
    pub fn set_video_enabled(&mut self, enabled: bool) -> bool {
        self.set_enabled(TrackKind::Video, enabled)
    }

    /// Set the microphone track's enabled flag. Returns false without one.
    pub fn set_audio_enabled(&mut self, enabled: bool) -> bool {
        self.set_enabled(TrackKind::Audio, enabled)
    }

    fn set_enabled(&mut self, kind: TrackKind, enabled: bool) -> bool {
        let track = self.local_stream.as_ref().and_then(|s| match kind {
            TrackKind::Audio => s.audio_track(),
            TrackKind::Video => s.video_track(),
        });
        match track {
            Some(track) => {
                track.set_enabled(enabled);
                debug!(
                    target: "mesh.session.media",
                    kind = ?kind,
                    enabled = enabled,
                    "Track toggled"
                );
                true
            }
            None => false,
        }
    }

    /// Ask the device layer for a display-capture stream.
    pub fn request_display(
        &self,
    ) -> impl Future<Output = Result<MediaStream, MediaError>> + Send + 'static {
        let devices = Arc::clone(&self.devices);
        async move {
            devices
                .request_display_media()
                .await
                .map_err(|failure| MediaError::classify(&failure.name, &failure.message))
        }
    }

    /// Make `display` the outgoing video on every link.
    ///
    /// Returns the display track so the caller can watch for it ending.
    /// A display stream without a video track is stopped and rejected.
    pub async fn start_screen_share(
        &mut self,
        display: MediaStream,
        peers: &mut PeerConnectionManager,
    ) -> Result<MediaTrack, MediaError> {
        let Some(track) = display.video_track().cloned() else {
            display.stop_all();
            return Err(MediaError::Unknown(
                "display capture returned no video track".to_string(),
            ));
        };

        if let Some(previous) = self.screen_stream.take() {
            previous.stop_all();
        }
        self.screen_stream = Some(display);
        peers.replace_outgoing_video(Some(track.clone())).await;

        info!(
            target: "mesh.session.media",
            track_id = %track.id(),
            "Screen share started"
        );
        Ok(track)
    }

    /// Stop screen sharing and restore the camera (or no video) on every link.
    ///
    /// Returns false if no screen share was active.
    pub async fn stop_screen_share(&mut self, peers: &mut PeerConnectionManager) -> bool {
        let Some(display) = self.screen_stream.take() else {
            return false;
        };
        display.stop_all();
        peers.replace_outgoing_video(self.outgoing_video()).await;

        info!(target: "mesh.session.media", "Screen share stopped");
        true
    }

    /// Whether `track` is the display track currently being shared.
    #[must_use]
    pub fn is_current_screen_track(&self, track_id: &str) -> bool {
        self.screen_stream
            .as_ref()
            .and_then(MediaStream::video_track)
            .is_some_and(|t| t.id() == track_id)
    }

    /// Stop every local track (camera, microphone, display) and forget them.
    ///
    /// Idempotent. Returns the number of tracks that were still live.
    pub fn release(&mut self) -> usize {
        let mut stopped = 0;
        if let Some(display) = self.screen_stream.take() {
            stopped += display.stop_all();
        }
        if let Some(local) = self.local_stream.take() {
            stopped += local.stop_all();
        }
        self.metrics.record_media_release();
        if stopped > 0 {
            info!(
                target: "mesh.session.media",
                tracks_stopped = stopped,
                "Local media released"
            );
        }
        stopped
    }

    /// Read model of the current local media.
    #[must_use]
    pub fn state(&self) -> LocalMediaState {
        let video = self.local_stream.as_ref().and_then(MediaStream::video_track);
        let audio = self.local_stream.as_ref().and_then(MediaStream::audio_track);
        LocalMediaState {
            video_enabled: video.is_some_and(MediaTrack::is_enabled),
            audio_enabled: audio.is_some_and(MediaTrack::is_enabled),
            has_video: video.is_some(),
            has_audio: audio.is_some(),
            screen_sharing: self.screen_stream.is_some(),
            local_stream: self.local_stream.clone(),
        }
    }
}
