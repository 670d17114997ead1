//! Mock device layer.
//!
//! `MockMediaDevices` hands out fresh camera/microphone tracks matching the
//! requested constraints, or a scripted failure. Every issued track is kept so
//! tests can check that the session stopped it.

use async_trait::async_trait;
use mesh_session::media::{
    DeviceFailure, MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind,
    TrackSource,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Mock camera, microphone and display capture.
#[derive(Debug, Clone, Default)]
pub struct MockMediaDevices {
    inner: Arc<Mutex<DevicesState>>,
}

#[derive(Debug, Default)]
struct DevicesState {
    /// Failure per constraint shape (video, audio); `None` key fails all.
    failures: Vec<(Option<(bool, bool)>, DeviceFailure)>,
    /// Failures consumed one per request before the shape rules apply.
    next_failures: VecDeque<DeviceFailure>,
    display_failure: Option<DeviceFailure>,
    delay: Option<Duration>,
    /// Hand out streams with no tracks, as a device layer with nothing attached.
    empty_streams: bool,
    requests: Vec<MediaConstraints>,
    display_requests: usize,
    issued: Vec<MediaStream>,
    displays: Vec<MediaStream>,
}

impl MockMediaDevices {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every camera/microphone request with the named device error.
    #[must_use]
    pub fn failing_with(self, name: &str) -> Self {
        self.lock()
            .failures
            .push((None, DeviceFailure::new(name, format!("mock {name}"))));
        self
    }

    /// Fail requests that ask for exactly `video`/`audio`.
    #[must_use]
    pub fn failing_for(self, video: bool, audio: bool, name: &str) -> Self {
        self.lock().failures.push((
            Some((video, audio)),
            DeviceFailure::new(name, format!("mock {name}")),
        ));
        self
    }

    /// Fail the next request only.
    #[must_use]
    pub fn failing_once_with(self, name: &str) -> Self {
        self.lock()
            .next_failures
            .push_back(DeviceFailure::new(name, format!("mock {name}")));
        self
    }

    /// Fail display capture with the named device error.
    #[must_use]
    pub fn with_display_failure(self, name: &str) -> Self {
        self.lock().display_failure = Some(DeviceFailure::new(name, format!("mock {name}")));
        self
    }

    /// Succeed every camera/microphone request with an empty stream.
    #[must_use]
    pub fn with_empty_streams(self) -> Self {
        self.lock().empty_streams = true;
        self
    }

    /// Delay every camera/microphone request.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        self.lock().delay = Some(delay);
        self
    }

    #[must_use]
    pub fn as_devices(&self) -> Arc<dyn MediaDevices> {
        Arc::new(self.clone())
    }

    /// Camera/microphone requests made, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.lock().requests.clone()
    }

    #[must_use]
    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    #[must_use]
    pub fn display_request_count(&self) -> usize {
        self.lock().display_requests
    }

    /// Camera/microphone streams handed out.
    #[must_use]
    pub fn issued_streams(&self) -> Vec<MediaStream> {
        self.lock().issued.clone()
    }

    /// Display streams handed out.
    #[must_use]
    pub fn display_streams(&self) -> Vec<MediaStream> {
        self.lock().displays.clone()
    }

    /// Issued tracks (camera, microphone and display) not yet stopped.
    #[must_use]
    pub fn live_track_count(&self) -> usize {
        let state = self.lock();
        state
            .issued
            .iter()
            .chain(state.displays.iter())
            .flat_map(MediaStream::tracks)
            .filter(|t| !t.is_stopped())
            .count()
    }

    /// End the current display capture as if the user stopped it from the OS.
    pub fn end_display_capture(&self) {
        if let Some(display) = self.lock().displays.last() {
            display.stop_all();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DevicesState> {
        self.inner.lock().unwrap()
    }

    fn scripted_failure(&self, constraints: &MediaConstraints) -> Option<DeviceFailure> {
        let mut state = self.lock();
        state.requests.push(*constraints);
        if let Some(failure) = state.next_failures.pop_front() {
            return Some(failure);
        }
        let shape = (constraints.video, constraints.audio);
        state
            .failures
            .iter()
            .find(|(when, _)| when.map_or(true, |w| w == shape))
            .map(|(_, failure)| failure.clone())
    }
}

#[async_trait]
impl MediaDevices for MockMediaDevices {
    async fn request_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, DeviceFailure> {
        let failure = self.scripted_failure(&constraints);
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(failure) = failure {
            return Err(failure);
        }

        let mut tracks = Vec::new();
        let empty = self.lock().empty_streams;
        if constraints.audio && !empty {
            tracks.push(MediaTrack::new(TrackKind::Audio, TrackSource::Microphone));
        }
        if constraints.video && !empty {
            tracks.push(MediaTrack::new(TrackKind::Video, TrackSource::Camera));
        }
        let stream = MediaStream::new(tracks);
        self.lock().issued.push(stream.clone());
        Ok(stream)
    }

    async fn request_display_media(&self) -> Result<MediaStream, DeviceFailure> {
        let mut state = self.lock();
        state.display_requests += 1;
        if let Some(failure) = state.display_failure.clone() {
            return Err(failure);
        }
        let stream = MediaStream::new(vec![MediaTrack::new(TrackKind::Video, TrackSource::Screen)]);
        state.displays.push(stream.clone());
        Ok(stream)
    }
}
