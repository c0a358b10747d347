use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::{join_all, BoxFuture, FutureExt};
use getset::{CopyGetters, Getters};
use tracing::{debug, info, warn};

use crate::{
    error::{Error, TransportError},
    message::PeerId,
    peer::{PeerTransport, SenderId},
};

mod track;
pub use track::{LocalTrack, RemoteStream, RemoteTrack, TrackKind, TrackSource};

const LOCAL_STREAM_ID: &str = "local";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Default)]
pub struct CapturedMedia {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

/// Capture backend. Refusals map to [`Error::PermissionDenied`].
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn user_media(&self, constraints: MediaConstraints) -> Result<CapturedMedia, Error>;

    async fn display_media(&self) -> Result<LocalTrack, Error>;
}

/// Devices backed by static-sample tracks that a capture pipeline writes
/// encoded frames into.
#[derive(Debug, Clone)]
pub struct SampleTrackDevices {
    pub allow_microphone: bool,
    pub allow_camera: bool,
    pub allow_display: bool,
}

impl Default for SampleTrackDevices {
    fn default() -> Self {
        Self {
            allow_microphone: true,
            allow_camera: true,
            allow_display: true,
        }
    }
}

#[async_trait]
impl MediaDevices for SampleTrackDevices {
    async fn user_media(&self, constraints: MediaConstraints) -> Result<CapturedMedia, Error> {
        if constraints.audio && !self.allow_microphone {
            return Err(Error::PermissionDenied("microphone".to_string()));
        }
        if constraints.video && !self.allow_camera {
            return Err(Error::PermissionDenied("camera".to_string()));
        }
        Ok(CapturedMedia {
            audio: constraints
                .audio
                .then(|| LocalTrack::new(TrackSource::Microphone, LOCAL_STREAM_ID)),
            video: constraints
                .video
                .then(|| LocalTrack::new(TrackSource::Camera, LOCAL_STREAM_ID)),
        })
    }

    async fn display_media(&self) -> Result<LocalTrack, Error> {
        if !self.allow_display {
            return Err(Error::PermissionDenied("display".to_string()));
        }
        Ok(LocalTrack::new(TrackSource::Screen, LOCAL_STREAM_ID))
    }
}

/// Local capture state for one meeting session.
#[derive(Debug, Default, Getters, CopyGetters)]
pub struct LocalMediaState {
    #[getset(get = "pub")]
    audio_track: Option<LocalTrack>,
    #[getset(get = "pub")]
    video_track: Option<LocalTrack>,
    #[getset(get = "pub")]
    screen_track: Option<LocalTrack>,
    #[getset(get_copy = "pub")]
    audio_enabled: bool,
    #[getset(get_copy = "pub")]
    video_enabled: bool,
}

impl LocalMediaState {
    /// The video track currently on the wire: the screen while sharing,
    /// otherwise the camera.
    pub fn outbound_video(&self) -> Option<LocalTrack> {
        self.screen_track
            .clone()
            .or_else(|| self.video_track.clone())
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen_track.is_some()
    }
}

/// Tracks attached to the senders of a freshly created connection.
#[derive(Debug, Clone, Default)]
pub struct OutboundTracks {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

impl OutboundTracks {
    pub fn get(&self, kind: TrackKind) -> Option<LocalTrack> {
        match kind {
            TrackKind::Audio => self.audio.clone(),
            TrackKind::Video => self.video.clone(),
        }
    }
}

pub type Capture = BoxFuture<'static, Result<LocalTrack, Error>>;

pub enum VideoToggle {
    /// The camera was released; nothing left to do.
    Stopped,
    /// A new camera capture is under way and has to be installed with
    /// [`MediaController::install_camera`].
    Acquire(Capture),
}

/// Owns [`LocalMediaState`] and all access to capture devices.
pub struct MediaController {
    devices: Arc<dyn MediaDevices>,
    constraints: MediaConstraints,
    state: LocalMediaState,
    acquiring: bool,
}

impl std::fmt::Debug for MediaController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaController")
            .field("constraints", &self.constraints)
            .field("state", &self.state)
            .field("acquiring", &self.acquiring)
            .finish()
    }
}

impl MediaController {
    pub fn new(devices: Arc<dyn MediaDevices>, constraints: MediaConstraints) -> Self {
        Self {
            devices,
            constraints,
            state: LocalMediaState::default(),
            acquiring: false,
        }
    }

    pub fn state(&self) -> &LocalMediaState {
        &self.state
    }

    pub fn outbound(&self) -> OutboundTracks {
        OutboundTracks {
            audio: self.state.audio_track.clone(),
            video: self.state.outbound_video(),
        }
    }

    pub async fn acquire_local_media(&mut self) -> Result<(), Error> {
        let media = self.devices.user_media(self.constraints).await?;
        info!(
            audio = media.audio.is_some(),
            video = media.video.is_some(),
            "Acquired local media"
        );
        self.state.audio_enabled = media.audio.is_some();
        self.state.video_enabled = media.video.is_some();
        self.state.audio_track = media.audio;
        self.state.video_track = media.video;
        Ok(())
    }

    /// Mutes or unmutes the microphone in place. Returns the new state.
    pub fn toggle_audio(&mut self) -> bool {
        self.state.audio_enabled = !self.state.audio_enabled;
        if let Some(track) = &self.state.audio_track {
            track.set_enabled(self.state.audio_enabled);
        }
        debug!(enabled = self.state.audio_enabled, "Toggled audio");
        self.state.audio_enabled
    }

    pub fn toggle_video(&mut self) -> Result<VideoToggle, Error> {
        if self.state.video_enabled {
            if let Some(track) = self.state.video_track.take() {
                track.stop();
            }
            self.state.video_enabled = false;
            info!("Camera released");
            return Ok(VideoToggle::Stopped);
        }
        Ok(VideoToggle::Acquire(self.capture_camera()?))
    }

    fn capture_camera(&mut self) -> Result<Capture, Error> {
        if self.acquiring {
            return Err(Error::MediaBusy);
        }
        self.acquiring = true;
        let devices = self.devices.clone();
        Ok(async move {
            let media = devices
                .user_media(MediaConstraints {
                    audio: false,
                    video: true,
                })
                .await?;
            media
                .video
                .ok_or_else(|| Error::MediaUnavailable("no camera track".to_string()))
        }
        .boxed())
    }

    /// Installs the result of a camera capture. Returns the track that now has
    /// to be pushed to every sender, if any.
    pub fn install_camera(
        &mut self,
        capture: Result<LocalTrack, Error>,
    ) -> Result<Option<LocalTrack>, Error> {
        self.acquiring = false;
        let track = capture?;
        if let Some(previous) = self.state.video_track.replace(track.clone()) {
            previous.stop();
        }
        self.state.video_enabled = true;
        info!(track = track.id(), "Camera restarted");
        if self.state.is_screen_sharing() {
            return Ok(None);
        }
        Ok(Some(track))
    }

    pub fn capture_screen(&mut self) -> Result<Capture, Error> {
        if self.acquiring {
            return Err(Error::MediaBusy);
        }
        self.acquiring = true;
        let devices = self.devices.clone();
        Ok(async move { devices.display_media().await }.boxed())
    }

    pub fn install_screen(&mut self, capture: Result<LocalTrack, Error>) -> Result<LocalTrack, Error> {
        self.acquiring = false;
        let track = capture?;
        if let Some(previous) = self.state.screen_track.replace(track.clone()) {
            previous.stop();
        }
        info!(track = track.id(), "Screen share started");
        Ok(track)
    }

    /// Ends the screen share if `track_id` is the active one (or any share when
    /// `None`). Returns the camera track to revert senders to, wrapped in `Some`
    /// when a share was actually ended.
    pub fn end_screen_share(&mut self, track_id: Option<&str>) -> Option<Option<LocalTrack>> {
        let active = self.state.screen_track.as_ref()?;
        if let Some(id) = track_id {
            if active.id() != id {
                return None;
            }
        }
        let screen = self.state.screen_track.take()?;
        screen.stop();
        info!(track = screen.id(), "Screen share stopped");
        Some(self.state.video_track.clone())
    }

    /// User request to stop sharing. Refused with [`Error::MediaBusy`] while a
    /// capture is still pending, since that capture may be the share itself.
    pub fn stop_screen_share(&mut self) -> Result<Option<Option<LocalTrack>>, Error> {
        if self.acquiring {
            return Err(Error::MediaBusy);
        }
        Ok(self.end_screen_share(None))
    }

    pub fn stop_all(&mut self) {
        for track in [
            self.state.audio_track.take(),
            self.state.video_track.take(),
            self.state.screen_track.take(),
        ]
        .into_iter()
        .flatten()
        {
            track.stop();
        }
        self.state.audio_enabled = false;
        self.state.video_enabled = false;
    }
}

/// One sender to retarget.
pub struct ReplaceTarget {
    pub peer_id: PeerId,
    pub transport: Arc<dyn PeerTransport>,
    pub sender: SenderId,
}

/// Per-connection outcome of a track replacement.
#[derive(Debug, Default)]
pub struct ReplaceReport {
    pub replaced: Vec<PeerId>,
    pub skipped: Vec<PeerId>,
    pub failed: Vec<Error>,
}

impl ReplaceReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

enum Outcome {
    Replaced,
    Skipped,
    Failed(TransportError),
}

/// Points every target sender at `track`. Each replacement is attempted
/// independently; closed connections are skipped.
pub async fn replace_track_everywhere(
    targets: Vec<ReplaceTarget>,
    track: Option<LocalTrack>,
) -> ReplaceReport {
    let attempts = targets.into_iter().map(|target| {
        let track = track.clone();
        async move {
            if target.transport.is_closed() {
                return (target.peer_id, Outcome::Skipped);
            }
            let outcome = match target.transport.replace_track(target.sender, track).await {
                Ok(()) => Outcome::Replaced,
                Err(_) if target.transport.is_closed() => Outcome::Skipped,
                Err(e) => Outcome::Failed(e),
            };
            (target.peer_id, outcome)
        }
    });

    let mut report = ReplaceReport::default();
    for (peer_id, outcome) in join_all(attempts).await {
        match outcome {
            Outcome::Replaced => report.replaced.push(peer_id),
            Outcome::Skipped => report.skipped.push(peer_id),
            Outcome::Failed(source) => {
                warn!(%peer_id, ?source, "Track replacement failed");
                report
                    .failed
                    .push(Error::TrackReplaceFailed { peer_id, source });
            }
        }
    }
    report
}
