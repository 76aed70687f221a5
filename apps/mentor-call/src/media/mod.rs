//! Local capture with graceful degradation.
//!
//! [`MediaAcquirer`] opens whatever subset of audio and video it can. One
//! usable track is enough to proceed; none is a [`PermissionError`] that the
//! session surfaces until the user picks a [`RecoveryAction`].

pub mod devices;
pub mod track;

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use uuid::Uuid;

pub use devices::{DeviceBehavior, DeviceError, MediaDevices, SyntheticDevices};
pub use track::{LocalStream, LocalTrack};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

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

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn wants(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }

    pub fn without(mut self, kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => self.audio = false,
            MediaKind::Video => self.video = false,
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }

    fn kinds(&self) -> impl Iterator<Item = MediaKind> + '_ {
        [MediaKind::Audio, MediaKind::Video]
            .into_iter()
            .filter(|kind| self.wants(*kind))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PermissionState {
    #[default]
    NotRequested,
    Granted,
    Denied,
    /// No capture device of this class exists.
    Unavailable,
    /// A device exists but could not be started.
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaState {
    pub has_audio: bool,
    pub has_video: bool,
    pub is_audio_denied: bool,
    pub is_video_denied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PermissionError {
    /// `fallback` names the class that was not denied and still has a
    /// device behind it, if any.
    #[error("camera/microphone permission denied (audio: {audio}, video: {video})")]
    PermissionDenied {
        audio: bool,
        video: bool,
        fallback: Option<MediaKind>,
    },
    #[error("no camera or microphone found")]
    DeviceNotFound,
    #[error("could not start media: {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry,
    ContinueAudioOnly,
    ContinueVideoOnly,
    GoBack,
}

impl PermissionError {
    pub fn recovery_actions(&self) -> Vec<RecoveryAction> {
        let mut actions = vec![RecoveryAction::Retry];
        if let PermissionError::PermissionDenied { fallback, .. } = self {
            match fallback {
                Some(MediaKind::Audio) => actions.push(RecoveryAction::ContinueAudioOnly),
                Some(MediaKind::Video) => actions.push(RecoveryAction::ContinueVideoOnly),
                None => {}
            }
        }
        actions.push(RecoveryAction::GoBack);
        actions
    }
}

#[derive(Debug, Clone)]
pub struct AcquiredMedia {
    pub stream: LocalStream,
    pub state: MediaState,
}

#[derive(Debug, Default)]
struct Ledger {
    audio: PermissionState,
    video: PermissionState,
    retry_audio: bool,
    retry_video: bool,
}

impl Ledger {
    fn state(&self, kind: MediaKind) -> PermissionState {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }

    fn record(&mut self, kind: MediaKind, state: PermissionState) {
        match kind {
            MediaKind::Audio => {
                self.audio = state;
                self.retry_audio = false;
            }
            MediaKind::Video => {
                self.video = state;
                self.retry_video = false;
            }
        }
    }

    fn retry_allowed(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.retry_audio,
            MediaKind::Video => self.retry_video,
        }
    }

    fn media_state(&self, stream: Option<&LocalStream>) -> MediaState {
        MediaState {
            has_audio: stream.is_some_and(|s| s.has(MediaKind::Audio)),
            has_video: stream.is_some_and(|s| s.has(MediaKind::Video)),
            is_audio_denied: self.audio == PermissionState::Denied,
            is_video_denied: self.video == PermissionState::Denied,
        }
    }
}

/// Requests capture devices and remembers per-class permission outcomes.
/// Clones share the ledger.
#[derive(Clone)]
pub struct MediaAcquirer {
    devices: Arc<dyn MediaDevices>,
    ledger: Arc<Mutex<Ledger>>,
}

impl MediaAcquirer {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            ledger: Arc::new(Mutex::new(Ledger::default())),
        }
    }

    pub fn permission(&self, kind: MediaKind) -> PermissionState {
        self.ledger.lock().state(kind)
    }

    /// Lets the next `acquire` ask again for a class the user denied.
    pub fn allow_retry(&self, kind: MediaKind) {
        let mut ledger = self.ledger.lock();
        match kind {
            MediaKind::Audio => ledger.retry_audio = true,
            MediaKind::Video => ledger.retry_video = true,
        }
    }

    pub fn state(&self) -> MediaState {
        self.ledger.lock().media_state(None)
    }

    /// Classes already denied are not requested again unless re-allowed.
    pub fn narrow(&self, requested: MediaConstraints) -> MediaConstraints {
        let ledger = self.ledger.lock();
        let mut effective = requested;
        for kind in requested.kinds() {
            if ledger.state(kind) == PermissionState::Denied && !ledger.retry_allowed(kind) {
                effective = effective.without(kind);
            }
        }
        effective
    }

    pub async fn acquire(
        &self,
        requested: MediaConstraints,
    ) -> Result<AcquiredMedia, PermissionError> {
        if requested.is_empty() {
            return Err(PermissionError::Unknown("no media classes requested".into()));
        }
        let effective = self.narrow(requested);
        if effective != requested {
            tracing::info!(
                target = "media",
                requested = ?requested,
                effective = ?effective,
                "skipping previously denied media classes"
            );
        }

        let stream_id = Uuid::new_v4().to_string();
        let mut tracks = PendingTracks::default();
        let mut failure: Option<String> = None;
        let mut missing = false;

        for kind in effective.kinds() {
            let outcome = match self.devices.open(kind, &stream_id).await {
                Ok(track) => {
                    tracks.0.push(track);
                    PermissionState::Granted
                }
                Err(DeviceError::Denied) => {
                    tracing::info!(target = "media", kind = kind.as_str(), "media permission denied");
                    PermissionState::Denied
                }
                Err(DeviceError::NotFound) => {
                    tracing::info!(target = "media", kind = kind.as_str(), "no capture device");
                    missing = true;
                    PermissionState::Unavailable
                }
                Err(DeviceError::Other(reason)) => {
                    tracing::warn!(target = "media", kind = kind.as_str(), reason = %reason, "capture failed");
                    failure = Some(reason);
                    PermissionState::Failed
                }
            };
            self.ledger.lock().record(kind, outcome);
        }

        let ledger = self.ledger.lock();
        if tracks.0.is_empty() {
            let audio_denied = requested.audio && ledger.audio == PermissionState::Denied;
            let video_denied = requested.video && ledger.video == PermissionState::Denied;
            let fallback = match (audio_denied, video_denied) {
                (false, true) if ledger.audio == PermissionState::Failed => Some(MediaKind::Audio),
                (true, false) if ledger.video == PermissionState::Failed => Some(MediaKind::Video),
                _ => None,
            };
            let error = if audio_denied || video_denied {
                PermissionError::PermissionDenied {
                    audio: audio_denied,
                    video: video_denied,
                    fallback,
                }
            } else if missing {
                PermissionError::DeviceNotFound
            } else {
                PermissionError::Unknown(failure.unwrap_or_else(|| "no tracks acquired".into()))
            };
            tracing::warn!(target = "media", error = %error, "media acquisition failed");
            return Err(error);
        }

        let stream = LocalStream::new(stream_id, tracks.release());
        let state = ledger.media_state(Some(&stream));
        tracing::info!(
            target = "media",
            has_audio = state.has_audio,
            has_video = state.has_video,
            "local media ready"
        );
        Ok(AcquiredMedia { stream, state })
    }
}

/// Tracks opened so far by one acquisition. Dropping it stops them, so an
/// acquisition cancelled between prompts leaves no device open.
#[derive(Default)]
struct PendingTracks(Vec<LocalTrack>);

impl PendingTracks {
    fn release(mut self) -> Vec<LocalTrack> {
        std::mem::take(&mut self.0)
    }
}

impl Drop for PendingTracks {
    fn drop(&mut self) {
        for track in &self.0 {
            track.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acquirer(devices: &SyntheticDevices) -> MediaAcquirer {
        MediaAcquirer::new(Arc::new(devices.clone()))
    }

    #[tokio::test]
    async fn video_denied_degrades_to_audio_only() {
        let devices = SyntheticDevices::new().with(MediaKind::Video, DeviceBehavior::Deny);
        let acquired = acquirer(&devices)
            .acquire(MediaConstraints::default())
            .await
            .expect("audio-only media");
        assert_eq!(
            acquired.state,
            MediaState {
                has_audio: true,
                has_video: false,
                is_audio_denied: false,
                is_video_denied: true,
            }
        );
        assert!(acquired.stream.track(MediaKind::Video).is_none());
    }

    #[tokio::test]
    async fn both_denied_is_a_permission_error() {
        let devices = SyntheticDevices::new()
            .with(MediaKind::Audio, DeviceBehavior::Deny)
            .with(MediaKind::Video, DeviceBehavior::Deny);
        let err = acquirer(&devices)
            .acquire(MediaConstraints::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PermissionError::PermissionDenied {
                audio: true,
                video: true,
                fallback: None,
            }
        );
        assert_eq!(
            err.recovery_actions(),
            vec![RecoveryAction::Retry, RecoveryAction::GoBack]
        );
    }

    #[tokio::test]
    async fn denied_class_is_not_requested_again_until_allowed() {
        let devices = SyntheticDevices::new().with(MediaKind::Video, DeviceBehavior::Deny);
        let acquirer = acquirer(&devices);
        let first = acquirer.acquire(MediaConstraints::default()).await.unwrap();
        first.stream.stop_all();

        devices.set(MediaKind::Video, DeviceBehavior::Grant);
        let second = acquirer.acquire(MediaConstraints::default()).await.unwrap();
        assert!(!second.state.has_video);
        second.stream.stop_all();

        acquirer.allow_retry(MediaKind::Video);
        let third = acquirer.acquire(MediaConstraints::default()).await.unwrap();
        assert!(third.state.has_video);
        assert_eq!(acquirer.permission(MediaKind::Video), PermissionState::Granted);
    }

    #[tokio::test]
    async fn missing_devices_report_not_found() {
        let devices = SyntheticDevices::new()
            .with(MediaKind::Audio, DeviceBehavior::Missing)
            .with(MediaKind::Video, DeviceBehavior::Missing);
        let err = acquirer(&devices)
            .acquire(MediaConstraints::default())
            .await
            .unwrap_err();
        assert_eq!(err, PermissionError::DeviceNotFound);
    }

    #[tokio::test]
    async fn partial_denial_offers_the_other_class_when_its_device_exists() {
        let devices = SyntheticDevices::new()
            .with(MediaKind::Audio, DeviceBehavior::Fail("device busy".into()))
            .with(MediaKind::Video, DeviceBehavior::Deny);
        let acquirer = acquirer(&devices);
        let err = acquirer
            .acquire(MediaConstraints::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PermissionError::PermissionDenied {
                audio: false,
                video: true,
                fallback: Some(MediaKind::Audio),
            }
        );
        assert_eq!(acquirer.permission(MediaKind::Audio), PermissionState::Failed);
        assert!(err
            .recovery_actions()
            .contains(&RecoveryAction::ContinueAudioOnly));
    }

    #[tokio::test]
    async fn missing_class_is_not_offered_as_a_fallback() {
        let devices = SyntheticDevices::new()
            .with(MediaKind::Audio, DeviceBehavior::Deny)
            .with(MediaKind::Video, DeviceBehavior::Missing);
        let acquirer = acquirer(&devices);
        let err = acquirer
            .acquire(MediaConstraints::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PermissionError::PermissionDenied {
                audio: true,
                video: false,
                fallback: None,
            }
        );
        assert_eq!(acquirer.permission(MediaKind::Video), PermissionState::Unavailable);
        assert_eq!(
            err.recovery_actions(),
            vec![RecoveryAction::Retry, RecoveryAction::GoBack]
        );
    }

    #[tokio::test]
    async fn cancelled_acquisition_stops_tracks_already_granted() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let devices = SyntheticDevices::new()
            .with(MediaKind::Video, DeviceBehavior::GrantAfter(gate));
        let acquirer = acquirer(&devices);
        let task = tokio::spawn(async move { acquirer.acquire(MediaConstraints::default()).await });
        while devices.active(MediaKind::Audio) == 0 {
            tokio::task::yield_now().await;
        }

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(devices.active(MediaKind::Audio), 0);
        assert!(devices.opened_tracks().iter().all(|track| !track.is_live()));
    }
}
