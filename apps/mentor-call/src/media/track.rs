use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use uuid::Uuid;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use super::MediaKind;

type Release = Box<dyn FnOnce() + Send>;

struct TrackInner {
    id: String,
    kind: MediaKind,
    stream_id: String,
    enabled: AtomicBool,
    live: AtomicBool,
    rtp: Arc<TrackLocalStaticSample>,
    release: Mutex<Option<Release>>,
}

impl TrackInner {
    fn stop(&self) -> bool {
        if !self.live.swap(false, Ordering::SeqCst) {
            return false;
        }
        if let Some(release) = self.release.lock().take() {
            release();
        }
        true
    }
}

impl Drop for TrackInner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A captured audio or video source. Clones share state; the device is
/// released on `stop()` or when the last clone drops.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    pub fn new(kind: MediaKind, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind.as_str(), Uuid::new_v4());
        let rtp = Arc::new(TrackLocalStaticSample::new(
            codec_for(kind),
            id.clone(),
            stream_id.to_string(),
        ));
        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                stream_id: stream_id.to_string(),
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
                rtp,
                release: Mutex::new(None),
            }),
        }
    }

    /// Runs `release` once when the track stops.
    pub fn with_release(self, release: impl FnOnce() + Send + 'static) -> Self {
        *self.inner.release.lock() = Some(Box::new(release));
        self
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mutes or unmutes without touching the peer connection.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Idempotent. Returns whether this call stopped the track.
    pub fn stop(&self) -> bool {
        let stopped = self.inner.stop();
        if stopped {
            tracing::debug!(target = "media", track_id = %self.inner.id, kind = ?self.inner.kind, "local track stopped");
        }
        stopped
    }

    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.inner.rtp)
    }

    /// Writes one captured frame. Muted or stopped tracks drop it.
    pub async fn write_sample(&self, sample: &Sample) -> Result<(), webrtc::Error> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(());
        }
        self.inner.rtp.write_sample(sample).await
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

fn codec_for(kind: MediaKind) -> RTCRtpCodecCapability {
    match kind {
        MediaKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        MediaKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
    }
}

/// Tracks captured together under one stream id.
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(id: impl Into<String>, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|track| track.kind() == kind)
    }

    pub fn has(&self, kind: MediaKind) -> bool {
        self.track(kind).is_some()
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use webrtc::track::track_local::TrackLocal;

    #[test]
    fn stop_is_idempotent_and_releases_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let track = LocalTrack::new(MediaKind::Audio, "s1").with_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(track.stop());
        assert!(!track.stop());
        assert!(!track.is_live());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_last_clone_releases_device() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let track = LocalTrack::new(MediaKind::Video, "s1").with_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let clone = track.clone();
        drop(track);
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn toggling_enabled_keeps_track_live() {
        let track = LocalTrack::new(MediaKind::Audio, "s1");
        track.set_enabled(false);
        assert!(!track.is_enabled());
        assert!(track.is_live());
        assert_eq!(track.rtp_track().stream_id(), "s1");
    }
}
