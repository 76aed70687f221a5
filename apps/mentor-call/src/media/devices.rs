use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use webrtc::media::Sample;

use super::{LocalTrack, MediaKind};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("permission denied")]
    Denied,
    #[error("no capture device")]
    NotFound,
    #[error("{0}")]
    Other(String),
}

/// Capture back end. One call opens one class of device.
#[async_trait]
pub trait MediaDevices: Send + Sync + 'static {
    async fn open(&self, kind: MediaKind, stream_id: &str) -> Result<LocalTrack, DeviceError>;
}

/// How a synthetic device answers an open request.
#[derive(Debug, Clone)]
pub enum DeviceBehavior {
    Grant,
    Deny,
    Missing,
    Fail(String),
    /// Grants once the notify fires.
    GrantAfter(Arc<Notify>),
}

struct Device {
    behavior: Mutex<DeviceBehavior>,
    active: AtomicUsize,
}

impl Device {
    fn new(behavior: DeviceBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            active: AtomicUsize::new(0),
        })
    }
}

/// Generated audio/video sources. Used by the CLI participant and tests.
#[derive(Clone)]
pub struct SyntheticDevices {
    audio: Arc<Device>,
    video: Arc<Device>,
    opened: Arc<Mutex<Vec<LocalTrack>>>,
    pump_samples: bool,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self {
            audio: Device::new(DeviceBehavior::Grant),
            video: Device::new(DeviceBehavior::Grant),
            opened: Arc::new(Mutex::new(Vec::new())),
            pump_samples: false,
        }
    }

    pub fn with(self, kind: MediaKind, behavior: DeviceBehavior) -> Self {
        self.set(kind, behavior);
        self
    }

    /// Writes silent frames into every opened track while it is live.
    pub fn with_sample_pump(mut self) -> Self {
        self.pump_samples = true;
        self
    }

    pub fn set(&self, kind: MediaKind, behavior: DeviceBehavior) {
        *self.device(kind).behavior.lock() = behavior;
    }

    pub fn opened_tracks(&self) -> Vec<LocalTrack> {
        self.opened.lock().clone()
    }

    /// Devices currently held by a live track.
    pub fn active(&self, kind: MediaKind) -> usize {
        self.device(kind).active.load(Ordering::SeqCst)
    }

    fn device(&self, kind: MediaKind) -> &Arc<Device> {
        match kind {
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
        }
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn open(&self, kind: MediaKind, stream_id: &str) -> Result<LocalTrack, DeviceError> {
        let device = Arc::clone(self.device(kind));
        let behavior = device.behavior.lock().clone();
        match behavior {
            DeviceBehavior::Grant => {}
            DeviceBehavior::GrantAfter(gate) => gate.notified().await,
            DeviceBehavior::Deny => return Err(DeviceError::Denied),
            DeviceBehavior::Missing => return Err(DeviceError::NotFound),
            DeviceBehavior::Fail(reason) => return Err(DeviceError::Other(reason)),
        }

        device.active.fetch_add(1, Ordering::SeqCst);
        let release_device = Arc::clone(&device);
        let track = LocalTrack::new(kind, stream_id).with_release(move || {
            release_device.active.fetch_sub(1, Ordering::SeqCst);
        });
        self.opened.lock().push(track.clone());
        if self.pump_samples {
            spawn_sample_pump(track.clone());
        }
        tracing::debug!(target = "media", kind = ?kind, track_id = %track.id(), "synthetic device opened");
        Ok(track)
    }
}

const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];
const VP8_FILLER: &[u8] = &[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a];

fn spawn_sample_pump(track: LocalTrack) {
    let (payload, interval) = match track.kind() {
        MediaKind::Audio => (OPUS_SILENCE, Duration::from_millis(20)),
        MediaKind::Video => (VP8_FILLER, Duration::from_millis(33)),
    };
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        while track.is_live() {
            ticker.tick().await;
            let sample = Sample {
                data: Bytes::from_static(payload),
                duration: interval,
                ..Default::default()
            };
            if let Err(err) = track.write_sample(&sample).await {
                tracing::trace!(target = "media", error = %err, "sample write failed");
            }
        }
    });
}
