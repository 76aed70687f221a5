use std::sync::Arc;

use parking_lot::Mutex;

/// Where remote media is rendered.
pub trait PlaybackSurfaces: Send + Sync + 'static {
    /// Binds the remote stream to the main video surface.
    fn show_remote(&self, stream_id: &str);
    /// Binds the remote stream's audio to the audio-only element.
    fn play_remote_audio(&self, stream_id: &str);
    fn clear_remote(&self);
}

/// Logs surface changes; used by the headless CLI.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSurfaces;

impl PlaybackSurfaces for TracingSurfaces {
    fn show_remote(&self, stream_id: &str) {
        tracing::info!(target = "peer", stream_id = %stream_id, "remote video attached");
    }

    fn play_remote_audio(&self, stream_id: &str) {
        tracing::info!(target = "peer", stream_id = %stream_id, "remote audio attached");
    }

    fn clear_remote(&self) {
        tracing::info!(target = "peer", "remote media cleared");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceCall {
    ShowRemote(String),
    PlayRemoteAudio(String),
    ClearRemote,
}

#[derive(Debug, Default, Clone)]
pub struct RecordingSurfaces {
    calls: Arc<Mutex<Vec<SurfaceCall>>>,
}

impl RecordingSurfaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SurfaceCall> {
        self.calls.lock().clone()
    }

    /// Stream currently bound to the video surface.
    pub fn showing(&self) -> Option<String> {
        let mut showing = None;
        for call in self.calls.lock().iter() {
            match call {
                SurfaceCall::ShowRemote(stream) => showing = Some(stream.clone()),
                SurfaceCall::ClearRemote => showing = None,
                SurfaceCall::PlayRemoteAudio(_) => {}
            }
        }
        showing
    }
}

impl PlaybackSurfaces for RecordingSurfaces {
    fn show_remote(&self, stream_id: &str) {
        self.calls
            .lock()
            .push(SurfaceCall::ShowRemote(stream_id.to_string()));
    }

    fn play_remote_audio(&self, stream_id: &str) {
        self.calls
            .lock()
            .push(SurfaceCall::PlayRemoteAudio(stream_id.to_string()));
    }

    fn clear_remote(&self) {
        self.calls.lock().push(SurfaceCall::ClearRemote);
    }
}
