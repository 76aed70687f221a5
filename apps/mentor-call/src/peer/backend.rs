use async_trait::async_trait;
use room_relay::{IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use crate::config::IceConfig;
use crate::media::{LocalTrack, MediaKind};

use super::NegotiationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub kind: MediaKind,
    pub track_id: String,
    pub stream_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    StateChanged(LinkState),
    RemoteTrack(RemoteTrack),
}

/// A backend event tagged with the link that produced it, so events from a
/// closed link can be told apart from the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub generation: u64,
    pub event: LinkEvent,
}

#[derive(Debug, Clone)]
pub struct LinkEventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl LinkEventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx
            .send(PeerEvent {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

#[async_trait]
pub trait PeerFactory: Send + Sync + 'static {
    async fn create(
        &self,
        ice: &IceConfig,
        events: LinkEventSink,
    ) -> Result<Box<dyn PeerLink>, NegotiationError>;
}

/// One peer connection as the manager drives it.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError>;
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError>;
    async fn set_remote_description(&self, desc: SessionDescription)
    -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;
    async fn close(&self) -> Result<(), NegotiationError>;
}
