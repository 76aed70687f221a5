//! In-memory peer backend for tests and local demos. Records every call
//! and can simulate connectivity without touching the network.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use room_relay::{IceCandidate, SdpKind, SessionDescription};

use super::NegotiationError;
use super::backend::{LinkEvent, LinkEventSink, LinkState, PeerFactory, PeerLink, RemoteTrack};
use crate::config::IceConfig;
use crate::media::{LocalTrack, MediaKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCall {
    AddTrack(MediaKind),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

#[derive(Default)]
struct LinkRecord {
    calls: Vec<LinkCall>,
    local_set: bool,
    remote_set: bool,
    connected: bool,
    closed: bool,
}

struct MockLinkShared {
    sink: LinkEventSink,
    record: Mutex<LinkRecord>,
    auto_connect: bool,
    fail_offers: bool,
    emit_candidates: bool,
}

/// Inspection handle for one link created by [`MockPeerFactory`].
#[derive(Clone)]
pub struct MockLinkHandle {
    shared: Arc<MockLinkShared>,
}

impl MockLinkHandle {
    pub fn calls(&self) -> Vec<LinkCall> {
        self.shared.record.lock().calls.clone()
    }

    pub fn candidates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                LinkCall::AddCandidate(candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.record.lock().closed
    }

    pub fn generation(&self) -> u64 {
        self.shared.sink.generation()
    }

    pub fn emit(&self, event: LinkEvent) {
        self.shared.sink.emit(event);
    }

    pub fn set_state(&self, state: LinkState) {
        self.emit(LinkEvent::StateChanged(state));
    }

    pub fn deliver_remote_track(&self, kind: MediaKind, stream_id: &str) {
        self.emit(LinkEvent::RemoteTrack(RemoteTrack {
            kind,
            track_id: format!("remote-{}", kind.as_str()),
            stream_id: stream_id.to_string(),
        }));
    }
}

#[derive(Default)]
struct FactoryState {
    links: Vec<MockLinkHandle>,
    fail_offers: bool,
}

#[derive(Clone)]
pub struct MockPeerFactory {
    state: Arc<Mutex<FactoryState>>,
    auto_connect: bool,
    emit_candidates: bool,
}

impl Default for MockPeerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPeerFactory {
    /// Links report `connected` once both descriptions are applied and emit
    /// one local candidate after the local description.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FactoryState::default())),
            auto_connect: true,
            emit_candidates: true,
        }
    }

    /// Links stay in `new` until a test drives them.
    pub fn manual() -> Self {
        Self {
            auto_connect: false,
            emit_candidates: false,
            ..Self::new()
        }
    }

    pub fn fail_offers(&self, fail: bool) {
        self.state.lock().fail_offers = fail;
    }

    pub fn created(&self) -> usize {
        self.state.lock().links.len()
    }

    pub fn links(&self) -> Vec<MockLinkHandle> {
        self.state.lock().links.clone()
    }

    pub fn last_link(&self) -> Option<MockLinkHandle> {
        self.state.lock().links.last().cloned()
    }

    pub fn open_links(&self) -> usize {
        self.state
            .lock()
            .links
            .iter()
            .filter(|link| !link.is_closed())
            .count()
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn create(
        &self,
        _ice: &IceConfig,
        events: LinkEventSink,
    ) -> Result<Box<dyn PeerLink>, NegotiationError> {
        let mut state = self.state.lock();
        let shared = Arc::new(MockLinkShared {
            sink: events,
            record: Mutex::new(LinkRecord::default()),
            auto_connect: self.auto_connect,
            fail_offers: state.fail_offers,
            emit_candidates: self.emit_candidates,
        });
        state.links.push(MockLinkHandle {
            shared: Arc::clone(&shared),
        });
        Ok(Box::new(MockPeerLink { shared }))
    }
}

struct MockPeerLink {
    shared: Arc<MockLinkShared>,
}

impl MockPeerLink {
    fn record(&self, call: LinkCall) -> Result<(), NegotiationError> {
        let mut record = self.shared.record.lock();
        if record.closed {
            return Err(NegotiationError::Backend("peer connection is closed".into()));
        }
        record.calls.push(call);
        Ok(())
    }

    fn maybe_connect(&self) {
        let mut record = self.shared.record.lock();
        if self.shared.auto_connect && record.local_set && record.remote_set && !record.connected {
            record.connected = true;
            drop(record);
            self.shared
                .sink
                .emit(LinkEvent::StateChanged(LinkState::Connected));
        }
    }
}

#[async_trait]
impl PeerLink for MockPeerLink {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        self.record(LinkCall::AddTrack(track.kind()))
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        if self.shared.fail_offers {
            return Err(NegotiationError::Backend("offer creation failed".into()));
        }
        self.record(LinkCall::CreateOffer)?;
        Ok(SessionDescription::offer(format!(
            "v=0\r\no=mock {} 0 IN IP4 127.0.0.1\r\n",
            self.shared.sink.generation()
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record(LinkCall::CreateAnswer)?;
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=mock {} 1 IN IP4 127.0.0.1\r\n",
            self.shared.sink.generation()
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.record(LinkCall::SetLocal(desc.kind))?;
        self.shared.record.lock().local_set = true;
        if self.shared.emit_candidates {
            self.shared.sink.emit(LinkEvent::LocalCandidate(IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2122260223 127.0.0.1 5000{} typ host",
                    self.shared.sink.generation(),
                    self.shared.sink.generation() % 10
                ),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.record(LinkCall::SetRemote(desc.kind))?;
        self.shared.record.lock().remote_set = true;
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.record(LinkCall::AddCandidate(candidate.candidate))
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        let mut record = self.shared.record.lock();
        if !record.closed {
            record.calls.push(LinkCall::Close);
            record.closed = true;
        }
        Ok(())
    }
}
