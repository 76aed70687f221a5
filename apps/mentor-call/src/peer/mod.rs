//! Offer/answer and ICE handling for the single peer connection of a call.
//!
//! [`PeerManager`] owns at most one [`PeerLink`]. It is driven entirely by
//! the session actor: relay messages come in through the `handle_*`
//! methods and backend callbacks arrive as [`PeerEvent`]s tagged with the
//! link generation, so late events from a torn-down link are ignored.

pub mod backend;
pub mod mock;
pub mod rtc;
pub mod surface;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use room_relay::{ClientEvent, IceCandidate, SessionDescription};
use thiserror::Error;
use tokio::sync::mpsc;

pub use backend::{
    LinkEvent, LinkEventSink, LinkState, PeerEvent, PeerFactory, PeerLink, RemoteTrack,
};
pub use mock::{LinkCall, MockLinkHandle, MockPeerFactory};
pub use rtc::RtcPeerFactory;
pub use surface::{PlaybackSurfaces, RecordingSurfaces, SurfaceCall, TracingSurfaces};

use crate::config::IceConfig;
use crate::media::LocalStream;
use crate::signaling::SignalSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Idle,
    Creating,
    AwaitingAnswer,
    Answering,
    Negotiating,
    Connected,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("peer backend error: {0}")]
    Backend(String),
    #[error("{op} is not valid in phase {phase:?}")]
    InvalidState { op: &'static str, phase: PeerPhase },
    #[error("no peer connection")]
    NoConnection,
}

pub struct PeerManager {
    factory: Arc<dyn PeerFactory>,
    ice: IceConfig,
    signals: Arc<dyn SignalSink>,
    surfaces: Arc<dyn PlaybackSurfaces>,
    events: mpsc::UnboundedSender<PeerEvent>,
    phase: PeerPhase,
    link: Option<Arc<dyn PeerLink>>,
    generation: u64,
    remote_id: Option<String>,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
    local_stream: Option<LocalStream>,
    attached_tracks: HashSet<String>,
    remote_stream: Option<String>,
    remote_audio_attached: bool,
}

impl PeerManager {
    pub fn new(
        factory: Arc<dyn PeerFactory>,
        ice: IceConfig,
        signals: Arc<dyn SignalSink>,
        surfaces: Arc<dyn PlaybackSurfaces>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            factory,
            ice,
            signals,
            surfaces,
            events,
            phase: PeerPhase::Idle,
            link: None,
            generation: 0,
            remote_id: None,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            local_stream: None,
            attached_tracks: HashSet::new(),
            remote_stream: None,
            remote_audio_attached: false,
        }
    }

    pub fn phase(&self) -> PeerPhase {
        self.phase
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn has_connection(&self) -> bool {
        self.link.is_some()
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// The other participant joined: this side offers.
    pub async fn handle_peer_joined(&mut self, remote_id: &str) -> Result<(), NegotiationError> {
        if self.link.is_some() || self.phase != PeerPhase::Idle {
            tracing::debug!(
                target = "peer",
                remote_id = %remote_id,
                phase = ?self.phase,
                "peer connection already exists; ignoring user-joined"
            );
            return Ok(());
        }
        let result = self.start_offer(remote_id).await;
        if let Err(err) = &result {
            self.abandon(err).await;
        }
        result
    }

    async fn start_offer(&mut self, remote_id: &str) -> Result<(), NegotiationError> {
        let link = self.create_link(remote_id).await?;
        let offer = link.create_offer().await?;
        link.set_local_description(offer.clone()).await?;
        self.signals.send(ClientEvent::Offer {
            target: remote_id.to_string(),
            offer,
        });
        self.phase = PeerPhase::AwaitingAnswer;
        tracing::info!(target = "peer", remote_id = %remote_id, "offer sent");
        Ok(())
    }

    /// The other participant offered: this side answers.
    pub async fn handle_offer_received(
        &mut self,
        remote_id: &str,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.link.is_some() || self.phase != PeerPhase::Idle {
            tracing::debug!(
                target = "peer",
                remote_id = %remote_id,
                phase = ?self.phase,
                "peer connection already exists; ignoring offer"
            );
            return Ok(());
        }
        let result = self.start_answer(remote_id, offer).await;
        if let Err(err) = &result {
            self.abandon(err).await;
        }
        result
    }

    async fn start_answer(
        &mut self,
        remote_id: &str,
        offer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let link = self.create_link(remote_id).await?;
        self.phase = PeerPhase::Answering;
        link.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.flush_pending_candidates(&link).await;
        let answer = link.create_answer().await?;
        link.set_local_description(answer.clone()).await?;
        self.signals.send(ClientEvent::Answer {
            target: remote_id.to_string(),
            answer,
        });
        self.phase = PeerPhase::Negotiating;
        tracing::info!(target = "peer", remote_id = %remote_id, "answer sent");
        Ok(())
    }

    pub async fn handle_answer_received(
        &mut self,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.phase != PeerPhase::AwaitingAnswer {
            return Err(NegotiationError::InvalidState {
                op: "answer",
                phase: self.phase,
            });
        }
        let link = self.link.clone().ok_or(NegotiationError::NoConnection)?;
        if let Err(err) = link.set_remote_description(answer).await {
            self.abandon(&err).await;
            return Err(err);
        }
        self.remote_description_set = true;
        self.flush_pending_candidates(&link).await;
        self.phase = PeerPhase::Negotiating;
        tracing::debug!(target = "peer", "remote answer applied");
        Ok(())
    }

    /// Applies a remote candidate now if the remote description is known,
    /// otherwise queues it in arrival order.
    pub async fn handle_ice_candidate(&mut self, candidate: IceCandidate) {
        match (&self.link, self.remote_description_set) {
            (Some(link), true) => {
                if let Err(err) = link.add_ice_candidate(candidate).await {
                    tracing::warn!(target = "peer", error = %err, "failed to add remote candidate");
                }
            }
            _ => {
                self.pending_candidates.push_back(candidate);
                tracing::trace!(
                    target = "peer",
                    queued = self.pending_candidates.len(),
                    "queued remote candidate until remote description is set"
                );
            }
        }
    }

    async fn flush_pending_candidates(&mut self, link: &Arc<dyn PeerLink>) {
        if self.pending_candidates.is_empty() {
            return;
        }
        tracing::debug!(
            target = "peer",
            count = self.pending_candidates.len(),
            "applying queued remote candidates"
        );
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(err) = link.add_ice_candidate(candidate).await {
                tracing::warn!(target = "peer", error = %err, "failed to add queued candidate");
            }
        }
    }

    /// The other participant left: stop rendering and close the connection.
    pub async fn handle_peer_disconnected(&mut self) {
        tracing::info!(target = "peer", remote_id = ?self.remote_id, "peer disconnected");
        self.close_link().await;
        self.phase = PeerPhase::Ended;
    }

    /// Allows a new peer after the previous one ended.
    pub fn rearm(&mut self) {
        if self.phase == PeerPhase::Ended {
            self.phase = PeerPhase::Idle;
        }
    }

    /// Adds tracks to a live connection; remembered for future ones.
    pub async fn attach_local_stream(&mut self, stream: LocalStream) {
        self.local_stream = Some(stream);
        if let Some(link) = self.link.clone() {
            self.attach_tracks(&link).await;
        }
    }

    /// Routes a backend event. Returns connection state changes for the
    /// session to reflect.
    pub async fn handle_link_event(&mut self, event: PeerEvent) -> Option<LinkState> {
        if event.generation != self.generation || self.link.is_none() {
            tracing::trace!(
                target = "peer",
                generation = event.generation,
                current = self.generation,
                "dropping event from stale peer connection"
            );
            return None;
        }
        match event.event {
            LinkEvent::LocalCandidate(candidate) => {
                if let Some(remote_id) = &self.remote_id {
                    self.signals.send(ClientEvent::IceCandidate {
                        target: remote_id.clone(),
                        candidate,
                    });
                }
                None
            }
            LinkEvent::StateChanged(state) => {
                tracing::info!(target = "peer", state = ?state, remote_id = ?self.remote_id, "peer connection state");
                if state == LinkState::Connected {
                    self.phase = PeerPhase::Connected;
                }
                Some(state)
            }
            LinkEvent::RemoteTrack(track) => {
                self.render_remote(&track);
                None
            }
        }
    }

    /// Tears the connection down for good (call end).
    pub async fn destroy(&mut self) {
        self.close_link().await;
        self.local_stream = None;
        self.phase = PeerPhase::Ended;
    }

    /// Synchronous teardown for drop paths; the backend close runs on the
    /// current runtime if there is one.
    pub fn destroy_now(&mut self) {
        if let Some(link) = self.reset_link() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    let _ = link.close().await;
                });
            }
        }
        self.local_stream = None;
        self.phase = PeerPhase::Ended;
    }

    fn render_remote(&mut self, track: &RemoteTrack) {
        if self.remote_stream.as_deref() != Some(track.stream_id.as_str()) {
            self.surfaces.show_remote(&track.stream_id);
            self.remote_stream = Some(track.stream_id.clone());
            self.remote_audio_attached = false;
        }
        if track.kind == crate::media::MediaKind::Audio && !self.remote_audio_attached {
            self.surfaces.play_remote_audio(&track.stream_id);
            self.remote_audio_attached = true;
        }
    }

    async fn create_link(&mut self, remote_id: &str) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        self.phase = PeerPhase::Creating;
        self.remote_id = Some(remote_id.to_string());
        self.generation += 1;
        let sink = LinkEventSink::new(self.generation, self.events.clone());
        if self.ice.turn.is_none() {
            tracing::debug!(target = "peer", "no TURN server configured; using STUN only");
        }
        let link: Arc<dyn PeerLink> = Arc::from(self.factory.create(&self.ice, sink).await?);
        self.link = Some(Arc::clone(&link));
        self.attach_tracks(&link).await;
        tracing::debug!(
            target = "peer",
            remote_id = %remote_id,
            generation = self.generation,
            "peer connection created"
        );
        Ok(link)
    }

    async fn attach_tracks(&mut self, link: &Arc<dyn PeerLink>) {
        let Some(stream) = self.local_stream.clone() else {
            return;
        };
        for track in stream.tracks() {
            if !track.is_live() || !self.attached_tracks.insert(track.id().to_string()) {
                continue;
            }
            if let Err(err) = link.add_track(track).await {
                tracing::warn!(target = "peer", track_id = %track.id(), error = %err, "failed to attach local track");
                self.attached_tracks.remove(track.id());
            }
        }
    }

    fn reset_link(&mut self) -> Option<Arc<dyn PeerLink>> {
        if self.remote_stream.take().is_some() || self.link.is_some() {
            self.surfaces.clear_remote();
        }
        self.remote_audio_attached = false;
        self.remote_id = None;
        self.remote_description_set = false;
        self.pending_candidates.clear();
        self.attached_tracks.clear();
        self.link.take()
    }

    async fn close_link(&mut self) {
        if let Some(link) = self.reset_link() {
            if let Err(err) = link.close().await {
                tracing::debug!(target = "peer", error = %err, "peer connection close failed");
            }
        }
    }

    async fn abandon(&mut self, err: &NegotiationError) {
        tracing::warn!(target = "peer", error = %err, remote_id = ?self.remote_id, "negotiation failed; dropping peer connection");
        self.close_link().await;
        self.phase = PeerPhase::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{LocalTrack, MediaKind};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<ClientEvent>>);

    impl SignalSink for RecordingSink {
        fn send(&self, message: ClientEvent) {
            self.0.lock().push(message);
        }
    }

    struct Fixture {
        manager: PeerManager,
        factory: MockPeerFactory,
        sink: Arc<RecordingSink>,
        surfaces: RecordingSurfaces,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    fn fixture(factory: MockPeerFactory) -> Fixture {
        let sink = Arc::new(RecordingSink::default());
        let surfaces = RecordingSurfaces::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = PeerManager::new(
            Arc::new(factory.clone()),
            IceConfig::default(),
            sink.clone(),
            Arc::new(surfaces.clone()),
            tx,
        );
        Fixture {
            manager,
            factory,
            sink,
            surfaces,
            events: rx,
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"))
    }

    #[tokio::test]
    async fn early_candidates_are_applied_in_order_after_offer() {
        let mut f = fixture(MockPeerFactory::manual());
        for n in 1..=3 {
            f.manager.handle_ice_candidate(candidate(n)).await;
        }
        assert_eq!(f.manager.pending_candidates(), 3);

        f.manager
            .handle_offer_received("sock-a", SessionDescription::offer("v=0"))
            .await
            .unwrap();
        let link = f.factory.last_link().unwrap();
        let calls = link.calls();
        let set_remote = calls
            .iter()
            .position(|c| *c == LinkCall::SetRemote(room_relay::SdpKind::Offer))
            .unwrap();
        let first_candidate = calls
            .iter()
            .position(|c| matches!(c, LinkCall::AddCandidate(_)))
            .unwrap();
        assert!(set_remote < first_candidate);
        assert_eq!(
            link.candidates(),
            (1..=3).map(|n| candidate(n).candidate).collect::<Vec<_>>()
        );
        assert_eq!(f.manager.pending_candidates(), 0);

        f.manager.handle_ice_candidate(candidate(4)).await;
        assert_eq!(link.candidates().len(), 4);
        assert_eq!(f.manager.phase(), PeerPhase::Negotiating);
    }

    #[tokio::test]
    async fn offerer_holds_candidates_until_the_answer_arrives() {
        let mut f = fixture(MockPeerFactory::manual());
        f.manager.handle_peer_joined("sock-b").await.unwrap();
        let link = f.factory.last_link().unwrap();
        for n in 1..=3 {
            f.manager.handle_ice_candidate(candidate(n)).await;
        }
        assert!(link.candidates().is_empty());
        assert_eq!(f.manager.pending_candidates(), 3);

        f.manager
            .handle_answer_received(SessionDescription::answer("v=0"))
            .await
            .unwrap();
        let calls = link.calls();
        let set_remote = calls
            .iter()
            .position(|c| *c == LinkCall::SetRemote(room_relay::SdpKind::Answer))
            .unwrap();
        let first_candidate = calls
            .iter()
            .position(|c| matches!(c, LinkCall::AddCandidate(_)))
            .unwrap();
        assert!(set_remote < first_candidate);
        assert_eq!(f.manager.pending_candidates(), 0);

        f.manager.handle_ice_candidate(candidate(4)).await;
        assert_eq!(
            link.candidates(),
            (1..=4).map(|n| candidate(n).candidate).collect::<Vec<_>>()
        );
        assert_eq!(f.manager.phase(), PeerPhase::Negotiating);
    }

    #[tokio::test]
    async fn second_trigger_does_not_create_another_connection() {
        let mut f = fixture(MockPeerFactory::manual());
        f.manager.handle_peer_joined("sock-b").await.unwrap();
        f.manager.handle_peer_joined("sock-b").await.unwrap();
        f.manager
            .handle_offer_received("sock-b", SessionDescription::offer("v=0"))
            .await
            .unwrap();
        assert_eq!(f.factory.created(), 1);
        assert_eq!(f.manager.phase(), PeerPhase::AwaitingAnswer);
        let offers = f
            .sink
            .0
            .lock()
            .iter()
            .filter(|e| matches!(e, ClientEvent::Offer { .. }))
            .count();
        assert_eq!(offers, 1);
    }

    #[tokio::test]
    async fn answer_outside_awaiting_answer_is_rejected() {
        let mut f = fixture(MockPeerFactory::manual());
        let err = f
            .manager
            .handle_answer_received(SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            NegotiationError::InvalidState {
                op: "answer",
                phase: PeerPhase::Idle
            }
        );
    }

    #[tokio::test]
    async fn offerer_attaches_local_tracks_before_offering() {
        let mut f = fixture(MockPeerFactory::manual());
        let stream = LocalStream::new(
            "s1",
            vec![
                LocalTrack::new(MediaKind::Audio, "s1"),
                LocalTrack::new(MediaKind::Video, "s1"),
            ],
        );
        f.manager.attach_local_stream(stream).await;
        f.manager.handle_peer_joined("sock-b").await.unwrap();
        let calls = f.factory.last_link().unwrap().calls();
        assert_eq!(
            &calls[..3],
            &[
                LinkCall::AddTrack(MediaKind::Audio),
                LinkCall::AddTrack(MediaKind::Video),
                LinkCall::CreateOffer,
            ]
        );
    }

    #[tokio::test]
    async fn local_candidates_are_sent_to_current_remote() {
        let mut f = fixture(MockPeerFactory::new());
        f.manager.handle_peer_joined("sock-b").await.unwrap();
        let event = f.events.recv().await.unwrap();
        assert!(matches!(event.event, LinkEvent::LocalCandidate(_)));
        assert_eq!(f.manager.handle_link_event(event).await, None);
        assert!(f.sink.0.lock().iter().any(|e| matches!(
            e,
            ClientEvent::IceCandidate { target, .. } if target == "sock-b"
        )));
    }

    #[tokio::test]
    async fn remote_stream_is_attached_once_and_cleared_on_disconnect() {
        let mut f = fixture(MockPeerFactory::manual());
        f.manager.handle_peer_joined("sock-b").await.unwrap();
        let link = f.factory.last_link().unwrap();
        link.deliver_remote_track(MediaKind::Audio, "remote-1");
        link.deliver_remote_track(MediaKind::Video, "remote-1");
        while let Ok(event) = f.events.try_recv() {
            f.manager.handle_link_event(event).await;
        }
        assert_eq!(
            f.surfaces.calls(),
            vec![
                SurfaceCall::ShowRemote("remote-1".into()),
                SurfaceCall::PlayRemoteAudio("remote-1".into()),
            ]
        );

        f.manager.handle_peer_disconnected().await;
        assert!(link.is_closed());
        assert_eq!(f.surfaces.showing(), None);
        assert_eq!(f.manager.phase(), PeerPhase::Ended);
        f.manager.rearm();
        assert_eq!(f.manager.phase(), PeerPhase::Idle);
    }

    #[tokio::test]
    async fn stale_link_events_are_ignored() {
        let mut f = fixture(MockPeerFactory::manual());
        f.manager.handle_peer_joined("sock-b").await.unwrap();
        let old = f.factory.last_link().unwrap();
        f.manager.handle_peer_disconnected().await;
        f.manager.rearm();
        f.manager.handle_peer_joined("sock-c").await.unwrap();

        old.set_state(LinkState::Connected);
        let event = f.events.recv().await.unwrap();
        assert_eq!(f.manager.handle_link_event(event).await, None);
        assert_eq!(f.manager.phase(), PeerPhase::AwaitingAnswer);
    }

    #[tokio::test]
    async fn failed_offer_returns_to_idle() {
        let mut f = fixture(MockPeerFactory::manual());
        f.factory.fail_offers(true);
        assert!(f.manager.handle_peer_joined("sock-b").await.is_err());
        assert_eq!(f.manager.phase(), PeerPhase::Idle);
        assert!(!f.manager.has_connection());
        assert_eq!(f.factory.open_links(), 0);
    }
}
