use std::sync::Arc;

use async_trait::async_trait;
use room_relay::{IceCandidate, SdpKind, SessionDescription};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

use super::NegotiationError;
use super::backend::{LinkEvent, LinkEventSink, LinkState, PeerFactory, PeerLink, RemoteTrack};
use crate::config::IceConfig;
use crate::media::{LocalTrack, MediaKind};

/// webrtc-rs backed peer connections.
pub struct RtcPeerFactory {
    api: API,
}

impl RtcPeerFactory {
    pub fn new() -> Result<Self, NegotiationError> {
        Ok(Self { api: build_api()? })
    }
}

fn build_api() -> Result<API, NegotiationError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_backend_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_backend_error)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_backend_error<E: std::fmt::Display>(err: E) -> NegotiationError {
    NegotiationError::Backend(err.to_string())
}

fn rtc_ice_servers(ice: &IceConfig) -> Vec<RTCIceServer> {
    ice.servers()
        .into_iter()
        .map(|server| RTCIceServer {
            urls: server.urls,
            username: server.username.unwrap_or_default(),
            credential: server.credential.unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn map_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => LinkState::New,
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
    }
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp).map_err(to_backend_error),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp).map_err(to_backend_error),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp).map_err(to_backend_error),
        SdpKind::Rollback => Err(NegotiationError::Backend(
            "rollback descriptions are not supported".into(),
        )),
    }
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        RTCSdpType::Unspecified => {
            return Err(NegotiationError::Backend("unspecified sdp type".into()));
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(
        &self,
        ice: &IceConfig,
        events: LinkEventSink,
    ) -> Result<Box<dyn PeerLink>, NegotiationError> {
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(to_backend_error)?,
        );

        let candidate_sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = candidate_sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.emit(LinkEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(err) => {
                        tracing::warn!(target = "peer", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let state_sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            tracing::debug!(target = "peer", ?state, generation = state_sink.generation(), "peer connection state changed");
            state_sink.emit(LinkEvent::StateChanged(map_state(state)));
            Box::pin(async {})
        }));

        let track_sink = events;
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => Some(MediaKind::Audio),
                RTPCodecType::Video => Some(MediaKind::Video),
                RTPCodecType::Unspecified => None,
            };
            if let Some(kind) = kind {
                track_sink.emit(LinkEvent::RemoteTrack(RemoteTrack {
                    kind,
                    track_id: track.id(),
                    stream_id: track.stream_id(),
                }));
            }
            Box::pin(async {})
        }));

        Ok(Box::new(RtcPeerLink { pc }))
    }
}

struct RtcPeerLink {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), NegotiationError> {
        let rtp: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
        let sender = self.pc.add_track(rtp).await.map_err(to_backend_error)?;
        // RTCP has to be read for interceptors (NACK, reports) to run.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.pc.create_offer(None).await.map_err(to_backend_error)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.pc.create_answer(None).await.map_err(to_backend_error)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(to_backend_error)
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(to_backend_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_backend_error)
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc.close().await.map_err(to_backend_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnServer;

    #[test]
    fn turn_credentials_flow_into_ice_servers() {
        let ice = IceConfig {
            stun_urls: vec!["stun:stun.example.org:3478".into()],
            turn: Some(TurnServer {
                url: "turn:turn.example.org:3478".into(),
                username: "mentor".into(),
                credential: "s3cret".into(),
            }),
        };
        let servers = rtc_ice_servers(&ice);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(servers[1].username, "mentor");
        assert!(servers[0].username.is_empty());
    }

    #[test]
    fn unusable_descriptions_are_backend_errors() {
        assert!(matches!(
            to_rtc_description(SessionDescription::answer("v=0\r\n")),
            Err(NegotiationError::Backend(_))
        ));
        let rollback = SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        };
        assert!(matches!(
            to_rtc_description(rollback),
            Err(NegotiationError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn offer_from_real_backend_carries_media_sections() {
        let factory = match RtcPeerFactory::new() {
            Ok(factory) => factory,
            Err(err) => {
                tracing::trace!(target = "peer", error = %err, "skipping webrtc offer test");
                return;
            }
        };
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let ice = IceConfig {
            stun_urls: Vec::new(),
            turn: None,
        };
        let link = factory
            .create(&ice, LinkEventSink::new(1, tx))
            .await
            .expect("peer connection");
        let track = LocalTrack::new(MediaKind::Audio, "stream-1");
        link.add_track(&track).await.expect("add track");
        let offer = link.create_offer().await.expect("offer");
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));

        let native = to_rtc_description(offer.clone()).expect("offer parses");
        assert_eq!(native.sdp_type, RTCSdpType::Offer);
        assert_eq!(from_rtc_description(native).expect("offer maps back"), offer);
        link.close().await.expect("close");
    }
}
