use serde::{Deserialize, Serialize};

/// SDP payload exchanged during offer/answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Network-path candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Messages sent from a participant to the relay.
///
/// Encoded as `{"event": "<kebab-name>", "data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinRoom { room_id: String, user_id: String },
    LeaveRoom(String),
    Offer {
        target: String,
        offer: SessionDescription,
    },
    Answer {
        target: String,
        answer: SessionDescription,
    },
    IceCandidate {
        target: String,
        candidate: IceCandidate,
    },
    UserInfo {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        name: String,
    },
    Ping,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinRoom { .. } => "join-room",
            ClientEvent::LeaveRoom(_) => "leave-room",
            ClientEvent::Offer { .. } => "offer",
            ClientEvent::Answer { .. } => "answer",
            ClientEvent::IceCandidate { .. } => "ice-candidate",
            ClientEvent::UserInfo { .. } => "user-info",
            ClientEvent::Ping => "ping",
        }
    }
}

/// Messages sent from the relay to a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// First frame on every connection; carries the relay-assigned id.
    #[serde(rename_all = "camelCase")]
    Connected { socket_id: String },
    #[serde(rename_all = "camelCase")]
    UserJoined { user_id: String, socket_id: String },
    ReceiveOffer {
        sender: String,
        offer: SessionDescription,
    },
    ReceiveAnswer {
        sender: String,
        answer: SessionDescription,
    },
    ReceiveIceCandidate {
        sender: String,
        candidate: IceCandidate,
    },
    #[serde(rename_all = "camelCase")]
    UserDisconnected {
        user_id: String,
        #[serde(default)]
        socket_id: String,
    },
    UserInfo { name: String },
    Pong,
    Error { message: String },
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::UserJoined { .. } => "user-joined",
            ServerEvent::ReceiveOffer { .. } => "receive-offer",
            ServerEvent::ReceiveAnswer { .. } => "receive-answer",
            ServerEvent::ReceiveIceCandidate { .. } => "receive-ice-candidate",
            ServerEvent::UserDisconnected { .. } => "user-disconnected",
            ServerEvent::UserInfo { .. } => "user-info",
            ServerEvent::Pong => "pong",
            ServerEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn join_room_uses_camel_case_payload() {
        let event = ClientEvent::JoinRoom {
            room_id: "r1".into(),
            user_id: "mentor-7".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"event": "join-room", "data": {"roomId": "r1", "userId": "mentor-7"}})
        );
    }

    #[test]
    fn leave_room_carries_bare_room_id() {
        let value = serde_json::to_value(ClientEvent::LeaveRoom("r1".into())).unwrap();
        assert_eq!(value, json!({"event": "leave-room", "data": "r1"}));
    }

    #[test]
    fn ice_candidate_keeps_browser_field_names() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 53421 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let value = serde_json::to_value(ClientEvent::IceCandidate {
            target: "sock-b".into(),
            candidate,
        })
        .unwrap();
        let data = &value["data"]["candidate"];
        assert_eq!(data["sdpMid"], Value::from("0"));
        assert_eq!(data["sdpMLineIndex"], Value::from(0));
        assert!(data.get("usernameFragment").is_none());
    }

    #[test]
    fn server_events_parse_from_relay_json() {
        let text = r#"{"event":"receive-offer","data":{"sender":"sock-a","offer":{"type":"offer","sdp":"v=0"}}}"#;
        let event: ServerEvent = serde_json::from_str(text).unwrap();
        assert_eq!(
            event,
            ServerEvent::ReceiveOffer {
                sender: "sock-a".into(),
                offer: SessionDescription::offer("v=0"),
            }
        );

        let pong: ServerEvent = serde_json::from_str(r#"{"event":"pong"}"#).unwrap();
        assert_eq!(pong, ServerEvent::Pong);
    }

    #[test]
    fn user_disconnected_tolerates_missing_socket_id() {
        let text = r#"{"event":"user-disconnected","data":{"userId":"student-3"}}"#;
        let event: ServerEvent = serde_json::from_str(text).unwrap();
        assert_eq!(
            event,
            ServerEvent::UserDisconnected {
                user_id: "student-3".into(),
                socket_id: String::new(),
            }
        );
    }
}
