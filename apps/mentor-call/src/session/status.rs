use std::fmt;

use crate::media::PermissionError;

/// Coarse call state shown to the participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallStatus {
    Connecting,
    /// Capture devices are being opened.
    AcquiringMedia,
    /// No usable media; stays here until the user picks a recovery action.
    PermissionError(PermissionError),
    WaitingForPeer,
    Negotiating,
    Connected,
    Disconnected,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Connecting => "connecting",
            CallStatus::AcquiringMedia => "acquiring-media",
            CallStatus::PermissionError(_) => "permission-error",
            CallStatus::WaitingForPeer => "waiting-for-peer",
            CallStatus::Negotiating => "negotiating",
            CallStatus::Connected => "connected",
            CallStatus::Disconnected => "disconnected",
        }
    }

    pub fn is_permission_error(&self) -> bool {
        matches!(self, CallStatus::PermissionError(_))
    }

    /// Whether the call is past loading and any permission problem.
    pub fn is_in_call(&self) -> bool {
        matches!(
            self,
            CallStatus::WaitingForPeer | CallStatus::Negotiating | CallStatus::Connected
        )
    }

    pub fn can_transition_to(&self, next: &CallStatus) -> bool {
        use CallStatus::*;

        if std::mem::discriminant(self) == std::mem::discriminant(next) {
            return false;
        }
        match (self, next) {
            (_, Disconnected) => true,
            (Connecting, AcquiringMedia | WaitingForPeer) => true,
            // The peer link can settle while signaling is still reconnecting.
            (Connecting, Negotiating | Connected) => true,
            (AcquiringMedia, Connecting | WaitingForPeer | PermissionError(_)) => true,
            (PermissionError(_), AcquiringMedia) => true,
            (WaitingForPeer, Negotiating | Connecting) => true,
            (Negotiating, Connected | WaitingForPeer | Connecting) => true,
            (Connected, WaitingForPeer | Negotiating | Connecting) => true,
            (Disconnected, Connected | Negotiating | WaitingForPeer | Connecting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallStatus::PermissionError(err) => write!(f, "permission-error ({err})"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn denied() -> CallStatus {
        CallStatus::PermissionError(PermissionError::PermissionDenied {
            audio: true,
            video: true,
            fallback: None,
        })
    }

    #[test]
    fn join_path_transitions_are_allowed() {
        let path = [
            CallStatus::Connecting,
            CallStatus::AcquiringMedia,
            CallStatus::WaitingForPeer,
            CallStatus::Negotiating,
            CallStatus::Connected,
            CallStatus::WaitingForPeer,
            CallStatus::Disconnected,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn permission_error_only_leaves_through_acquisition_or_teardown() {
        let status = denied();
        assert!(status.can_transition_to(&CallStatus::AcquiringMedia));
        assert!(status.can_transition_to(&CallStatus::Disconnected));
        assert!(!status.can_transition_to(&CallStatus::Connecting));
        assert!(!status.can_transition_to(&CallStatus::WaitingForPeer));
        assert!(!status.can_transition_to(&CallStatus::Connected));
        assert!(!status.can_transition_to(&denied()));
    }

    #[test]
    fn cannot_skip_straight_to_connected() {
        assert!(!CallStatus::AcquiringMedia.can_transition_to(&CallStatus::Negotiating));
        assert!(!CallStatus::WaitingForPeer.can_transition_to(&CallStatus::Connected));
        assert!(!CallStatus::Connected.can_transition_to(&CallStatus::Connected));
    }

    #[test]
    fn link_progress_is_shown_while_signaling_reconnects() {
        let path = [
            CallStatus::Negotiating,
            CallStatus::Connecting,
            CallStatus::Connected,
            CallStatus::Connecting,
            CallStatus::Negotiating,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(&pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn display_names_match_wire_style() {
        assert_eq!(CallStatus::WaitingForPeer.to_string(), "waiting-for-peer");
        assert!(denied().to_string().starts_with("permission-error"));
        assert!(CallStatus::Negotiating.is_in_call());
        assert!(!CallStatus::AcquiringMedia.is_in_call());
    }
}
