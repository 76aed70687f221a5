use std::sync::Arc;
use std::time::Duration;

use room_relay::{ClientEvent, ServerEvent};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::display::DisplayControl;
use super::status::CallStatus;
use super::timer::CallTimer;
use crate::config::{CallConfig, PeerFailurePolicy};
use crate::media::{
    AcquiredMedia, LocalStream, MediaAcquirer, MediaConstraints, MediaDevices, MediaKind,
    MediaState, PermissionError, RecoveryAction,
};
use crate::peer::{
    LinkState, NegotiationError, PeerEvent, PeerFactory, PeerManager, PeerPhase,
    PlaybackSurfaces,
};
use crate::signaling::{
    ChannelEvent, Connector, DisconnectReason, InboundKind, SignalingChannel, SignalingError,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error("{0} is only available after a media permission error")]
    NothingToRecover(&'static str),
    #[error("call session has ended")]
    Closed,
}

/// Everything the session talks to. Swapped for in-memory versions in tests.
#[derive(Clone)]
pub struct SessionDeps {
    pub connector: Arc<dyn Connector>,
    pub devices: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerFactory>,
    pub surfaces: Arc<dyn PlaybackSurfaces>,
    pub display: Arc<dyn DisplayControl>,
}

#[derive(Debug, Clone)]
pub struct CallParams {
    pub room_id: String,
    /// Application-level user id carried in `join-room`.
    pub user_id: String,
    pub config: CallConfig,
}

#[derive(Debug, Clone)]
pub struct CallSnapshot {
    pub room_id: String,
    pub status: CallStatus,
    pub local_participant_id: Option<String>,
    pub remote_participant_id: Option<String>,
    pub remote_display_name: Option<String>,
    pub media: MediaState,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub fullscreen: bool,
    /// Connected without a bearer token.
    pub anonymous: bool,
    /// `join-room` has been emitted for the current session.
    pub joined: bool,
    pub torn_down: bool,
    pub call_started_at: Option<Instant>,
    pub last_error: Option<String>,
}

impl CallSnapshot {
    fn initial(room_id: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            status: CallStatus::Connecting,
            local_participant_id: None,
            remote_participant_id: None,
            remote_display_name: None,
            media: MediaState::default(),
            audio_enabled: false,
            video_enabled: false,
            fullscreen: false,
            anonymous: false,
            joined: false,
            torn_down: false,
            call_started_at: None,
            last_error: None,
        }
    }

    pub fn call_duration(&self) -> Duration {
        self.call_started_at
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }

    pub fn recovery_actions(&self) -> Vec<RecoveryAction> {
        match &self.status {
            CallStatus::PermissionError(err) => err.recovery_actions(),
            _ => Vec::new(),
        }
    }
}

enum SessionCommand {
    Join(oneshot::Sender<Result<(), SessionError>>),
    Leave(oneshot::Sender<()>),
    Toggle(MediaKind, oneshot::Sender<Option<bool>>),
    ToggleFullscreen(oneshot::Sender<bool>),
    RetryMedia(oneshot::Sender<Result<(), SessionError>>),
    ContinueWithout(MediaKind, oneshot::Sender<Result<(), SessionError>>),
}

/// Handle to one call session. The session runs as its own task; dropping
/// every handle ends the call.
pub struct CallHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshot: watch::Receiver<CallSnapshot>,
    task: JoinHandle<()>,
}

impl CallHandle {
    pub fn spawn(params: CallParams, deps: SessionDeps) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(CallSnapshot::initial(&params.room_id));
        let actor = SessionActor::new(params, deps, snapshot_tx);
        let task = tokio::spawn(actor.run(commands_rx));
        Self {
            commands: commands_tx,
            snapshot: snapshot_rx,
            task,
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Opens the channel and starts acquiring media. A second call is a
    /// no-op.
    pub async fn join(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::Join).await?
    }

    /// Ends the call and releases every resource. Safe to repeat.
    pub async fn leave(&self) -> Result<(), SessionError> {
        match self.request(SessionCommand::Leave).await {
            Ok(()) | Err(SessionError::Closed) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Returns the new mic state, or `None` if no mic was acquired.
    pub async fn toggle_mic(&self) -> Result<Option<bool>, SessionError> {
        self.request(|tx| SessionCommand::Toggle(MediaKind::Audio, tx))
            .await
    }

    pub async fn toggle_camera(&self) -> Result<Option<bool>, SessionError> {
        self.request(|tx| SessionCommand::Toggle(MediaKind::Video, tx))
            .await
    }

    /// Returns whether the display is fullscreen afterwards.
    pub async fn toggle_fullscreen(&self) -> Result<bool, SessionError> {
        self.request(SessionCommand::ToggleFullscreen).await
    }

    /// Asks for every media class again after a permission error.
    pub async fn retry_media(&self) -> Result<(), SessionError> {
        self.request(SessionCommand::RetryMedia).await?
    }

    /// Proceeds without `kind` after a permission error.
    pub async fn continue_without(&self, kind: MediaKind) -> Result<(), SessionError> {
        self.request(|tx| SessionCommand::ContinueWithout(kind, tx))
            .await?
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> CallStatus {
        self.snapshot.borrow().status.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    pub fn call_duration(&self) -> Duration {
        self.snapshot.borrow().call_duration()
    }

    /// Resolves with the first snapshot that satisfies `predicate`.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<CallSnapshot, SessionError>
    where
        F: FnMut(&CallSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| SessionError::Closed)?;
        Ok(snapshot.clone())
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct MediaOutcome {
    attempt: u64,
    result: Result<AcquiredMedia, PermissionError>,
}

enum Flow {
    Continue,
    Stop,
}

struct SessionActor {
    room_id: String,
    user_id: String,
    config: CallConfig,
    deps: SessionDeps,
    acquirer: MediaAcquirer,
    constraints: MediaConstraints,

    channel: Option<Arc<SignalingChannel>>,
    channel_events: Option<mpsc::UnboundedReceiver<ChannelEvent>>,
    inbound_tx: mpsc::UnboundedSender<ServerEvent>,
    inbound_rx: mpsc::UnboundedReceiver<ServerEvent>,
    peer: Option<PeerManager>,
    peer_events_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    media_tx: mpsc::UnboundedSender<MediaOutcome>,
    media_rx: mpsc::UnboundedReceiver<MediaOutcome>,
    media_attempt: u64,
    media_task: Option<JoinHandle<()>>,
    cancelled_media: Option<JoinHandle<()>>,

    local_stream: Option<LocalStream>,
    media_state: MediaState,
    media_ready: bool,
    join_requested: bool,
    handlers_registered: bool,
    join_sent: bool,
    channel_connected: bool,
    local_participant_id: Option<String>,
    remote_participant_id: Option<String>,
    remote_display_name: Option<String>,
    anonymous: bool,
    rejoin_attempts: u32,
    last_error: Option<String>,
    status: CallStatus,
    timer: CallTimer,
    torn_down: bool,
    snapshot_tx: watch::Sender<CallSnapshot>,
}

impl SessionActor {
    fn new(params: CallParams, deps: SessionDeps, snapshot_tx: watch::Sender<CallSnapshot>) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        let acquirer = MediaAcquirer::new(Arc::clone(&deps.devices));
        let constraints = params.config.constraints;
        Self {
            room_id: params.room_id,
            user_id: params.user_id,
            config: params.config,
            deps,
            acquirer,
            constraints,
            channel: None,
            channel_events: None,
            inbound_tx,
            inbound_rx,
            peer: None,
            peer_events_tx,
            peer_events_rx,
            media_tx,
            media_rx,
            media_attempt: 0,
            media_task: None,
            cancelled_media: None,
            local_stream: None,
            media_state: MediaState::default(),
            media_ready: false,
            join_requested: false,
            handlers_registered: false,
            join_sent: false,
            channel_connected: false,
            local_participant_id: None,
            remote_participant_id: None,
            remote_display_name: None,
            anonymous: false,
            rejoin_attempts: 0,
            last_error: None,
            status: CallStatus::Connecting,
            timer: CallTimer::new(),
            torn_down: false,
            snapshot_tx,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if let Flow::Stop = self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        tracing::debug!(target = "session", room_id = %self.room_id, "call handle dropped; ending call");
                        break;
                    }
                },
                event = next_event(&mut self.channel_events) => self.on_channel_event(event).await,
                Some(message) = self.inbound_rx.recv() => self.on_relay_message(message).await,
                Some(event) = self.peer_events_rx.recv() => self.on_peer_event(event).await,
                Some(outcome) = self.media_rx.recv() => self.on_media_outcome(outcome).await,
            }
        }
        self.teardown().await;
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Flow {
        match command {
            SessionCommand::Join(reply) => {
                let _ = reply.send(self.join());
            }
            SessionCommand::Leave(reply) => {
                self.teardown().await;
                let _ = reply.send(());
                return Flow::Stop;
            }
            SessionCommand::Toggle(kind, reply) => {
                let _ = reply.send(self.toggle(kind));
            }
            SessionCommand::ToggleFullscreen(reply) => {
                let _ = reply.send(self.toggle_fullscreen());
            }
            SessionCommand::RetryMedia(reply) => {
                let _ = reply.send(self.retry_media());
            }
            SessionCommand::ContinueWithout(kind, reply) => {
                let _ = reply.send(self.continue_without(kind));
            }
        }
        Flow::Continue
    }

    fn join(&mut self) -> Result<(), SessionError> {
        if self.torn_down {
            return Err(SessionError::Closed);
        }
        if self.join_requested {
            tracing::debug!(target = "session", room_id = %self.room_id, "join already in progress");
            return Ok(());
        }

        let channel = SignalingChannel::connect(
            &self.config.signaling_url,
            self.config.credentials.clone(),
            &self.room_id,
            Arc::clone(&self.deps.connector),
            self.config.reconnect,
        )?;
        self.join_requested = true;
        self.channel_events = channel.events();
        let channel = Arc::new(channel);
        self.peer = Some(PeerManager::new(
            Arc::clone(&self.deps.peers),
            self.config.ice.clone(),
            channel.clone(),
            Arc::clone(&self.deps.surfaces),
            self.peer_events_tx.clone(),
        ));
        self.channel = Some(channel);
        tracing::info!(
            target = "session",
            room_id = %self.room_id,
            user_id = %self.user_id,
            "joining call"
        );
        self.start_media();
        Ok(())
    }

    fn start_media(&mut self) {
        self.media_attempt += 1;
        let attempt = self.media_attempt;
        if let Some(task) = self.media_task.take() {
            task.abort();
        }
        let acquirer = self.acquirer.clone();
        let constraints = self.constraints;
        let tx = self.media_tx.clone();
        self.media_task = Some(tokio::spawn(async move {
            let result = acquirer.acquire(constraints).await;
            if let Err(tokio::sync::mpsc::error::SendError(outcome)) =
                tx.send(MediaOutcome { attempt, result })
            {
                if let Ok(media) = outcome.result {
                    media.stream.stop_all();
                }
            }
        }));
        self.set_status(CallStatus::AcquiringMedia);
    }

    async fn on_media_outcome(&mut self, outcome: MediaOutcome) {
        if self.torn_down || outcome.attempt != self.media_attempt {
            if let Ok(media) = outcome.result {
                tracing::debug!(target = "session", "stopping late media result");
                media.stream.stop_all();
            }
            return;
        }
        self.media_task = None;
        match outcome.result {
            Ok(media) => {
                if let Some(previous) = self.local_stream.replace(media.stream.clone()) {
                    previous.stop_all();
                }
                self.media_state = media.state;
                self.media_ready = true;
                if let Some(peer) = self.peer.as_mut() {
                    peer.attach_local_stream(media.stream).await;
                }
                if self.channel_connected {
                    self.send_join_room();
                } else {
                    self.set_status(CallStatus::Connecting);
                }
                self.publish();
            }
            Err(err) => {
                self.media_state = self.acquirer.state();
                tracing::warn!(
                    target = "session",
                    room_id = %self.room_id,
                    error = %err,
                    actions = ?err.recovery_actions(),
                    "cannot start call without media"
                );
                self.set_status(CallStatus::PermissionError(err));
                self.publish();
            }
        }
    }

    fn retry_media(&mut self) -> Result<(), SessionError> {
        if !self.status.is_permission_error() {
            return Err(SessionError::NothingToRecover("retry"));
        }
        self.constraints = self.config.constraints;
        for kind in [MediaKind::Audio, MediaKind::Video] {
            if self.constraints.wants(kind) {
                self.acquirer.allow_retry(kind);
            }
        }
        tracing::info!(target = "session", room_id = %self.room_id, "retrying media acquisition");
        self.start_media();
        Ok(())
    }

    fn continue_without(&mut self, kind: MediaKind) -> Result<(), SessionError> {
        if !self.status.is_permission_error() {
            return Err(SessionError::NothingToRecover("continue without"));
        }
        let constraints = self.constraints.without(kind);
        if constraints.is_empty() {
            return Err(PermissionError::Unknown("no media classes left to request".into()).into());
        }
        self.constraints = constraints;
        for remaining in [MediaKind::Audio, MediaKind::Video] {
            if constraints.wants(remaining) {
                self.acquirer.allow_retry(remaining);
            }
        }
        tracing::info!(
            target = "session",
            room_id = %self.room_id,
            without = kind.as_str(),
            "continuing with reduced media"
        );
        self.start_media();
        Ok(())
    }

    /// Registers relay handlers and announces this participant. Runs once
    /// media is ready and the channel is up.
    fn send_join_room(&mut self) {
        if self.join_sent || !self.media_ready || !self.channel_connected || self.torn_down {
            return;
        }
        let Some(channel) = self.channel.clone() else {
            return;
        };
        if !self.handlers_registered {
            for kind in InboundKind::ALL {
                let tx = self.inbound_tx.clone();
                if let Err(err) = channel.on(kind, move |event| {
                    let _ = tx.send(event);
                }) {
                    tracing::warn!(target = "session", error = %err, "failed to register relay handler");
                }
            }
            self.handlers_registered = true;
        }
        channel.send(ClientEvent::JoinRoom {
            room_id: self.room_id.clone(),
            user_id: self.user_id.clone(),
        });
        self.join_sent = true;
        tracing::info!(
            target = "session",
            room_id = %self.room_id,
            participant_id = ?self.local_participant_id,
            "join-room sent"
        );
        self.set_status(CallStatus::WaitingForPeer);
    }

    async fn on_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected { participant_id } => {
                self.local_participant_id = Some(participant_id);
                self.channel_connected = true;
                self.send_join_room();
            }
            ChannelEvent::Reconnected { participant_id } => {
                self.local_participant_id = Some(participant_id);
                self.channel_connected = true;
                if !self.join_sent {
                    self.send_join_room();
                } else if self.config.rejoin_on_reconnect {
                    tracing::info!(
                        target = "session",
                        room_id = %self.room_id,
                        participant_id = ?self.local_participant_id,
                        "signaling reconnected; rejoining room"
                    );
                    self.reset_peer().await;
                    if let Some(channel) = &self.channel {
                        channel.send(ClientEvent::JoinRoom {
                            room_id: self.room_id.clone(),
                            user_id: self.user_id.clone(),
                        });
                    }
                    self.set_status(CallStatus::WaitingForPeer);
                } else {
                    tracing::warn!(
                        target = "session",
                        room_id = %self.room_id,
                        "signaling reconnected; not rejoining room"
                    );
                }
            }
            ChannelEvent::AuthMissing => {
                self.anonymous = true;
            }
            ChannelEvent::ConnectError { message } => {
                tracing::debug!(target = "session", error = %message, "signaling connect attempt failed");
                self.last_error = Some(message);
            }
            ChannelEvent::Disconnected { reason } => {
                self.channel_connected = false;
                match reason {
                    DisconnectReason::Transport => self.signaling_lost(CallStatus::Connecting),
                    DisconnectReason::ServerInitiated => {
                        self.last_error = Some("relay closed the connection".into());
                        self.signaling_lost(CallStatus::Disconnected);
                    }
                }
            }
            ChannelEvent::GaveUp { attempts } => {
                self.last_error = Some(format!("signaling unreachable after {attempts} attempts"));
                self.signaling_lost(CallStatus::Disconnected);
            }
        }
        self.publish();
    }

    /// An established peer link keeps media flowing without the relay.
    fn signaling_lost(&mut self, next: CallStatus) {
        if self.status == CallStatus::Connected
            || self.status.is_permission_error()
            || self.status == CallStatus::AcquiringMedia
        {
            return;
        }
        self.set_status(next);
    }

    async fn on_relay_message(&mut self, message: ServerEvent) {
        if self.torn_down {
            return;
        }
        match message {
            ServerEvent::UserJoined { user_id, socket_id } => {
                if self.local_participant_id.as_deref() == Some(socket_id.as_str()) {
                    return;
                }
                tracing::info!(
                    target = "session",
                    room_id = %self.room_id,
                    remote_user = %user_id,
                    remote_id = %socket_id,
                    "peer joined"
                );
                let Some(peer) = self.peer.as_mut() else {
                    return;
                };
                let is_new = !peer.has_connection();
                let result = peer.handle_peer_joined(&socket_id).await;
                if is_new {
                    self.introduce(&socket_id);
                }
                self.after_negotiation_step(&socket_id, result);
            }
            ServerEvent::ReceiveOffer { sender, offer } => {
                let Some(peer) = self.peer.as_mut() else {
                    return;
                };
                let is_new = !peer.has_connection();
                let result = peer.handle_offer_received(&sender, offer).await;
                if is_new {
                    self.introduce(&sender);
                }
                self.after_negotiation_step(&sender, result);
            }
            ServerEvent::ReceiveAnswer { sender, answer } => {
                let Some(peer) = self.peer.as_mut() else {
                    return;
                };
                if peer.remote_id() != Some(sender.as_str()) {
                    tracing::debug!(target = "session", sender = %sender, "ignoring answer from unexpected sender");
                    return;
                }
                if let Err(err) = peer.handle_answer_received(answer).await {
                    self.negotiation_failed(err);
                }
            }
            ServerEvent::ReceiveIceCandidate { sender, candidate } => {
                let Some(peer) = self.peer.as_mut() else {
                    return;
                };
                if peer.remote_id().is_some_and(|remote| remote != sender) {
                    tracing::debug!(target = "session", sender = %sender, "ignoring candidate from unexpected sender");
                    return;
                }
                peer.handle_ice_candidate(candidate).await;
            }
            ServerEvent::UserDisconnected { user_id, socket_id } => {
                let is_current = self.remote_participant_id.as_deref() == Some(socket_id.as_str())
                    || self
                        .peer
                        .as_ref()
                        .and_then(|peer| peer.remote_id())
                        .is_some_and(|remote| remote == socket_id);
                if !is_current {
                    tracing::debug!(target = "session", remote_id = %socket_id, "ignoring disconnect of unknown participant");
                    return;
                }
                tracing::info!(
                    target = "session",
                    room_id = %self.room_id,
                    remote_user = %user_id,
                    remote_id = %socket_id,
                    "peer left the call"
                );
                self.reset_peer().await;
                self.rejoin_attempts = 0;
                self.set_status(CallStatus::WaitingForPeer);
            }
            ServerEvent::UserInfo { name } => {
                tracing::debug!(target = "session", remote_name = %name, "remote participant introduced");
                self.remote_display_name = Some(name);
            }
            ServerEvent::Error { message } => {
                tracing::warn!(target = "session", room_id = %self.room_id, error = %message, "relay reported an error");
                self.last_error = Some(message);
            }
            ServerEvent::Connected { .. } | ServerEvent::Pong => {}
        }
        self.publish();
    }

    fn introduce(&self, remote_id: &str) {
        let (Some(name), Some(channel)) = (&self.config.display_name, &self.channel) else {
            return;
        };
        channel.send(ClientEvent::UserInfo {
            target: Some(remote_id.to_string()),
            name: name.clone(),
        });
    }

    fn after_negotiation_step(&mut self, remote_id: &str, result: Result<(), NegotiationError>) {
        if let Err(err) = result {
            self.negotiation_failed(err);
            return;
        }
        let Some(peer) = self.peer.as_ref() else {
            return;
        };
        if peer.remote_id() != Some(remote_id) {
            return;
        }
        self.remote_participant_id = Some(remote_id.to_string());
        if matches!(
            peer.phase(),
            PeerPhase::AwaitingAnswer | PeerPhase::Answering | PeerPhase::Negotiating
        ) {
            self.set_status(CallStatus::Negotiating);
        }
    }

    fn negotiation_failed(&mut self, err: NegotiationError) {
        tracing::warn!(
            target = "session",
            room_id = %self.room_id,
            error = %err,
            "negotiation failed"
        );
        self.last_error = Some(err.to_string());
        if !self.peer.as_ref().is_some_and(PeerManager::has_connection) {
            self.remote_participant_id = None;
            if self.status == CallStatus::Negotiating {
                self.set_status(CallStatus::WaitingForPeer);
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) {
        let Some(peer) = self.peer.as_mut() else {
            return;
        };
        let Some(state) = peer.handle_link_event(event).await else {
            return;
        };
        match state {
            LinkState::Connected => {
                self.rejoin_attempts = 0;
                self.set_status(CallStatus::Connected);
            }
            LinkState::Disconnected => {
                self.set_status(CallStatus::Disconnected);
            }
            LinkState::Failed => {
                self.set_status(CallStatus::Disconnected);
                self.apply_failure_policy().await;
            }
            LinkState::New | LinkState::Connecting | LinkState::Closed => {}
        }
        self.publish();
    }

    async fn apply_failure_policy(&mut self) {
        match self.config.failure_policy {
            PeerFailurePolicy::Manual => {
                tracing::warn!(
                    target = "session",
                    room_id = %self.room_id,
                    "peer connection failed; waiting for the user to rejoin"
                );
            }
            PeerFailurePolicy::Rejoin { max_attempts } if self.rejoin_attempts < max_attempts => {
                self.rejoin_attempts += 1;
                tracing::info!(
                    target = "session",
                    room_id = %self.room_id,
                    attempt = self.rejoin_attempts,
                    max_attempts,
                    "peer connection failed; rejoining room"
                );
                self.reset_peer().await;
                if let Some(channel) = &self.channel {
                    channel.send(ClientEvent::LeaveRoom(self.room_id.clone()));
                    channel.send(ClientEvent::JoinRoom {
                        room_id: self.room_id.clone(),
                        user_id: self.user_id.clone(),
                    });
                }
                self.set_status(CallStatus::WaitingForPeer);
            }
            PeerFailurePolicy::Rejoin { max_attempts } => {
                tracing::warn!(
                    target = "session",
                    room_id = %self.room_id,
                    max_attempts,
                    "peer connection failed; rejoin attempts exhausted"
                );
            }
        }
    }

    /// Drops the current peer link and accepts a new peer.
    async fn reset_peer(&mut self) {
        if let Some(peer) = self.peer.as_mut() {
            peer.handle_peer_disconnected().await;
            peer.rearm();
        }
        self.remote_participant_id = None;
        self.remote_display_name = None;
    }

    fn toggle(&mut self, kind: MediaKind) -> Option<bool> {
        let track = self.local_stream.as_ref()?.track(kind)?.clone();
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        tracing::info!(target = "session", kind = kind.as_str(), enabled, "local track toggled");
        self.publish();
        Some(enabled)
    }

    fn toggle_fullscreen(&mut self) -> bool {
        let display = &self.deps.display;
        let result = if display.is_fullscreen() {
            display.exit_fullscreen()
        } else {
            display.enter_fullscreen()
        };
        if let Err(err) = result {
            tracing::warn!(target = "session", error = %err, "fullscreen change refused");
        }
        self.publish();
        display.is_fullscreen()
    }

    fn set_status(&mut self, next: CallStatus) -> bool {
        if self.status == next {
            return false;
        }
        if !self.status.can_transition_to(&next) {
            tracing::warn!(
                target = "session",
                room_id = %self.room_id,
                from = %self.status,
                to = %next,
                "refusing call status transition"
            );
            return false;
        }
        tracing::info!(
            target = "session",
            room_id = %self.room_id,
            from = %self.status,
            to = %next,
            "call status changed"
        );
        self.status = next;
        if self.status == CallStatus::WaitingForPeer && !self.torn_down && self.timer.start() {
            tracing::debug!(target = "session", room_id = %self.room_id, "call timer started");
        }
        self.publish();
        true
    }

    fn snapshot(&self) -> CallSnapshot {
        let enabled = |kind| {
            self.local_stream
                .as_ref()
                .and_then(|stream| stream.track(kind))
                .is_some_and(|track| track.is_enabled() && track.is_live())
        };
        CallSnapshot {
            room_id: self.room_id.clone(),
            status: self.status.clone(),
            local_participant_id: self.local_participant_id.clone(),
            remote_participant_id: self.remote_participant_id.clone(),
            remote_display_name: self.remote_display_name.clone(),
            media: self.media_state,
            audio_enabled: enabled(MediaKind::Audio),
            video_enabled: enabled(MediaKind::Video),
            fullscreen: self.deps.display.is_fullscreen(),
            anonymous: self.anonymous,
            joined: self.join_sent,
            torn_down: self.torn_down,
            call_started_at: self.timer.started_at(),
            last_error: self.last_error.clone(),
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn begin_teardown(&mut self) -> bool {
        if self.torn_down {
            return false;
        }
        self.torn_down = true;
        self.media_attempt += 1;
        if let Some(task) = self.media_task.take() {
            task.abort();
            self.cancelled_media = Some(task);
        }
        if let Some(channel) = &self.channel {
            if self.join_sent {
                channel.send(ClientEvent::LeaveRoom(self.room_id.clone()));
            }
            channel.off_all();
        }
        true
    }

    fn finish_teardown(&mut self) {
        if let Some(stream) = self.local_stream.take() {
            stream.stop_all();
        }
        while let Ok(outcome) = self.media_rx.try_recv() {
            if let Ok(media) = outcome.result {
                media.stream.stop_all();
            }
        }
        self.media_ready = false;
        self.channel_connected = false;
        self.channel_events = None;
        self.remote_participant_id = None;
        self.remote_display_name = None;
        if let Some(elapsed) = self.timer.stop() {
            tracing::info!(
                target = "session",
                room_id = %self.room_id,
                duration = %super::timer::format_duration(elapsed),
                "call ended"
            );
        }
        if self.deps.display.is_fullscreen() {
            let _ = self.deps.display.exit_fullscreen();
        }
        self.set_status(CallStatus::Disconnected);
        self.publish();
    }

    async fn teardown(&mut self) {
        if !self.begin_teardown() {
            return;
        }
        // Resolves once the aborted acquisition has dropped, releasing
        // any device it had already opened.
        if let Some(task) = self.cancelled_media.take() {
            let _ = task.await;
        }
        if let Some(peer) = self.peer.as_mut() {
            peer.destroy().await;
        }
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        self.finish_teardown();
    }

    /// Teardown for paths that cannot await (task abort, runtime shutdown).
    fn teardown_now(&mut self) {
        if !self.begin_teardown() {
            return;
        }
        if let Some(peer) = self.peer.as_mut() {
            peer.destroy_now();
        }
        if let Some(channel) = self.channel.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { channel.close().await });
            }
        }
        self.finish_teardown();
    }
}

impl Drop for SessionActor {
    fn drop(&mut self) {
        self.teardown_now();
    }
}

async fn next_event<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> T {
    if let Some(inner) = rx.as_mut() {
        if let Some(value) = inner.recv().await {
            return value;
        }
        *rx = None;
    }
    std::future::pending().await
}
