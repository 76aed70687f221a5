//! Persistent relay channel for one call room.
//!
//! The channel owns a driver task that connects through a [`Connector`],
//! dispatches relay messages to at most one handler per [`InboundKind`], and
//! reconnects after transport drops with capped exponential backoff. A close
//! frame from the relay ends the channel instead.

pub mod backoff;
pub mod connector;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use room_relay::{ClientEvent, ServerEvent};
use thiserror::Error;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use url::Url;

pub use backoff::ReconnectPolicy;
pub use connector::{
    ConnectRequest, Connection, Connector, Credentials, DisconnectReason, Inbound,
    MemoryConnector, WsConnector,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("invalid signaling endpoint {0}")]
    InvalidEndpoint(String),
    #[error("signaling connect failed: {0}")]
    Connect(String),
    #[error("signaling channel closed")]
    ChannelClosed,
    #[error("a handler for {0:?} is already registered")]
    HandlerAlreadyRegistered(InboundKind),
    #[error("failed to encode signaling message: {0}")]
    Encode(String),
}

/// Relay messages a session can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InboundKind {
    UserJoined,
    ReceiveOffer,
    ReceiveAnswer,
    ReceiveIceCandidate,
    UserDisconnected,
    UserInfo,
    Error,
}

impl InboundKind {
    pub const ALL: [InboundKind; 7] = [
        InboundKind::UserJoined,
        InboundKind::ReceiveOffer,
        InboundKind::ReceiveAnswer,
        InboundKind::ReceiveIceCandidate,
        InboundKind::UserDisconnected,
        InboundKind::UserInfo,
        InboundKind::Error,
    ];

    /// `None` for frames the channel consumes itself.
    pub fn of(event: &ServerEvent) -> Option<Self> {
        match event {
            ServerEvent::UserJoined { .. } => Some(InboundKind::UserJoined),
            ServerEvent::ReceiveOffer { .. } => Some(InboundKind::ReceiveOffer),
            ServerEvent::ReceiveAnswer { .. } => Some(InboundKind::ReceiveAnswer),
            ServerEvent::ReceiveIceCandidate { .. } => Some(InboundKind::ReceiveIceCandidate),
            ServerEvent::UserDisconnected { .. } => Some(InboundKind::UserDisconnected),
            ServerEvent::UserInfo { .. } => Some(InboundKind::UserInfo),
            ServerEvent::Error { .. } => Some(InboundKind::Error),
            ServerEvent::Connected { .. } | ServerEvent::Pong => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Connected { participant_id: String },
    Reconnected { participant_id: String },
    /// The channel is running without a bearer token.
    AuthMissing,
    ConnectError { message: String },
    Disconnected { reason: DisconnectReason },
    GaveUp { attempts: u32 },
}

/// Outbound side of the channel as seen by negotiation code.
pub trait SignalSink: Send + Sync {
    fn send(&self, message: ClientEvent);
}

type Handler = Arc<dyn Fn(ServerEvent) + Send + Sync>;

struct ChannelShared {
    room_id: String,
    outgoing: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
    handlers: Mutex<HashMap<InboundKind, Handler>>,
    participant_id: Mutex<Option<String>>,
    unhandled: AtomicU64,
    closed: AtomicBool,
    shutdown: Notify,
}

impl ChannelShared {
    fn dispatch(&self, event: ServerEvent) {
        let Some(kind) = InboundKind::of(&event) else {
            return;
        };
        let handler = self.handlers.lock().get(&kind).cloned();
        match handler {
            Some(handler) => handler(event),
            None => {
                self.unhandled.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    target = "signaling",
                    room_id = %self.room_id,
                    kind = ?kind,
                    "no handler registered; discarding relay message"
                );
            }
        }
    }
}

pub struct SignalingChannel {
    shared: Arc<ChannelShared>,
    driver: Mutex<Option<JoinHandle<()>>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl SignalingChannel {
    /// Starts the channel. Only an unusable endpoint fails here; connect
    /// failures are reported as [`ChannelEvent::ConnectError`] and retried.
    pub fn connect(
        endpoint: &str,
        credentials: Credentials,
        room_id: &str,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
    ) -> Result<Self, SignalingError> {
        let endpoint = derive_websocket_url(endpoint)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ChannelShared {
            room_id: room_id.to_string(),
            outgoing: Mutex::new(None),
            handlers: Mutex::new(HashMap::new()),
            participant_id: Mutex::new(None),
            unhandled: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        if credentials.is_anonymous() {
            tracing::info!(
                target = "signaling",
                room_id = %room_id,
                "no auth token available; connecting anonymously"
            );
            let _ = events_tx.send(ChannelEvent::AuthMissing);
        }

        let request = ConnectRequest {
            endpoint,
            room_id: room_id.to_string(),
            credentials,
        };
        let driver = tokio::spawn(drive(
            Arc::clone(&shared),
            connector,
            request,
            policy,
            events_tx,
        ));

        Ok(Self {
            shared,
            driver: Mutex::new(Some(driver)),
            events: Mutex::new(Some(events_rx)),
        })
    }

    /// Lifecycle events. Can be taken once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.lock().take()
    }

    pub fn room_id(&self) -> &str {
        &self.shared.room_id
    }

    /// Relay-assigned id of the current connection.
    pub fn participant_id(&self) -> Option<String> {
        self.shared.participant_id.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.outgoing.lock().is_some()
    }

    pub fn unhandled_count(&self) -> u64 {
        self.shared.unhandled.load(Ordering::Relaxed)
    }

    pub fn on<F>(&self, kind: InboundKind, handler: F) -> Result<(), SignalingError>
    where
        F: Fn(ServerEvent) + Send + Sync + 'static,
    {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SignalingError::ChannelClosed);
        }
        let mut handlers = self.shared.handlers.lock();
        if handlers.contains_key(&kind) {
            return Err(SignalingError::HandlerAlreadyRegistered(kind));
        }
        handlers.insert(kind, Arc::new(handler));
        Ok(())
    }

    pub fn off(&self, kind: InboundKind) -> bool {
        self.shared.handlers.lock().remove(&kind).is_some()
    }

    pub fn off_all(&self) {
        self.shared.handlers.lock().clear();
    }

    /// Fire-and-forget. Dropped with a debug log while disconnected.
    pub fn send(&self, message: ClientEvent) {
        let outgoing = self.shared.outgoing.lock();
        let delivered = outgoing
            .as_ref()
            .is_some_and(|tx| tx.send(message.clone()).is_ok());
        if !delivered {
            tracing::debug!(
                target = "signaling",
                room_id = %self.shared.room_id,
                kind = message.name(),
                "signaling channel down; dropping outbound message"
            );
        }
    }

    /// Deregisters handlers, flushes queued messages and stops the driver.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.off_all();
        self.shared.outgoing.lock().take();
        self.shared.shutdown.notify_one();
        let driver = self.driver.lock().take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(CLOSE_GRACE * 2, &mut driver).await.is_err() {
                driver.abort();
            }
        }
        tracing::debug!(target = "signaling", room_id = %self.shared.room_id, "signaling channel closed");
    }
}

impl SignalSink for SignalingChannel {
    fn send(&self, message: ClientEvent) {
        SignalingChannel::send(self, message);
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.off_all();
        self.shared.outgoing.lock().take();
        if let Some(driver) = self.driver.lock().take() {
            driver.abort();
        }
    }
}

enum SessionEnd {
    Lost(DisconnectReason),
    Shutdown,
}

async fn drive(
    shared: Arc<ChannelShared>,
    connector: Arc<dyn Connector>,
    request: ConnectRequest,
    policy: ReconnectPolicy,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let mut failures: u32 = 0;
    let mut established_once = false;

    while !shared.closed.load(Ordering::SeqCst) {
        match connector.connect(&request).await {
            Ok(connection) => {
                failures = 0;
                match run_connection(&shared, connection, &events, &mut established_once).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Lost(reason) => {
                        shared.outgoing.lock().take();
                        let _ = events.send(ChannelEvent::Disconnected { reason });
                        if reason == DisconnectReason::ServerInitiated {
                            tracing::warn!(
                                target = "signaling",
                                room_id = %shared.room_id,
                                "relay closed the signaling connection; not reconnecting"
                            );
                            return;
                        }
                        tracing::info!(
                            target = "signaling",
                            room_id = %shared.room_id,
                            "signaling transport dropped; reconnecting"
                        );
                    }
                }
            }
            Err(err) => {
                tracing::warn!(
                    target = "signaling",
                    room_id = %shared.room_id,
                    error = %err,
                    "signaling connect failed"
                );
                let _ = events.send(ChannelEvent::ConnectError {
                    message: err.to_string(),
                });
            }
        }

        failures += 1;
        if failures > policy.max_attempts {
            tracing::warn!(
                target = "signaling",
                room_id = %shared.room_id,
                attempts = policy.max_attempts,
                "giving up on signaling reconnect"
            );
            let _ = events.send(ChannelEvent::GaveUp {
                attempts: policy.max_attempts,
            });
            return;
        }
        let delay = policy.delay_for(failures);
        tracing::debug!(
            target = "signaling",
            room_id = %shared.room_id,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            "scheduling signaling reconnect"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.shutdown.notified() => return,
        }
    }
}

async fn run_connection(
    shared: &Arc<ChannelShared>,
    mut connection: Connection,
    events: &mpsc::UnboundedSender<ChannelEvent>,
    established_once: &mut bool,
) -> SessionEnd {
    *shared.outgoing.lock() = Some(connection.outgoing.clone());
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );

    loop {
        tokio::select! {
            inbound = connection.incoming.recv() => match inbound {
                Some(Inbound::Event(ServerEvent::Connected { socket_id })) => {
                    *shared.participant_id.lock() = Some(socket_id.clone());
                    let event = if *established_once {
                        ChannelEvent::Reconnected { participant_id: socket_id.clone() }
                    } else {
                        ChannelEvent::Connected { participant_id: socket_id.clone() }
                    };
                    *established_once = true;
                    tracing::info!(
                        target = "signaling",
                        room_id = %shared.room_id,
                        participant_id = %socket_id,
                        "signaling connected"
                    );
                    let _ = events.send(event);
                }
                Some(Inbound::Event(ServerEvent::Pong)) => {
                    tracing::trace!(target = "signaling", "pong");
                }
                Some(Inbound::Event(event)) => shared.dispatch(event),
                Some(Inbound::Closed(reason)) => return SessionEnd::Lost(reason),
                None => return SessionEnd::Lost(DisconnectReason::Transport),
            },
            _ = heartbeat.tick() => {
                if connection.outgoing.send(ClientEvent::Ping).is_err() {
                    return SessionEnd::Lost(DisconnectReason::Transport);
                }
            }
            _ = shared.shutdown.notified() => {
                connection.shutdown(CLOSE_GRACE).await;
                return SessionEnd::Shutdown;
            }
        }
    }
}

/// Normalises a configured relay address to a WebSocket URL. Bare
/// `http(s)` origins get the `/ws` path.
pub fn derive_websocket_url(signaling_url: &str) -> Result<Url, SignalingError> {
    let mut url = Url::parse(signaling_url.trim())
        .map_err(|err| SignalingError::InvalidEndpoint(format!("{signaling_url}: {err}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        "memory" => "memory",
        other => {
            return Err(SignalingError::InvalidEndpoint(format!(
                "unsupported scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidEndpoint("invalid websocket scheme".into()))?;
    if scheme != "memory" && (url.path().is_empty() || url.path() == "/") {
        url.set_path("/ws");
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use room_relay::RoomRegistry;

    fn memory_channel(connector: &MemoryConnector, policy: ReconnectPolicy) -> SignalingChannel {
        SignalingChannel::connect(
            "memory://relay",
            Credentials::Anonymous,
            "r1",
            Arc::new(connector.clone()),
            policy,
        )
        .expect("channel")
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("event timeout")
            .expect("event stream ended")
    }

    #[test]
    fn websocket_url_is_derived_from_http_origin() {
        let url = derive_websocket_url("https://relay.example.com").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/ws");
        let url = derive_websocket_url("ws://127.0.0.1:8090/ws?stale=1").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8090/ws");
        assert!(matches!(
            derive_websocket_url("ftp://relay"),
            Err(SignalingError::InvalidEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn second_handler_for_same_kind_is_refused() {
        let connector = MemoryConnector::new(RoomRegistry::new());
        let channel = memory_channel(&connector, ReconnectPolicy::default());
        channel.on(InboundKind::UserJoined, |_| {}).unwrap();
        assert_eq!(
            channel.on(InboundKind::UserJoined, |_| {}),
            Err(SignalingError::HandlerAlreadyRegistered(InboundKind::UserJoined))
        );
        assert!(channel.off(InboundKind::UserJoined));
        channel.on(InboundKind::UserJoined, |_| {}).unwrap();
        channel.close().await;
    }

    #[tokio::test]
    async fn anonymous_connect_reports_auth_missing_then_connected() {
        let connector = MemoryConnector::new(RoomRegistry::new());
        let channel = memory_channel(&connector, ReconnectPolicy::default());
        let mut events = channel.events().expect("events");
        assert_eq!(next_event(&mut events).await, ChannelEvent::AuthMissing);
        let participant_id = match next_event(&mut events).await {
            ChannelEvent::Connected { participant_id } => participant_id,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(channel.participant_id(), Some(participant_id));
        assert_eq!(connector.requests()[0].credentials.token(), "");
        channel.close().await;
    }

    #[tokio::test]
    async fn unhandled_messages_are_counted_not_delivered() {
        let registry = RoomRegistry::new();
        let connector = MemoryConnector::new(registry.clone());
        let channel = memory_channel(&connector, ReconnectPolicy::default());
        let mut events = channel.events().expect("events");
        let _ = next_event(&mut events).await;
        let _ = next_event(&mut events).await;

        channel.send(ClientEvent::JoinRoom {
            room_id: "r1".into(),
            user_id: "a".into(),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let other = registry.connect(Some("r1"), tx);
        let _ = rx.recv().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry
            .handle(
                &other,
                ClientEvent::JoinRoom {
                    room_id: "r1".into(),
                    user_id: "b".into(),
                },
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(channel.unhandled_count(), 1);
        channel.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transport_drop_reconnects_with_new_participant_id() {
        let connector = MemoryConnector::new(RoomRegistry::new());
        let channel = memory_channel(&connector, ReconnectPolicy::default());
        let mut events = channel.events().expect("events");
        let _ = next_event(&mut events).await;
        let first = match next_event(&mut events).await {
            ChannelEvent::Connected { participant_id } => participant_id,
            other => panic!("unexpected {other:?}"),
        };

        connector.sever();
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Disconnected {
                reason: DisconnectReason::Transport
            }
        );
        match next_event(&mut events).await {
            ChannelEvent::Reconnected { participant_id } => assert_ne!(participant_id, first),
            other => panic!("unexpected {other:?}"),
        }
        channel.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn relay_close_is_not_reconnected() {
        let connector = MemoryConnector::new(RoomRegistry::new());
        let channel = memory_channel(&connector, ReconnectPolicy::default());
        let mut events = channel.events().expect("events");
        let _ = next_event(&mut events).await;
        let _ = next_event(&mut events).await;

        connector.kick();
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Disconnected {
                reason: DisconnectReason::ServerInitiated
            }
        );
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.requests().len(), 1);
        assert!(!channel.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_bounded_attempts() {
        let connector = MemoryConnector::new(RoomRegistry::new());
        connector.fail_next_connects(u32::MAX);
        let channel = memory_channel(&connector, ReconnectPolicy::default().with_max_attempts(3));
        let mut events = channel.events().expect("events");
        let _ = next_event(&mut events).await;

        let mut errors = 0;
        loop {
            match next_event(&mut events).await {
                ChannelEvent::ConnectError { .. } => errors += 1,
                ChannelEvent::GaveUp { attempts } => {
                    assert_eq!(attempts, 3);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(errors, 4);
        assert_eq!(connector.requests().len(), 4);
    }
}
