use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use room_relay::{ClientEvent, RoomRegistry, ServerEvent};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use super::SignalingError;

/// Bearer token presented to the relay. Anonymous connections send the
/// empty string, never an absent value.
#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    Bearer(String),
    #[default]
    Anonymous,
}

impl Credentials {
    pub fn from_token(token: Option<String>) -> Self {
        match token {
            Some(token) if !token.trim().is_empty() => Credentials::Bearer(token),
            _ => Credentials::Anonymous,
        }
    }

    pub fn token(&self) -> &str {
        match self {
            Credentials::Bearer(token) => token,
            Credentials::Anonymous => "",
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Credentials::Anonymous)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Credentials::Anonymous => f.write_str("Anonymous"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub endpoint: Url,
    pub room_id: String,
    pub credentials: Credentials,
}

impl ConnectRequest {
    /// Endpoint with the `roomId` and `token` query parameters applied.
    pub fn url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("roomId", &self.room_id)
            .append_pair("token", self.credentials.token());
        url
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The relay closed the socket. Not reconnected automatically.
    ServerInitiated,
    Transport,
}

#[derive(Debug)]
pub enum Inbound {
    Event(ServerEvent),
    Closed(DisconnectReason),
}

/// One live relay connection. Dropping it aborts its tasks.
pub struct Connection {
    pub outgoing: mpsc::UnboundedSender<ClientEvent>,
    pub incoming: mpsc::UnboundedReceiver<Inbound>,
    writer: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    pub fn new(
        outgoing: mpsc::UnboundedSender<ClientEvent>,
        incoming: mpsc::UnboundedReceiver<Inbound>,
        writer: JoinHandle<()>,
        tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            outgoing,
            incoming,
            writer: Some(writer),
            tasks,
        }
    }

    /// Closes the outgoing queue and gives the writer `grace` to flush what
    /// is already queued before the tasks are aborted.
    pub async fn shutdown(mut self, grace: Duration) {
        let (closed_tx, _) = mpsc::unbounded_channel();
        drop(std::mem::replace(&mut self.outgoing, closed_tx));
        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(grace, writer).await.is_err() {
                tracing::debug!(target = "signaling", "writer did not flush before close");
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, request: &ConnectRequest) -> Result<Connection, SignalingError>;
}

/// Relay connection over a WebSocket.
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Connection, SignalingError> {
        let url = request.url();
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| SignalingError::Connect(err.to_string()))?;
        tracing::debug!(
            target = "signaling",
            endpoint = %request.endpoint,
            room_id = %request.room_id,
            "signaling websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Inbound>();

        let writer = tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target = "signaling", error = %err, "failed to encode signaling message");
                        continue;
                    }
                };
                tracing::trace!(
                    target = "signaling",
                    event = "ws_out",
                    kind = event.name(),
                    len = text.len()
                );
                if ws_write.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            let _ = ws_write.send(Message::Close(None)).await;
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                let text = match ws_read.next().await {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!(target = "signaling", frame = ?frame, "relay sent close frame");
                        break DisconnectReason::ServerInitiated;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!(target = "signaling", "signaling websocket closed: {err}");
                            }
                            _ => {
                                tracing::warn!(target = "signaling", "signaling websocket error: {err}");
                            }
                        }
                        break DisconnectReason::Transport;
                    }
                    None => break DisconnectReason::Transport,
                };
                tracing::trace!(target = "signaling", event = "ws_in", len = text.len());
                match serde_json::from_str::<ServerEvent>(&text) {
                    Ok(event) => {
                        if in_tx.send(Inbound::Event(event)).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        tracing::debug!(target = "signaling", error = %err, "ignoring malformed relay frame");
                    }
                }
            };
            let _ = in_tx.send(Inbound::Closed(reason));
        });

        Ok(Connection::new(out_tx, in_rx, writer, vec![reader]))
    }
}

#[derive(Default)]
struct MemoryState {
    sent: Vec<ClientEvent>,
    requests: Vec<ConnectRequest>,
    live: Vec<LiveLink>,
    failures_remaining: u32,
}

struct LiveLink {
    socket_id: String,
    sever: Option<oneshot::Sender<()>>,
}

/// Removes the relay registration once both pump tasks are gone, however
/// they ended.
struct Registration {
    registry: RoomRegistry,
    socket_id: String,
    state: Arc<Mutex<MemoryState>>,
}

impl Registration {
    fn release(&self) {
        self.registry.disconnect(&self.socket_id);
        self.state
            .lock()
            .live
            .retain(|link| link.socket_id != self.socket_id);
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

/// In-process connector backed by a [`RoomRegistry`]. Records every message
/// sent through it and can simulate transport drops and relay kicks.
#[derive(Clone)]
pub struct MemoryConnector {
    registry: RoomRegistry,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    pub fn new(registry: RoomRegistry) -> Self {
        Self {
            registry,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    pub fn sent(&self) -> Vec<ClientEvent> {
        self.state.lock().sent.clone()
    }

    pub fn sent_named(&self, name: &str) -> Vec<ClientEvent> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|event| event.name() == name)
            .cloned()
            .collect()
    }

    pub fn requests(&self) -> Vec<ConnectRequest> {
        self.state.lock().requests.clone()
    }

    pub fn live_connections(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().failures_remaining = count;
    }

    /// Drops every live connection as a network failure would.
    pub fn sever(&self) {
        let mut state = self.state.lock();
        for link in state.live.iter_mut() {
            if let Some(sever) = link.sever.take() {
                let _ = sever.send(());
            }
        }
    }

    /// Has the relay close every live connection.
    pub fn kick(&self) {
        let ids: Vec<String> = self
            .state
            .lock()
            .live
            .iter()
            .map(|link| link.socket_id.clone())
            .collect();
        for id in ids {
            self.registry.disconnect(&id);
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Connection, SignalingError> {
        {
            let mut state = self.state.lock();
            state.requests.push(request.clone());
            if state.failures_remaining > 0 {
                state.failures_remaining -= 1;
                return Err(SignalingError::Connect("relay unreachable".into()));
            }
        }

        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<ServerEvent>();
        let socket_id = self.registry.connect(Some(&request.room_id), outbox_tx);
        let (sever_tx, sever_rx) = oneshot::channel::<()>();
        self.state.lock().live.push(LiveLink {
            socket_id: socket_id.clone(),
            sever: Some(sever_tx),
        });
        let registration = Arc::new(Registration {
            registry: self.registry.clone(),
            socket_id: socket_id.clone(),
            state: Arc::clone(&self.state),
        });

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Inbound>();

        let writer_registration = Arc::clone(&registration);
        let writer_state = Arc::clone(&self.state);
        let writer = tokio::spawn(async move {
            while let Some(event) = out_rx.recv().await {
                writer_state.lock().sent.push(event.clone());
                let _ = writer_registration
                    .registry
                    .handle(&writer_registration.socket_id, event);
            }
        });

        let pump = tokio::spawn(async move {
            let mut sever_rx = sever_rx;
            loop {
                tokio::select! {
                    event = outbox_rx.recv() => match event {
                        Some(event) => {
                            if in_tx.send(Inbound::Event(event)).is_err() {
                                return;
                            }
                        }
                        None => {
                            let _ = in_tx.send(Inbound::Closed(DisconnectReason::ServerInitiated));
                            return;
                        }
                    },
                    _ = &mut sever_rx => {
                        registration.release();
                        let _ = in_tx.send(Inbound::Closed(DisconnectReason::Transport));
                        return;
                    }
                }
            }
        });

        Ok(Connection::new(out_tx, in_rx, writer, vec![pump]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_request_carries_empty_token() {
        let request = ConnectRequest {
            endpoint: Url::parse("ws://relay.local/ws").unwrap(),
            room_id: "r1".into(),
            credentials: Credentials::from_token(Some("   ".into())),
        };
        assert_eq!(request.url().as_str(), "ws://relay.local/ws?roomId=r1&token=");
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials::from_token(Some("secret-jwt".into()));
        assert_eq!(format!("{creds:?}"), "Bearer(<redacted>)");
        assert_eq!(creds.token(), "secret-jwt");
    }

    #[tokio::test]
    async fn memory_connector_reports_kick_as_server_close() {
        let connector = MemoryConnector::new(RoomRegistry::new());
        let request = ConnectRequest {
            endpoint: Url::parse("memory://relay").unwrap(),
            room_id: "r1".into(),
            credentials: Credentials::Anonymous,
        };
        let mut connection = connector.connect(&request).await.unwrap();
        assert!(matches!(
            connection.incoming.recv().await,
            Some(Inbound::Event(ServerEvent::Connected { .. }))
        ));

        connector.kick();
        assert!(matches!(
            connection.incoming.recv().await,
            Some(Inbound::Closed(DisconnectReason::ServerInitiated))
        ));
    }

    #[tokio::test]
    async fn memory_connector_reports_sever_as_transport_drop() {
        let connector = MemoryConnector::new(RoomRegistry::new());
        let request = ConnectRequest {
            endpoint: Url::parse("memory://relay").unwrap(),
            room_id: "r1".into(),
            credentials: Credentials::Anonymous,
        };
        let mut connection = connector.connect(&request).await.unwrap();
        let _ = connection.incoming.recv().await;

        connector.sever();
        assert!(matches!(
            connection.incoming.recv().await,
            Some(Inbound::Closed(DisconnectReason::Transport))
        ));
        assert_eq!(connector.registry().stats().connections, 0);
        assert_eq!(connector.live_connections(), 0);
    }
}
