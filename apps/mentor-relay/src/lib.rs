//! WebSocket front end for [`room_relay::RoomRegistry`].

pub mod config;

use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use room_relay::{ClientEvent, RoomRegistry, ServerEvent};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct ConnectQuery {
    #[serde(rename = "roomId")]
    room_id: Option<String>,
    #[serde(default)]
    token: String,
}

pub fn router(registry: RoomRegistry) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

/// Serves the relay until `shutdown` resolves, then closes every socket with
/// a close frame.
pub async fn serve(
    listener: TcpListener,
    registry: RoomRegistry,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    info!(%addr, "mentor-relay listening");
    let app = router(registry.clone());
    let kicker = registry.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.await;
        let closed = kicker.disconnect_all();
        info!(closed, "shutdown signal received; closing relay sockets");
    })
    .await
    .context("relay server exited with error")
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(registry): State<RoomRegistry>) -> impl IntoResponse {
    Json(registry.stats())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<ConnectQuery>,
    State(registry): State<RoomRegistry>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, query, registry))
}

async fn handle_socket(socket: WebSocket, query: ConnectQuery, registry: RoomRegistry) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let socket_id = registry.connect(query.room_id.as_deref(), tx);
    info!(
        socket_id = %socket_id,
        room_id = ?query.room_id,
        anonymous = query.token.is_empty(),
        "relay socket connected"
    );

    // The registry drops the outbox when it kicks a socket, which ends this
    // loop and sends the close frame.
    let writer_id = socket_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(err) => {
                    warn!(socket_id = %writer_id, error = %err, "failed to encode relay event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        let _ = sender
            .send(Message::Close(Some(CloseFrame {
                code: close_code::NORMAL,
                reason: "relay closed connection".into(),
            })))
            .await;
        debug!(socket_id = %writer_id, "relay writer finished");
    });

    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(socket_id = %socket_id, error = %err, "relay socket error");
                break;
            }
        };
        match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => {
                debug!(socket_id = %socket_id, event = event.name(), "client event");
                // Rejections are reported to the sender by the registry.
                let _ = registry.handle(&socket_id, event);
            }
            Err(err) => {
                warn!(socket_id = %socket_id, error = %err, "invalid client event");
            }
        }
    }

    registry.disconnect(&socket_id);
    let _ = writer.await;
    info!(socket_id = %socket_id, "relay socket closed");
}
