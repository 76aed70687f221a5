mod common;

use std::sync::Arc;

use common::{init_tracing, memory_config};
use mentor_call_core::media::SyntheticDevices;
use mentor_call_core::peer::{MockPeerFactory, RecordingSurfaces};
use mentor_call_core::session::HeadlessDisplay;
use mentor_call_core::signaling::{Credentials, WsConnector};
use mentor_call_core::{CallHandle, CallParams, CallStatus, SessionDeps};
use room_relay::RoomRegistry;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

async fn start_relay() -> (String, RoomRegistry, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let registry = RoomRegistry::new();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let served = registry.clone();
    tokio::spawn(async move {
        let _ = mentor_relay::serve(listener, served, async {
            let _ = stop_rx.await;
        })
        .await;
    });
    (format!("http://{addr}"), registry, stop_tx)
}

fn ws_call(base: &str, user: &str, token: Option<&str>) -> (CallHandle, MockPeerFactory) {
    let peers = MockPeerFactory::new();
    let mut config = memory_config(user);
    config.signaling_url = base.to_string();
    config.credentials = Credentials::from_token(token.map(str::to_string));
    let call = CallHandle::spawn(
        CallParams {
            room_id: "ws-room".into(),
            user_id: user.into(),
            config,
        },
        SessionDeps {
            connector: Arc::new(WsConnector),
            devices: Arc::new(SyntheticDevices::new()),
            peers: Arc::new(peers.clone()),
            surfaces: Arc::new(RecordingSurfaces::new()),
            display: Arc::new(HeadlessDisplay::new()),
        },
    );
    (call, peers)
}

#[test_timeout::tokio_timeout_test(30)]
async fn calls_negotiate_through_the_websocket_relay() {
    init_tracing();
    let (base, registry, stop) = start_relay().await;

    let (a, a_peers) = ws_call(&base, "mentor", Some("mentor-token"));
    a.join().await.unwrap();
    let a_waiting = a
        .wait_for(|s| s.status == CallStatus::WaitingForPeer)
        .await
        .unwrap();
    assert!(!a_waiting.anonymous);

    let (b, b_peers) = ws_call(&base, "student", None);
    b.join().await.unwrap();
    a.wait_for(|s| s.status == CallStatus::Connected).await.unwrap();
    let b_connected = b
        .wait_for(|s| s.status == CallStatus::Connected)
        .await
        .unwrap();
    assert!(b_connected.anonymous);
    assert_eq!(a_peers.created(), 1);
    assert_eq!(b_peers.created(), 1);
    assert_eq!(registry.room_members("ws-room").len(), 2);

    a.leave().await.unwrap();
    b.wait_for(|s| s.status == CallStatus::WaitingForPeer)
        .await
        .unwrap();

    // Relay shutdown closes the socket with a close frame: no reconnect.
    let _ = stop.send(());
    let ended = b
        .wait_for(|s| s.status == CallStatus::Disconnected)
        .await
        .unwrap();
    assert!(ended.last_error.is_some());
    b.leave().await.unwrap();
}
