#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mentor_call_core::media::SyntheticDevices;
use mentor_call_core::peer::{MockPeerFactory, RecordingSurfaces};
use mentor_call_core::session::HeadlessDisplay;
use mentor_call_core::signaling::MemoryConnector;
use mentor_call_core::{CallConfig, CallHandle, CallParams, CallSnapshot, CallStatus, SessionDeps};
use room_relay::RoomRegistry;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::SubscriberBuilder;

pub const ROOM: &str = "r1";

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// One participant wired to in-memory signaling, devices and peers.
pub struct Party {
    pub call: CallHandle,
    pub connector: MemoryConnector,
    pub devices: SyntheticDevices,
    pub peers: MockPeerFactory,
    pub surfaces: RecordingSurfaces,
    pub display: Arc<HeadlessDisplay>,
}

pub fn memory_config(user: &str) -> CallConfig {
    CallConfig {
        signaling_url: "memory://relay".into(),
        display_name: Some(format!("{user} (display)")),
        ..CallConfig::default()
    }
}

pub fn party(registry: &RoomRegistry, user: &str, devices: SyntheticDevices) -> Party {
    party_with(registry, user, devices, |_| {}, HeadlessDisplay::new())
}

pub fn party_with(
    registry: &RoomRegistry,
    user: &str,
    devices: SyntheticDevices,
    configure: impl FnOnce(&mut CallConfig),
    display: HeadlessDisplay,
) -> Party {
    let connector = MemoryConnector::new(registry.clone());
    let peers = MockPeerFactory::new();
    let surfaces = RecordingSurfaces::new();
    let display = Arc::new(display);
    let mut config = memory_config(user);
    configure(&mut config);
    let call = CallHandle::spawn(
        CallParams {
            room_id: ROOM.into(),
            user_id: user.into(),
            config,
        },
        SessionDeps {
            connector: Arc::new(connector.clone()),
            devices: Arc::new(devices.clone()),
            peers: Arc::new(peers.clone()),
            surfaces: Arc::new(surfaces.clone()),
            display: display.clone(),
        },
    );
    Party {
        call,
        connector,
        devices,
        peers,
        surfaces,
        display,
    }
}

pub async fn wait_status(party: &Party, status: CallStatus) -> CallSnapshot {
    party
        .call
        .wait_for(|snapshot| snapshot.status == status)
        .await
        .expect("session ended before reaching status")
}

/// Joins both parties and waits until each reports `Connected`.
pub async fn connected_pair(registry: &RoomRegistry) -> (Party, Party) {
    let a = party(registry, "mentor", SyntheticDevices::new());
    a.call.join().await.expect("join a");
    wait_status(&a, CallStatus::WaitingForPeer).await;

    let b = party(registry, "student", SyntheticDevices::new());
    b.call.join().await.expect("join b");
    wait_status(&a, CallStatus::Connected).await;
    wait_status(&b, CallStatus::Connected).await;
    (a, b)
}

pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
