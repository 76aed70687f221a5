use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{ClientEvent, ServerEvent};

/// A call room holds the two participants of a session.
pub const MAX_ROOM_MEMBERS: usize = 2;

pub type Outbox = mpsc::UnboundedSender<ServerEvent>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("unknown socket {0}")]
    UnknownSocket(String),
    #[error("room {0} is full")]
    RoomFull(String),
    #[error("socket has not joined room {0}")]
    NotJoined(String),
    #[error("target {target} is not in room {room_id}")]
    UnknownTarget { target: String, room_id: String },
    #[error("connection bound to room {bound} cannot join {requested}")]
    RoomMismatch { bound: String, requested: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub rooms: usize,
    pub connections: usize,
}

struct Member {
    outbox: Outbox,
    bound_room: Option<String>,
    joined: Option<Joined>,
}

#[derive(Clone)]
struct Joined {
    room_id: String,
    user_id: String,
}

#[derive(Default)]
struct RegistryState {
    sockets: HashMap<String, Member>,
    /// room id -> socket ids in join order
    rooms: HashMap<String, Vec<String>>,
}

impl RegistryState {
    fn send(&self, socket_id: &str, event: ServerEvent) {
        if let Some(member) = self.sockets.get(socket_id) {
            if member.outbox.send(event).is_err() {
                debug!(socket_id = %socket_id, "outbox closed; dropping relay event");
            }
        }
    }

    fn others(&self, room_id: &str, socket_id: &str) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|members| {
                members
                    .iter()
                    .filter(|id| id.as_str() != socket_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn joined(&self, socket_id: &str) -> Result<Joined, RelayError> {
        let member = self
            .sockets
            .get(socket_id)
            .ok_or_else(|| RelayError::UnknownSocket(socket_id.to_string()))?;
        member.joined.clone().ok_or_else(|| {
            RelayError::NotJoined(member.bound_room.clone().unwrap_or_default())
        })
    }

    fn leave_room(&mut self, socket_id: &str) {
        let Some(joined) = self
            .sockets
            .get_mut(socket_id)
            .and_then(|member| member.joined.take())
        else {
            return;
        };

        let mut remove_room = false;
        if let Some(members) = self.rooms.get_mut(&joined.room_id) {
            members.retain(|id| id != socket_id);
            remove_room = members.is_empty();
        }
        if remove_room {
            self.rooms.remove(&joined.room_id);
        }

        for other in self.others(&joined.room_id, socket_id) {
            self.send(
                &other,
                ServerEvent::UserDisconnected {
                    user_id: joined.user_id.clone(),
                    socket_id: socket_id.to_string(),
                },
            );
        }
        info!(
            room_id = %joined.room_id,
            socket_id = %socket_id,
            user_id = %joined.user_id,
            "participant left room"
        );
    }

    fn route(&self, sender: &str, target: &str, event: ServerEvent) -> Result<(), RelayError> {
        let joined = self.joined(sender)?;
        let target_in_room = self
            .rooms
            .get(&joined.room_id)
            .is_some_and(|members| members.iter().any(|id| id == target));
        if !target_in_room || target == sender {
            return Err(RelayError::UnknownTarget {
                target: target.to_string(),
                room_id: joined.room_id,
            });
        }
        debug!(
            room_id = %joined.room_id,
            from = %sender,
            to = %target,
            event = event.name(),
            "relaying signal"
        );
        self.send(target, event);
        Ok(())
    }
}

/// In-process room relay shared by the WebSocket server and in-memory
/// connectors.
///
/// Each connection registers an outbox and receives `connected` with its
/// relay-assigned socket id. Directed messages only reach a target that has
/// joined the same room.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection and returns its socket id. `room_hint` is
    /// the `roomId` supplied at connect time; a later `join-room` for a
    /// different room is rejected.
    pub fn connect(&self, room_hint: Option<&str>, outbox: Outbox) -> String {
        let socket_id = Uuid::new_v4().to_string();
        let _ = outbox.send(ServerEvent::Connected {
            socket_id: socket_id.clone(),
        });
        let mut state = self.inner.lock();
        state.sockets.insert(
            socket_id.clone(),
            Member {
                outbox,
                bound_room: room_hint
                    .map(str::trim)
                    .filter(|room| !room.is_empty())
                    .map(str::to_string),
                joined: None,
            },
        );
        debug!(socket_id = %socket_id, room_hint = ?room_hint, "relay connection registered");
        socket_id
    }

    /// Applies one client event. Failures are reported back to the sender as
    /// an `error` event and returned for logging.
    pub fn handle(&self, socket_id: &str, event: ClientEvent) -> Result<(), RelayError> {
        let mut state = self.inner.lock();
        let result = Self::apply(&mut state, socket_id, event);
        if let Err(err) = &result {
            warn!(socket_id = %socket_id, error = %err, "relay rejected client event");
            state.send(
                socket_id,
                ServerEvent::Error {
                    message: err.to_string(),
                },
            );
        }
        result
    }

    fn apply(
        state: &mut RegistryState,
        socket_id: &str,
        event: ClientEvent,
    ) -> Result<(), RelayError> {
        match event {
            ClientEvent::JoinRoom { room_id, user_id } => {
                let member = state
                    .sockets
                    .get(socket_id)
                    .ok_or_else(|| RelayError::UnknownSocket(socket_id.to_string()))?;
                if let Some(bound) = &member.bound_room {
                    if bound != &room_id {
                        return Err(RelayError::RoomMismatch {
                            bound: bound.clone(),
                            requested: room_id,
                        });
                    }
                }
                if let Some(joined) = &member.joined {
                    if joined.room_id == room_id {
                        debug!(socket_id = %socket_id, room_id = %room_id, "duplicate join ignored");
                        return Ok(());
                    }
                    state.leave_room(socket_id);
                }

                let occupancy = state.rooms.get(&room_id).map_or(0, Vec::len);
                if occupancy >= MAX_ROOM_MEMBERS {
                    return Err(RelayError::RoomFull(room_id));
                }

                state
                    .rooms
                    .entry(room_id.clone())
                    .or_default()
                    .push(socket_id.to_string());
                if let Some(member) = state.sockets.get_mut(socket_id) {
                    member.joined = Some(Joined {
                        room_id: room_id.clone(),
                        user_id: user_id.clone(),
                    });
                }
                for other in state.others(&room_id, socket_id) {
                    state.send(
                        &other,
                        ServerEvent::UserJoined {
                            user_id: user_id.clone(),
                            socket_id: socket_id.to_string(),
                        },
                    );
                }
                info!(
                    room_id = %room_id,
                    socket_id = %socket_id,
                    user_id = %user_id,
                    members = occupancy + 1,
                    "participant joined room"
                );
                Ok(())
            }
            ClientEvent::LeaveRoom(room_id) => {
                let joined = state.joined(socket_id)?;
                if joined.room_id != room_id {
                    return Err(RelayError::NotJoined(room_id));
                }
                state.leave_room(socket_id);
                Ok(())
            }
            ClientEvent::Offer { target, offer } => state.route(
                socket_id,
                &target,
                ServerEvent::ReceiveOffer {
                    sender: socket_id.to_string(),
                    offer,
                },
            ),
            ClientEvent::Answer { target, answer } => state.route(
                socket_id,
                &target,
                ServerEvent::ReceiveAnswer {
                    sender: socket_id.to_string(),
                    answer,
                },
            ),
            ClientEvent::IceCandidate { target, candidate } => state.route(
                socket_id,
                &target,
                ServerEvent::ReceiveIceCandidate {
                    sender: socket_id.to_string(),
                    candidate,
                },
            ),
            ClientEvent::UserInfo { target, name } => match target {
                Some(target) => state.route(socket_id, &target, ServerEvent::UserInfo { name }),
                None => {
                    let joined = state.joined(socket_id)?;
                    for other in state.others(&joined.room_id, socket_id) {
                        state.send(&other, ServerEvent::UserInfo { name: name.clone() });
                    }
                    Ok(())
                }
            },
            ClientEvent::Ping => {
                state.send(socket_id, ServerEvent::Pong);
                Ok(())
            }
        }
    }

    /// Drops a connection. The remaining room member is told with
    /// `user-disconnected`, and the connection's outbox is closed, which the
    /// transports surface as a server-initiated close.
    pub fn disconnect(&self, socket_id: &str) -> bool {
        let mut state = self.inner.lock();
        state.leave_room(socket_id);
        let removed = state.sockets.remove(socket_id).is_some();
        if removed {
            debug!(socket_id = %socket_id, "relay connection removed");
        }
        removed
    }

    pub fn disconnect_all(&self) -> usize {
        let ids: Vec<String> = self.inner.lock().sockets.keys().cloned().collect();
        ids.iter().filter(|id| self.disconnect(id)).count()
    }

    pub fn room_members(&self, room_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .rooms
            .get(room_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.inner.lock();
        RegistryStats {
            rooms: state.rooms.len(),
            connections: state.sockets.len(),
        }
    }
}
