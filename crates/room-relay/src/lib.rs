//! Signaling primitives shared by the call client and the relay server.
//! The wire format lives here so both ends agree on event names and payload
//! shapes, and the in-process registry lets tests run a relay without a
//! socket.

pub mod protocol;
pub mod registry;

pub use protocol::{ClientEvent, IceCandidate, SdpKind, ServerEvent, SessionDescription};
pub use registry::{Outbox, RegistryStats, RelayError, RoomRegistry, MAX_ROOM_MEMBERS};
