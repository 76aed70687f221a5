pub mod config;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod telemetry;

pub use config::{CallConfig, IceConfig, PeerFailurePolicy, TurnServer};
pub use session::{CallHandle, CallParams, CallSnapshot, CallStatus, SessionDeps, SessionError};
