//! Call lifecycle.
//!
//! A session is one actor task that owns the signaling channel, local media
//! and the peer manager. [`CallHandle`] is the only way in: commands go over
//! an mpsc queue and state comes back as a [`CallSnapshot`] on a watch
//! channel. Relay handlers and webrtc callbacks only forward into the
//! actor's queues, so all state changes happen on one task.

mod controller;
pub mod display;
pub mod status;
pub mod timer;

pub use controller::{CallHandle, CallParams, CallSnapshot, SessionDeps, SessionError};
pub use display::{DisplayControl, DisplayError, HeadlessDisplay};
pub use status::CallStatus;
pub use timer::{CallTimer, format_duration};
