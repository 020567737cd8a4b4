//! # Slate Sync Client
//!
//! The client half of the sync protocol: owns a local document replica,
//! drives the WebSocket connection through an explicit state machine with
//! bounded reconnection, queues strokes durably while offline, and keeps
//! the local user's presence fresh.
//!
//! ```text
//!  UI / caller
//!      |  add_stroke / pause / resume / close
//!      v
//!  SyncSession (handle) ----> driver task
//!      |                        |  deltas over WebSocket
//!      v                        v
//!  StrokeDocument <------- relay server
//!      ^
//!      |  replay on reconnect
//!  DurableQueue
//! ```
//!
//! All connection management happens on a single driver task per session,
//! so there is never more than one socket (or one in-flight connect) per
//! room.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]

pub mod error;
pub mod registry;
pub mod session;
pub mod status;

pub use error::{ClientError, ClientResult};
pub use registry::SessionRegistry;
pub use session::{SyncConfig, SyncSession};
pub use status::{backoff_delay, SessionEvent, SessionStatus, MAX_RECONNECT_ATTEMPTS};
