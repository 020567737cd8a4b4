//! # Slate Core
//!
//! Shared data model for the Slate collaborative drawing system.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 slate-core                  │
//! ├─────────────────────────────────────────────┤
//! │  Stroke Document │  Delta Frames            │
//! │  - add-only set  │  - versioned binary      │
//! │  - LWW presence  │  - no-op threshold       │
//! ├─────────────────────────────────────────────┤
//! │  Offline Queue   │  Wire Control Messages   │
//! │  - durable, FIFO │  - ping / pong           │
//! │  - per room      │  - room-info             │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Both the relay and the client sync engine build on this crate. The merge
//! semantics live behind the [`DocumentEngine`] trait so the delivery
//! protocol never depends on a particular CRDT implementation.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod delta;
pub mod document;
pub mod error;
pub mod presence;
pub mod protocol;
pub mod queue;
pub mod stroke;

pub use delta::{Delta, FrameError, NOOP_THRESHOLD};
pub use document::{DocumentEngine, StrokeDocument};
pub use error::{CoreError, CoreResult};
pub use presence::{roster, PresenceEntry, PRESENCE_TTL_MS};
pub use protocol::Control;
pub use queue::{DurableQueue, FileQueue, MemoryQueue, QueueEntry};
pub use stroke::{Point, Stroke, StrokeId};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn timestamp_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
