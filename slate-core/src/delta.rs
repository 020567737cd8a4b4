//! Delta frames - the opaque payloads exchanged between replicas.
//!
//! ## Frame format
//!
//! A delta travels as a binary frame: a one-byte format version tag followed
//! by a JSON body. Frames of length ≤ [`NOOP_THRESHOLD`] bytes encode
//! nothing meaningful and MUST be dropped before decoding, at both the relay
//! and the client. This is a correctness filter, not an optimization:
//! undersized frames are indistinguishable from encoding artifacts, and
//! applying them is a no-op whose broadcast only wastes bandwidth.
//!
//! An empty delta encodes to zero bytes, so it falls below the threshold and
//! is naturally dropped by every sender.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::presence::PresenceEntry;
use crate::stroke::Stroke;

/// Frames at or below this many bytes are no-ops and are dropped unseen.
pub const NOOP_THRESHOLD: usize = 2;

/// Format version tag carried in the first byte of every frame.
const FRAME_VERSION: u8 = 1;

/// Why a binary frame could not be decoded into a [`Delta`].
///
/// Callers treat every variant the same way - log and drop, never surface -
/// but the typed split keeps the drop sites honest about what they saw.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame is at or below the no-op threshold.
    #[error("frame of {0} bytes is below the no-op threshold")]
    Undersized(usize),

    /// Unknown format version tag.
    #[error("unknown frame version: {0}")]
    UnknownVersion(u8),

    /// The frame body did not parse.
    #[error("malformed frame body: {0}")]
    Body(#[from] serde_json::Error),
}

/// A state mutation: strokes added and presence entries updated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Strokes introduced by this delta.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub strokes: Vec<Stroke>,
    /// Presence entries updated by this delta.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub presence: Vec<(String, PresenceEntry)>,
}

impl Delta {
    /// A delta carrying a single stroke.
    #[must_use]
    pub fn from_stroke(stroke: Stroke) -> Self {
        Self {
            strokes: vec![stroke],
            ..Self::default()
        }
    }

    /// A delta carrying a single presence update.
    #[must_use]
    pub fn from_presence(user_id: impl Into<String>, entry: PresenceEntry) -> Self {
        Self {
            presence: vec![(user_id.into(), entry)],
            ..Self::default()
        }
    }

    /// True when the delta mutates nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strokes.is_empty() && self.presence.is_empty()
    }

    /// Encode to a binary frame. Empty deltas encode to zero bytes, which is
    /// below [`NOOP_THRESHOLD`], so senders drop them without special cases.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        if self.is_empty() {
            return Vec::new();
        }
        let body = serde_json::to_vec(self).unwrap_or_default();
        if body.is_empty() {
            return Vec::new();
        }
        let mut frame = Vec::with_capacity(1 + body.len());
        frame.push(FRAME_VERSION);
        frame.extend_from_slice(&body);
        frame
    }

    /// Decode a binary frame into a typed delta.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] for undersized frames, unknown versions, and
    /// malformed bodies. All of these are expected wire noise; callers log
    /// at debug level and drop the frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() <= NOOP_THRESHOLD {
            return Err(FrameError::Undersized(bytes.len()));
        }
        let (version, body) = bytes.split_at(1);
        if version[0] != FRAME_VERSION {
            return Err(FrameError::UnknownVersion(version[0]));
        }
        Ok(serde_json::from_slice(body)?)
    }
}
