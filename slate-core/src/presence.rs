//! Ephemeral per-user presence records.
//!
//! Presence is ordinary document state: updates travel inside deltas like
//! stroke additions do. Records are advisory - losing them costs nothing but
//! a stale-looking roster. The visible roster is always derived by filtering
//! the map, never stored.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A presence record is stale after this long without a refresh (ms).
pub const PRESENCE_TTL_MS: u64 = 60_000;

/// Liveness record for a single user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// When the user first joined (ms since epoch).
    pub joined_at: u64,
    /// Last refresh from the owning client (ms since epoch).
    pub last_seen: u64,
    /// The user departed explicitly; excluded from the roster immediately.
    pub left: bool,
}

impl PresenceEntry {
    /// A fresh entry for a user joining now.
    #[must_use]
    pub const fn join(now: u64) -> Self {
        Self {
            joined_at: now,
            last_seen: now,
            left: false,
        }
    }

    /// This entry refreshed at `now`, preserving the original join time.
    #[must_use]
    pub const fn refreshed(self, now: u64) -> Self {
        Self {
            joined_at: self.joined_at,
            last_seen: now,
            left: self.left,
        }
    }

    /// This entry marked as departed at `now`.
    #[must_use]
    pub const fn departed(self, now: u64) -> Self {
        Self {
            joined_at: self.joined_at,
            last_seen: now,
            left: true,
        }
    }

    /// Last-writer-wins merge preference. Ties resolve toward the departed
    /// entry so an explicit leave is never shadowed by a same-instant refresh.
    #[must_use]
    pub fn supersedes(&self, other: &Self) -> bool {
        self.last_seen > other.last_seen
            || (self.last_seen == other.last_seen && self.left && !other.left)
    }
}

/// Derive the visible roster: user ids whose entries were refreshed within
/// [`PRESENCE_TTL_MS`] of `now` and have not departed, sorted for stable
/// display order.
#[must_use]
pub fn roster(presence: &HashMap<String, PresenceEntry>, now: u64) -> Vec<String> {
    let mut users: Vec<String> = presence
        .iter()
        .filter(|(_, entry)| !entry.left && now.saturating_sub(entry.last_seen) <= PRESENCE_TTL_MS)
        .map(|(user, _)| user.clone())
        .collect();
    users.sort();
    users
}
