//! The shared stroke document and the engine boundary around it.
//!
//! The delivery protocol treats merge semantics as a black box: anything
//! implementing [`DocumentEngine`] can sit behind the relay and the client
//! sync engine. The guarantee an engine must uphold is that applying deltas
//! is commutative, associative, and idempotent - two replicas that have seen
//! the same set of deltas, in any order, expose identical stroke lists.
//!
//! [`StrokeDocument`] is the engine shipped here: an add-only stroke set
//! merged by id, plus a last-writer-wins presence map.

use std::collections::{BTreeMap, HashMap};

use crate::delta::Delta;
use crate::presence::PresenceEntry;
use crate::stroke::{Stroke, StrokeId};

/// Invoked with the flattened, ordered stroke list after every change.
pub type ChangeCallback = Box<dyn Fn(&[Stroke]) + Send + Sync>;

/// The merge boundary between the sync protocol and the CRDT internals.
pub trait DocumentEngine: Send {
    /// Merge a delta into this replica. Returns true if anything changed.
    fn apply(&mut self, delta: &Delta) -> bool;

    /// A delta carrying the full document state. An empty replica snapshots
    /// below the no-op threshold, so receivers drop it unseen.
    fn snapshot(&self) -> Delta;

    /// The flattened stroke list in canonical order.
    fn strokes(&self) -> Vec<Stroke>;
}

/// One replica of a room's shared drawing.
#[derive(Default)]
pub struct StrokeDocument {
    strokes: BTreeMap<StrokeId, Stroke>,
    presence: HashMap<String, PresenceEntry>,
    on_change: Option<ChangeCallback>,
}

impl std::fmt::Debug for StrokeDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrokeDocument")
            .field("strokes", &self.strokes.len())
            .field("presence", &self.presence.len())
            .finish()
    }
}

impl StrokeDocument {
    /// Create an empty document.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the change-notification callback. Replaces any previous one.
    pub fn set_on_change(&mut self, callback: ChangeCallback) {
        self.on_change = Some(callback);
    }

    /// Add a locally drawn stroke, returning the delta to publish.
    ///
    /// Re-adding a stroke id already present is a no-op merge on every other
    /// replica, so the returned delta is always safe to send.
    pub fn add_stroke(&mut self, stroke: Stroke) -> Delta {
        self.strokes.insert(stroke.id, stroke.clone());
        self.notify();
        Delta::from_stroke(stroke)
    }

    /// Upsert the local user's presence record, returning the delta to
    /// publish. Keeps the earliest join time across refreshes.
    pub fn update_presence(&mut self, user_id: &str, entry: PresenceEntry) -> Delta {
        let merged = match self.presence.get(user_id) {
            Some(existing) => PresenceEntry {
                joined_at: existing.joined_at.min(entry.joined_at),
                ..entry
            },
            None => entry,
        };
        self.presence.insert(user_id.to_string(), merged);
        Delta::from_presence(user_id, merged)
    }

    /// Mark a user as departed, returning the delta to publish.
    pub fn mark_left(&mut self, user_id: &str, now: u64) -> Delta {
        let entry = self
            .presence
            .get(user_id)
            .copied()
            .unwrap_or_else(|| PresenceEntry::join(now))
            .departed(now);
        self.presence.insert(user_id.to_string(), entry);
        Delta::from_presence(user_id, entry)
    }

    /// The raw presence map. The visible roster is derived from this via
    /// [`crate::presence::roster`], never stored.
    #[must_use]
    pub fn presence(&self) -> &HashMap<String, PresenceEntry> {
        &self.presence
    }

    /// Number of strokes in the document.
    #[must_use]
    pub fn stroke_count(&self) -> usize {
        self.strokes.len()
    }

    /// True when a stroke with this id is present.
    #[must_use]
    pub fn contains_stroke(&self, id: StrokeId) -> bool {
        self.strokes.contains_key(&id)
    }

    fn notify(&self) {
        if let Some(callback) = &self.on_change {
            callback(&self.strokes());
        }
    }
}

impl DocumentEngine for StrokeDocument {
    fn apply(&mut self, delta: &Delta) -> bool {
        let mut changed = false;

        for stroke in &delta.strokes {
            // Add-wins: first writer for an id sticks, replays merge silently.
            if !self.strokes.contains_key(&stroke.id) {
                self.strokes.insert(stroke.id, stroke.clone());
                changed = true;
            }
        }

        for (user_id, entry) in &delta.presence {
            match self.presence.get(user_id) {
                Some(existing) if !entry.supersedes(existing) => {}
                _ => {
                    self.presence.insert(user_id.clone(), *entry);
                    changed = true;
                }
            }
        }

        if changed {
            self.notify();
        }
        changed
    }

    fn snapshot(&self) -> Delta {
        Delta {
            strokes: self.strokes(),
            presence: self
                .presence
                .iter()
                .map(|(user, entry)| (user.clone(), *entry))
                .collect(),
        }
    }

    fn strokes(&self) -> Vec<Stroke> {
        let mut strokes: Vec<Stroke> = self.strokes.values().cloned().collect();
        // Canonical order: creation time, id as tiebreak. Deterministic for
        // any two replicas holding the same stroke set.
        strokes.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        strokes
    }
}
