//! The durable offline queue.
//!
//! Strokes drawn without a live connection land here and are replayed, in
//! enqueue order, on the next successful connect. Replay order preserves the
//! causal intent of a multi-stroke offline session; the CRDT merge would
//! converge either way, so ordering is for user-visible fidelity, not
//! correctness.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::stroke::Stroke;

/// One durable queue record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Unique entry id.
    pub id: Uuid,
    /// Room the stroke belongs to.
    pub room_id: String,
    /// The queued stroke.
    pub stroke: Stroke,
    /// When the entry was enqueued (ms since epoch).
    pub enqueued_at: u64,
    /// Whether the entry has been replayed into the document.
    pub synced: bool,
}

/// A local append-only persistent store for offline strokes, keyed by room.
pub trait DurableQueue: Send + Sync {
    /// Append a stroke for a room. Returns the new entry's id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Io`] or [`CoreError::Serialization`] if the
    /// entry cannot be persisted.
    fn enqueue(&self, room_id: &str, stroke: Stroke) -> CoreResult<Uuid>;

    /// Unsynced entries for a room, in enqueue order.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Io`] if the store cannot be read.
    fn list_unsynced(&self, room_id: &str) -> CoreResult<Vec<QueueEntry>>;

    /// Mark an entry as replayed.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EntryNotFound`] for unknown ids, or a
    /// persistence error.
    fn mark_synced(&self, id: Uuid) -> CoreResult<()>;
}

/// In-memory queue. Durable only for the lifetime of the process; used in
/// tests and as a fallback when no data directory is available.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    entries: Mutex<Vec<QueueEntry>>,
}

impl MemoryQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableQueue for MemoryQueue {
    fn enqueue(&self, room_id: &str, stroke: Stroke) -> CoreResult<Uuid> {
        let entry = QueueEntry {
            id: Uuid::new_v4(),
            room_id: room_id.to_string(),
            stroke,
            enqueued_at: crate::timestamp_now(),
            synced: false,
        };
        let id = entry.id;
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(entry);
        Ok(id)
    }

    fn list_unsynced(&self, room_id: &str) -> CoreResult<Vec<QueueEntry>> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(entries
            .iter()
            .filter(|e| e.room_id == room_id && !e.synced)
            .cloned()
            .collect())
    }

    fn mark_synced(&self, id: Uuid) -> CoreResult<()> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.synced = true;
                Ok(())
            }
            None => Err(CoreError::EntryNotFound(id)),
        }
    }
}

/// Queue state as persisted on disk: one JSON file per room.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RoomLog {
    entries: Vec<QueueEntry>,
}

/// File-backed queue. Each room's entries live in `<data_dir>/<room>.json`,
/// rewritten on every mutation - queue files stay small (an offline session's
/// worth of strokes), so rewrite-on-mutation keeps the format dead simple.
#[derive(Debug)]
pub struct FileQueue {
    data_dir: PathBuf,
    // Room id -> loaded log. Populated lazily from disk.
    cache: Mutex<HashMap<String, RoomLog>>,
}

impl FileQueue {
    /// Open (or create) a queue rooted at `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Io`] if the directory cannot be created.
    pub fn open(data_dir: impl Into<PathBuf>) -> CoreResult<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self {
            data_dir,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn room_path(&self, room_id: &str) -> PathBuf {
        // Room ids are restricted to filename-safe characters by the relay;
        // sanitize anyway so a hostile id cannot escape the data directory.
        let safe: String = room_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            })
            .collect();
        self.data_dir.join(format!("{safe}.json"))
    }

    fn load(&self, room_id: &str) -> CoreResult<RoomLog> {
        let path = self.room_path(room_id);
        if !path.exists() {
            return Ok(RoomLog::default());
        }
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    fn with_log<T>(
        &self,
        room_id: &str,
        f: impl FnOnce(&mut RoomLog) -> CoreResult<T>,
        persist: bool,
    ) -> CoreResult<T> {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !cache.contains_key(room_id) {
            let log = self.load(room_id)?;
            cache.insert(room_id.to_string(), log);
        }
        let log = cache
            .get_mut(room_id)
            .unwrap_or_else(|| unreachable!("inserted above"));
        let result = f(log)?;
        if persist {
            let json = serde_json::to_string_pretty(log)?;
            std::fs::write(self.room_path(room_id), json)?;
        }
        Ok(result)
    }

    /// Rooms that currently have entries on disk.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Io`] if the data directory cannot be listed.
    pub fn rooms(&self) -> CoreResult<Vec<String>> {
        let mut rooms = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    rooms.push(stem.to_string());
                }
            }
        }
        rooms.sort();
        Ok(rooms)
    }
}

impl DurableQueue for FileQueue {
    fn enqueue(&self, room_id: &str, stroke: Stroke) -> CoreResult<Uuid> {
        let entry = QueueEntry {
            id: Uuid::new_v4(),
            room_id: room_id.to_string(),
            stroke,
            enqueued_at: crate::timestamp_now(),
            synced: false,
        };
        let id = entry.id;
        self.with_log(
            room_id,
            |log| {
                log.entries.push(entry);
                Ok(())
            },
            true,
        )?;
        Ok(id)
    }

    fn list_unsynced(&self, room_id: &str) -> CoreResult<Vec<QueueEntry>> {
        self.with_log(
            room_id,
            |log| Ok(log.entries.iter().filter(|e| !e.synced).cloned().collect()),
            false,
        )
    }

    fn mark_synced(&self, id: Uuid) -> CoreResult<()> {
        // The entry's room is unknown to the caller; scan loaded and on-disk
        // rooms for the id.
        let rooms = {
            let cache = self
                .cache
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut rooms: Vec<String> = cache.keys().cloned().collect();
            drop(cache);
            for room in self.rooms()? {
                if !rooms.contains(&room) {
                    rooms.push(room);
                }
            }
            rooms
        };

        for room in rooms {
            let found = self.with_log(
                &room,
                |log| match log.entries.iter_mut().find(|e| e.id == id) {
                    Some(entry) => {
                        entry.synced = true;
                        Ok(true)
                    }
                    None => Ok(false),
                },
                true,
            )?;
            if found {
                return Ok(());
            }
        }
        Err(CoreError::EntryNotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stroke::Point;

    fn stroke(user: &str) -> Stroke {
        Stroke::new(user, "#0000ff", 3.0).with_points(vec![Point::new(1.0, 1.0)])
    }

    #[test]
    fn memory_queue_preserves_enqueue_order() {
        let queue = MemoryQueue::new();
        queue.enqueue("r1", stroke("a")).expect("enqueue");
        queue.enqueue("r1", stroke("b")).expect("enqueue");
        queue.enqueue("r1", stroke("c")).expect("enqueue");

        let unsynced = queue.list_unsynced("r1").expect("list");
        let users: Vec<&str> = unsynced.iter().map(|e| e.stroke.user_id.as_str()).collect();
        assert_eq!(users, vec!["a", "b", "c"]);
    }

    #[test]
    fn memory_queue_isolates_rooms() {
        let queue = MemoryQueue::new();
        queue.enqueue("r1", stroke("a")).expect("enqueue");
        queue.enqueue("r2", stroke("b")).expect("enqueue");

        assert_eq!(queue.list_unsynced("r1").expect("list").len(), 1);
        assert_eq!(queue.list_unsynced("r2").expect("list").len(), 1);
        assert!(queue.list_unsynced("r3").expect("list").is_empty());
    }

    #[test]
    fn mark_synced_removes_from_unsynced_view() {
        let queue = MemoryQueue::new();
        let id = queue.enqueue("r1", stroke("a")).expect("enqueue");

        assert_eq!(queue.list_unsynced("r1").expect("list").len(), 1);
        queue.mark_synced(id).expect("mark");
        assert!(queue.list_unsynced("r1").expect("list").is_empty());
    }

    #[test]
    fn mark_synced_unknown_id_is_an_error() {
        let queue = MemoryQueue::new();
        assert!(matches!(
            queue.mark_synced(Uuid::new_v4()),
            Err(CoreError::EntryNotFound(_))
        ));
    }

    #[test]
    fn file_queue_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");

        let id = {
            let queue = FileQueue::open(dir.path()).expect("open");
            queue.enqueue("r1", stroke("a")).expect("enqueue");
            queue.enqueue("r1", stroke("b")).expect("enqueue")
        };

        // Fresh instance reads the same directory.
        let queue = FileQueue::open(dir.path()).expect("reopen");
        let unsynced = queue.list_unsynced("r1").expect("list");
        assert_eq!(unsynced.len(), 2);

        queue.mark_synced(id).expect("mark");
        let unsynced = queue.list_unsynced("r1").expect("list");
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].stroke.user_id, "a");

        // The synced flag persisted too.
        let queue = FileQueue::open(dir.path()).expect("reopen again");
        assert_eq!(queue.list_unsynced("r1").expect("list").len(), 1);
    }

    #[test]
    fn file_queue_sanitizes_room_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = FileQueue::open(dir.path()).expect("open");
        queue.enqueue("../escape", stroke("a")).expect("enqueue");

        // Entry is reachable under the same (sanitized) id, and nothing was
        // written outside the data dir.
        assert_eq!(queue.list_unsynced("../escape").expect("list").len(), 1);
        assert!(dir.path().join("___escape.json").exists());
    }

    #[test]
    fn file_queue_lists_rooms() {
        let dir = tempfile::tempdir().expect("tempdir");
        let queue = FileQueue::open(dir.path()).expect("open");
        queue.enqueue("beta", stroke("a")).expect("enqueue");
        queue.enqueue("alpha", stroke("b")).expect("enqueue");

        assert_eq!(
            queue.rooms().expect("rooms"),
            vec!["alpha".to_string(), "beta".to_string()]
        );
    }
}
