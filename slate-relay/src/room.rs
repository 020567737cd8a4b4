//! Rooms, connections, and the registry that owns them.
//!
//! Locking is coarse and per room: the registry map and each room's
//! connection set sit behind their own mutexes, so a broadcast and a close
//! racing in one room cannot lose updates, and operations on different
//! rooms never block each other. Sends go over per-connection unbounded
//! channels and never suspend under a lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use slate_core::{Control, Delta, DocumentEngine, StrokeDocument};

/// Tunable intervals. Defaults match the production protocol; integration
/// tests shorten them.
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// Period of the two-phase heartbeat sweep.
    pub sweep_interval: Duration,
    /// A connection with no inbound activity for this long is presumed dead
    /// regardless of heartbeat state.
    pub idle_timeout: Duration,
    /// Grace period before an empty room is torn down.
    pub empty_room_ttl: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            empty_room_ttl: Duration::from_secs(60),
        }
    }
}

/// Message pushed to a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// A frame to forward to the peer.
    Frame(Message),
    /// Close the connection; issued by the liveness sweep.
    Terminate,
}

/// Liveness bookkeeping shared between a connection's socket task and the
/// sweep.
#[derive(Debug)]
pub struct Liveness {
    alive: AtomicBool,
    last_activity: Mutex<Instant>,
}

impl Liveness {
    /// Fresh record; the connection starts alive.
    #[must_use]
    pub fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// A heartbeat answer arrived: set the alive flag and touch activity.
    pub fn refresh(&self) {
        self.alive.store(true, Ordering::SeqCst);
        self.touch();
    }

    /// Any inbound traffic counts as activity.
    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Clear the alive flag for the next heartbeat round, returning whether
    /// it was set.
    fn take_alive(&self) -> bool {
        self.alive.swap(false, Ordering::SeqCst)
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// The relay's handle on one client connection.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Unique client id, minted at accept time.
    pub client_id: String,
    tx: mpsc::UnboundedSender<Outbound>,
    liveness: Arc<Liveness>,
}

impl ConnectionHandle {
    /// Create a handle around a connection's outbound channel.
    #[must_use]
    pub fn new(
        client_id: String,
        tx: mpsc::UnboundedSender<Outbound>,
        liveness: Arc<Liveness>,
    ) -> Self {
        Self {
            client_id,
            tx,
            liveness,
        }
    }

    /// Queue a frame. Returns false if the connection's writer is gone.
    fn send(&self, out: Outbound) -> bool {
        self.tx.send(out).is_ok()
    }
}

/// One active collaboration room: the merged document plus the live
/// connection set.
pub struct Room {
    /// Opaque room identifier.
    pub id: String,
    doc: Mutex<StrokeDocument>,
    conns: Mutex<HashMap<String, ConnectionHandle>>,
}

impl Room {
    fn new(id: String) -> Self {
        Self {
            id,
            doc: Mutex::new(StrokeDocument::new()),
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live connections.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True when no connections remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.client_count() == 0
    }

    /// Full-state snapshot as a wire frame. Empty rooms encode below the
    /// no-op threshold, so joiners of a fresh room receive nothing.
    #[must_use]
    pub fn snapshot_frame(&self) -> Vec<u8> {
        self.doc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .snapshot()
            .encode()
    }

    /// Merge a decoded delta into the room document.
    pub fn apply(&self, delta: &Delta) -> bool {
        self.doc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(delta)
    }

    /// Number of strokes in the room document.
    #[must_use]
    pub fn stroke_count(&self) -> usize {
        self.doc
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stroke_count()
    }

    /// Register a connection.
    pub fn insert(&self, handle: ConnectionHandle) {
        self.conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.client_id.clone(), handle);
    }

    /// Remove a connection. Returns true if it was present.
    pub fn remove(&self, client_id: &str) -> bool {
        self.conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(client_id)
            .is_some()
    }

    /// Fan a frame out to every connection except `exclude`.
    ///
    /// Best-effort, at-most-once per peer, no retry: a peer whose channel
    /// is gone is evicted on the spot, and the loop continues to the rest.
    /// Returns the number of successful sends.
    pub fn broadcast_from(&self, exclude: Option<&str>, message: &Message) -> usize {
        let mut conns = self.conns.lock().unwrap_or_else(PoisonError::into_inner);
        let mut dead = Vec::new();
        let mut sent = 0;

        for (client_id, handle) in conns.iter() {
            if exclude == Some(client_id.as_str()) {
                continue;
            }
            if handle.send(Outbound::Frame(message.clone())) {
                sent += 1;
            } else {
                dead.push(client_id.clone());
            }
        }

        for client_id in dead {
            conns.remove(&client_id);
            tracing::debug!(room = %self.id, client = %client_id, "evicted unwritable peer");
        }
        sent
    }

    /// Broadcast the current membership to everyone in the room.
    pub fn broadcast_room_info(&self) {
        let info = Control::RoomInfo {
            room_id: self.id.clone(),
            client_count: self.client_count(),
            client_id: None,
        };
        self.broadcast_from(None, &Message::Text(info.to_json().into()));
    }

    /// One heartbeat pass over this room's connections.
    ///
    /// Terminates peers that failed to answer the previous round's ping or
    /// have been idle past `idle_timeout`; pings everyone else, clearing
    /// their alive flag for the next round.
    fn sweep(&self, idle_timeout: Duration) -> (usize, usize) {
        let mut conns = self.conns.lock().unwrap_or_else(PoisonError::into_inner);
        let mut terminated = Vec::new();
        let mut pinged = 0;

        for (client_id, handle) in conns.iter() {
            let answered = handle.liveness.take_alive();
            if !answered || handle.liveness.idle_for() > idle_timeout {
                terminated.push(client_id.clone());
                continue;
            }
            if handle.send(Outbound::Frame(Message::Ping(Vec::new().into()))) {
                pinged += 1;
            } else {
                terminated.push(client_id.clone());
            }
        }

        for client_id in &terminated {
            if let Some(handle) = conns.get(client_id) {
                // Socket task cleanup runs the normal close path; if the
                // channel is already gone, drop the handle directly.
                if !handle.send(Outbound::Terminate) {
                    conns.remove(client_id);
                }
            }
        }
        (pinged, terminated.len())
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("clients", &self.client_count())
            .finish()
    }
}

/// Registry of active rooms. One instance per process, passed explicitly to
/// connection handlers.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<Mutex<HashMap<String, Arc<Room>>>>,
    config: RelayConfig,
}

impl RoomRegistry {
    /// Create a registry.
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// The configured intervals.
    #[must_use]
    pub fn config(&self) -> RelayConfig {
        self.config
    }

    /// Register a connection, lazily creating its room.
    pub fn join(&self, room_id: &str, handle: ConnectionHandle) -> Arc<Room> {
        let room = {
            let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                rooms
                    .entry(room_id.to_string())
                    .or_insert_with(|| {
                        tracing::info!(room = %room_id, "room created");
                        Arc::new(Room::new(room_id.to_string()))
                    }),
            )
        };
        room.insert(handle);
        room
    }

    /// Remove a connection from its room, notify remaining peers, and
    /// schedule teardown if the room is now empty.
    pub fn leave(&self, room: &Arc<Room>, client_id: &str) {
        if !room.remove(client_id) {
            return;
        }
        room.broadcast_room_info();

        if room.is_empty() {
            let registry = self.clone();
            let room_id = room.id.clone();
            let ttl = self.config.empty_room_ttl;
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                registry.collect_if_empty(&room_id);
            });
        }
    }

    /// Tear a room down if it is still empty. Emptiness is re-read at fire
    /// time, so a reconnect inside the grace window cancels the teardown
    /// implicitly.
    pub fn collect_if_empty(&self, room_id: &str) {
        let mut rooms = self.rooms.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(room) = rooms.get(room_id) {
            if room.is_empty() {
                rooms.remove(room_id);
                tracing::info!(room = %room_id, "idle room collected");
            }
        }
    }

    /// True while the registry lock is not poisoned. Readers recover from
    /// poison, but a poisoned lock means a handler panicked mid-update and
    /// the process should be rotated out of the load balancer.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.rooms.lock().is_ok()
    }

    /// Look up a room without creating it.
    #[must_use]
    pub fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(room_id)
            .cloned()
    }

    /// Number of active rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Total connections across all rooms.
    #[must_use]
    pub fn client_count(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        rooms.iter().map(|r| r.client_count()).sum()
    }

    /// One heartbeat pass over every room.
    pub fn sweep(&self) {
        let rooms: Vec<Arc<Room>> = self
            .rooms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut pinged = 0;
        let mut terminated = 0;
        for room in &rooms {
            let (p, t) = room.sweep(self.config.idle_timeout);
            pinged += p;
            terminated += t;
        }

        tracing::debug!(
            rooms = rooms.len(),
            clients = self.client_count(),
            pinged,
            terminated,
            "liveness sweep"
        );
    }

    /// Run the periodic liveness sweep until aborted.
    #[must_use]
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The immediate first tick would terminate peers that never had
            // a chance to answer a ping; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                registry.sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slate_core::{Point, Stroke};

    fn handle(id: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectionHandle::new(id.to_string(), tx, Arc::new(Liveness::new())),
            rx,
        )
    }

    fn delta_frame() -> Vec<u8> {
        let stroke =
            Stroke::new("alice", "#0000ff", 3.0).with_points(vec![Point::new(1.0, 2.0)]);
        Delta::from_stroke(stroke).encode()
    }

    #[test]
    fn broadcast_excludes_sender() {
        let room = Room::new("r1".into());
        let (a, mut rx_a) = handle("a");
        let (b, mut rx_b) = handle("b");
        let (c, mut rx_c) = handle("c");
        room.insert(a);
        room.insert(b);
        room.insert(c);

        let sent = room.broadcast_from(Some("a"), &Message::Binary(delta_frame().into()));
        assert_eq!(sent, 2);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());
    }

    #[test]
    fn broadcast_survives_a_dead_peer() {
        let room = Room::new("r1".into());
        let (a, _rx_a) = handle("a");
        let (b, rx_b) = handle("b");
        let (c, mut rx_c) = handle("c");
        room.insert(a);
        room.insert(b);
        room.insert(c);

        // b's writer is gone.
        drop(rx_b);

        let sent = room.broadcast_from(Some("a"), &Message::Binary(delta_frame().into()));
        assert_eq!(sent, 1, "exactly one live peer should receive the frame");
        assert!(rx_c.try_recv().is_ok());
        // The dead peer was evicted, the rest stayed.
        assert_eq!(room.client_count(), 2);
    }

    #[tokio::test]
    async fn join_creates_room_lazily() {
        let registry = RoomRegistry::new(RelayConfig::default());
        assert_eq!(registry.room_count(), 0);

        let (h, _rx) = handle("a");
        let room = registry.join("r1", h);
        assert_eq!(registry.room_count(), 1);
        assert_eq!(room.client_count(), 1);

        // Second join reuses the same room.
        let (h2, _rx2) = handle("b");
        let room2 = registry.join("r1", h2);
        assert!(Arc::ptr_eq(&room, &room2));
        assert_eq!(room.client_count(), 2);
    }

    #[tokio::test]
    async fn empty_room_is_collected_only_if_still_empty() {
        let registry = RoomRegistry::new(RelayConfig::default());
        let (h, _rx) = handle("a");
        let room = registry.join("r1", h);
        room.remove("a");

        // A peer rejoined before the timer fired: room survives.
        let (h2, _rx2) = handle("b");
        registry.join("r1", h2);
        registry.collect_if_empty("r1");
        assert_eq!(registry.room_count(), 1);

        // Now actually empty at fire time: room goes away.
        room.remove("b");
        registry.collect_if_empty("r1");
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn room_document_accumulates_deltas() {
        let room = Room::new("r1".into());
        let frame = delta_frame();
        let delta = Delta::decode(&frame).expect("decode");

        assert!(room.apply(&delta));
        assert!(!room.apply(&delta), "second apply is an idempotent no-op");
        assert_eq!(room.stroke_count(), 1);
        assert!(room.snapshot_frame().len() > slate_core::NOOP_THRESHOLD);
    }

    #[test]
    fn poisoned_registry_lock_reports_unhealthy() {
        let registry = RoomRegistry::new(RelayConfig::default());
        assert!(registry.is_healthy());

        let poisoner = registry.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.rooms.lock().expect("fresh lock");
            panic!("poison the registry lock");
        })
        .join();

        assert!(!registry.is_healthy());
        // Readers still recover and keep serving.
        assert_eq!(registry.room_count(), 0);
    }

    #[test]
    fn sweep_terminates_silent_peers_and_pings_the_rest() {
        let room = Room::new("r1".into());
        let (a, mut rx_a) = handle("a");
        let (b, mut rx_b) = handle("b");
        let b_liveness = Arc::clone(&b.liveness);
        room.insert(a);
        room.insert(b);

        // Round 1: everyone starts alive, gets pinged.
        let (pinged, terminated) = room.sweep(Duration::from_secs(120));
        assert_eq!((pinged, terminated), (2, 0));
        assert!(matches!(rx_a.try_recv(), Ok(Outbound::Frame(_))));
        assert!(matches!(rx_b.try_recv(), Ok(Outbound::Frame(_))));

        // Only b answers before round 2.
        b_liveness.refresh();
        let (pinged, terminated) = room.sweep(Duration::from_secs(120));
        assert_eq!((pinged, terminated), (1, 1));
        assert!(matches!(rx_a.try_recv(), Ok(Outbound::Terminate)));
        assert!(matches!(rx_b.try_recv(), Ok(Outbound::Frame(_))));
    }
}
