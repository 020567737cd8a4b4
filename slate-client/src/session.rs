//! One sync session per room: the handle callers hold and the driver task
//! behind it.
//!
//! The driver owns the socket and is the only place connection state
//! changes, so a second in-flight connect for the same room cannot exist.
//! Callers talk to it over a command channel and observe it through a
//! watch channel; the document replica is shared so reads never cross the
//! task boundary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use slate_core::{
    roster, Control, Delta, DocumentEngine, DurableQueue, PresenceEntry, Stroke, StrokeDocument,
    NOOP_THRESHOLD,
};

use crate::error::{ClientError, ClientResult};
use crate::status::{
    backoff_delay, SessionEvent, SessionStatus, BASE_RETRY_DELAY, HANDSHAKE_TIMEOUT,
    MAX_RETRY_DELAY, PRESENCE_REFRESH_INTERVAL,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Settings for one sync session.
#[derive(Clone)]
pub struct SyncConfig {
    /// Base WebSocket endpoint, e.g. `ws://host:3334/ws`.
    pub server_url: String,
    /// Room to join. An empty id disables collaboration entirely.
    pub room_id: String,
    /// Identity written into the shared presence map.
    pub user_id: String,
    /// Connect attempts past this count transition to `Failed`.
    pub max_attempts: u32,
    /// Base of the linear retry backoff.
    pub base_retry_delay: Duration,
    /// Ceiling of the retry backoff.
    pub max_retry_delay: Duration,
    /// Window for the open acknowledgement.
    pub handshake_timeout: Duration,
    /// Presence refresh cadence while connected.
    pub presence_interval: Duration,
    /// State to seed the local replica with before the first connect, for
    /// callers that persisted a snapshot from a previous run.
    pub initial_snapshot: Option<Delta>,
}

impl SyncConfig {
    /// Config with production timing.
    #[must_use]
    pub fn new(
        server_url: impl Into<String>,
        room_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            room_id: room_id.into(),
            user_id: user_id.into(),
            max_attempts: crate::status::MAX_RECONNECT_ATTEMPTS,
            base_retry_delay: BASE_RETRY_DELAY,
            max_retry_delay: MAX_RETRY_DELAY,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            presence_interval: PRESENCE_REFRESH_INTERVAL,
            initial_snapshot: None,
        }
    }
}

impl std::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("server_url", &self.server_url)
            .field("room_id", &self.room_id)
            .field("user_id", &self.user_id)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

enum Command {
    AddStroke(Stroke),
    Pause,
    Resume,
    Retry,
    Close,
}

/// Handle to a running sync session. Cheap to clone; all clones talk to
/// the same driver task.
#[derive(Clone)]
pub struct SyncSession {
    cmd: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    doc: Arc<Mutex<StrokeDocument>>,
    queue: Arc<dyn DurableQueue>,
    peers: Arc<AtomicUsize>,
    room_id: String,
    user_id: String,
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("room_id", &self.room_id)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl SyncSession {
    /// Start a session and its driver task.
    #[must_use]
    pub fn spawn(config: SyncConfig, queue: Arc<dyn DurableQueue>) -> Self {
        let mut doc = StrokeDocument::new();
        if let Some(snapshot) = &config.initial_snapshot {
            doc.apply(snapshot);
        }
        let doc = Arc::new(Mutex::new(doc));

        let initial = if config.room_id.is_empty() {
            SessionStatus::Disabled
        } else {
            SessionStatus::Connecting { attempt: 1 }
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(initial);
        let peers = Arc::new(AtomicUsize::new(0));

        let session = Self {
            cmd: cmd_tx,
            status: status_rx,
            doc: Arc::clone(&doc),
            queue: Arc::clone(&queue),
            peers: Arc::clone(&peers),
            room_id: config.room_id.clone(),
            user_id: config.user_id.clone(),
        };

        let driver = Driver {
            config,
            queue,
            doc,
            cmd_rx,
            status_tx,
            peers,
            paused: false,
        };
        tokio::spawn(driver.run());

        session
    }

    /// The room this session syncs.
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// A receiver that yields every status change, for UIs that render it.
    #[must_use]
    pub fn status_stream(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Peer count from the latest `room-info`, zero before the first one.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.peers.load(Ordering::Relaxed)
    }

    /// True while the driver task is accepting commands.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.cmd.is_closed() && !self.status.borrow().is_terminal()
    }

    /// Add a locally drawn stroke.
    ///
    /// The stroke lands in the local replica immediately so the UI can
    /// render it; whether it is published now or queued for replay is the
    /// driver's call based on connection state.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::SessionClosed`] if the session was torn down.
    pub fn add_stroke(&self, stroke: Stroke) -> ClientResult<()> {
        self.cmd
            .send(Command::AddStroke(stroke))
            .map_err(|_| ClientError::SessionClosed)
    }

    /// Suppress reconnection while backgrounded. An open connection stays
    /// open; a lost one is not re-established until [`Self::resume`].
    pub fn pause(&self) {
        let _ = self.cmd.send(Command::Pause);
    }

    /// Re-enable reconnection and, if not connected, retry immediately
    /// with a fresh attempt counter.
    pub fn resume(&self) {
        let _ = self.cmd.send(Command::Resume);
    }

    /// Manual retry out of `Failed`.
    pub fn retry(&self) {
        let _ = self.cmd.send(Command::Retry);
    }

    /// Tear the session down: announce departure, close the socket, stop
    /// the driver.
    pub fn close(&self) {
        let _ = self.cmd.send(Command::Close);
    }

    /// The flattened stroke list in canonical order.
    #[must_use]
    pub fn strokes(&self) -> Vec<Stroke> {
        self.lock_doc().strokes()
    }

    /// User ids currently considered present, per the TTL rule.
    #[must_use]
    pub fn roster(&self) -> Vec<String> {
        roster(self.lock_doc().presence(), slate_core::timestamp_now())
    }

    /// Full-state delta of the local replica, for callers that persist it
    /// across runs and feed it back via [`SyncConfig::initial_snapshot`].
    #[must_use]
    pub fn export_snapshot(&self) -> Delta {
        self.lock_doc().snapshot()
    }

    /// The local user's unsynced backlog for this room.
    ///
    /// # Errors
    ///
    /// Propagates queue read errors.
    pub fn pending(&self) -> ClientResult<Vec<slate_core::QueueEntry>> {
        Ok(self.queue.list_unsynced(&self.room_id)?)
    }

    fn lock_doc(&self) -> std::sync::MutexGuard<'_, StrokeDocument> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// How the connected loop ended.
enum LinkExit {
    /// The network took the connection.
    Dropped,
    /// The caller tore the session down.
    Closed,
}

/// What woke an idle (backoff / failed / paused) wait.
enum Wake {
    Elapsed,
    Restart,
    Close,
}

struct Driver {
    config: SyncConfig,
    queue: Arc<dyn DurableQueue>,
    doc: Arc<Mutex<StrokeDocument>>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<SessionStatus>,
    peers: Arc<AtomicUsize>,
    paused: bool,
}

impl Driver {
    async fn run(mut self) {
        loop {
            if self.paused {
                match self.wait_for_command().await {
                    Wake::Close => return self.finish(),
                    Wake::Restart | Wake::Elapsed => {
                        self.apply_event(SessionEvent::ManualRetry);
                    }
                }
                continue;
            }

            let status = *self.status_tx.borrow();
            match status {
                SessionStatus::Connecting { attempt } => {
                    match self.connect().await {
                        Ok(ws) => {
                            tracing::info!(
                                room = %self.config.room_id,
                                attempt,
                                "connected"
                            );
                            self.apply_event(SessionEvent::Opened);
                            match self.drive_connected(ws).await {
                                LinkExit::Closed => return self.finish(),
                                LinkExit::Dropped => {
                                    tracing::warn!(room = %self.config.room_id, "connection lost");
                                    self.apply_event(SessionEvent::Dropped);
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                room = %self.config.room_id,
                                attempt,
                                "connect failed: {e}"
                            );
                            self.apply_event(SessionEvent::ConnectFailed);
                        }
                    }
                }
                SessionStatus::Error { attempt } => {
                    let delay = backoff_delay(
                        attempt,
                        self.config.base_retry_delay,
                        self.config.max_retry_delay,
                    );
                    match self.sleep_responsive(delay).await {
                        Wake::Elapsed => self.apply_event(SessionEvent::RetryDue),
                        Wake::Restart => self.apply_event(SessionEvent::ManualRetry),
                        Wake::Close => return self.finish(),
                    }
                }
                SessionStatus::Failed | SessionStatus::Disabled => {
                    match self.wait_for_command().await {
                        Wake::Close => return self.finish(),
                        Wake::Restart | Wake::Elapsed => {
                            // A disabled session stays disabled without a room.
                            if self.config.room_id.is_empty() {
                                continue;
                            }
                            self.apply_event(SessionEvent::ManualRetry);
                        }
                    }
                }
                SessionStatus::Connected | SessionStatus::Disconnected => {
                    // Connected is only ever observed inside drive_connected;
                    // Disconnected only after finish(). Restart defensively.
                    self.apply_event(SessionEvent::Dropped);
                }
            }
        }
    }

    fn finish(&mut self) {
        self.status_tx
            .send_replace(SessionStatus::Disconnected);
        tracing::info!(room = %self.config.room_id, "session closed");
    }

    fn apply_event(&mut self, event: SessionEvent) {
        self.status_tx.send_modify(|s| *s = s.transition(event));
    }

    async fn connect(&self) -> ClientResult<WsStream> {
        let url = format!(
            "{}/{}",
            self.config.server_url.trim_end_matches('/'),
            self.config.room_id
        );
        let (ws, _response) = timeout(self.config.handshake_timeout, connect_async(&url))
            .await
            .map_err(|_| ClientError::HandshakeTimeout(self.config.handshake_timeout))??;
        Ok(ws)
    }

    async fn drive_connected(&mut self, ws: WsStream) -> LinkExit {
        let (mut sink, mut stream) = ws.split();

        if self.announce_and_replay(&mut sink).await.is_err() {
            return LinkExit::Dropped;
        }

        let mut presence = tokio::time::interval(self.config.presence_interval);
        // The first tick fires immediately; the join above already covered it.
        presence.tick().await;

        loop {
            tokio::select! {
                inbound = stream.next() => {
                    match inbound {
                        Some(Ok(WsMessage::Binary(bytes))) => self.ingest_frame(&bytes),
                        Some(Ok(WsMessage::Text(text))) => self.ingest_control(&text),
                        Some(Ok(WsMessage::Ping(payload))) => {
                            if sink.send(WsMessage::Pong(payload)).await.is_err() {
                                return LinkExit::Dropped;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => return LinkExit::Dropped,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            tracing::debug!(room = %self.config.room_id, "socket error: {e}");
                            return LinkExit::Dropped;
                        }
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::AddStroke(stroke)) => {
                            let delta = self
                                .lock_doc()
                                .add_stroke(stroke);
                            if send_delta(&mut sink, &delta).await.is_err() {
                                return LinkExit::Dropped;
                            }
                        }
                        Some(Command::Pause) => {
                            // Stays connected; only reconnection is suppressed.
                            self.paused = true;
                        }
                        Some(Command::Resume) => self.paused = false,
                        Some(Command::Retry) => {}
                        Some(Command::Close) | None => {
                            let farewell = self
                                .lock_doc()
                                .mark_left(&self.config.user_id, slate_core::timestamp_now());
                            let _ = send_delta(&mut sink, &farewell).await;
                            let _ = sink.send(WsMessage::Close(None)).await;
                            return LinkExit::Closed;
                        }
                    }
                }
                _ = presence.tick() => {
                    let refresh = self.lock_doc().update_presence(
                        &self.config.user_id,
                        PresenceEntry::join(slate_core::timestamp_now()),
                    );
                    if send_delta(&mut sink, &refresh).await.is_err() {
                        return LinkExit::Dropped;
                    }
                }
            }
        }
    }

    /// The connect ritual: register presence, publish pending local state,
    /// then replay the offline backlog in enqueue order.
    async fn announce_and_replay(
        &mut self,
        sink: &mut (impl Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    ) -> ClientResult<()> {
        let join = self.lock_doc().update_presence(
            &self.config.user_id,
            PresenceEntry::join(slate_core::timestamp_now()),
        );
        send_delta(sink, &join).await?;

        let pending = self.lock_doc().snapshot();
        if pending.encode().len() > NOOP_THRESHOLD {
            send_delta(sink, &pending).await?;
        }

        // Queue read failures cost durability, not the session: the strokes
        // are already in the local replica and the snapshot above carried
        // them.
        let backlog = match self.queue.list_unsynced(&self.config.room_id) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(room = %self.config.room_id, "offline queue read failed: {e}");
                return Ok(());
            }
        };
        if backlog.is_empty() {
            return Ok(());
        }

        tracing::info!(
            room = %self.config.room_id,
            count = backlog.len(),
            "replaying offline strokes"
        );
        for entry in backlog {
            let delta = self.lock_doc().add_stroke(entry.stroke);
            send_delta(sink, &delta).await?;
            if let Err(e) = self.queue.mark_synced(entry.id) {
                tracing::error!(entry = %entry.id, "failed to mark entry synced: {e}");
            }
        }
        Ok(())
    }

    fn ingest_frame(&self, bytes: &[u8]) {
        if bytes.len() <= NOOP_THRESHOLD {
            return;
        }
        match Delta::decode(bytes) {
            Ok(delta) => {
                self.lock_doc().apply(&delta);
            }
            Err(e) => {
                tracing::debug!(room = %self.config.room_id, "dropping malformed frame: {e}");
            }
        }
    }

    fn ingest_control(&self, text: &str) {
        match Control::parse(text) {
            Some(Control::RoomInfo {
                client_count,
                room_id,
                ..
            }) => {
                tracing::debug!(room = %room_id, clients = client_count, "room-info");
                self.peers.store(client_count, Ordering::Relaxed);
            }
            Some(Control::Pong { .. }) | Some(Control::Ping) => {}
            None => {
                tracing::debug!(room = %self.config.room_id, "dropping unparseable text frame");
            }
        }
    }

    /// Park in a non-connected state, handling commands as they arrive.
    /// Strokes added here go to the durable queue and the local replica.
    async fn wait_for_command(&mut self) -> Wake {
        loop {
            match self.cmd_rx.recv().await {
                Some(Command::AddStroke(stroke)) => self.queue_stroke(stroke),
                Some(Command::Pause) => self.paused = true,
                Some(Command::Resume) => {
                    self.paused = false;
                    return Wake::Restart;
                }
                Some(Command::Retry) => return Wake::Restart,
                Some(Command::Close) | None => return Wake::Close,
            }
        }
    }

    /// Like [`Self::wait_for_command`], but returns once `delay` elapses.
    async fn sleep_responsive(&mut self, delay: Duration) -> Wake {
        let deadline = tokio::time::Instant::now() + delay;
        loop {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => return Wake::Elapsed,
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::AddStroke(stroke)) => self.queue_stroke(stroke),
                        Some(Command::Pause) => {
                            self.paused = true;
                            return Wake::Restart;
                        }
                        Some(Command::Resume) => {
                            self.paused = false;
                            return Wake::Restart;
                        }
                        Some(Command::Retry) => return Wake::Restart,
                        Some(Command::Close) | None => return Wake::Close,
                    }
                }
            }
        }
    }

    /// Offline path for a stroke: durable queue plus immediate local render.
    /// A persist failure is logged and the stroke still renders, accepting
    /// at-least-once-but-possibly-not-durable semantics.
    fn queue_stroke(&self, stroke: Stroke) {
        if let Err(e) = self.queue.enqueue(&self.config.room_id, stroke.clone()) {
            tracing::error!(room = %self.config.room_id, "failed to persist offline stroke: {e}");
        }
        self.lock_doc().add_stroke(stroke);
    }

    fn lock_doc(&self) -> std::sync::MutexGuard<'_, StrokeDocument> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Encode and send a delta, skipping frames both ends would drop anyway.
async fn send_delta(
    sink: &mut (impl Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    delta: &Delta,
) -> ClientResult<()> {
    let frame = delta.encode();
    if frame.len() <= NOOP_THRESHOLD {
        return Ok(());
    }
    sink.send(WsMessage::Binary(frame)).await?;
    Ok(())
}
