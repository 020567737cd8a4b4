//! Test server harness for integration tests.
//!
//! Spins up the real relay router on a random port so tests can exercise
//! it with genuine WebSocket clients.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use slate_relay::{AppState, RelayConfig, RoomRegistry};

/// A test server instance with control handles.
pub struct TestServer {
    addr: SocketAddr,
    registry: RoomRegistry,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    /// Start a test server with default timing.
    ///
    /// # Panics
    ///
    /// Panics if no port is available or the server fails to bind.
    #[allow(dead_code)]
    pub async fn start() -> Self {
        Self::start_with(RelayConfig::default()).await
    }

    /// Start a test server with custom timing, for tests that exercise the
    /// sweeper or room garbage collection on a short clock.
    pub async fn start_with(config: RelayConfig) -> Self {
        let port = portpicker::pick_unused_port().expect("no available port");
        let addr = SocketAddr::from(([127, 0, 0, 1], port));

        let registry = RoomRegistry::new(config);
        let app = slate_relay::router(AppState::new(registry.clone()));

        let listener = TcpListener::bind(addr).await.expect("failed to bind");
        let actual_addr = listener.local_addr().expect("failed to get local addr");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("server error");
        });

        // Give the server a moment to start
        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        Self {
            addr: actual_addr,
            registry,
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    /// Get the server's socket address.
    #[allow(dead_code)]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// WebSocket URL for the default room.
    #[allow(dead_code)]
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// WebSocket URL for a named room.
    pub fn room_url(&self, room_id: &str) -> String {
        format!("ws://{}/ws/{}", self.addr, room_id)
    }

    /// Access the room registry for test assertions.
    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Gracefully shut down the server.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(tokio::time::Duration::from_secs(5), self.handle).await;
    }
}
