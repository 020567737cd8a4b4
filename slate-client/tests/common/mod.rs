//! In-process relay harness for client end-to-end tests.

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use slate_relay::{AppState, RelayConfig, RoomRegistry};

/// A relay running inside the test process.
pub struct TestRelay {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestRelay {
    /// Start on a random port.
    pub async fn start() -> Self {
        let port = portpicker::pick_unused_port().expect("no available port");
        Self::start_on(port).await
    }

    /// Start on a specific port, for tests that pick the port before the
    /// relay exists.
    pub async fn start_on(port: u16) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let registry = RoomRegistry::new(RelayConfig::default());
        let app = slate_relay::router(AppState::new(registry));

        let listener = TcpListener::bind(addr).await.expect("failed to bind");
        let actual_addr = listener.local_addr().expect("failed to get local addr");

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .expect("relay error");
        });

        tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;

        Self {
            addr: actual_addr,
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    /// Base WebSocket endpoint for clients.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Gracefully shut the relay down.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(tokio::time::Duration::from_secs(5), self.handle).await;
    }
}
