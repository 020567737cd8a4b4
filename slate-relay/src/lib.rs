//! # Slate Relay Library
//!
//! Shared types and functionality for the relay server.
//! This library is used by both the binary and integration tests.
//!
//! The relay is stateless between restarts: rooms live in memory, are
//! created lazily on first join, and are garbage-collected once empty.
//! Deltas are opaque to the relay beyond the no-op size filter and a typed
//! decode; it merges them into the room document (so late joiners can be
//! seeded with a snapshot) and fans the raw bytes out to every other peer.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]

pub mod health;
pub mod relay;
pub mod room;

pub use relay::{ws_default_handler, ws_room_handler, DEFAULT_ROOM_ID};
pub use room::{RelayConfig, Room, RoomRegistry};

use axum::routing::get;
use axum::Router;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

/// Build the full relay router. Shared by the binary and the test harness.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        // Health check endpoints (Kubernetes probes)
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/ws", get(ws_default_handler))
        .route("/ws/{room_id}", get(ws_room_handler))
        // Request ID for distributed tracing correlation
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        // Structured request tracing with timing
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// The room registry. One per process, passed explicitly - never global.
    pub registry: RoomRegistry,
}

impl AppState {
    /// Create state around a registry.
    #[must_use]
    pub fn new(registry: RoomRegistry) -> Self {
        Self { registry }
    }
}
