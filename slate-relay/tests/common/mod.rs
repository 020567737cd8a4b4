//! Shared helpers for relay integration tests.

pub mod server;

pub use server::TestServer;
