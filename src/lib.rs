//! Client for a realtime chat gateway session.
//!
//! The crate is organized by concern:
//! - `gateway`: websocket session client with resume, heartbeat and caches.
//! - `retry`: shared retry, backoff and timeout utilities.

/// Gateway session client, protocol types and caches.
pub mod gateway;
/// Retry and timeout helpers.
pub mod retry;

pub use gateway::{Gateway, GatewayClient, GatewayError, GatewayOptions, SessionState};
