//! Realtime gateway session modules.
//!
//! - `client`: public builder, options, errors and the live session handle.
//! - `proto`: wire envelope, opcodes and outbound payload builders.
//! - `codec`: zlib-stream decompression bound to one socket.
//! - `events`: normalized event records and their FIFO buffers.
//! - `cache`: snapshot caches built from the ready events and patched after.
//! - `session`: session identity, lifecycle state and the reconnect signal.
//! - `connection`, `receiver`, `heartbeat`, `reconnect`: the per-socket tasks
//!   and the recovery supervisor.

/// Client builder, options and the running session handle.
pub mod client;
/// Snapshot caches.
pub mod cache;
/// Frame decompression.
pub mod codec;
/// Event records and buffers.
pub mod events;
/// Heartbeat scheduling.
pub mod heartbeat;
/// Gateway protocol messages.
pub mod proto;
/// Session state and reconnect signalling.
pub mod session;

mod connection;
mod receiver;
mod reconnect;

pub use client::{Gateway, GatewayClient, GatewayDefaults, GatewayError, GatewayOptions};
pub use session::SessionState;
