//! `replica_server`
//!
//! Server-side systems:
//! - Identifier allocation with FIFO reuse (`ids`)
//! - Live-connection registry (`connections`)
//! - Tick-driven relay loop with secret check and fan-out (`server`)
//!
//! The server never stores replicated object state; it only forwards it.

pub mod connections;
pub mod ids;
pub mod server;

pub use server::{ServerSession, ServerState};
