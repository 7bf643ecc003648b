//! `replica_client`
//!
//! Client side of the replication relay:
//! - Session loop over any transport driver
//! - Heartbeat while idle
//! - Replication events for the host, queued or dispatched to a handler
//! - A ready-made object mirror

pub mod client;
pub mod events;
pub mod heartbeat;
pub mod mirror;

pub use client::{ClientError, ClientSession, ClientState};
pub use events::{ReplicaEvent, ReplicaHandler};
pub use mirror::ObjectMirror;
