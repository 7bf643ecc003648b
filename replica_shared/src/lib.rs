//! `replica_shared`
//!
//! Shared libraries used by both client and server.
//!
//! Design goals:
//! - One wire format, encoded and decoded in one place (`codec`).
//! - Sessions depend on the `transport::Driver` trait, never on sockets, so
//!   the same loops run over UDP and over the in-process loopback.
//! - No `unsafe`.

pub mod codec;
pub mod config;
pub mod console;
pub mod math;
pub mod object;
pub mod transport;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::codec::{ClientMessage, CodecError, Opcode, Secret, ServerMessage};
    pub use crate::config::*;
    pub use crate::math::*;
    pub use crate::object::*;
    pub use crate::transport::{
        Connection, DisconnectReason, Driver, LoopbackDriver, LoopbackNetwork, NetEvent,
        TransportError, UdpDriver,
    };
}
