//! Transport drivers.
//!
//! The session loops never touch sockets directly. They talk to a
//! [`Driver`]: a connection-oriented, non-blocking message transport that is
//! advanced once per tick with [`Driver::update`] and then drained per
//! connection with [`Driver::pop_event`].
//!
//! Two drivers ship with the crate:
//! - [`loopback`]: in-process and deterministic, for tests and for hosts that
//!   run server and client in the same process.
//! - [`udp`]: datagrams over a Tokio `UdpSocket`.

pub mod loopback;
pub mod udp;

use std::{fmt, net::SocketAddr};

use bytes::Bytes;
use thiserror::Error;

pub use loopback::{LoopbackDriver, LoopbackNetwork};
pub use udp::UdpDriver;

/// Opaque per-driver connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Connection(u32);

impl Connection {
    pub const fn from_raw(raw: u32) -> Self {
        Connection(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn{}", self.0)
    }
}

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer disconnected on purpose.
    ClosedByRemote,
    /// Nothing was heard from the peer for too long.
    Timeout,
    /// The peer never answered the connection request.
    MaxConnectionAttempts,
}

/// Something that happened on a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
    Connect,
    Disconnect(DisconnectReason),
    Data(Bytes),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("driver is not bound")]
    NotBound,
    #[error("address {0} already in use")]
    AddrInUse(SocketAddr),
    #[error("{0} is not established")]
    NotConnected(Connection),
    #[error("payload of {0} bytes does not fit in a datagram")]
    PayloadTooLarge(usize),
    #[error("send queue is full")]
    OutboxFull,
}

/// Connection-oriented message transport, polled once per tick.
///
/// No method blocks. Sends are fire-and-forget at the protocol level: an
/// `Ok` means the driver accepted the message, not that it arrived.
pub trait Driver {
    /// Binds the local endpoint. Port 0 picks a free port.
    fn bind(&mut self, addr: SocketAddr) -> Result<(), TransportError>;

    /// Starts accepting inbound connections. Requires [`Driver::bind`].
    fn listen(&mut self) -> Result<(), TransportError>;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Starts connecting to `addr`. The returned connection produces a
    /// `Connect` event once established, or a `Disconnect` if it never is.
    fn connect(&mut self, addr: SocketAddr) -> Result<Connection, TransportError>;

    /// Pops the next accepted inbound connection, if any.
    fn accept(&mut self) -> Option<Connection>;

    /// Closes a connection and tells the peer. Pending events are dropped.
    fn disconnect(&mut self, conn: Connection);

    /// True while the connection is open or still holds events to pop.
    fn is_live(&self, conn: Connection) -> bool;

    /// Advances internal clocks and queues. Call once per tick before
    /// accepting or popping.
    fn update(&mut self);

    fn pop_event(&mut self, conn: Connection) -> Option<NetEvent>;

    fn send(&mut self, conn: Connection, payload: &[u8]) -> Result<(), TransportError>;
}
