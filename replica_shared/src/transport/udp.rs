//! Connection-oriented datagram transport over UDP.
//!
//! Each datagram carries a 5-byte header: a packet kind and the session token
//! the client picked when it started connecting. The token ties datagrams to
//! one connection attempt so stragglers from an earlier session from the same
//! address are ignored.
//!
//! ```text
//! [kind: u8][token: u32 LE][payload]
//! ```
//!
//! The socket is a Tokio `UdpSocket` driven with `try_recv_from` /
//! `try_send_to`, so `update` never waits. Datagrams that hit `WouldBlock`
//! go to a bounded outbox flushed on the next update. The driver must be
//! bound inside a Tokio runtime, and the runtime needs to get a turn between
//! ticks for readiness to be observed.

use std::{
    collections::{HashMap, VecDeque},
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::{net::UdpSocket, time::Instant};
use tracing::{debug, info, trace};

use super::{Connection, DisconnectReason, Driver, NetEvent, TransportError};
use crate::config::TransportConfig;

/// Largest payload accepted by [`Driver::send`]. Big enough for an Add with
/// a full-length spawn descriptor.
pub const MAX_PAYLOAD: usize = 8 * 1024;

const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum PacketKind {
    ConnectRequest = 1,
    ConnectAccept = 2,
    Disconnect = 3,
    Data = 4,
    Keepalive = 5,
}

impl PacketKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(PacketKind::ConnectRequest),
            2 => Some(PacketKind::ConnectAccept),
            3 => Some(PacketKind::Disconnect),
            4 => Some(PacketKind::Data),
            5 => Some(PacketKind::Keepalive),
            _ => None,
        }
    }
}

fn frame(kind: PacketKind, token: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(kind as u8);
    buf.put_u32_le(token);
    buf.put_slice(payload);
    buf.freeze()
}

fn parse(datagram: &[u8]) -> Option<(PacketKind, u32, &[u8])> {
    if datagram.len() < HEADER_LEN {
        return None;
    }
    let kind = PacketKind::from_u8(datagram[0])?;
    let token = u32::from_le_bytes([datagram[1], datagram[2], datagram[3], datagram[4]]);
    Some((kind, token, &datagram[HEADER_LEN..]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Connecting,
    Connected,
    Closed,
}

struct Peer {
    addr: SocketAddr,
    token: u32,
    state: PeerState,
    attempts: u32,
    last_attempt: Instant,
    last_recv: Instant,
    last_send: Instant,
    events: VecDeque<NetEvent>,
}

impl Peer {
    fn new(addr: SocketAddr, token: u32, state: PeerState, now: Instant) -> Self {
        Self {
            addr,
            token,
            state,
            attempts: 0,
            last_attempt: now,
            last_recv: now,
            last_send: now,
            events: VecDeque::new(),
        }
    }

    fn close(&mut self, reason: DisconnectReason) {
        self.state = PeerState::Closed;
        self.events.push_back(NetEvent::Disconnect(reason));
    }
}

/// UDP [`Driver`].
pub struct UdpDriver {
    config: TransportConfig,
    socket: Option<UdpSocket>,
    listening: bool,
    next_conn: u32,
    peers: HashMap<Connection, Peer>,
    by_addr: HashMap<SocketAddr, Connection>,
    accepted: VecDeque<Connection>,
    outbox: VecDeque<(SocketAddr, Bytes)>,
    recv_buf: Vec<u8>,
}

impl UdpDriver {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            socket: None,
            listening: false,
            next_conn: 0,
            peers: HashMap::new(),
            by_addr: HashMap::new(),
            accepted: VecDeque::new(),
            outbox: VecDeque::new(),
            recv_buf: vec![0u8; 64 * 1024],
        }
    }

    fn add_peer(&mut self, peer: Peer) -> Connection {
        let conn = Connection(self.next_conn);
        self.next_conn = self.next_conn.wrapping_add(1);
        self.by_addr.insert(peer.addr, conn);
        self.peers.insert(conn, peer);
        conn
    }

    fn send_raw(&mut self, addr: SocketAddr, packet: Bytes) -> Result<(), TransportError> {
        let socket = self.socket.as_ref().ok_or(TransportError::NotBound)?;
        if self.outbox.is_empty() {
            match socket.try_send_to(&packet, addr) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }
        if self.outbox.len() >= self.config.max_outbox {
            return Err(TransportError::OutboxFull);
        }
        self.outbox.push_back((addr, packet));
        Ok(())
    }

    fn send_control(&mut self, conn: Connection, kind: PacketKind) {
        let Some(peer) = self.peers.get_mut(&conn) else {
            return;
        };
        peer.last_send = Instant::now();
        let (addr, token) = (peer.addr, peer.token);
        if let Err(e) = self.send_raw(addr, frame(kind, token, &[])) {
            trace!(%conn, ?kind, error = %e, "control packet dropped");
        }
    }

    fn flush_outbox(&mut self) {
        let Some(socket) = self.socket.as_ref() else {
            return;
        };
        while let Some((addr, packet)) = self.outbox.front() {
            match socket.try_send_to(packet, *addr) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => trace!(%addr, error = %e, "queued datagram dropped"),
                Ok(_) => {}
            }
            self.outbox.pop_front();
        }
    }

    fn receive(&mut self) {
        loop {
            let Some(socket) = self.socket.as_ref() else {
                return;
            };
            let (n, from) = match socket.try_recv_from(&mut self.recv_buf) {
                Ok(received) => received,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    // ICMP errors from earlier sends surface here on some
                    // platforms; they carry nothing for us.
                    trace!(error = %e, "udp recv error");
                    return;
                }
            };
            let datagram = Bytes::copy_from_slice(&self.recv_buf[..n]);
            self.handle_datagram(from, &datagram);
        }
    }

    fn handle_datagram(&mut self, from: SocketAddr, datagram: &[u8]) {
        let Some((kind, token, payload)) = parse(datagram) else {
            trace!(%from, len = datagram.len(), "malformed datagram");
            return;
        };
        let now = Instant::now();
        let known = self
            .by_addr
            .get(&from)
            .copied()
            .filter(|conn| self.peers.get(conn).is_some_and(|p| p.token == token));

        match (kind, known) {
            (PacketKind::ConnectRequest, Some(conn)) => {
                // Our accept was lost; answer again.
                if self.peers.get(&conn).is_some_and(|p| p.state == PeerState::Connected) {
                    self.send_control(conn, PacketKind::ConnectAccept);
                }
            }
            (PacketKind::ConnectRequest, None) => {
                if !self.listening || self.by_addr.contains_key(&from) {
                    return;
                }
                let conn = self.add_peer(Peer::new(from, token, PeerState::Connected, now));
                self.accepted.push_back(conn);
                debug!(%conn, %from, "connection request accepted");
                self.send_control(conn, PacketKind::ConnectAccept);
            }
            (_, None) => trace!(%from, ?kind, "datagram for unknown session"),
            (kind, Some(conn)) => {
                let Some(peer) = self.peers.get_mut(&conn) else {
                    return;
                };
                if peer.state == PeerState::Closed {
                    return;
                }
                peer.last_recv = now;
                match kind {
                    PacketKind::ConnectAccept if peer.state == PeerState::Connecting => {
                        peer.state = PeerState::Connected;
                        peer.events.push_back(NetEvent::Connect);
                        info!(%conn, addr = %peer.addr, "connected");
                    }
                    PacketKind::Disconnect => peer.close(DisconnectReason::ClosedByRemote),
                    PacketKind::Data if peer.state == PeerState::Connected => {
                        peer.events
                            .push_back(NetEvent::Data(Bytes::copy_from_slice(payload)));
                    }
                    _ => {}
                }
            }
        }
    }

    fn run_timers(&mut self) {
        let now = Instant::now();
        let mut due = Vec::new();
        for (conn, peer) in &mut self.peers {
            match peer.state {
                PeerState::Connecting => {
                    if now.duration_since(peer.last_attempt) < self.config.connect_timeout() {
                        continue;
                    }
                    if peer.attempts >= self.config.max_connect_attempts {
                        debug!(%conn, addr = %peer.addr, attempts = peer.attempts, "giving up connecting");
                        peer.close(DisconnectReason::MaxConnectionAttempts);
                    } else {
                        peer.attempts += 1;
                        peer.last_attempt = now;
                        due.push((*conn, PacketKind::ConnectRequest));
                    }
                }
                PeerState::Connected => {
                    if now.duration_since(peer.last_recv) >= self.config.disconnect_timeout() {
                        debug!(%conn, addr = %peer.addr, "connection timed out");
                        peer.close(DisconnectReason::Timeout);
                    } else if now.duration_since(peer.last_send) >= self.config.keepalive() {
                        due.push((*conn, PacketKind::Keepalive));
                    }
                }
                PeerState::Closed => {}
            }
        }
        for (conn, kind) in due {
            self.send_control(conn, kind);
        }
    }

    /// Forgets closed connections whose events have all been popped.
    fn collect_closed(&mut self) {
        let by_addr = &mut self.by_addr;
        self.peers.retain(|conn, peer| {
            let keep = peer.state != PeerState::Closed || !peer.events.is_empty();
            if !keep && by_addr.get(&peer.addr) == Some(conn) {
                by_addr.remove(&peer.addr);
            }
            keep
        });
    }
}

impl Driver for UdpDriver {
    fn bind(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        let std_socket = std::net::UdpSocket::bind(addr)?;
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;
        debug!(local = ?socket.local_addr().ok(), "udp socket bound");
        self.socket = Some(socket);
        Ok(())
    }

    fn listen(&mut self) -> Result<(), TransportError> {
        if self.socket.is_none() {
            return Err(TransportError::NotBound);
        }
        self.listening = true;
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<Connection, TransportError> {
        if self.socket.is_none() {
            let any = match addr.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            self.bind(SocketAddr::new(any, 0))?;
        }
        let mut peer = Peer::new(addr, rand::random(), PeerState::Connecting, Instant::now());
        peer.attempts = 1;
        let conn = self.add_peer(peer);
        self.send_control(conn, PacketKind::ConnectRequest);
        Ok(conn)
    }

    fn accept(&mut self) -> Option<Connection> {
        self.accepted.pop_front()
    }

    fn disconnect(&mut self, conn: Connection) {
        let Some(peer) = self.peers.remove(&conn) else {
            return;
        };
        if self.by_addr.get(&peer.addr) == Some(&conn) {
            self.by_addr.remove(&peer.addr);
        }
        if peer.state != PeerState::Closed {
            if let Err(e) = self.send_raw(peer.addr, frame(PacketKind::Disconnect, peer.token, &[])) {
                trace!(%conn, error = %e, "disconnect notice dropped");
            }
        }
    }

    fn is_live(&self, conn: Connection) -> bool {
        self.peers
            .get(&conn)
            .is_some_and(|p| p.state != PeerState::Closed || !p.events.is_empty())
    }

    fn update(&mut self) {
        self.flush_outbox();
        self.collect_closed();
        self.receive();
        self.run_timers();
    }

    fn pop_event(&mut self, conn: Connection) -> Option<NetEvent> {
        self.peers.get_mut(&conn).and_then(|p| p.events.pop_front())
    }

    fn send(&mut self, conn: Connection, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }
        let peer = self
            .peers
            .get_mut(&conn)
            .filter(|p| p.state == PeerState::Connected)
            .ok_or(TransportError::NotConnected(conn))?;
        peer.last_send = Instant::now();
        let (addr, token) = (peer.addr, peer.token);
        self.send_raw(addr, frame(PacketKind::Data, token, payload))
    }
}

impl Drop for UdpDriver {
    /// Gives queued datagrams, such as the Disconnect notice `disconnect`
    /// queues when the socket is busy, one last chance to leave.
    fn drop(&mut self) {
        self.flush_outbox();
        if !self.outbox.is_empty() {
            debug!(dropped = self.outbox.len(), "outbox discarded on close");
        }
    }
}
