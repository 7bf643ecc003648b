//! In-process loopback transport.
//!
//! All drivers created from one [`LoopbackNetwork`] share a hub. Delivery is
//! deterministic: anything sent becomes visible to the receiver after the
//! receiver's next [`Driver::update`], and connection requests complete on
//! the listener's `update`.
//!
//! Dropping a driver does not send a disconnect, but its peers observe a
//! `Disconnect(Timeout)` on their next update, standing in for the timeout a
//! real transport would eventually report.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    rc::Rc,
};

use bytes::Bytes;

use super::{Connection, DisconnectReason, Driver, NetEvent, TransportError};

const FIRST_EPHEMERAL_PORT: u16 = 49152;

/// Shared in-process network. Cheap to clone.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    hub: Rc<RefCell<Hub>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new, unbound driver attached to this network.
    pub fn driver(&self) -> LoopbackDriver {
        let endpoint = self.hub.borrow_mut().add_endpoint();
        LoopbackDriver {
            hub: Rc::clone(&self.hub),
            endpoint,
        }
    }

    /// Number of live drivers on the network.
    pub fn driver_count(&self) -> usize {
        self.hub.borrow().endpoints.iter().flatten().count()
    }
}

#[derive(Default)]
struct Hub {
    endpoints: Vec<Option<Endpoint>>,
    bound: HashMap<SocketAddr, usize>,
    next_port: u16,
}

#[derive(Default)]
struct Endpoint {
    addr: Option<SocketAddr>,
    listening: bool,
    next_conn: u32,
    links: HashMap<Connection, Link>,
    /// Connect requests waiting for this endpoint's update.
    requests: VecDeque<(usize, Connection)>,
    accepted: VecDeque<Connection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connecting,
    Connected,
    Closed,
}

struct Link {
    peer: Option<(usize, Connection)>,
    state: LinkState,
    in_flight: VecDeque<NetEvent>,
    inbox: VecDeque<NetEvent>,
}

impl Link {
    fn new(peer: Option<(usize, Connection)>, state: LinkState) -> Self {
        Self {
            peer,
            state,
            in_flight: VecDeque::new(),
            inbox: VecDeque::new(),
        }
    }
}

impl Hub {
    fn endpoint(&self, index: usize) -> Option<&Endpoint> {
        self.endpoints.get(index).and_then(Option::as_ref)
    }

    fn endpoint_mut(&mut self, index: usize) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(index).and_then(Option::as_mut)
    }

    fn link_mut(&mut self, (endpoint, conn): (usize, Connection)) -> Option<&mut Link> {
        self.endpoint_mut(endpoint)
            .and_then(|ep| ep.links.get_mut(&conn))
    }

    fn ephemeral_addr(&mut self) -> SocketAddr {
        loop {
            if self.next_port < FIRST_EPHEMERAL_PORT {
                self.next_port = FIRST_EPHEMERAL_PORT;
            }
            let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.next_port);
            self.next_port = self.next_port.wrapping_add(1);
            if !self.bound.contains_key(&addr) {
                return addr;
            }
        }
    }

    fn bind(&mut self, endpoint: usize, mut addr: SocketAddr) -> Result<(), TransportError> {
        if addr.port() == 0 {
            let port = self.ephemeral_addr().port();
            addr.set_port(port);
        }
        if self.bound.contains_key(&addr) {
            return Err(TransportError::AddrInUse(addr));
        }
        let ep = self.endpoint_mut(endpoint).ok_or(TransportError::NotBound)?;
        let previous = ep.addr.replace(addr);
        if let Some(previous) = previous {
            self.bound.remove(&previous);
        }
        self.bound.insert(addr, endpoint);
        Ok(())
    }

    /// Reuses the slot of a dropped driver when there is one.
    fn add_endpoint(&mut self) -> usize {
        match self.endpoints.iter().position(Option::is_none) {
            Some(free) => {
                self.endpoints[free] = Some(Endpoint::default());
                free
            }
            None => {
                self.endpoints.push(Some(Endpoint::default()));
                self.endpoints.len() - 1
            }
        }
    }

    /// Queues a disconnect on the far side of a link and detaches it, so the
    /// far side never sends into a slot that may be reused.
    fn sever_peer(&mut self, peer: Option<(usize, Connection)>, reason: DisconnectReason) {
        if let Some(link) = peer.and_then(|peer| self.link_mut(peer)) {
            if link.state != LinkState::Closed {
                link.in_flight.push_back(NetEvent::Disconnect(reason));
            }
            link.peer = None;
        }
    }

    fn push_to_peer(&mut self, peer: Option<(usize, Connection)>, event: NetEvent) -> bool {
        match peer.and_then(|peer| self.link_mut(peer)) {
            Some(link) if link.state != LinkState::Closed => {
                link.in_flight.push_back(event);
                true
            }
            _ => false,
        }
    }

    fn answer_requests(&mut self, endpoint: usize) {
        let Some(ep) = self.endpoint_mut(endpoint) else {
            return;
        };
        let listening = ep.listening;
        let requests: Vec<_> = ep.requests.drain(..).collect();

        for (client_ep, client_conn) in requests {
            // The requester may have given up or been dropped meanwhile.
            let waiting = self
                .link_mut((client_ep, client_conn))
                .is_some_and(|link| link.state == LinkState::Connecting);
            if !waiting {
                continue;
            }

            if !listening {
                if let Some(link) = self.link_mut((client_ep, client_conn)) {
                    link.state = LinkState::Closed;
                    link.in_flight
                        .push_back(NetEvent::Disconnect(DisconnectReason::MaxConnectionAttempts));
                }
                continue;
            }

            let Some(ep) = self.endpoint_mut(endpoint) else {
                return;
            };
            let server_conn = Connection(ep.next_conn);
            ep.next_conn += 1;
            ep.links.insert(
                server_conn,
                Link::new(Some((client_ep, client_conn)), LinkState::Connected),
            );
            ep.accepted.push_back(server_conn);

            if let Some(link) = self.link_mut((client_ep, client_conn)) {
                link.peer = Some((endpoint, server_conn));
                link.state = LinkState::Connected;
                link.in_flight.push_back(NetEvent::Connect);
            }
        }
    }

    fn remove_endpoint(&mut self, endpoint: usize) {
        let Some(ep) = self.endpoints.get_mut(endpoint).and_then(Option::take) else {
            return;
        };
        if let Some(addr) = ep.addr {
            self.bound.remove(&addr);
        }
        for link in ep.links.into_values() {
            if link.state != LinkState::Closed {
                self.sever_peer(link.peer, DisconnectReason::Timeout);
            }
        }
        for other in self.endpoints.iter_mut().flatten() {
            other.requests.retain(|(requester, _)| *requester != endpoint);
        }
        for requester in ep.requests {
            if let Some(link) = self.link_mut(requester) {
                link.state = LinkState::Closed;
                link.in_flight
                    .push_back(NetEvent::Disconnect(DisconnectReason::MaxConnectionAttempts));
            }
        }
    }
}

/// One endpoint on a [`LoopbackNetwork`].
pub struct LoopbackDriver {
    hub: Rc<RefCell<Hub>>,
    endpoint: usize,
}

impl Driver for LoopbackDriver {
    fn bind(&mut self, addr: SocketAddr) -> Result<(), TransportError> {
        self.hub.borrow_mut().bind(self.endpoint, addr)
    }

    fn listen(&mut self) -> Result<(), TransportError> {
        let mut hub = self.hub.borrow_mut();
        let ep = hub
            .endpoint_mut(self.endpoint)
            .filter(|ep| ep.addr.is_some())
            .ok_or(TransportError::NotBound)?;
        ep.listening = true;
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.hub.borrow().endpoint(self.endpoint).and_then(|ep| ep.addr)
    }

    fn connect(&mut self, addr: SocketAddr) -> Result<Connection, TransportError> {
        let mut hub = self.hub.borrow_mut();
        if hub.endpoint(self.endpoint).and_then(|ep| ep.addr).is_none() {
            let local = hub.ephemeral_addr();
            hub.bind(self.endpoint, local)?;
        }

        let target = hub.bound.get(&addr).copied();
        let ep = hub
            .endpoint_mut(self.endpoint)
            .ok_or(TransportError::NotBound)?;
        let conn = Connection(ep.next_conn);
        ep.next_conn += 1;
        let mut link = Link::new(None, LinkState::Connecting);
        if target.is_none() {
            link.state = LinkState::Closed;
            link.in_flight
                .push_back(NetEvent::Disconnect(DisconnectReason::MaxConnectionAttempts));
        }
        ep.links.insert(conn, link);

        if let Some(target) = target.and_then(|t| hub.endpoint_mut(t)) {
            target.requests.push_back((self.endpoint, conn));
        }
        Ok(conn)
    }

    fn accept(&mut self) -> Option<Connection> {
        self.hub
            .borrow_mut()
            .endpoint_mut(self.endpoint)
            .and_then(|ep| ep.accepted.pop_front())
    }

    fn disconnect(&mut self, conn: Connection) {
        let mut hub = self.hub.borrow_mut();
        let Some(link) = hub
            .endpoint_mut(self.endpoint)
            .and_then(|ep| ep.links.remove(&conn))
        else {
            return;
        };
        if link.state != LinkState::Closed {
            hub.sever_peer(link.peer, DisconnectReason::ClosedByRemote);
        }
    }

    fn is_live(&self, conn: Connection) -> bool {
        self.hub
            .borrow()
            .endpoint(self.endpoint)
            .and_then(|ep| ep.links.get(&conn))
            .is_some_and(|link| link.state != LinkState::Closed || !link.inbox.is_empty())
    }

    fn update(&mut self) {
        let mut hub = self.hub.borrow_mut();
        hub.answer_requests(self.endpoint);

        let Some(ep) = hub.endpoint_mut(self.endpoint) else {
            return;
        };
        ep.links.retain(|_, link| {
            link.state != LinkState::Closed || !link.inbox.is_empty() || !link.in_flight.is_empty()
        });
        for link in ep.links.values_mut() {
            while let Some(event) = link.in_flight.pop_front() {
                if matches!(event, NetEvent::Disconnect(_)) {
                    link.state = LinkState::Closed;
                }
                link.inbox.push_back(event);
            }
        }
    }

    fn pop_event(&mut self, conn: Connection) -> Option<NetEvent> {
        self.hub
            .borrow_mut()
            .endpoint_mut(self.endpoint)
            .and_then(|ep| ep.links.get_mut(&conn))
            .and_then(|link| link.inbox.pop_front())
    }

    fn send(&mut self, conn: Connection, payload: &[u8]) -> Result<(), TransportError> {
        let mut hub = self.hub.borrow_mut();
        let peer = hub
            .endpoint(self.endpoint)
            .and_then(|ep| ep.links.get(&conn))
            .filter(|link| link.state == LinkState::Connected)
            .and_then(|link| link.peer)
            .ok_or(TransportError::NotConnected(conn))?;
        if hub.push_to_peer(Some(peer), NetEvent::Data(Bytes::copy_from_slice(payload))) {
            Ok(())
        } else {
            Err(TransportError::NotConnected(conn))
        }
    }
}

impl Drop for LoopbackDriver {
    fn drop(&mut self) {
        self.hub.borrow_mut().remove_endpoint(self.endpoint);
    }
}
