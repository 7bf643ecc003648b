//! Server session loop.
//!
//! The server is an authoritative relay. It keeps no object state of its
//! own: it hands out identifiers for new objects and forwards every change
//! to the peers that need it.
//!
//! Each `tick`:
//! 1. advance the driver,
//! 2. prune dead slots, then accept new peers,
//! 3. for every slot, drain that connection's events in arrival order.
//!
//! Fan-out rules:
//! - Add goes to everyone, including the sender, which learns the assigned
//!   identifier that way.
//! - Modify and Delete go to everyone except the sender.
//!
//! Sends are fire-and-forget; a failed send to one peer never stops the
//! fan-out to the others.

use std::net::SocketAddr;

use anyhow::Context;
use replica_shared::{
    codec::{self, ClientMessage, CodecError, Secret, ServerMessage},
    config::ReplicaConfig,
    transport::{Connection, Driver, NetEvent},
};
use tracing::{debug, info, trace, warn};

use crate::{connections::ConnectionTable, ids::IdPool};

/// Server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Not bound; `tick` does nothing.
    Idle,
    /// Bound and accepting clients.
    Listening,
}

/// Everything that only exists while listening.
struct Listening<D> {
    driver: D,
    table: ConnectionTable,
    ids: IdPool,
    secret: Secret,
}

/// Replication server.
pub struct ServerSession<D: Driver> {
    config: ReplicaConfig,
    make_driver: Box<dyn FnMut() -> D>,
    active: Option<Listening<D>>,
}

impl<D: Driver> ServerSession<D> {
    /// Creates an idle server. `make_driver` is called once per
    /// [`ServerSession::connect_all`].
    pub fn new(config: ReplicaConfig, make_driver: impl FnMut() -> D + 'static) -> Self {
        Self {
            config,
            make_driver: Box::new(make_driver),
            active: None,
        }
    }

    /// Starts a fresh session on `port`, dropping any previous one first.
    ///
    /// Identifiers restart from 0.
    pub fn connect_all(&mut self, port: u16, secret: Secret) -> anyhow::Result<()> {
        self.disconnect_all();

        let addr = self.config.bind_socket_addr(port)?;
        let mut driver = (self.make_driver)();
        driver.bind(addr).with_context(|| format!("bind {addr}"))?;
        driver.listen().context("listen")?;
        info!(local = ?driver.local_addr(), "server listening");

        self.active = Some(Listening {
            driver,
            table: ConnectionTable::new(),
            ids: IdPool::new(),
            secret,
        });
        Ok(())
    }

    /// Tells every connected client goodbye, then closes.
    pub fn disconnect_all(&mut self) {
        if let Some(session) = self.active.as_mut() {
            let mut notified = 0;
            for (_, conn) in session.table.live() {
                session.driver.disconnect(conn);
                notified += 1;
            }
            info!(clients = notified, "disconnected all clients");
        }
        self.close();
    }

    /// Releases the session without notifying anyone.
    pub fn close(&mut self) {
        if self.active.take().is_some() {
            info!("server closed");
        }
    }

    pub fn state(&self) -> ServerState {
        if self.active.is_some() {
            ServerState::Listening
        } else {
            ServerState::Idle
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().and_then(|s| s.driver.local_addr())
    }

    /// Connected clients, not counting ones dropped earlier this tick.
    pub fn connection_count(&self) -> usize {
        self.active.as_ref().map_or(0, |s| s.table.live_count())
    }

    /// Identifiers currently allocated.
    pub fn live_objects(&self) -> usize {
        self.active.as_ref().map_or(0, |s| s.ids.live_count())
    }

    /// Runs one server tick. Does nothing while idle.
    pub fn tick(&mut self) {
        let Some(session) = self.active.as_mut() else {
            return;
        };
        session.driver.update();

        let driver = &mut session.driver;
        let pruned = session.table.prune(|conn| driver.is_live(conn));
        let accepted = session.table.accept_pending(|| {
            let conn = driver.accept();
            if let Some(conn) = conn {
                info!(%conn, "client connected");
            }
            conn
        });
        if pruned > 0 || accepted > 0 {
            debug!(pruned, accepted, clients = session.table.len(), "connection table updated");
        }

        for slot in 0..session.table.len() {
            session.process_connection(slot);
        }
    }
}

impl<D: Driver> Listening<D> {
    fn process_connection(&mut self, slot: usize) {
        while let Some(conn) = self.table.get(slot) {
            let Some(event) = self.driver.pop_event(conn) else {
                break;
            };
            match event {
                NetEvent::Disconnect(reason) => {
                    info!(%conn, ?reason, "client disconnected");
                    self.table.invalidate(slot);
                }
                NetEvent::Data(bytes) => match codec::decode_client(&self.secret, &bytes) {
                    Ok(msg) => self.dispatch(conn, msg),
                    Err(CodecError::SecretMismatch) => {
                        warn!(%conn, "secret mismatch, dropping client");
                        self.driver.disconnect(conn);
                        self.table.invalidate(slot);
                    }
                    Err(e) => debug!(%conn, error = %e, "ignoring message"),
                },
                NetEvent::Connect => trace!(%conn, "connect event on accepted connection"),
            }
        }
    }

    fn dispatch(&mut self, from: Connection, msg: ClientMessage) {
        match msg {
            ClientMessage::Pinging => {
                debug!(%from, "ping received");
                let ack = codec::encode_server(&self.secret, &ServerMessage::Acknowledged);
                if let Err(e) = self.driver.send(from, &ack) {
                    trace!(%from, error = %e, "acknowledge not sent");
                }
            }
            ClientMessage::Present => trace!(%from, "present"),
            ClientMessage::Add {
                transform,
                descriptor,
            } => {
                let Some(id) = self.ids.allocate() else {
                    warn!(%from, "identifier space exhausted, dropping add");
                    return;
                };
                debug!(%from, %id, %descriptor, "add");
                let msg = ServerMessage::Add {
                    id,
                    transform,
                    descriptor,
                };
                self.broadcast(&msg, None);
            }
            ClientMessage::Modify { id, transform } => {
                trace!(%from, %id, "modify");
                self.broadcast(&ServerMessage::Modify { id, transform }, Some(from));
            }
            ClientMessage::Delete { id } => {
                if let Err(e) = self.ids.release(id) {
                    warn!(%from, error = %e, "dropping delete");
                    return;
                }
                debug!(%from, %id, "delete");
                self.broadcast(&ServerMessage::Delete { id }, Some(from));
            }
        }
    }

    /// Sends `msg` to every valid slot except `except`.
    fn broadcast(&mut self, msg: &ServerMessage, except: Option<Connection>) {
        let bytes = codec::encode_server(&self.secret, msg);
        for (_, conn) in self.table.live() {
            if Some(conn) == except {
                continue;
            }
            if let Err(e) = self.driver.send(conn, &bytes) {
                trace!(%conn, error = %e, "broadcast send failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use replica_shared::{
        object::{ObjectId, SpawnDescriptor, Transform},
        transport::{DisconnectReason, LoopbackDriver, LoopbackNetwork},
    };

    use super::*;

    const SECRET: &str = "replica";

    /// A client speaking the wire format directly, so it can also send
    /// things a well-behaved client never would.
    struct RawClient {
        driver: LoopbackDriver,
        conn: Connection,
        secret: Secret,
    }

    impl RawClient {
        fn send(&mut self, msg: &ClientMessage) {
            let bytes = codec::encode_client(&self.secret, msg);
            self.send_bytes(&bytes);
        }

        fn send_bytes(&mut self, bytes: &[u8]) {
            self.driver.send(self.conn, bytes).unwrap();
        }

        /// Everything received since the last call, decoded.
        fn received(&mut self) -> Vec<ServerMessage> {
            self.driver.update();
            let mut out = Vec::new();
            while let Some(event) = self.driver.pop_event(self.conn) {
                if let NetEvent::Data(bytes) = event {
                    out.push(codec::decode_server(&self.secret, &bytes).unwrap());
                }
            }
            out
        }

        fn events(&mut self) -> Vec<NetEvent> {
            self.driver.update();
            std::iter::from_fn(|| self.driver.pop_event(self.conn)).collect()
        }
    }

    fn listening(net: &LoopbackNetwork) -> ServerSession<LoopbackDriver> {
        let config = ReplicaConfig {
            bind_addr: "127.0.0.1".to_string(),
            ..ReplicaConfig::default()
        };
        let port = config.port;
        let net = net.clone();
        let mut server = ServerSession::new(config, move || net.driver());
        server.connect_all(port, Secret::new(SECRET).unwrap()).unwrap();
        assert_eq!(server.state(), ServerState::Listening);
        server
    }

    /// Connects one client and lets the server accept it, so slot order
    /// follows call order.
    fn join(net: &LoopbackNetwork, server: &mut ServerSession<LoopbackDriver>) -> RawClient {
        let mut driver = net.driver();
        let conn = driver.connect(server.local_addr().unwrap()).unwrap();
        server.tick();
        driver.update();
        assert_eq!(driver.pop_event(conn), Some(NetEvent::Connect));
        RawClient {
            driver,
            conn,
            secret: Secret::new(SECRET).unwrap(),
        }
    }

    fn add() -> ClientMessage {
        ClientMessage::Add {
            transform: Transform::default(),
            descriptor: SpawnDescriptor::new("crate").unwrap(),
        }
    }

    fn added(id: u32) -> ServerMessage {
        ServerMessage::Add {
            id: ObjectId(id),
            transform: Transform::default(),
            descriptor: SpawnDescriptor::new("crate").unwrap(),
        }
    }

    #[test]
    fn pinging_is_acknowledged_to_sender_only() {
        let net = LoopbackNetwork::new();
        let mut server = listening(&net);
        let mut x = join(&net, &mut server);
        let mut y = join(&net, &mut server);

        x.send(&ClientMessage::Pinging);
        x.send(&ClientMessage::Present);
        server.tick();

        assert_eq!(x.received(), vec![ServerMessage::Acknowledged]);
        assert!(y.received().is_empty());
    }

    #[test]
    fn add_reaches_all_three_and_modify_skips_sender() {
        let net = LoopbackNetwork::new();
        let mut server = listening(&net);
        let mut x = join(&net, &mut server);
        let mut y = join(&net, &mut server);
        let mut z = join(&net, &mut server);

        x.send(&add());
        server.tick();
        for peer in [&mut x, &mut y, &mut z] {
            assert_eq!(peer.received(), vec![added(0)]);
        }

        let modify = ServerMessage::Modify {
            id: ObjectId(0),
            transform: Transform::default(),
        };
        x.send(&ClientMessage::Modify {
            id: ObjectId(0),
            transform: Transform::default(),
        });
        server.tick();
        assert!(x.received().is_empty());
        assert_eq!(y.received(), vec![modify.clone()]);
        assert_eq!(z.received(), vec![modify]);
    }

    #[test]
    fn secret_mismatch_drops_sender_and_its_remaining_events() {
        let net = LoopbackNetwork::new();
        let mut server = listening(&net);
        let mut x = join(&net, &mut server);
        let mut y = join(&net, &mut server);

        let intruder = Secret::new("intruder").unwrap();
        let bytes = codec::encode_client(&intruder, &ClientMessage::Pinging);
        x.send_bytes(&bytes);
        x.send(&add());
        server.tick();

        assert_eq!(server.connection_count(), 1);
        assert_eq!(server.live_objects(), 0);
        assert!(y.received().is_empty());
        assert_eq!(
            x.events(),
            vec![NetEvent::Disconnect(DisconnectReason::ClosedByRemote)]
        );
    }

    #[test]
    fn malformed_messages_are_ignored() {
        let net = LoopbackNetwork::new();
        let mut server = listening(&net);
        let mut x = join(&net, &mut server);
        let mut y = join(&net, &mut server);

        let mut unknown = codec::encode_client(&x.secret, &ClientMessage::Pinging).to_vec();
        unknown[codec::SECRET_FIELD_LEN] = 99;
        x.send_bytes(&unknown);

        let full = codec::encode_client(&x.secret, &add());
        let truncated = full.slice(..full.len() - 3);
        x.send_bytes(&truncated);

        x.send(&add());
        server.tick();

        assert_eq!(server.connection_count(), 2);
        assert_eq!(server.live_objects(), 1);
        assert_eq!(x.received(), vec![added(0)]);
        assert_eq!(y.received(), vec![added(0)]);
    }

    #[test]
    fn failed_send_does_not_stop_fan_out() {
        let net = LoopbackNetwork::new();
        let mut server = listening(&net);
        let mut x = join(&net, &mut server);
        let gone = join(&net, &mut server);
        let mut y = join(&net, &mut server);

        // Sits between sender and receiver in slot order, and can no longer
        // be reached when the broadcast goes out.
        drop(gone);
        x.send(&add());
        server.tick();

        assert_eq!(x.received(), vec![added(0)]);
        assert_eq!(y.received(), vec![added(0)]);
        assert_eq!(server.connection_count(), 2);
    }

    #[test]
    fn rejected_delete_is_not_broadcast() {
        let net = LoopbackNetwork::new();
        let mut server = listening(&net);
        let mut x = join(&net, &mut server);
        let mut y = join(&net, &mut server);

        x.send(&ClientMessage::Delete { id: ObjectId(3) });
        server.tick();

        assert!(x.received().is_empty());
        assert!(y.received().is_empty());
        assert_eq!(server.connection_count(), 2);
    }

    #[test]
    fn disconnect_all_notifies_every_client() {
        let net = LoopbackNetwork::new();
        let mut server = listening(&net);
        let mut x = join(&net, &mut server);
        let mut y = join(&net, &mut server);

        server.disconnect_all();
        assert_eq!(server.state(), ServerState::Idle);
        assert_eq!(server.connection_count(), 0);
        for peer in [&mut x, &mut y] {
            assert_eq!(
                peer.events(),
                vec![NetEvent::Disconnect(DisconnectReason::ClosedByRemote)]
            );
        }
    }
}
