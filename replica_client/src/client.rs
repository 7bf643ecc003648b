//! Client session loop.
//!
//! The client mirrors objects owned by the server. It writes its own
//! changes as Add, Modify and Delete messages and turns every change the
//! server relays back into a [`ReplicaEvent`] for the host.
//!
//! Each `tick`:
//! 1. advance the heartbeat timer and the driver,
//! 2. drain this connection's events in arrival order,
//! 3. send a Present if nothing was sent for a heartbeat interval.
//!
//! The server acknowledges the first Pinging with Acknowledged. Nothing
//! waits on it; `is_acknowledged` only reports whether it arrived.

use std::{collections::VecDeque, net::SocketAddr, time::Duration};

use anyhow::Context;
use replica_shared::{
    codec::{self, ClientMessage, CodecError, Secret, ServerMessage},
    config::ReplicaConfig,
    object::{ObjectId, SpawnDescriptor, Transform},
    transport::{Connection, DisconnectReason, Driver, NetEvent, TransportError},
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::{
    events::{ReplicaEvent, ReplicaHandler},
    heartbeat::Heartbeat,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No session. `tick` does nothing.
    Disconnected,
    /// Waiting for the transport to establish the connection.
    Connecting,
    /// Established. Writes are accepted.
    Connected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Everything that only exists while a session is open.
struct Session<D> {
    driver: D,
    conn: Connection,
    server: SocketAddr,
    secret: Secret,
}

/// Replication client.
pub struct ClientSession<D: Driver> {
    make_driver: Box<dyn FnMut() -> D>,
    active: Option<Session<D>>,
    state: ClientState,
    acknowledged: bool,
    heartbeat: Heartbeat,
    events: VecDeque<ReplicaEvent>,
}

impl<D: Driver> ClientSession<D> {
    /// Creates a disconnected client. `make_driver` is called once per
    /// [`ClientSession::connect`].
    pub fn new(config: &ReplicaConfig, make_driver: impl FnMut() -> D + 'static) -> Self {
        Self {
            make_driver: Box::new(make_driver),
            active: None,
            state: ClientState::Disconnected,
            acknowledged: false,
            heartbeat: Heartbeat::new(config.heartbeat()),
            events: VecDeque::new(),
        }
    }

    /// Starts connecting to `server`, dropping any previous session first.
    /// Events still queued from that session are discarded.
    ///
    /// Returns once the request is queued. The session becomes
    /// [`ClientState::Connected`] on a later tick.
    pub fn connect(&mut self, server: SocketAddr, secret: Secret) -> anyhow::Result<()> {
        self.disconnect();
        self.events.clear();

        let mut driver = (self.make_driver)();
        let conn = driver
            .connect(server)
            .with_context(|| format!("connect {server}"))?;
        info!(%server, %conn, "connecting");

        self.active = Some(Session {
            driver,
            conn,
            server,
            secret,
        });
        self.state = ClientState::Connecting;
        self.heartbeat.reset();
        Ok(())
    }

    /// Tells the server goodbye, then closes.
    pub fn disconnect(&mut self) {
        if let Some(session) = self.active.as_mut() {
            session.driver.disconnect(session.conn);
            info!(server = %session.server, "disconnected");
        }
        self.close();
    }

    /// Releases the session without notifying the server.
    pub fn close(&mut self) {
        if self.active.take().is_some() {
            debug!("client closed");
        }
        self.state = ClientState::Disconnected;
        self.acknowledged = false;
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.active.as_ref().map(|s| s.server)
    }

    /// Number of events waiting to be drained.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Takes every queued event, oldest first.
    pub fn drain_events(&mut self) -> Vec<ReplicaEvent> {
        self.events.drain(..).collect()
    }

    /// Hands every queued event to `handler`, oldest first. Returns how many
    /// were delivered.
    pub fn dispatch<H: ReplicaHandler + ?Sized>(&mut self, handler: &mut H) -> usize {
        let mut delivered = 0;
        while let Some(event) = self.events.pop_front() {
            event.dispatch(handler);
            delivered += 1;
        }
        delivered
    }

    /// Runs one client tick. `dt` is the time since the previous tick.
    pub fn tick(&mut self, dt: Duration) {
        let Some(session) = self.active.as_mut() else {
            return;
        };
        self.heartbeat.advance(dt);
        session.driver.update();

        while let Some(event) = self.pop_event() {
            self.handle_event(event);
        }

        if self.state == ClientState::Connected && self.heartbeat.is_due() {
            trace!(elapsed = ?self.heartbeat.elapsed(), "heartbeat");
            if let Err(e) = self.send(&ClientMessage::Present) {
                trace!(error = %e, "present not sent");
            }
        }
    }

    /// Asks the server to create an object. The server answers every
    /// client, this one included, with the identifier it assigned.
    pub fn write_add(
        &mut self,
        transform: Transform,
        descriptor: SpawnDescriptor,
    ) -> Result<(), ClientError> {
        self.send(&ClientMessage::Add {
            transform,
            descriptor,
        })
    }

    pub fn write_modify(&mut self, id: ObjectId, transform: Transform) -> Result<(), ClientError> {
        self.send(&ClientMessage::Modify { id, transform })
    }

    pub fn write_delete(&mut self, id: ObjectId) -> Result<(), ClientError> {
        self.send(&ClientMessage::Delete { id })
    }

    fn pop_event(&mut self) -> Option<NetEvent> {
        let session = self.active.as_mut()?;
        session.driver.pop_event(session.conn)
    }

    fn handle_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Connect => {
                info!("connected");
                self.state = ClientState::Connected;
                self.heartbeat.reset();
                if let Err(e) = self.send(&ClientMessage::Pinging) {
                    warn!(error = %e, "pinging not sent");
                }
            }
            NetEvent::Disconnect(reason) => self.on_disconnect(reason),
            NetEvent::Data(bytes) => {
                let Some(session) = self.active.as_ref() else {
                    return;
                };
                match codec::decode_server(&session.secret, &bytes) {
                    Ok(msg) => self.on_message(msg),
                    Err(CodecError::SecretMismatch) => trace!("dropping message with foreign secret"),
                    Err(e) => debug!(error = %e, "ignoring message"),
                }
            }
        }
    }

    fn on_disconnect(&mut self, reason: DisconnectReason) {
        info!(?reason, "server connection lost");
        self.close();
        self.events.push_back(ReplicaEvent::Disconnected(reason));
    }

    fn on_message(&mut self, msg: ServerMessage) {
        let event = match msg {
            ServerMessage::Acknowledged => {
                debug!("acknowledged by server");
                self.acknowledged = true;
                return;
            }
            ServerMessage::Add {
                id,
                transform,
                descriptor,
            } => ReplicaEvent::Added {
                id,
                transform,
                descriptor,
            },
            ServerMessage::Modify { id, transform } => ReplicaEvent::Modified { id, transform },
            ServerMessage::Delete { id } => ReplicaEvent::Deleted { id },
        };
        self.events.push_back(event);
    }

    /// Encodes and sends one message. Any successful send resets the
    /// heartbeat.
    fn send(&mut self, msg: &ClientMessage) -> Result<(), ClientError> {
        if self.state != ClientState::Connected {
            return Err(ClientError::NotConnected);
        }
        let session = self.active.as_mut().ok_or(ClientError::NotConnected)?;
        let bytes = codec::encode_client(&session.secret, msg);
        session.driver.send(session.conn, &bytes)?;
        self.heartbeat.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use replica_shared::{
        math::Vec3,
        transport::{LoopbackDriver, LoopbackNetwork},
    };

    use super::*;

    const STEP: Duration = Duration::from_millis(150);

    /// A bare listening driver standing in for the server.
    struct RawServer {
        driver: LoopbackDriver,
        conn: Option<Connection>,
        secret: Secret,
    }

    impl RawServer {
        fn new(net: &LoopbackNetwork) -> Self {
            let mut driver = net.driver();
            driver
                .bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000))
                .unwrap();
            driver.listen().unwrap();
            Self {
                driver,
                conn: None,
                secret: Secret::new("replica").unwrap(),
            }
        }

        fn addr(&self) -> SocketAddr {
            self.driver.local_addr().unwrap()
        }

        /// Advances the driver and returns every client message received.
        fn pump(&mut self) -> Vec<ClientMessage> {
            self.driver.update();
            if let Some(conn) = self.driver.accept() {
                self.conn = Some(conn);
            }
            let mut out = Vec::new();
            if let Some(conn) = self.conn {
                while let Some(event) = self.driver.pop_event(conn) {
                    if let NetEvent::Data(bytes) = event {
                        out.push(codec::decode_client(&self.secret, &bytes).unwrap());
                    }
                }
            }
            out
        }

        fn send(&mut self, secret: &Secret, msg: &ServerMessage) {
            let bytes = codec::encode_server(secret, msg);
            self.driver.send(self.conn.unwrap(), &bytes).unwrap();
        }
    }

    fn connected_pair() -> (ClientSession<LoopbackDriver>, RawServer) {
        let net = LoopbackNetwork::new();
        let mut server = RawServer::new(&net);
        let mut client = ClientSession::new(&ReplicaConfig::default(), move || net.driver());
        client
            .connect(server.addr(), Secret::new("replica").unwrap())
            .unwrap();
        assert_eq!(client.state(), ClientState::Connecting);

        server.pump();
        client.tick(Duration::ZERO);
        assert_eq!(client.state(), ClientState::Connected);
        assert_eq!(server.pump(), vec![ClientMessage::Pinging]);
        (client, server)
    }

    #[test]
    fn connect_sends_pinging_and_records_acknowledge() {
        let (mut client, mut server) = connected_pair();
        assert!(!client.is_acknowledged());

        let secret = server.secret.clone();
        server.send(&secret, &ServerMessage::Acknowledged);
        client.tick(Duration::ZERO);
        assert!(client.is_acknowledged());
        assert_eq!(client.pending_events(), 0);
    }

    #[test]
    fn exactly_one_present_after_heartbeat_interval() {
        let (mut client, mut server) = connected_pair();

        for _ in 0..4 {
            client.tick(STEP);
        }
        assert!(server.pump().is_empty());

        client.tick(STEP);
        assert_eq!(server.pump(), vec![ClientMessage::Present]);
        assert_eq!(client.heartbeat().elapsed(), Duration::ZERO);

        client.tick(STEP);
        assert!(server.pump().is_empty());
    }

    #[test]
    fn writes_reset_the_heartbeat() {
        let (mut client, mut server) = connected_pair();

        for _ in 0..4 {
            client.tick(STEP);
        }
        client
            .write_modify(ObjectId(2), Transform::at(Vec3::new(1.0, 0.0, 0.0)))
            .unwrap();
        client.tick(STEP);

        let received = server.pump();
        assert_eq!(received.len(), 1);
        assert!(matches!(received[0], ClientMessage::Modify { id: ObjectId(2), .. }));
    }

    #[test]
    fn relayed_changes_become_events_in_order() {
        let (mut client, mut server) = connected_pair();
        let secret = server.secret.clone();
        let descriptor = SpawnDescriptor::new("crate").unwrap();

        server.send(
            &secret,
            &ServerMessage::Add {
                id: ObjectId(0),
                transform: Transform::default(),
                descriptor: descriptor.clone(),
            },
        );
        server.send(
            &secret,
            &ServerMessage::Modify {
                id: ObjectId(0),
                transform: Transform::default(),
            },
        );
        server.send(&secret, &ServerMessage::Delete { id: ObjectId(0) });
        client.tick(Duration::ZERO);

        assert_eq!(
            client.drain_events(),
            vec![
                ReplicaEvent::Added {
                    id: ObjectId(0),
                    transform: Transform::default(),
                    descriptor,
                },
                ReplicaEvent::Modified {
                    id: ObjectId(0),
                    transform: Transform::default(),
                },
                ReplicaEvent::Deleted { id: ObjectId(0) },
            ]
        );
    }

    #[test]
    fn foreign_secret_is_dropped_silently() {
        let (mut client, mut server) = connected_pair();
        let foreign = Secret::new("other").unwrap();

        server.send(&foreign, &ServerMessage::Delete { id: ObjectId(1) });
        client.tick(Duration::ZERO);

        assert_eq!(client.pending_events(), 0);
        assert_eq!(client.state(), ClientState::Connected);
    }

    #[test]
    fn server_disconnect_closes_and_notifies() {
        let (mut client, mut server) = connected_pair();
        let conn = server.conn.unwrap();

        server.driver.disconnect(conn);
        client.tick(Duration::ZERO);

        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(
            client.drain_events(),
            vec![ReplicaEvent::Disconnected(DisconnectReason::ClosedByRemote)]
        );
        assert!(matches!(
            client.write_delete(ObjectId(0)),
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn reconnect_discards_events_from_previous_session() {
        let (mut client, mut server) = connected_pair();
        let conn = server.conn.unwrap();
        server.driver.disconnect(conn);
        client.tick(Duration::ZERO);
        assert_eq!(client.pending_events(), 1);

        client
            .connect(server.addr(), Secret::new("replica").unwrap())
            .unwrap();
        assert_eq!(client.pending_events(), 0);
        assert!(client.drain_events().is_empty());
    }

    #[test]
    fn connect_resets_heartbeat_even_if_pinging_fails() {
        let net = LoopbackNetwork::new();
        let mut server = RawServer::new(&net);
        let mut client = ClientSession::new(&ReplicaConfig::default(), move || net.driver());
        client
            .connect(server.addr(), Secret::new("replica").unwrap())
            .unwrap();
        client.tick(STEP);
        assert_eq!(client.heartbeat().elapsed(), STEP);

        // Accepted and immediately dropped, so Connect and Disconnect arrive
        // together and the Pinging has nowhere to go.
        server.pump();
        let conn = server.conn.unwrap();
        server.driver.disconnect(conn);
        client.tick(STEP);

        assert_eq!(client.heartbeat().elapsed(), Duration::ZERO);
        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(
            client.drain_events(),
            vec![ReplicaEvent::Disconnected(DisconnectReason::ClosedByRemote)]
        );
    }

    #[test]
    fn writes_fail_until_connected() {
        let net = LoopbackNetwork::new();
        let server = RawServer::new(&net);
        let mut client = ClientSession::new(&ReplicaConfig::default(), move || net.driver());

        assert!(matches!(
            client.write_add(Transform::default(), SpawnDescriptor::new("a").unwrap()),
            Err(ClientError::NotConnected)
        ));

        client
            .connect(server.addr(), Secret::new("replica").unwrap())
            .unwrap();
        assert!(matches!(
            client.write_delete(ObjectId(0)),
            Err(ClientError::NotConnected)
        ));
    }

    #[test]
    fn unreachable_server_reports_disconnect() {
        let net = LoopbackNetwork::new();
        let mut client = ClientSession::new(&ReplicaConfig::default(), move || net.driver());
        let nowhere = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1);

        client
            .connect(nowhere, Secret::new("replica").unwrap())
            .unwrap();
        client.tick(Duration::ZERO);

        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(
            client.drain_events(),
            vec![ReplicaEvent::Disconnected(
                DisconnectReason::MaxConnectionAttempts
            )]
        );
    }
}
