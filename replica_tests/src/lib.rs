//! In-process test rig.
//!
//! Runs one [`ServerSession`] and any number of [`ClientSession`]s on a
//! shared [`LoopbackNetwork`], stepping them in a fixed order so scenarios
//! are deterministic.

use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use replica_client::{ClientSession, ObjectMirror, ReplicaEvent};
use replica_server::ServerSession;
use replica_shared::{
    codec::Secret,
    config::ReplicaConfig,
    transport::{LoopbackDriver, LoopbackNetwork},
};

/// Steps needed for a connect to finish the Pinging/Acknowledged exchange.
pub const CONNECT_STEPS: usize = 3;

/// Installs a test-friendly tracing subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Config every rig session starts from.
pub fn loopback_config() -> ReplicaConfig {
    ReplicaConfig {
        bind_addr: "127.0.0.1".to_string(),
        ..ReplicaConfig::default()
    }
}

/// One client plus everything the rig observed for it.
pub struct Peer {
    pub session: ClientSession<LoopbackDriver>,
    pub mirror: ObjectMirror,
    /// Every event drained so far, oldest first.
    pub log: Vec<ReplicaEvent>,
}

pub struct LoopbackRig {
    net: LoopbackNetwork,
    config: ReplicaConfig,
    pub server: ServerSession<LoopbackDriver>,
    peers: Vec<Option<Peer>>,
}

impl LoopbackRig {
    /// Starts a listening server with the default secret.
    pub fn new() -> anyhow::Result<Self> {
        let net = LoopbackNetwork::new();
        let config = loopback_config();
        let server_net = net.clone();
        let mut server = ServerSession::new(config.clone(), move || server_net.driver());
        let secret = Secret::new(&config.secret)?;
        server.connect_all(config.port, secret)?;
        Ok(Self {
            net,
            config,
            server,
            peers: Vec::new(),
        })
    }

    pub fn server_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server.local_addr().context("server is not listening")
    }

    /// Connects a client using the server's secret. Returns its index.
    pub fn add_client(&mut self) -> anyhow::Result<usize> {
        let secret = self.config.secret.clone();
        self.add_client_with_secret(&secret)
    }

    pub fn add_client_with_secret(&mut self, secret: &str) -> anyhow::Result<usize> {
        let net = self.net.clone();
        let mut session = ClientSession::new(&self.config, move || net.driver());
        session.connect(self.server_addr()?, Secret::new(secret)?)?;
        self.peers.push(Some(Peer {
            session,
            mirror: ObjectMirror::new(),
            log: Vec::new(),
        }));
        Ok(self.peers.len() - 1)
    }

    /// Drops a client without saying goodbye, as if its process died.
    pub fn drop_client(&mut self, index: usize) {
        if let Some(slot) = self.peers.get_mut(index) {
            slot.take();
        }
    }

    /// # Panics
    ///
    /// Panics if `index` was never added or was dropped.
    pub fn peer(&mut self, index: usize) -> &mut Peer {
        self.peers[index].as_mut().expect("client was dropped")
    }

    pub fn client(&mut self, index: usize) -> &mut ClientSession<LoopbackDriver> {
        &mut self.peer(index).session
    }

    /// Takes the events logged for a client since the last call.
    pub fn take_events(&mut self, index: usize) -> Vec<ReplicaEvent> {
        std::mem::take(&mut self.peer(index).log)
    }

    /// Ticks the server, then every client in order, advancing client
    /// clocks by `dt`.
    pub fn step(&mut self, dt: Duration) {
        self.server.tick();
        for peer in self.peers.iter_mut().flatten() {
            peer.session.tick(dt);
            for event in peer.session.drain_events() {
                event.clone().dispatch(&mut peer.mirror);
                peer.log.push(event);
            }
        }
    }

    /// Runs `n` zero-length steps.
    pub fn settle(&mut self, n: usize) {
        for _ in 0..n {
            self.step(Duration::ZERO);
        }
    }
}
