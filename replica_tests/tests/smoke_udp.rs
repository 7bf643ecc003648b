//! Real sockets: one server and two clients on 127.0.0.1.

use std::time::Duration;

use replica_client::{ClientSession, ClientState, ReplicaEvent};
use replica_server::ServerSession;
use replica_shared::{
    codec::Secret,
    object::{ObjectId, SpawnDescriptor, Transform},
    transport::UdpDriver,
};
use replica_tests::{init_tracing, loopback_config};

type UdpClient = ClientSession<UdpDriver>;

/// Ticks everything with a short sleep until `done` holds or the budget runs out.
async fn run_until(
    server: &mut ServerSession<UdpDriver>,
    clients: &mut [UdpClient],
    events: &mut [Vec<ReplicaEvent>],
    mut done: impl FnMut(&ServerSession<UdpDriver>, &[UdpClient], &[Vec<ReplicaEvent>]) -> bool,
) -> bool {
    let step = Duration::from_millis(5);
    for _ in 0..400 {
        server.tick();
        for (client, log) in clients.iter_mut().zip(events.iter_mut()) {
            client.tick(step);
            log.extend(client.drain_events());
        }
        if done(&*server, &*clients, &*events) {
            return true;
        }
        tokio::time::sleep(step).await;
    }
    false
}

#[tokio::test]
async fn udp_relay_smoke() -> anyhow::Result<()> {
    init_tracing();
    let config = loopback_config();
    let transport = config.transport.clone();
    let secret = Secret::new(&config.secret)?;

    let mut server = ServerSession::new(config.clone(), move || UdpDriver::new(transport.clone()));
    server.connect_all(0, secret.clone())?;
    let addr = server.local_addr().expect("server bound");

    let mut clients: Vec<UdpClient> = (0..2)
        .map(|_| {
            let transport = config.transport.clone();
            ClientSession::new(&config, move || UdpDriver::new(transport.clone()))
        })
        .collect();
    for client in &mut clients {
        client.connect(addr, secret.clone())?;
    }
    let mut events = vec![Vec::new(), Vec::new()];

    let acknowledged = run_until(&mut server, &mut clients, &mut events, |_, c, _| {
        c.iter().all(|c| c.is_acknowledged())
    })
    .await;
    assert!(acknowledged, "clients were never acknowledged");
    assert_eq!(server.connection_count(), 2);

    clients[0].write_add(Transform::default(), SpawnDescriptor::new("crate").unwrap())?;
    let relayed = run_until(&mut server, &mut clients, &mut events, |_, _, e| {
        e.iter().all(|log| !log.is_empty())
    })
    .await;
    assert!(relayed, "add was never relayed");
    for log in &events {
        assert!(matches!(
            log.as_slice(),
            [ReplicaEvent::Added { id: ObjectId(0), .. }]
        ));
    }

    clients[1].disconnect();
    assert_eq!(clients[1].state(), ClientState::Disconnected);
    let pruned = run_until(&mut server, &mut clients, &mut events, |s, _, _| {
        s.connection_count() == 1
    })
    .await;
    assert!(pruned, "disconnected client was never pruned");

    server.disconnect_all();
    Ok(())
}
