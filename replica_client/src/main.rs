//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p replica_client -- [--config client.json] [--addr 127.0.0.1:40000] [--secret s]
//!
//! The client connects to a relay server, mirrors every replicated object
//! and lets the console create, move and delete objects.
//!
//! Console commands:
//!   add <descriptor> [x y z]    - Create an object
//!   move <id> <x> <y> <z> [yaw] - Move an object, yaw in degrees
//!   delete <id>                 - Delete an object
//!   list                        - List mirrored objects
//!   connect [host:port]         - Reconnect
//!   disconnect                  - Disconnect from server
//!   status                      - Show client status
//!   quit                        - Exit client

use std::env;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use replica_client::{ClientSession, ObjectMirror, ReplicaEvent, ReplicaHandler};
use replica_shared::{
    codec::Secret,
    config::ReplicaConfig,
    console,
    math::{Quat, Vec3},
    object::{ObjectId, SpawnDescriptor, Transform},
    transport::UdpDriver,
};
use tracing::info;

fn parse_args() -> anyhow::Result<ReplicaConfig> {
    let args: Vec<String> = env::args().collect();

    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => ReplicaConfig::from_json_file(&args[i + 1])?,
        _ => ReplicaConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--secret" if i + 1 < args.len() => {
                cfg.secret = args[i + 1].clone();
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(60);
                i += 2;
            }
            "--heartbeat-ms" if i + 1 < args.len() => {
                cfg.heartbeat_ms = args[i + 1].parse().context("parse --heartbeat-ms")?;
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

fn parse_vec3(args: &[&str]) -> anyhow::Result<Vec3> {
    match args {
        [] => Ok(Vec3::ZERO),
        [x, y, z, ..] => Ok(Vec3::new(x.parse()?, y.parse()?, z.parse()?)),
        _ => bail!("expected x y z"),
    }
}

fn parse_id(arg: Option<&&str>) -> anyhow::Result<ObjectId> {
    let raw = arg.context("missing object id")?;
    let raw = raw.strip_prefix('#').unwrap_or(raw);
    Ok(ObjectId(raw.parse().context("parse object id")?))
}

struct Console {
    cfg: ReplicaConfig,
    client: ClientSession<UdpDriver>,
    mirror: ObjectMirror,
}

impl Console {
    fn connect(&mut self, addr: Option<&str>) -> anyhow::Result<SocketAddr> {
        let server: SocketAddr = match addr {
            Some(addr) => addr.parse().context("parse server address")?,
            None => self.cfg.server_socket_addr()?,
        };
        let secret = Secret::new(&self.cfg.secret).context("invalid secret")?;
        self.client.connect(server, secret)?;
        Ok(server)
    }

    fn exec(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((cmd, args)) = parts.split_first() else {
            return Ok(Vec::new());
        };
        match *cmd {
            "add" => {
                let name = args.first().context("usage: add <descriptor> [x y z]")?;
                let descriptor = SpawnDescriptor::new(*name).context("descriptor too long")?;
                let transform = Transform::at(parse_vec3(&args[1..])?);
                self.client.write_add(transform, descriptor)?;
                Ok(Vec::new())
            }
            "move" => {
                let id = parse_id(args.first())?;
                let position = parse_vec3(args.get(1..).unwrap_or_default())?;
                let rotation = match args.get(4) {
                    Some(yaw) => Quat::from_yaw(yaw.parse::<f32>()?.to_radians()),
                    None => self.mirror.get(id).map_or(Quat::IDENTITY, |o| o.transform.rotation),
                };
                let scale = self.mirror.get(id).map_or(1.0, |o| o.transform.scale);
                let transform = Transform::new(position, rotation, scale);
                self.client.write_modify(id, transform)?;
                // Modify is not echoed back to the sender.
                self.mirror.on_modify(id, transform);
                Ok(Vec::new())
            }
            "delete" => {
                let id = parse_id(args.first())?;
                self.client.write_delete(id)?;
                self.mirror.on_delete(id);
                Ok(Vec::new())
            }
            "list" => Ok(self
                .mirror
                .sorted()
                .into_iter()
                .map(|(id, o)| {
                    let p = o.transform.position;
                    format!("{id} {} ({:.2}, {:.2}, {:.2})", o.descriptor, p.x, p.y, p.z)
                })
                .collect()),
            "connect" => {
                let server = self.connect(args.first().copied())?;
                self.mirror.clear();
                Ok(vec![format!("Connecting to {server}")])
            }
            "disconnect" => {
                self.client.disconnect();
                // A local disconnect queues no event, so the mirror is not
                // cleared by the usual path.
                self.mirror.clear();
                Ok(vec!["Disconnected.".to_string()])
            }
            "status" => Ok(vec![
                format!("State: {:?}", self.client.state()),
                format!(
                    "Server: {}",
                    self.client
                        .server_addr()
                        .map_or_else(|| "-".to_string(), |a| a.to_string())
                ),
                format!("Acknowledged: {}", self.client.is_acknowledged()),
                format!("Objects: {}", self.mirror.len()),
            ]),
            other => bail!("Unknown command: {other}"),
        }
    }

    fn tick(&mut self, dt: Duration) {
        self.client.tick(dt);
        for event in self.client.drain_events() {
            match &event {
                ReplicaEvent::Added { id, descriptor, .. } => println!("+ {id} {descriptor}"),
                ReplicaEvent::Deleted { id } => println!("- {id}"),
                ReplicaEvent::Disconnected(reason) => {
                    println!("Disconnected from server ({reason:?}). Type 'connect' to retry.")
                }
                ReplicaEvent::Modified { .. } => {}
            }
            event.dispatch(&mut self.mirror);
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(server = %cfg.server_addr, tick_hz = cfg.tick_hz, "Starting client");

    let transport = cfg.transport.clone();
    let client = ClientSession::new(&cfg, move || UdpDriver::new(transport.clone()));
    let mut app = Console {
        cfg: cfg.clone(),
        client,
        mirror: ObjectMirror::new(),
    };
    app.connect(None)?;

    let (mut console_rx, _stdin) = console::spawn_stdin_reader(32);

    println!("Client started. Type 'status' for info, 'quit' to exit.");
    println!();

    let mut ticker = tokio::time::interval(cfg.tick_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut last_tick = Instant::now();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Instant::now();
                app.tick(now - last_tick);
                last_tick = now;
            }
            Some(line) = console_rx.recv() => {
                if matches!(line.as_str(), "quit" | "exit") {
                    break;
                }
                match app.exec(&line) {
                    Ok(output) => {
                        for out in output {
                            println!("{out}");
                        }
                    }
                    Err(e) => println!("Error: {e}"),
                }
            }
            _ = &mut ctrl_c => break,
        }
    }

    info!("Client shutting down");
    app.client.disconnect();
    Ok(())
}
