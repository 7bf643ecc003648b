//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p replica_server -- [--config server.json] [--port 40000] [--secret s] [--tick-hz 60]
//!
//! The server listens on UDP, relays object changes between clients and
//! assigns identifiers to new objects.
//!
//! Console commands:
//!   status  - Show server status
//!   quit    - Disconnect all clients and exit

use std::env;

use anyhow::Context;
use replica_server::{ServerSession, ServerState};
use replica_shared::{codec::Secret, config::ReplicaConfig, console, transport::UdpDriver};
use tracing::info;

fn parse_args() -> anyhow::Result<ReplicaConfig> {
    let args: Vec<String> = env::args().collect();

    // The config file is the base; flags override it.
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => ReplicaConfig::from_json_file(&args[i + 1])?,
        _ => ReplicaConfig::default(),
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--port" if i + 1 < args.len() => {
                cfg.port = args[i + 1].parse().context("parse --port")?;
                i += 2;
            }
            "--bind" if i + 1 < args.len() => {
                cfg.bind_addr = args[i + 1].clone();
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
            _ => i += 1,
        }
    }
    Ok(cfg)
}

fn exec_console(server: &ServerSession<UdpDriver>, line: &str) -> Vec<String> {
    match line.split_whitespace().next() {
        Some("status") => vec![
            format!("State: {:?}", server.state()),
            format!(
                "Local: {}",
                server
                    .local_addr()
                    .map_or_else(|| "-".to_string(), |a| a.to_string())
            ),
            format!("Clients: {}", server.connection_count()),
            format!("Live objects: {}", server.live_objects()),
        ],
        Some(other) => vec![format!("Unknown command: {other}")],
        None => Vec::new(),
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
    info!(bind = %cfg.bind_addr, port = cfg.port, tick_hz = cfg.tick_hz, "Starting server");

    let secret = Secret::new(&cfg.secret).context("invalid secret")?;
    let transport = cfg.transport.clone();
    let mut server = ServerSession::new(cfg.clone(), move || UdpDriver::new(transport.clone()));
    server.connect_all(cfg.port, secret)?;

    let (mut console_rx, _stdin) = console::spawn_stdin_reader(32);

    println!("Server ready. Type 'status' for info, 'quit' to exit.");
    println!();

    let mut ticker = tokio::time::interval(cfg.tick_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    while server.state() == ServerState::Listening {
        tokio::select! {
            _ = ticker.tick() => server.tick(),
            Some(line) = console_rx.recv() => {
                if matches!(line.as_str(), "quit" | "exit") {
                    break;
                }
                for out in exec_console(&server, &line) {
                    println!("{out}");
                }
            }
            _ = &mut ctrl_c => break,
        }
    }

    info!("Server shutting down");
    server.disconnect_all();
    Ok(())
}
