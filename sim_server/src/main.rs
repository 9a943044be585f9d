//! Standalone server binary.
//!
//! Usage:
//!   cargo run -p sim_server -- [--config server.json] [--tick-hz 30] [--ticks 300] [--bots 2] [--npcs 3]
//!
//! Sockets are outside this crate, so the binary runs the authoritative loop
//! against a recording transport with scripted bot sessions, then flushes
//! persistence and prints a summary.

use std::env;
use std::sync::Arc;

use anyhow::Context;
use sim_server::{server::GameServer, session::WorldMap, PersistenceWorker};
use sim_shared::{
    components::PlayerId,
    config::EngineConfig,
    math::{Cell, Vec2},
    net::PeerId,
    queues::LoginRequest,
    services::{BlockedCells, InMemoryRepository},
    transport::LoopbackTransport,
};
use tracing::info;

struct Args {
    cfg: EngineConfig,
    ticks: u64,
    bots: u32,
    npcs: u16,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        cfg: EngineConfig::default(),
        ticks: 300,
        bots: 2,
        npcs: 3,
    };
    let argv: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" if i + 1 < argv.len() => {
                args.cfg = EngineConfig::load(&argv[i + 1])?;
                i += 2;
            }
            "--tick-hz" if i + 1 < argv.len() => {
                args.cfg.tick_hz = argv[i + 1].parse().unwrap_or(30);
                i += 2;
            }
            "--ticks" if i + 1 < argv.len() => {
                args.ticks = argv[i + 1].parse().unwrap_or(300);
                i += 2;
            }
            "--bots" if i + 1 < argv.len() => {
                args.bots = argv[i + 1].parse().unwrap_or(2);
                i += 2;
            }
            "--npcs" if i + 1 < argv.len() => {
                args.npcs = argv[i + 1].parse().unwrap_or(3);
                i += 2;
            }
            _ => i += 1,
        }
    }
    args.cfg.validate().context("validate config")?;
    Ok(args)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    info!(tick_hz = args.cfg.tick_hz, ticks = args.ticks, bots = args.bots, "Starting server");

    let transport = Arc::new(LoopbackTransport::new());
    let collision = BlockedCells::new([Cell::new(4, 4), Cell::new(4, 5)])
        .with_bounds(Cell::new(-16, -16), Cell::new(15, 15));
    let map = WorldMap::new("arena", 32, 32, Vec2::new(0.5, 0.5));
    let mut server = GameServer::new(args.cfg, transport.clone(), Arc::new(collision), map)
        .context("create server")?;

    let repo = Arc::new(InMemoryRepository::new());
    let worker = PersistenceWorker::spawn(server.queues(), repo.clone());

    for n in 0..args.npcs {
        let position = Vec2::new(2.0 + f32::from(n), -3.0);
        server.spawn_npc(n % 3, position, 30);
    }
    for bot in 0..args.bots {
        let peer = PeerId(bot + 1);
        server.login(LoginRequest {
            peer,
            player_id: PlayerId(1000 + u64::from(bot)),
            name: format!("bot{bot}"),
            position: None,
        });
        server.map_loaded(peer);
    }

    server.run_for_ticks(args.ticks).await?;

    let staged = server.save_all();
    let saved = worker.shutdown().await?;
    info!(
        online = server.online_players(),
        staged,
        saved,
        deliveries = transport.len(),
        "Server stopped"
    );
    Ok(())
}
