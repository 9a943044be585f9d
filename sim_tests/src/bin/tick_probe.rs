//! Runs a server and a few clients in-process and prints what happened.
//!
//! Usage:
//!   cargo run -p sim_tests --bin tick_probe -- [ticks] [clients]
//!
//! Prints the compiled pipeline of each side, then per-client replication
//! counts and the server's channel statistics.

use std::sync::Arc;

use sim_client::{ClientHooks, GameClient};
use sim_server::{server::GameServer, session::WorldMap};
use sim_shared::{
    components::PlayerId,
    config::EngineConfig,
    math::Vec2,
    net::{channels, ChannelId, PeerId},
    queues::LoginRequest,
    schedule::Side,
    services::{InputSample, OpenField, ScriptedInput},
    transport::InProcessTransport,
};

const SERVER: PeerId = PeerId(0);

fn circle(ticks: u64, phase: f32) -> Vec<InputSample> {
    (0..ticks)
        .map(|t| {
            let a = phase + t as f32 * 0.1;
            InputSample {
                movement: Vec2::new(a.cos(), a.sin()),
                ..InputSample::default()
            }
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let ticks: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(60);
    let count: u32 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(2);

    let server_transport = Arc::new(InProcessTransport::new());
    let mut server = GameServer::new(
        EngineConfig::default(),
        server_transport.clone(),
        Arc::new(OpenField),
        WorldMap::new("probe", 32, 32, Vec2::new(0.5, 0.5)),
    )?;
    server.spawn_npc(1, Vec2::new(4.0, 4.0), 30);

    let mut clients = Vec::new();
    for n in 0..count {
        let peer = PeerId(n + 1);
        let transport = Arc::new(InProcessTransport::new());
        let hooks = ClientHooks::with_input(Box::new(ScriptedInput::new(circle(ticks, n as f32))));
        let client = GameClient::new(EngineConfig::for_role(Side::Client), transport.clone(), SERVER, hooks)?;
        transport.route(SERVER, peer, server.inbound());
        server_transport.route(peer, SERVER, client.inbound());
        server.login(LoginRequest {
            peer,
            player_id: PlayerId(u64::from(n) + 1),
            name: format!("probe{n}"),
            position: None,
        });
        server.map_loaded(peer);
        clients.push(client);
    }

    println!("server pipeline: {}", server.sim().order().join(" -> "));
    if let Some(client) = clients.first() {
        println!("client pipeline: {}", client.sim().order().join(" -> "));
    }

    let mut faults = 0;
    for _ in 0..ticks {
        faults += server.step()?.faults.len();
        for client in &mut clients {
            faults += client.step()?.faults.len();
        }
    }

    println!("ticks: {ticks}, online: {}, faults: {faults}", server.online_players());
    for (n, client) in clients.iter().enumerate() {
        println!(
            "client {n}: state {:?}, replicated {}",
            client.state(),
            client.replicated()
        );
    }
    for name in [channels::SESSION, channels::TRANSFORM, channels::VITALS, channels::COMBAT] {
        if let Some(endpoint) = server.sim().channels().try_get(&ChannelId::new(name)) {
            let stats = endpoint.stats();
            println!("{name}: sent {}, dropped {}", stats.sent, stats.dropped);
        }
    }
    Ok(())
}
