//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p sim_client -- [--config client.json] [--ticks 90] [--name walker]
//!
//! Runs the client pipeline offline: a join packet is injected as if the
//! server had sent it, scripted input walks the character in a square, and
//! the input stream the client would send is counted.

use std::env;
use std::sync::Arc;

use anyhow::Context;
use sim_client::{ClientHooks, GameClient};
use sim_shared::{
    components::{PlayerId, Vitals},
    config::EngineConfig,
    ecs::Entity,
    math::Vec2,
    net::{
        channels, ChannelId, Envelope, MapData, Packet, PeerId, PlayerJoinPacket, PlayerState,
        Target, PROTOCOL_VERSION,
    },
    replication::vitals_snapshot,
    schedule::Side,
    services::{InputSample, ScriptedInput},
    transport::LoopbackTransport,
};
use tracing::info;

const SERVER: PeerId = PeerId(0);

struct Args {
    cfg: EngineConfig,
    ticks: u64,
    name: String,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        cfg: EngineConfig::for_role(Side::Client),
        ticks: 90,
        name: "walker".to_string(),
    };
    let argv: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" if i + 1 < argv.len() => {
                args.cfg = EngineConfig::load(&argv[i + 1])?;
                args.cfg.role = Side::Client;
                i += 2;
            }
            "--ticks" if i + 1 < argv.len() => {
                args.ticks = argv[i + 1].parse().unwrap_or(90);
                i += 2;
            }
            "--name" if i + 1 < argv.len() => {
                args.name = argv[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    args.cfg.validate().context("validate config")?;
    Ok(args)
}

/// Walks right, up, left, down, a quarter of the run each.
fn square_walk(ticks: u64) -> Vec<InputSample> {
    let leg = (ticks / 4).max(1);
    let dirs = [
        Vec2::new(1.0, 0.0),
        Vec2::new(0.0, 1.0),
        Vec2::new(-1.0, 0.0),
        Vec2::new(0.0, -1.0),
    ];
    (0..ticks)
        .map(|t| InputSample {
            movement: dirs[((t / leg) % 4) as usize],
            ..InputSample::default()
        })
        .collect()
}

fn offline_join(name: &str) -> Envelope {
    let you = Entity::from_parts(0, 0);
    Envelope {
        version: PROTOCOL_VERSION,
        channel: ChannelId::new(channels::SESSION),
        target: Target::Peer(PeerId(1)),
        seq: Some(0),
        packet: Packet::PlayerJoin(PlayerJoinPacket {
            map: MapData {
                name: "offline".to_string(),
                width: 16,
                height: 16,
            },
            you: PlayerState {
                entity: you,
                player_id: PlayerId(1),
                name: name.to_string(),
                position: Vec2::new(0.5, 0.5),
                facing: Vec2::new(1.0, 0.0),
                vitals: vitals_snapshot(you, &Vitals::full(100, 50)),
            },
        }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    info!(ticks = args.ticks, name = %args.name, "Starting offline client");

    let transport = Arc::new(LoopbackTransport::new());
    let hooks = ClientHooks::with_input(Box::new(ScriptedInput::new(square_walk(args.ticks))));
    let mut client = GameClient::new(args.cfg, transport.clone(), SERVER, hooks)
        .context("create client")?;

    client.inbound().push(SERVER, offline_join(&args.name));
    client.run_for_ticks(args.ticks).await?;

    let inputs = transport
        .take_envelopes()
        .into_iter()
        .filter(|(_, _, env)| matches!(env.packet, Packet::PlayerInput(_)))
        .count();
    info!(
        state = ?client.state(),
        replicated = client.replicated(),
        inputs,
        "Client stopped"
    );
    Ok(())
}
