//! Client implementation.
//!
//! The client maintains:
//! - An inbound buffer the transport fills with server packets
//! - A replicated copy of the world keyed by [`NetIndex`]
//! - Per-tick input sampling, sent back through the input sync policy
//! - Position history plus prediction and smoothing hooks

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use sim_shared::{
    config::EngineConfig,
    ecs::Entity,
    inbound::InboundBuffer,
    net::PeerId,
    schedule::{Side, Stage, SystemMeta, TickReport},
    services::InputProvider,
    sim::Simulation,
    transport::Transport,
};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    input::InputSampler,
    interp::{NoPrediction, NoSmoothing, PositionHistory, Predict, PredictionHook, Smooth, SmoothingHook},
    replicate::{self, LocalPlayer, NetIndex, RecentAttacks, ServerSession},
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Waiting for the server to send our character.
    Connecting,
    /// Character received; the world is being replicated.
    InWorld,
}

/// Pluggable collaborators of a client.
pub struct ClientHooks {
    pub input: Box<dyn InputProvider>,
    pub prediction: Box<dyn PredictionHook>,
    pub smoothing: Box<dyn SmoothingHook>,
}

impl ClientHooks {
    /// Hooks that only sample input; prediction and smoothing do nothing.
    pub fn with_input(input: Box<dyn InputProvider>) -> Self {
        Self {
            input,
            prediction: Box::new(NoPrediction),
            smoothing: Box::new(NoSmoothing),
        }
    }
}

/// Execution order the client pipeline compiles to.
pub const CLIENT_ORDER: [&str; 5] = [
    "apply_inbound",
    "sample_input",
    "predict",
    "smooth",
    sim_shared::sim::SYNC_SYSTEM,
];

/// High-level game client.
pub struct GameClient {
    sim: Simulation,
    inbound: InboundBuffer,
    server: PeerId,
}

impl GameClient {
    pub fn new(
        cfg: EngineConfig,
        transport: Arc<dyn Transport>,
        server: PeerId,
        hooks: ClientHooks,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            cfg.role == Side::Client,
            "client needs role = client, got {:?}",
            cfg.role
        );
        let mut sim = Simulation::new(cfg, transport)
            .context("create simulation")?
            .with_default_sync()
            .context("register sync policies")?;
        sim.channels().connect_peer(server);

        let inbound = InboundBuffer::new();
        let resources = sim.resources_mut();
        resources.insert(inbound.clone());
        resources.insert(NetIndex::new());
        resources.insert(LocalPlayer::default());
        resources.insert(ServerSession::default());
        resources.insert(RecentAttacks::default());
        resources.insert(PositionHistory::default());

        sim.add_system_fn(
            SystemMeta::new("apply_inbound", Stage::Input).client_only(),
            replicate::apply_inbound,
        )
        .add_system(
            SystemMeta::new("sample_input", Stage::Input)
                .order(10)
                .client_only()
                .after("apply_inbound"),
            InputSampler::new(hooks.input),
        )
        .add_system(
            SystemMeta::new("predict", Stage::Physics)
                .client_only()
                .after("sample_input"),
            Predict::new(hooks.prediction),
        )
        .add_system(
            SystemMeta::new("smooth", Stage::Physics)
                .order(10)
                .client_only(),
            Smooth::new(hooks.smoothing),
        );
        sim.build().context("build client pipeline")?;

        info!(?server, "Client ready");
        Ok(Self {
            sim,
            inbound,
            server,
        })
    }

    /// Buffer the transport pushes server packets into.
    pub fn inbound(&self) -> InboundBuffer {
        self.inbound.clone()
    }

    pub fn server(&self) -> PeerId {
        self.server
    }

    pub fn state(&self) -> ClientState {
        if self.local_player().is_some() {
            ClientState::InWorld
        } else {
            ClientState::Connecting
        }
    }

    pub fn local_player(&self) -> Option<Entity> {
        self.sim.resources().get::<LocalPlayer>().and_then(|p| p.0)
    }

    pub fn session(&self) -> Option<&ServerSession> {
        self.sim.resources().get::<ServerSession>()
    }

    /// Local entity for a server entity id.
    pub fn resolve(&self, server: Entity) -> Option<Entity> {
        self.sim
            .resources()
            .get::<NetIndex>()?
            .try_get(self.sim.world(), server)
    }

    /// Number of replicated entities.
    pub fn replicated(&self) -> usize {
        self.sim.resources().get::<NetIndex>().map_or(0, NetIndex::len)
    }

    pub fn history(&self) -> Option<&PositionHistory> {
        self.sim.resources().get::<PositionHistory>()
    }

    pub fn step(&mut self) -> anyhow::Result<TickReport> {
        let report = self.sim.tick().context("client tick")?;
        if !report.is_clean() {
            warn!(tick = report.tick, faults = report.faults.len(), "Tick finished with faults");
        }
        Ok(report)
    }

    pub async fn run_for_ticks(&mut self, ticks: u64) -> anyhow::Result<()> {
        let dt = Duration::from_secs_f32(self.sim.config().dt());
        let mut next = Instant::now();
        for _ in 0..ticks {
            next += dt;
            self.step()?;
            tokio::time::sleep_until(next).await;
        }
        Ok(())
    }

    pub fn sim(&self) -> &Simulation {
        &self.sim
    }

    pub fn sim_mut(&mut self) -> &mut Simulation {
        &mut self.sim
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim_shared::{
        components::{InputState, PlayerId, Position, Vitals},
        math::Vec2,
        net::{
            channels, Envelope, LeftPacket, MapData, Packet, PlayerJoinPacket, PlayerState,
            Target, TransformPacket, TransformSnapshot, PROTOCOL_VERSION,
        },
        replication::vitals_snapshot,
        services::{InputSample, ScriptedInput},
        transport::LoopbackTransport,
    };

    const SERVER: PeerId = PeerId(0);

    fn client(samples: Vec<InputSample>) -> (Arc<LoopbackTransport>, GameClient) {
        let transport = Arc::new(LoopbackTransport::new());
        let client = GameClient::new(
            EngineConfig::for_role(Side::Client),
            transport.clone(),
            SERVER,
            ClientHooks::with_input(Box::new(ScriptedInput::new(samples))),
        )
        .unwrap();
        (transport, client)
    }

    fn envelope(channel: &str, packet: Packet) -> Envelope {
        Envelope {
            version: PROTOCOL_VERSION,
            channel: sim_shared::net::ChannelId::new(channel),
            target: Target::Broadcast,
            seq: None,
            packet,
        }
    }

    fn join(server_entity: Entity) -> Packet {
        Packet::PlayerJoin(PlayerJoinPacket {
            map: MapData {
                name: "arena".into(),
                width: 8,
                height: 8,
            },
            you: PlayerState {
                entity: server_entity,
                player_id: PlayerId(7),
                name: "me".into(),
                position: Vec2::new(1.0, 1.0),
                facing: Vec2::new(1.0, 0.0),
                vitals: vitals_snapshot(server_entity, &Vitals::full(100, 50)),
            },
        })
    }

    #[test]
    fn pipeline_compiles_to_expected_order() {
        let (_t, client) = client(vec![]);
        assert_eq!(client.sim().order(), CLIENT_ORDER.to_vec());
    }

    #[test]
    fn join_creates_local_player() {
        let (_t, mut client) = client(vec![]);
        assert_eq!(client.state(), ClientState::Connecting);
        let remote = Entity::from_parts(42, 3);
        client.inbound().push(SERVER, envelope(channels::SESSION, join(remote)));
        client.step().unwrap();

        assert_eq!(client.state(), ClientState::InWorld);
        let local = client.local_player().unwrap();
        assert_eq!(client.resolve(remote), Some(local));
        assert_eq!(
            client.sim().world().get::<Position>(local),
            Some(&Position(Vec2::new(1.0, 1.0)))
        );
        assert_eq!(client.session().and_then(|s| s.player_id), Some(PlayerId(7)));
    }

    #[test]
    fn transform_updates_history_and_left_removes() {
        let (_t, mut client) = client(vec![]);
        let remote = Entity::from_parts(1, 0);
        client.inbound().push(SERVER, envelope(channels::SESSION, join(remote)));
        client.step().unwrap();
        let local = client.local_player().unwrap();

        client.inbound().push(
            SERVER,
            envelope(
                channels::TRANSFORM,
                Packet::Transform(TransformPacket {
                    transforms: vec![TransformSnapshot {
                        entity: remote,
                        position: Vec2::new(2.0, 1.0),
                    }],
                }),
            ),
        );
        client.step().unwrap();
        assert_eq!(client.history().map(|h| h.len(local)), Some(2));

        client.inbound().push(
            SERVER,
            envelope(
                channels::SESSION,
                Packet::Left(LeftPacket {
                    entities: vec![remote],
                }),
            ),
        );
        client.step().unwrap();
        assert_eq!(client.resolve(remote), None);
        assert!(!client.sim().world().is_alive(local));
        assert_eq!(client.replicated(), 0);
        assert_eq!(client.state(), ClientState::Connecting);
    }

    #[test]
    fn input_is_sequenced_and_sent_every_tick() {
        let sample = InputSample {
            movement: Vec2::new(1.0, 0.0),
            ..InputSample::default()
        };
        let (t, mut client) = client(vec![sample; 3]);
        client
            .inbound()
            .push(SERVER, envelope(channels::SESSION, join(Entity::from_parts(1, 0))));
        client.step().unwrap();
        client.step().unwrap();

        let local = client.local_player().unwrap();
        assert_eq!(client.sim().world().get::<InputState>(local).map(|i| i.sequence), Some(2));

        let sent: Vec<u32> = t
            .take_envelopes()
            .into_iter()
            .filter_map(|(peer, _, env)| match env.packet {
                Packet::PlayerInput(msg) if peer == SERVER => Some(msg.sequence),
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![1, 2]);
    }
}
