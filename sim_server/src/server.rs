//! Server implementation.
//!
//! An authoritative, fixed-timestep host around a [`Simulation`]:
//! - connection events arrive through staging queues and the inbound buffer
//! - gameplay systems run in the compiled pipeline order
//! - replication goes out through the channel dispatcher after the sync stage
//!
//! Determinism notes:
//! - Keep simulation in a fixed timestep.
//! - Avoid wall-clock-dependent branching in gameplay code.
//! - Use stable ordering when iterating collections.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use rand::{rngs::StdRng, SeedableRng};
use sim_shared::{
    components::{Facing, Npc, PlayerId, Position, Velocity, Vitals},
    config::EngineConfig,
    ecs::Entity,
    inbound::{InboundBuffer, InputSequencer},
    index::PlayerIndex,
    math::Vec2,
    net::{channels, NpcSpawnPacket, Packet, PeerId},
    queues::{
        LeaveRequest, LoginRequest, MapLoaded, MapLoadedNotice, PlayerLeave, PlayerLogin,
        StagingQueues, TeleportRequest, Teleports,
    },
    schedule::{Side, TickReport},
    services::CollisionService,
    sim::Simulation,
    transport::Transport,
};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
    gameplay::{self, Autosave, Collision, NpcRng},
    pipeline::register_server_systems,
    session::{self, AwaitingLogin, PeerIndex, WorldMap},
};

/// Seed for NPC behaviour; fixed so runs are reproducible.
pub const NPC_SEED: u64 = 0x5EED;

/// Game server.
pub struct GameServer {
    sim: Simulation,
    inbound: InboundBuffer,
}

impl GameServer {
    /// Creates a server with a built pipeline.
    pub fn new(
        cfg: EngineConfig,
        transport: Arc<dyn Transport>,
        collision: Arc<dyn CollisionService>,
        map: WorldMap,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(
            cfg.role == Side::Server,
            "server needs role = server, got {:?}",
            cfg.role
        );
        let autosave = cfg.autosave_ticks;
        let mut sim = Simulation::new(cfg, transport)
            .context("create simulation")?
            .with_default_sync()
            .context("register sync policies")?;

        let inbound = InboundBuffer::new();
        let resources = sim.resources_mut();
        resources.insert(inbound.clone());
        resources.insert(InputSequencer::new());
        resources.insert(PeerIndex::new());
        resources.insert(AwaitingLogin::default());
        resources.insert(map);
        resources.insert(Collision(collision));
        resources.insert(NpcRng(StdRng::seed_from_u64(NPC_SEED)));
        resources.insert(Autosave {
            every_ticks: autosave,
        });

        register_server_systems(&mut sim);
        sim.build().context("build server pipeline")?;
        Ok(Self { sim, inbound })
    }

    /// Buffer the network layer pushes client packets into.
    pub fn inbound(&self) -> InboundBuffer {
        self.inbound.clone()
    }

    pub fn queues(&self) -> Arc<StagingQueues> {
        self.sim.queues().clone()
    }

    pub fn login(&self, request: LoginRequest) {
        self.sim.queues().enqueue::<PlayerLogin>(request);
    }

    pub fn map_loaded(&self, peer: PeerId) {
        self.sim
            .queues()
            .enqueue::<MapLoaded>(MapLoadedNotice { peer });
    }

    pub fn leave(&self, peer: PeerId, reason: &str) {
        self.sim.queues().enqueue::<PlayerLeave>(LeaveRequest {
            peer,
            reason: reason.to_string(),
        });
    }

    pub fn teleport(&self, entity: Entity, position: Vec2, facing: Vec2) {
        self.sim.queues().enqueue::<Teleports>(TeleportRequest {
            entity,
            position,
            facing,
        });
    }

    /// Spawns an NPC and announces it to connected peers.
    pub fn spawn_npc(&mut self, kind: u16, position: Vec2, max_health: i32) -> Entity {
        let world = self.sim.world_mut();
        let entity = world.spawn();
        world.insert(entity, Npc { kind });
        world.insert(entity, Position(position));
        world.insert(entity, Velocity::default());
        world.insert(entity, Facing::default());
        world.insert(entity, Vitals::full(max_health, 0));

        if let Some(state) = session::npc_state(self.sim.world(), entity) {
            if let Ok(endpoint) = self.sim.with_context(|ctx| ctx.endpoint(channels::SESSION)) {
                endpoint.send_to_all_reliable(Packet::NpcSpawn(NpcSpawnPacket {
                    npcs: vec![state],
                }));
            }
        }
        entity
    }

    /// Live character of a player, if online.
    pub fn player_entity(&self, player: PlayerId) -> Option<Entity> {
        self.sim
            .resources()
            .get::<PlayerIndex>()?
            .try_get(self.sim.world(), player)
    }

    pub fn online_players(&self) -> usize {
        self.sim
            .resources()
            .get::<PlayerIndex>()
            .map_or(0, |index| index.iter(self.sim.world()).count())
    }

    /// Stages a save for every online player; used on shutdown.
    pub fn save_all(&mut self) -> usize {
        self.sim.with_context(|ctx| gameplay::stage_saves(ctx))
    }

    /// Executes one fixed simulation step.
    pub fn step(&mut self) -> anyhow::Result<TickReport> {
        let report = self.sim.tick().context("server tick")?;
        if !report.is_clean() {
            warn!(tick = report.tick, faults = report.faults.len(), "Tick finished with faults");
        }
        Ok(report)
    }

    /// Runs the server for a number of ticks at the configured rate.
    pub async fn run_for_ticks(&mut self, ticks: u64) -> anyhow::Result<()> {
        let dt = Duration::from_secs_f32(self.sim.config().dt());
        let mut next = Instant::now();

        for _ in 0..ticks {
            next += dt;
            self.step()?;
            tokio::time::sleep_until(next).await;
        }
        info!(ticks, tick = self.sim.current_tick(), "Run finished");
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
        net::Delivery,
        services::{BlockedCells, OpenField},
        transport::LoopbackTransport,
    };

    use crate::pipeline::SERVER_ORDER;

    fn server(collision: Arc<dyn CollisionService>) -> (Arc<LoopbackTransport>, GameServer) {
        let transport = Arc::new(LoopbackTransport::new());
        let map = WorldMap::new("test", 16, 16, Vec2::new(0.5, 0.5));
        let server =
            GameServer::new(EngineConfig::default(), transport.clone(), collision, map).unwrap();
        (transport, server)
    }

    fn login(server: &GameServer, peer: u32, player: u64) {
        server.login(LoginRequest {
            peer: PeerId(peer),
            player_id: PlayerId(player),
            name: format!("p{player}"),
            position: None,
        });
    }

    #[test]
    fn pipeline_compiles_to_expected_order() {
        let (_t, server) = server(Arc::new(OpenField));
        assert_eq!(server.sim().order(), SERVER_ORDER.to_vec());
    }

    #[test]
    fn login_sends_join_to_the_joiner_only() {
        let (t, mut server) = server(Arc::new(OpenField));
        login(&server, 1, 100);
        server.step().unwrap();
        let sent = t.take_envelopes();
        let joins: Vec<_> = sent
            .iter()
            .filter(|(_, _, env)| matches!(env.packet, Packet::PlayerJoin(_)))
            .collect();
        assert_eq!(joins.len(), 1);
        assert_eq!(joins[0].0, PeerId(1));
        assert_eq!(joins[0].1, Delivery::Reliable);
        assert!(server.player_entity(PlayerId(100)).is_some());
    }

    #[test]
    fn duplicate_login_is_rejected() {
        let (_t, mut server) = server(Arc::new(OpenField));
        login(&server, 1, 100);
        server.step().unwrap();
        login(&server, 2, 100);
        server.step().unwrap();
        assert_eq!(server.online_players(), 1);
    }

    #[test]
    fn second_login_from_a_connected_peer_is_rejected() {
        let (_t, mut server) = server(Arc::new(OpenField));
        login(&server, 1, 100);
        server.step().unwrap();
        login(&server, 1, 200);
        server.step().unwrap();
        assert_eq!(server.online_players(), 1);
        assert_eq!(server.player_entity(PlayerId(200)), None);

        // Leaving releases the first character, so it can log in again.
        server.leave(PeerId(1), "quit");
        server.step().unwrap();
        assert_eq!(server.player_entity(PlayerId(100)), None);
        login(&server, 2, 100);
        server.step().unwrap();
        assert!(server.player_entity(PlayerId(100)).is_some());
        assert!(server.sim().channels().is_connected(PeerId(2)));
    }

    #[test]
    fn map_loaded_before_login_still_gets_the_population() {
        let (t, mut server) = server(Arc::new(OpenField));
        server.spawn_npc(1, Vec2::new(4.0, 4.0), 30);
        server.map_loaded(PeerId(1));
        server.step().unwrap();
        login(&server, 1, 100);
        server.step().unwrap();

        let npc_spawns = t
            .take_envelopes()
            .into_iter()
            .filter(|(peer, _, env)| *peer == PeerId(1) && matches!(env.packet, Packet::NpcSpawn(_)))
            .count();
        assert_eq!(npc_spawns, 1);

        // Served once; later ticks do not repeat it.
        server.step().unwrap();
        assert!(t
            .take_envelopes()
            .iter()
            .all(|(_, _, env)| !matches!(env.packet, Packet::NpcSpawn(_))));
    }

    #[test]
    fn leave_stages_save_and_announces_departure() {
        let (t, mut server) = server(Arc::new(OpenField));
        login(&server, 1, 100);
        login(&server, 2, 200);
        server.step().unwrap();
        let leaving = server.player_entity(PlayerId(100)).unwrap();
        t.take();

        server.leave(PeerId(1), "quit");
        server.step().unwrap();

        assert_eq!(server.player_entity(PlayerId(100)), None);
        assert!(!server.sim().channels().is_connected(PeerId(1)));
        let save = server.queues().try_dequeue::<sim_shared::queues::PersistenceSave>();
        assert_eq!(save.map(|s| s.player_id), Some(PlayerId(100)));

        let left: Vec<_> = t
            .take_envelopes()
            .into_iter()
            .filter_map(|(peer, _, env)| match env.packet {
                Packet::Left(p) => Some((peer, p.entities)),
                _ => None,
            })
            .collect();
        assert_eq!(left, vec![(PeerId(2), vec![leaving])]);
    }

    #[test]
    fn only_entities_with_velocity_move() {
        let (_t, mut server) = server(Arc::new(OpenField));
        let world = server.sim_mut().world_mut();
        let statue = world.spawn();
        world.insert(statue, Position(Vec2::new(2.0, 2.0)));
        world.insert(
            statue,
            sim_shared::components::InputState {
                movement: Vec2::new(1.0, 0.0),
                ..Default::default()
            },
        );
        server.step().unwrap();
        assert_eq!(
            server.sim().world().get::<Position>(statue).map(|p| p.0),
            Some(Vec2::new(2.0, 2.0))
        );
    }

    #[test]
    fn movement_respects_collision() {
        let blocked = BlockedCells::new([sim_shared::math::Cell::new(1, 0)]);
        let (_t, mut server) = server(Arc::new(blocked));
        login(&server, 1, 100);
        server.step().unwrap();
        let e = server.player_entity(PlayerId(100)).unwrap();
        server.sim_mut().world_mut().insert(
            e,
            sim_shared::components::InputState {
                movement: Vec2::new(1.0, 0.0),
                ..Default::default()
            },
        );
        for _ in 0..30 {
            server.step().unwrap();
        }
        let x = server.sim().world().get::<Position>(e).unwrap().0.x;
        assert!(x > 0.5 && x < 1.0, "x = {x}");
    }
}
