//! Composition root shared by the server and client.
//!
//! A [`Simulation`] owns the world, the resource map, the scheduler, and the
//! sync engine, and shares the channel dispatcher and staging queues with the
//! host (network and persistence tasks) through `Arc`s.

use std::sync::Arc;

use tracing::info;

use crate::{
    channel::ChannelDispatcher,
    config::EngineConfig,
    ecs::{Entity, World},
    error::ConfigError,
    index::PlayerIndex,
    queues::StagingQueues,
    replication::register_default_policies,
    resources::Resources,
    schedule::{PipelineScheduler, Side, Stage, System, SystemMeta, TickContext, TickReport},
    sync::{ComponentSyncEngine, SyncPolicy, Synced},
    transport::Transport,
};

/// Id of the built-in system that flushes component sync.
pub const SYNC_SYSTEM: &str = "component_sync";

pub struct Simulation {
    cfg: EngineConfig,
    world: World,
    resources: Resources,
    scheduler: PipelineScheduler,
    sync: ComponentSyncEngine,
    channels: Arc<ChannelDispatcher>,
    queues: Arc<StagingQueues>,
    tick: u64,
}

impl Simulation {
    /// Validates `cfg`, opens every configured channel, and registers the
    /// sync flush as the last system of the sync stage.
    pub fn new(cfg: EngineConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let channels = Arc::new(ChannelDispatcher::new(transport));
        for ch in &cfg.channels {
            channels.create_or_get(&ch.to_channel())?;
        }
        let queues = Arc::new(StagingQueues::new(cfg.queue_capacity, cfg.overflow));
        let sync = ComponentSyncEngine::new(cfg.role, channels.clone());

        let mut scheduler = PipelineScheduler::new(cfg.role);
        scheduler.register_fn(
            SystemMeta::new(SYNC_SYSTEM, Stage::Sync).order(i32::MAX),
            |ctx| {
                ctx.sync.flush(&*ctx.world, ctx.tick);
                Ok(())
            },
        );

        let mut resources = Resources::default();
        resources.insert(PlayerIndex::new());

        info!(
            role = ?cfg.role,
            tick_hz = cfg.tick_hz,
            channels = channels.channel_count(),
            "Simulation created"
        );
        Ok(Self {
            cfg,
            world: World::default(),
            resources,
            scheduler,
            sync,
            channels,
            queues,
            tick: 0,
        })
    }

    /// Registers the stock sync policy table with this config's rate overrides.
    pub fn with_default_sync(mut self) -> Result<Self, ConfigError> {
        register_default_policies(&mut self.sync, &self.cfg.sync_rate_overrides)?;
        Ok(self)
    }

    pub fn add_system(&mut self, meta: SystemMeta, system: impl System + 'static) -> &mut Self {
        self.scheduler.register(meta, system);
        self
    }

    pub fn add_system_fn<F>(&mut self, meta: SystemMeta, f: F) -> &mut Self
    where
        F: FnMut(&mut TickContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.scheduler.register_fn(meta, f);
        self
    }

    pub fn add_sync<T: Synced>(&mut self, policy: SyncPolicy) -> Result<(), ConfigError> {
        self.sync.register::<T>(policy)
    }

    pub fn build(&mut self) -> Result<(), ConfigError> {
        self.scheduler.build()
    }

    /// Runs one tick and advances the tick counter.
    pub fn tick(&mut self) -> Result<TickReport, ConfigError> {
        let mut ctx = TickContext {
            tick: self.tick,
            dt: self.cfg.dt(),
            side: self.cfg.role,
            world: &mut self.world,
            resources: &mut self.resources,
            sync: &mut self.sync,
            channels: &self.channels,
            queues: &self.queues,
        };
        let report = self.scheduler.tick(&mut ctx)?;
        self.tick += 1;
        Ok(report)
    }

    /// Runs `f` with a context for the current tick, outside the scheduler.
    pub fn with_context<R>(&mut self, f: impl FnOnce(&mut TickContext<'_>) -> R) -> R {
        let mut ctx = TickContext {
            tick: self.tick,
            dt: self.cfg.dt(),
            side: self.cfg.role,
            world: &mut self.world,
            resources: &mut self.resources,
            sync: &mut self.sync,
            channels: &self.channels,
            queues: &self.queues,
        };
        f(&mut ctx)
    }

    /// Ordered despawn outside a system.
    pub fn despawn(&mut self, entity: Entity) -> bool {
        self.with_context(|ctx| ctx.despawn(entity))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn side(&self) -> Side {
        self.cfg.role
    }

    /// Number of the next tick to run.
    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    pub fn order(&self) -> Vec<&'static str> {
        self.scheduler.order()
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut Resources {
        &mut self.resources
    }

    pub fn sync_mut(&mut self) -> &mut ComponentSyncEngine {
        &mut self.sync
    }

    pub fn channels(&self) -> &Arc<ChannelDispatcher> {
        &self.channels
    }

    pub fn queues(&self) -> &Arc<StagingQueues> {
        &self.queues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        components::Position,
        math::Vec2,
        net::{Packet, PeerId},
        transport::LoopbackTransport,
    };

    fn server() -> (Arc<LoopbackTransport>, Simulation) {
        let transport = Arc::new(LoopbackTransport::new());
        let sim = Simulation::new(EngineConfig::for_role(Side::Server), transport.clone())
            .unwrap()
            .with_default_sync()
            .unwrap();
        (transport, sim)
    }

    #[test]
    fn sync_flush_runs_last_in_sync_stage() {
        let (_t, mut sim) = server();
        sim.add_system_fn(SystemMeta::new("late_sync", Stage::Sync).order(100), |_| Ok(()));
        sim.add_system_fn(SystemMeta::new("cleanup", Stage::Cleanup), |_| Ok(()));
        sim.build().unwrap();
        assert_eq!(sim.order(), vec!["late_sync", SYNC_SYSTEM, "cleanup"]);
    }

    #[test]
    fn position_changes_are_replicated() {
        let (t, mut sim) = server();
        sim.build().unwrap();
        sim.channels().connect_peer(PeerId(1));
        let e = sim.world_mut().spawn();
        sim.world_mut().insert(e, Position(Vec2::new(1.0, 2.0)));

        assert!(sim.tick().unwrap().is_clean());
        assert!(sim.tick().unwrap().is_clean());
        let sent = t.take_envelopes();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].2.packet, Packet::Transform(_)));
        assert_eq!(sim.current_tick(), 2);
    }

    #[test]
    fn unbuilt_simulation_refuses_to_tick() {
        let (_t, mut sim) = server();
        assert_eq!(sim.tick().unwrap_err(), ConfigError::NotBuilt);
    }
}
