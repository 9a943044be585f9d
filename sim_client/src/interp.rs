//! Interpolation and the prediction/smoothing extension points.
//!
//! The server sends positions at tick boundaries, only when they change.
//! Each entity keeps a short history so a renderer can blend between the
//! last two samples. Prediction and smoothing ship as no-op hooks.

use std::collections::{HashMap, VecDeque};

use sim_shared::{
    components::{InputState, Position},
    ecs::Entity,
    math::Vec2,
    schedule::{System, TickContext},
};

/// Samples kept per entity by default.
pub const DEFAULT_HISTORY: usize = 8;

/// Per-entity buffered positions, tagged with the local tick they arrived on.
#[derive(Debug)]
pub struct PositionHistory {
    samples: HashMap<Entity, VecDeque<(u64, Vec2)>>,
    max: usize,
}

impl Default for PositionHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY)
    }
}

impl PositionHistory {
    pub fn new(max: usize) -> Self {
        Self {
            samples: HashMap::new(),
            max: max.max(2),
        }
    }

    pub fn record(&mut self, entity: Entity, tick: u64, position: Vec2) {
        let history = self.samples.entry(entity).or_default();
        // Two packets in one tick: keep the later one.
        if let Some(last) = history.back_mut() {
            if last.0 == tick {
                last.1 = position;
                return;
            }
        }
        history.push_back((tick, position));
        while history.len() > self.max {
            history.pop_front();
        }
    }

    pub fn forget(&mut self, entity: Entity) {
        self.samples.remove(&entity);
    }

    pub fn len(&self, entity: Entity) -> usize {
        self.samples.get(&entity).map_or(0, VecDeque::len)
    }

    pub fn latest(&self, entity: Entity) -> Option<Vec2> {
        self.samples.get(&entity)?.back().map(|(_, p)| *p)
    }

    /// Blends the two newest samples.
    ///
    /// `alpha` is clamped to `[0, 1]`: 0 gives the older sample, 1 the newer.
    /// With a single sample that sample is returned as-is.
    pub fn sample(&self, entity: Entity, alpha: f32) -> Option<Vec2> {
        let history = self.samples.get(&entity)?;
        match history.len() {
            0 => None,
            1 => history.back().map(|(_, p)| *p),
            n => {
                let (_, a) = history[n - 2];
                let (_, b) = history[n - 1];
                Some(a.lerp(b, alpha.clamp(0.0, 1.0)))
            }
        }
    }
}

/// Client-side prediction of the local player.
pub trait PredictionHook: Send + Sync {
    /// Called once per tick with the input just sampled.
    fn predict(&mut self, _entity: Entity, _input: &InputState, _position: &mut Position, _dt: f32) {}
}

/// Visual smoothing of remote entities.
pub trait SmoothingHook: Send + Sync {
    fn smooth(&mut self, _entity: Entity, _history: &PositionHistory, _position: &mut Position) {}
}

/// Leaves the replicated position untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrediction;

impl PredictionHook for NoPrediction {}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoSmoothing;

impl SmoothingHook for NoSmoothing {}

/// Runs the prediction hook for the local player.
pub struct Predict {
    hook: Box<dyn PredictionHook>,
}

impl Predict {
    pub fn new(hook: Box<dyn PredictionHook>) -> Self {
        Self { hook }
    }
}

impl System for Predict {
    fn run(&mut self, ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
        let Some(local) = ctx
            .resources
            .get::<crate::replicate::LocalPlayer>()
            .and_then(|p| p.0)
        else {
            return Ok(());
        };
        let Some(input) = ctx.world.get::<InputState>(local).copied() else {
            return Ok(());
        };
        let dt = ctx.dt;
        if let Some(position) = ctx.world.get_mut::<Position>(local) {
            self.hook.predict(local, &input, position, dt);
        }
        Ok(())
    }
}

/// Runs the smoothing hook for every replicated entity except the local player.
pub struct Smooth {
    hook: Box<dyn SmoothingHook>,
}

impl Smooth {
    pub fn new(hook: Box<dyn SmoothingHook>) -> Self {
        Self { hook }
    }
}

impl System for Smooth {
    fn run(&mut self, ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
        let local = ctx
            .resources
            .get::<crate::replicate::LocalPlayer>()
            .and_then(|p| p.0);
        let history = ctx.resources.expect::<PositionHistory>()?;
        for (entity, position) in ctx.world.iter_mut::<Position>() {
            if Some(entity) != local {
                self.hook.smooth(entity, history, position);
            }
        }
        Ok(())
    }
}
