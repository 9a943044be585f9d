//! Component synchronization.
//!
//! Each replicated component type is registered with a [`SyncPolicy`]. On
//! every flush the engine walks the entities carrying that type and decides,
//! per entity, whether to send:
//!
//! 1. The policy's authority must match this process's [`Side`]; otherwise the
//!    type is skipped entirely.
//! 2. `OnChange` compares against the last value sent for that entity and
//!    skips equal values, unless the policy has a keyframe interval and that
//!    many ticks passed since the last send. `OnTick` is always a candidate.
//! 3. `rate_ticks` throttles: a candidate is held back until at least that
//!    many ticks have passed since its last send. A held-back change stays
//!    pending and goes out once the window opens.
//!
//! Eligible entities of one type are batched into the packets produced by
//! [`Synced::packets`] and broadcast on the policy's channel.

use std::{
    any::TypeId,
    collections::{HashMap, HashSet},
    sync::Arc,
};

use tracing::{debug, trace, warn};

use crate::{
    channel::ChannelDispatcher,
    ecs::{Component, Entity, World},
    error::ConfigError,
    net::{ChannelId, Packet},
    schedule::Side,
};

/// When a component is considered for sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Only when the value differs from the last one sent.
    OnChange,
    /// Every eligible tick, whatever the value.
    OnTick,
}

/// Which entities a flush looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Detection {
    /// Every carrier is diffed against its last-sent snapshot.
    #[default]
    Shadow,
    /// Only entities passed to `mark_dirty` since their last send.
    Marked,
}

/// Replication policy of one component type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPolicy {
    pub authority: Side,
    pub trigger: SyncTrigger,
    /// Minimum ticks between two sends for the same entity; 0 = unthrottled.
    pub rate_ticks: u32,
    pub channel: ChannelId,
    pub detection: Detection,
    /// Resend an unchanged `OnChange` value after this many ticks; 0 = never.
    pub keyframe_ticks: u32,
}

impl SyncPolicy {
    pub fn new(authority: Side, trigger: SyncTrigger, channel: &str) -> Self {
        Self {
            authority,
            trigger,
            rate_ticks: 0,
            channel: ChannelId::new(channel),
            detection: Detection::Shadow,
            keyframe_ticks: 0,
        }
    }

    pub fn rate(mut self, rate_ticks: u32) -> Self {
        self.rate_ticks = rate_ticks;
        self
    }

    pub fn detection(mut self, detection: Detection) -> Self {
        self.detection = detection;
        self
    }

    /// Periodic resend of settled values on lossy channels. Nonzero intervals
    /// are at least 2, so an unchanged value never goes out on consecutive ticks.
    pub fn keyframe(mut self, keyframe_ticks: u32) -> Self {
        self.keyframe_ticks = if keyframe_ticks == 0 { 0 } else { keyframe_ticks.max(2) };
        self
    }
}

/// A component type that can be replicated.
pub trait Synced: Component + Clone + PartialEq {
    /// Name used in logs and config overrides.
    const NAME: &'static str;

    /// Builds outbound packets for one flush worth of changes.
    fn packets(batch: Vec<(Entity, Self)>) -> Vec<Packet>;
}

/// Counters from one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub sent: usize,
    pub unchanged: usize,
    pub throttled: usize,
    pub packets: usize,
}

impl FlushStats {
    fn merge(&mut self, other: FlushStats) {
        self.sent += other.sent;
        self.unchanged += other.unchanged;
        self.throttled += other.throttled;
        self.packets += other.packets;
    }
}

struct LastSent<T> {
    tick: u64,
    value: T,
}

struct Tracker<T> {
    policy: SyncPolicy,
    last: HashMap<Entity, LastSent<T>>,
    dirty: HashSet<Entity>,
}

trait AnyTracker: Send + Sync {
    fn name(&self) -> &'static str;
    fn policy(&self) -> &SyncPolicy;
    fn mark_dirty(&mut self, entity: Entity);
    fn forget(&mut self, entity: Entity);
    fn flush(&mut self, world: &World, tick: u64, channels: &ChannelDispatcher) -> FlushStats;
}

impl<T: Synced> AnyTracker for Tracker<T> {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    fn mark_dirty(&mut self, entity: Entity) {
        self.dirty.insert(entity);
    }

    fn forget(&mut self, entity: Entity) {
        self.last.remove(&entity);
        self.dirty.remove(&entity);
    }

    fn flush(&mut self, world: &World, tick: u64, channels: &ChannelDispatcher) -> FlushStats {
        let mut stats = FlushStats::default();
        // Drop state for handles that died without going through `forget`,
        // and for live entities that lost the component.
        self.last.retain(|e, _| world.is_alive(*e) && world.has::<T>(*e));
        self.dirty.retain(|e| world.is_alive(*e) && world.has::<T>(*e));

        let candidates: Vec<Entity> = match self.policy.detection {
            Detection::Shadow => world.iter::<T>().map(|(e, _)| e).collect(),
            Detection::Marked => self.dirty.iter().copied().collect(),
        };

        let keyframe = u64::from(self.policy.keyframe_ticks);
        let mut batch = Vec::new();
        for entity in candidates {
            let Some(value) = world.get::<T>(entity) else {
                self.dirty.remove(&entity);
                continue;
            };
            let previous = self.last.get(&entity);
            if self.policy.trigger == SyncTrigger::OnChange
                && previous.is_some_and(|p| {
                    p.value == *value
                        && (keyframe == 0 || tick.saturating_sub(p.tick) < keyframe)
                })
            {
                self.dirty.remove(&entity);
                stats.unchanged += 1;
                continue;
            }
            if let Some(p) = previous {
                if tick.saturating_sub(p.tick) < u64::from(self.policy.rate_ticks) {
                    stats.throttled += 1;
                    continue;
                }
            }
            batch.push((entity, value.clone()));
        }

        if batch.is_empty() {
            return stats;
        }
        let Some(endpoint) = channels.try_get(&self.policy.channel) else {
            warn!(component = T::NAME, channel = %self.policy.channel, "Sync channel missing; flush skipped");
            return stats;
        };

        for (entity, value) in &batch {
            self.dirty.remove(entity);
            self.last.insert(
                *entity,
                LastSent {
                    tick,
                    value: value.clone(),
                },
            );
        }
        stats.sent = batch.len();
        for packet in T::packets(batch) {
            endpoint.broadcast(packet);
            stats.packets += 1;
        }
        trace!(component = T::NAME, tick, sent = stats.sent, "Sync flush");
        stats
    }
}

/// Detects per-tick component changes and emits replication packets.
pub struct ComponentSyncEngine {
    side: Side,
    channels: Arc<ChannelDispatcher>,
    trackers: Vec<Box<dyn AnyTracker>>,
    by_type: HashMap<TypeId, usize>,
}

impl ComponentSyncEngine {
    pub fn new(side: Side, channels: Arc<ChannelDispatcher>) -> Self {
        Self {
            side,
            channels,
            trackers: Vec::new(),
            by_type: HashMap::new(),
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Attaches a policy to `T`. The policy's channel must already exist.
    pub fn register<T: Synced>(&mut self, policy: SyncPolicy) -> Result<(), ConfigError> {
        if self.channels.try_get(&policy.channel).is_none() {
            return Err(ConfigError::UnknownSyncChannel {
                component: T::NAME.to_string(),
                channel: policy.channel,
            });
        }
        debug!(component = T::NAME, ?policy, "Sync policy registered");
        let tracker = Box::new(Tracker::<T> {
            policy,
            last: HashMap::new(),
            dirty: HashSet::new(),
        });
        match self.by_type.get(&TypeId::of::<T>()) {
            Some(&slot) => self.trackers[slot] = tracker,
            None => {
                self.by_type.insert(TypeId::of::<T>(), self.trackers.len());
                self.trackers.push(tracker);
            }
        }
        Ok(())
    }

    pub fn policy_of<T: Synced>(&self) -> Option<&SyncPolicy> {
        self.by_type
            .get(&TypeId::of::<T>())
            .map(|slot| self.trackers[*slot].policy())
    }

    pub fn mark_dirty<T: Synced>(&mut self, entity: Entity) {
        self.mark_dirty_type(entity, TypeId::of::<T>());
    }

    /// Flags an entity's component as changed. Unregistered types are ignored.
    pub fn mark_dirty_type(&mut self, entity: Entity, ty: TypeId) {
        if let Some(slot) = self.by_type.get(&ty) {
            self.trackers[*slot].mark_dirty(entity);
        }
    }

    /// Voids all pending and last-sent state for an entity.
    pub fn forget(&mut self, entity: Entity) {
        for tracker in &mut self.trackers {
            tracker.forget(entity);
        }
    }

    /// Sends everything eligible this tick.
    pub fn flush(&mut self, world: &World, tick: u64) -> FlushStats {
        let mut total = FlushStats::default();
        for tracker in &mut self.trackers {
            if tracker.policy().authority != self.side {
                continue;
            }
            let stats = tracker.flush(world, tick, &self.channels);
            if stats.sent > 0 {
                debug!(component = tracker.name(), tick, sent = stats.sent, "Replicated");
            }
            total.merge(stats);
        }
        total
    }
}
