//! Staging queues.
//!
//! Named FIFO buffers that carry gameplay events across the boundary between
//! the tick thread and asynchronous workers (connection handling,
//! persistence). Each queue is declared as a marker type implementing
//! [`StagingQueue`], which fixes both its name and its payload type, so a
//! mismatched payload does not compile.
//!
//! Enqueue and dequeue never block on anything but a short critical section.
//! Order is guaranteed within one queue only.

use std::{
    any::Any,
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::warn;

use crate::{
    components::{PlayerId, Position, Vitals},
    ecs::{Entity, World},
    math::Vec2,
    net::PeerId,
};

/// Declares a named queue and its payload.
pub trait StagingQueue: 'static {
    type Item: Send + 'static;
    const NAME: &'static str;
}

/// What to do when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest item to make room.
    #[default]
    DropOldest,
    /// Discard the item being enqueued.
    DropNewest,
}

struct Lane<T> {
    name: &'static str,
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    overflow: OverflowPolicy,
    dropped: AtomicU64,
    ready: Notify,
}

impl<T> Lane<T> {
    fn push(&self, item: T) {
        let Ok(mut items) = self.items.lock() else {
            return;
        };
        if self.capacity > 0 && items.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(queue = self.name, capacity = self.capacity, policy = ?self.overflow, "Staging queue full");
            match self.overflow {
                OverflowPolicy::DropOldest => {
                    items.pop_front();
                }
                OverflowPolicy::DropNewest => return,
            }
        }
        items.push_back(item);
        drop(items);
        self.ready.notify_one();
    }

    fn pop(&self) -> Option<T> {
        self.items.lock().ok()?.pop_front()
    }
}

/// Registry of named queues. Share it behind an `Arc`.
pub struct StagingQueues {
    capacity: usize,
    overflow: OverflowPolicy,
    lanes: RwLock<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>,
}

impl Default for StagingQueues {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl StagingQueues {
    /// `capacity == 0` means unbounded.
    pub fn new(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            capacity,
            overflow,
            lanes: RwLock::new(HashMap::new()),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0, OverflowPolicy::default())
    }

    /// Appends an item. Never fails; a full bounded queue applies its overflow policy.
    pub fn enqueue<Q: StagingQueue>(&self, item: Q::Item) {
        self.lane::<Q>().push(item);
    }

    /// Pops the oldest item, or `None` when empty.
    pub fn try_dequeue<Q: StagingQueue>(&self) -> Option<Q::Item> {
        self.existing_lane::<Q>()?.pop()
    }

    /// Pops everything currently queued, oldest first.
    pub fn drain<Q: StagingQueue>(&self) -> Vec<Q::Item> {
        let Some(lane) = self.existing_lane::<Q>() else {
            return Vec::new();
        };
        let Ok(mut items) = lane.items.lock() else {
            return Vec::new();
        };
        items.drain(..).collect()
    }

    /// Waits until an item is available and pops it.
    pub async fn next<Q: StagingQueue>(&self) -> Q::Item {
        let lane = self.lane::<Q>();
        loop {
            if let Some(item) = lane.pop() {
                return item;
            }
            lane.ready.notified().await;
        }
    }

    pub fn len<Q: StagingQueue>(&self) -> usize {
        self.existing_lane::<Q>()
            .and_then(|lane| lane.items.lock().ok().map(|i| i.len()))
            .unwrap_or(0)
    }

    pub fn is_empty<Q: StagingQueue>(&self) -> bool {
        self.len::<Q>() == 0
    }

    /// Items discarded by the overflow policy so far.
    pub fn dropped<Q: StagingQueue>(&self) -> u64 {
        self.existing_lane::<Q>()
            .map(|lane| lane.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn existing_lane<Q: StagingQueue>(&self) -> Option<Arc<Lane<Q::Item>>> {
        let erased = self.lanes.read().ok()?.get(Q::NAME)?.clone();
        Some(Self::downcast::<Q>(erased))
    }

    fn lane<Q: StagingQueue>(&self) -> Arc<Lane<Q::Item>> {
        if let Some(lane) = self.existing_lane::<Q>() {
            return lane;
        }
        let mut lanes = match self.lanes.write() {
            Ok(lanes) => lanes,
            Err(poisoned) => poisoned.into_inner(),
        };
        let erased = lanes
            .entry(Q::NAME)
            .or_insert_with(|| {
                Arc::new(Lane::<Q::Item> {
                    name: Q::NAME,
                    items: Mutex::new(VecDeque::new()),
                    capacity: self.capacity,
                    overflow: self.overflow,
                    dropped: AtomicU64::new(0),
                    ready: Notify::new(),
                })
            })
            .clone();
        Self::downcast::<Q>(erased)
    }

    fn downcast<Q: StagingQueue>(erased: Arc<dyn Any + Send + Sync>) -> Arc<Lane<Q::Item>> {
        erased
            .downcast::<Lane<Q::Item>>()
            .unwrap_or_else(|_| panic!("staging queue `{}` declared with two payload types", Q::NAME))
    }
}

// ─── Named queues ───

/// A peer finished authenticating and wants a character in the world.
#[derive(Debug, Clone, PartialEq)]
pub struct LoginRequest {
    pub peer: PeerId,
    pub player_id: PlayerId,
    pub name: String,
    /// Last persisted position, if the character has one.
    pub position: Option<Vec2>,
}

/// A peer disconnected or asked to leave.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaveRequest {
    pub peer: PeerId,
    pub reason: String,
}

/// A peer finished loading the map and can receive world state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapLoadedNotice {
    pub peer: PeerId,
}

/// Last authoritative state of a character, handed to persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveRequest {
    pub player_id: PlayerId,
    pub position: Vec2,
    pub vitals: Option<Vitals>,
    pub tick: u64,
    pub staged_at: DateTime<Utc>,
}

impl SaveRequest {
    /// Stamped with the current wall-clock time.
    pub fn new(player_id: PlayerId, position: Vec2, vitals: Option<Vitals>, tick: u64) -> Self {
        Self {
            player_id,
            position,
            vitals,
            tick,
            staged_at: Utc::now(),
        }
    }

    /// Snapshot of a player character, or `None` for anything else.
    pub fn capture(world: &World, entity: Entity, tick: u64) -> Option<Self> {
        Some(Self::new(
            *world.get::<PlayerId>(entity)?,
            world.get::<Position>(entity)?.0,
            world.get::<Vitals>(entity).copied(),
            tick,
        ))
    }
}

/// Instantaneous relocation requested by gameplay or an admin tool.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TeleportRequest {
    pub entity: Entity,
    pub position: Vec2,
    pub facing: Vec2,
}

pub struct PlayerLogin;
impl StagingQueue for PlayerLogin {
    type Item = LoginRequest;
    const NAME: &'static str = "player_login";
}

pub struct PlayerLeave;
impl StagingQueue for PlayerLeave {
    type Item = LeaveRequest;
    const NAME: &'static str = "player_leave";
}

pub struct MapLoaded;
impl StagingQueue for MapLoaded {
    type Item = MapLoadedNotice;
    const NAME: &'static str = "map_loaded";
}

pub struct PersistenceSave;
impl StagingQueue for PersistenceSave {
    type Item = SaveRequest;
    const NAME: &'static str = "persistence_save";
}

pub struct Teleports;
impl StagingQueue for Teleports {
    type Item = TeleportRequest;
    const NAME: &'static str = "teleport";
}
