//! Collaborator interfaces consumed by the simulation.
//!
//! Implementations live outside the core (map data, device input, storage).
//! Each trait has a small in-process implementation for the binaries and tests.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use async_trait::async_trait;

use crate::{
    components::{InputFlags, PlayerId},
    ecs::Entity,
    math::{Cell, Vec2},
    queues::SaveRequest,
};

/// Walkability checks used by movement validation.
pub trait CollisionService: Send + Sync {
    fn can_enter_cell(&self, entity: Entity, cell: Cell) -> bool;
}

/// Everything is walkable.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenField;

impl CollisionService for OpenField {
    fn can_enter_cell(&self, _entity: Entity, _cell: Cell) -> bool {
        true
    }
}

/// A fixed set of blocked cells, optionally bounded.
#[derive(Debug, Default, Clone)]
pub struct BlockedCells {
    blocked: HashSet<Cell>,
    bounds: Option<(Cell, Cell)>,
}

impl BlockedCells {
    pub fn new(cells: impl IntoIterator<Item = Cell>) -> Self {
        Self {
            blocked: cells.into_iter().collect(),
            bounds: None,
        }
    }

    /// Cells outside `[min, max]` are blocked too.
    pub fn with_bounds(mut self, min: Cell, max: Cell) -> Self {
        self.bounds = Some((min, max));
        self
    }
}

impl CollisionService for BlockedCells {
    fn can_enter_cell(&self, _entity: Entity, cell: Cell) -> bool {
        if let Some((min, max)) = self.bounds {
            if cell.x < min.x || cell.y < min.y || cell.x > max.x || cell.y > max.y {
                return false;
            }
        }
        !self.blocked.contains(&cell)
    }
}

/// One polled input sample.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct InputSample {
    /// Movement axis, clamped to unit length by the consumer.
    pub movement: Vec2,
    /// World position under the pointer.
    pub click: Option<Vec2>,
    pub flags: InputFlags,
}

/// Device input, polled once per tick.
pub trait InputProvider: Send {
    fn poll(&mut self) -> InputSample;
}

/// Plays back a fixed list of samples, then idles.
#[derive(Debug, Default, Clone)]
pub struct ScriptedInput {
    samples: Vec<InputSample>,
    cursor: usize,
}

impl ScriptedInput {
    pub fn new(samples: Vec<InputSample>) -> Self {
        Self { samples, cursor: 0 }
    }
}

impl InputProvider for ScriptedInput {
    fn poll(&mut self) -> InputSample {
        let sample = self.samples.get(self.cursor).copied().unwrap_or_default();
        self.cursor += 1;
        sample
    }
}

/// Storage for save requests drained from the persistence queue.
#[async_trait]
pub trait PersistenceRepository: Send + Sync {
    async fn save(&self, request: SaveRequest) -> anyhow::Result<()>;
}

/// Keeps the latest save per player in memory.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    saves: Mutex<HashMap<PlayerId, SaveRequest>>,
    history: Mutex<Vec<PlayerId>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, player: PlayerId) -> Option<SaveRequest> {
        self.saves.lock().ok()?.get(&player).cloned()
    }

    /// Player ids in the order their saves arrived.
    pub fn history(&self) -> Vec<PlayerId> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PersistenceRepository for InMemoryRepository {
    async fn save(&self, request: SaveRequest) -> anyhow::Result<()> {
        let player = request.player_id;
        self.saves
            .lock()
            .map_err(|_| anyhow::anyhow!("save table poisoned"))?
            .insert(player, request);
        self.history
            .lock()
            .map_err(|_| anyhow::anyhow!("save history poisoned"))?
            .push(player);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_cells_respect_bounds() {
        let map = BlockedCells::new([Cell::new(1, 1)]).with_bounds(Cell::new(0, 0), Cell::new(3, 3));
        let e = Entity::from_parts(0, 0);
        assert!(map.can_enter_cell(e, Cell::new(0, 1)));
        assert!(!map.can_enter_cell(e, Cell::new(1, 1)));
        assert!(!map.can_enter_cell(e, Cell::new(4, 0)));
        assert!(!map.can_enter_cell(e, Cell::new(-1, 0)));
    }

    #[test]
    fn scripted_input_idles_after_script() {
        let mut input = ScriptedInput::new(vec![InputSample {
            movement: Vec2::new(1.0, 0.0),
            ..InputSample::default()
        }]);
        assert_eq!(input.poll().movement, Vec2::new(1.0, 0.0));
        assert_eq!(input.poll(), InputSample::default());
    }

    #[tokio::test]
    async fn in_memory_repository_keeps_latest() {
        let repo = InMemoryRepository::new();
        for tick in [1, 2] {
            repo.save(SaveRequest::new(PlayerId(9), Vec2::new(tick as f32, 0.0), None, tick))
                .await
                .unwrap();
        }
        assert_eq!(repo.latest(PlayerId(9)).map(|s| s.tick), Some(2));
        assert_eq!(repo.history(), vec![PlayerId(9), PlayerId(9)]);
    }
}
