//! Domain id <-> entity lookup.
//!
//! The index is liveness-aware: it only accepts live handles, and a lookup
//! that would resolve to a dead handle reports "not found". Despawn paths are
//! expected to call [`EntityIndex::unregister`] before freeing the slot (see
//! [`crate::schedule::TickContext::despawn`]), so no background sweep exists.

use std::{collections::HashMap, hash::Hash};

use crate::{
    components::PlayerId,
    ecs::{Entity, World},
};

/// Bidirectional map between a stable domain key and a live entity.
#[derive(Debug)]
pub struct EntityIndex<K> {
    by_key: HashMap<K, Entity>,
    by_entity: HashMap<Entity, K>,
}

impl<K> Default for EntityIndex<K> {
    fn default() -> Self {
        Self {
            by_key: HashMap::new(),
            by_entity: HashMap::new(),
        }
    }
}

/// Player characters by persistence id.
pub type PlayerIndex = EntityIndex<PlayerId>;

impl<K: Copy + Eq + Hash> EntityIndex<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `key` to `entity` if the entity is alive.
    ///
    /// Returns whether a mapping was written. A dead handle is ignored. Any
    /// previous mapping for either side is replaced so the map stays 1:1.
    pub fn register(&mut self, world: &World, entity: Entity, key: K) -> bool {
        if !world.is_alive(entity) {
            return false;
        }
        if let Some(old_key) = self.by_entity.remove(&entity) {
            self.by_key.remove(&old_key);
        }
        if let Some(old_entity) = self.by_key.insert(key, entity) {
            self.by_entity.remove(&old_entity);
        }
        self.by_entity.insert(entity, key);
        true
    }

    /// Removes whatever key the entity currently carries.
    ///
    /// A dead or unknown handle carries nothing and is a no-op.
    pub fn unregister(&mut self, world: &World, entity: Entity) -> Option<K> {
        if !world.is_alive(entity) {
            return None;
        }
        let key = self.by_entity.remove(&entity)?;
        self.by_key.remove(&key);
        Some(key)
    }

    /// Live entity for `key`, or `None` for unknown and stale ids.
    pub fn try_get(&self, world: &World, key: K) -> Option<Entity> {
        self.by_key
            .get(&key)
            .copied()
            .filter(|e| world.is_alive(*e))
    }

    /// Key carried by a live entity.
    pub fn key_of(&self, world: &World, entity: Entity) -> Option<K> {
        if !world.is_alive(entity) {
            return None;
        }
        self.by_entity.get(&entity).copied()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Live `(key, entity)` pairs.
    pub fn iter<'a>(&'a self, world: &'a World) -> impl Iterator<Item = (K, Entity)> + 'a {
        self.by_key
            .iter()
            .filter(|(_, e)| world.is_alive(**e))
            .map(|(k, e)| (*k, *e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_unregister_clears_lookup() {
        let mut world = World::default();
        let mut index = PlayerIndex::new();
        let e = world.spawn();
        assert!(index.register(&world, e, PlayerId(7)));
        assert_eq!(index.try_get(&world, PlayerId(7)), Some(e));
        assert_eq!(index.unregister(&world, e), Some(PlayerId(7)));
        assert_eq!(index.try_get(&world, PlayerId(7)), None);
        assert!(index.is_empty());
    }

    #[test]
    fn dead_handle_is_not_registered() {
        let mut world = World::default();
        let mut index = PlayerIndex::new();
        let e = world.spawn();
        world.despawn(e);
        assert!(!index.register(&world, e, PlayerId(1)));
        assert_eq!(index.try_get(&world, PlayerId(1)), None);
        assert_eq!(index.unregister(&world, e), None);
    }

    #[test]
    fn stale_mapping_is_not_returned() {
        let mut world = World::default();
        let mut index = PlayerIndex::new();
        let e = world.spawn();
        index.register(&world, e, PlayerId(2));
        world.despawn(e);
        let reused = world.spawn();
        assert_eq!(reused.index(), e.index());
        assert_eq!(index.try_get(&world, PlayerId(2)), None);
        assert_eq!(index.key_of(&world, reused), None);
    }

    #[test]
    fn re_registering_keeps_map_one_to_one() {
        let mut world = World::default();
        let mut index = PlayerIndex::new();
        let a = world.spawn();
        let b = world.spawn();
        index.register(&world, a, PlayerId(1));
        index.register(&world, b, PlayerId(1));
        assert_eq!(index.try_get(&world, PlayerId(1)), Some(b));
        assert_eq!(index.key_of(&world, a), None);
        assert_eq!(index.len(), 1);
    }
}
