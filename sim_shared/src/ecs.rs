//! Entity/component storage.
//!
//! Entities are generational handles: a freed slot keeps its index but bumps its
//! generation, so handles held past a despawn stop resolving. Components live
//! in one sparse-set column per type (dense values + dense owner list + a
//! slot table indexed by entity index), which keeps iteration linear over
//! packed memory.
//!
//! The world is owned by the tick execution context. Nothing here is shared
//! across threads.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
};

use serde::{Deserialize, Serialize};

/// Opaque entity handle.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    index: u32,
    generation: u32,
}

impl Entity {
    /// Rebuilds a handle from its parts (used when decoding network ids).
    pub const fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Marker for types that can be stored as components.
pub trait Component: 'static + Send + Sync {}

impl<T: 'static + Send + Sync> Component for T {}

#[derive(Default)]
struct Allocator {
    generations: Vec<u32>,
    free: Vec<u32>,
}

impl Allocator {
    fn allocate(&mut self) -> Entity {
        if let Some(index) = self.free.pop() {
            Entity {
                index,
                generation: self.generations[index as usize],
            }
        } else {
            let index = self.generations.len() as u32;
            self.generations.push(0);
            Entity {
                index,
                generation: 0,
            }
        }
    }

    fn free(&mut self, e: Entity) -> bool {
        if !self.is_alive(e) {
            return false;
        }
        let slot = &mut self.generations[e.index as usize];
        *slot = slot.wrapping_add(1);
        self.free.push(e.index);
        true
    }

    fn is_alive(&self, e: Entity) -> bool {
        self.generations
            .get(e.index as usize)
            .is_some_and(|g| *g == e.generation)
    }

    fn alive_count(&self) -> usize {
        self.generations.len() - self.free.len()
    }
}

/// Dense column for one component type.
struct Column<T> {
    values: Vec<T>,
    owners: Vec<Entity>,
    slots: Vec<Option<u32>>,
}

impl<T> Default for Column<T> {
    fn default() -> Self {
        Self {
            values: Vec::new(),
            owners: Vec::new(),
            slots: Vec::new(),
        }
    }
}

impl<T> Column<T> {
    fn dense_index(&self, e: Entity) -> Option<usize> {
        let dense = (*self.slots.get(e.index as usize)?)? as usize;
        (self.owners[dense] == e).then_some(dense)
    }

    fn insert(&mut self, e: Entity, value: T) -> Option<T> {
        let slot = e.index as usize;
        if slot >= self.slots.len() {
            self.slots.resize(slot + 1, None);
        }
        if let Some(dense) = self.slots[slot].map(|d| d as usize) {
            self.owners[dense] = e;
            return Some(std::mem::replace(&mut self.values[dense], value));
        }
        self.slots[slot] = Some(self.values.len() as u32);
        self.values.push(value);
        self.owners.push(e);
        None
    }

    fn remove(&mut self, e: Entity) -> Option<T> {
        let dense = self.dense_index(e)?;
        self.slots[e.index as usize] = None;
        let last = self.values.len() - 1;
        if dense != last {
            let moved = self.owners[last];
            self.slots[moved.index as usize] = Some(dense as u32);
        }
        self.owners.swap_remove(dense);
        Some(self.values.swap_remove(dense))
    }
}

/// Type-erased view of a column, used by despawn and query filtering.
trait AnyColumn: Send + Sync {
    fn drop_entity(&mut self, e: Entity);
    fn contains(&self, e: Entity) -> bool;
    fn owners(&self) -> &[Entity];
    fn len(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Component> AnyColumn for Column<T> {
    fn drop_entity(&mut self, e: Entity) {
        self.remove(e);
    }

    fn contains(&self, e: Entity) -> bool {
        self.dense_index(e).is_some()
    }

    fn owners(&self) -> &[Entity] {
        &self.owners
    }

    fn len(&self) -> usize {
        self.values.len()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Entity/component store.
#[derive(Default)]
pub struct World {
    entities: Allocator,
    columns: HashMap<TypeId, Box<dyn AnyColumn>>,
}

impl World {
    /// Creates a new entity.
    pub fn spawn(&mut self) -> Entity {
        self.entities.allocate()
    }

    /// Removes an entity and every component it carries.
    ///
    /// Returns `false` for handles that are already stale.
    pub fn despawn(&mut self, entity: Entity) -> bool {
        if !self.entities.is_alive(entity) {
            return false;
        }
        for column in self.columns.values_mut() {
            column.drop_entity(entity);
        }
        self.entities.free(entity)
    }

    pub fn is_alive(&self, entity: Entity) -> bool {
        self.entities.is_alive(entity)
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.entities.alive_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts/replaces a component. Returns the previous value, if any.
    ///
    /// Inserting on a dead handle is ignored and hands the value back.
    pub fn insert<T: Component>(&mut self, entity: Entity, component: T) -> Option<T> {
        if !self.entities.is_alive(entity) {
            return Some(component);
        }
        self.column_mut_or_default::<T>().insert(entity, component)
    }

    pub fn remove<T: Component>(&mut self, entity: Entity) -> Option<T> {
        self.column_mut::<T>()?.remove(entity)
    }

    pub fn get<T: Component>(&self, entity: Entity) -> Option<&T> {
        let column = self.column::<T>()?;
        let dense = column.dense_index(entity)?;
        Some(&column.values[dense])
    }

    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> Option<&mut T> {
        let column = self.column_mut::<T>()?;
        let dense = column.dense_index(entity)?;
        Some(&mut column.values[dense])
    }

    pub fn has<T: Component>(&self, entity: Entity) -> bool {
        self.has_type(TypeId::of::<T>(), entity)
    }

    /// Presence check by type identity.
    pub fn has_type(&self, ty: TypeId, entity: Entity) -> bool {
        self.columns.get(&ty).is_some_and(|c| c.contains(entity))
    }

    /// Iterates entities carrying `T`, in dense order.
    pub fn iter<T: Component>(&self) -> impl Iterator<Item = (Entity, &T)> {
        self.column::<T>()
            .into_iter()
            .flat_map(|c| c.owners.iter().copied().zip(c.values.iter()))
    }

    pub fn iter_mut<T: Component>(&mut self) -> impl Iterator<Item = (Entity, &mut T)> {
        self.column_mut::<T>()
            .into_iter()
            .flat_map(|c| c.owners.iter().copied().zip(c.values.iter_mut()))
    }

    /// Entities carrying every type in `required`, sorted by handle.
    ///
    /// Iteration is driven by the smallest column.
    pub fn entities_with(&self, required: &[TypeId]) -> Vec<Entity> {
        let mut columns = Vec::with_capacity(required.len());
        for ty in required {
            match self.columns.get(ty) {
                Some(c) => columns.push(c.as_ref()),
                None => return Vec::new(),
            }
        }
        columns.sort_by_key(|c| c.len());
        let Some((driver, rest)) = columns.split_first() else {
            return Vec::new();
        };
        let mut out: Vec<Entity> = driver
            .owners()
            .iter()
            .copied()
            .filter(|e| rest.iter().all(|c| c.contains(*e)))
            .collect();
        out.sort_unstable();
        out
    }

    fn column<T: Component>(&self) -> Option<&Column<T>> {
        self.columns
            .get(&TypeId::of::<T>())
            .and_then(|c| c.as_any().downcast_ref::<Column<T>>())
    }

    fn column_mut<T: Component>(&mut self) -> Option<&mut Column<T>> {
        self.columns
            .get_mut(&TypeId::of::<T>())
            .and_then(|c| c.as_any_mut().downcast_mut::<Column<T>>())
    }

    fn column_mut_or_default<T: Component>(&mut self) -> &mut Column<T> {
        self.columns
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(Column::<T>::default()))
            .as_any_mut()
            .downcast_mut::<Column<T>>()
            .expect("column registered under its own TypeId")
    }
}
