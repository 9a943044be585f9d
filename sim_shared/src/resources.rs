//! Per-simulation resources.
//!
//! A type-keyed map holding at most one value per type. Systems reach shared
//! services (input provider, collision service, queues, indices) through it
//! instead of process-wide globals.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

/// Type-keyed resource map.
#[derive(Default)]
pub struct Resources {
    by_type: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Resources {
    /// Inserts a resource, returning the one it replaced.
    pub fn insert<T: 'static + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.by_type
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T: 'static + Send + Sync>(&self) -> Option<&T> {
        self.by_type
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_ref::<T>())
    }

    pub fn get_mut<T: 'static + Send + Sync>(&mut self) -> Option<&mut T> {
        self.by_type
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast_mut::<T>())
    }

    /// Like [`Resources::get`], but reports the missing type by name.
    pub fn expect<T: 'static + Send + Sync>(&self) -> anyhow::Result<&T> {
        self.get::<T>()
            .ok_or_else(|| anyhow::anyhow!("missing resource {}", std::any::type_name::<T>()))
    }

    pub fn expect_mut<T: 'static + Send + Sync>(&mut self) -> anyhow::Result<&mut T> {
        self.get_mut::<T>()
            .ok_or_else(|| anyhow::anyhow!("missing resource {}", std::any::type_name::<T>()))
    }

    pub fn remove<T: 'static + Send + Sync>(&mut self) -> Option<T> {
        self.by_type
            .remove(&TypeId::of::<T>())
            .and_then(|boxed| boxed.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    pub fn contains<T: 'static + Send + Sync>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<T>())
    }
}
