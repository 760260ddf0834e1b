//! Entity/component store (minimal ECS).
//!
//! Typed component storages keyed by entity id. Storages are ordered maps so
//! iteration (and therefore replication order) is deterministic.

use std::{
    any::{Any, TypeId},
    collections::{BTreeMap, HashMap},
};

use serde::{Deserialize, Serialize};

/// Opaque entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

trait Storage: Send {
    fn remove(&mut self, entity: EntityId);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: 'static + Send> Storage for BTreeMap<EntityId, T> {
    fn remove(&mut self, entity: EntityId) {
        BTreeMap::remove(self, &entity);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Entity store with typed component storages.
#[derive(Default)]
pub struct EntityStore {
    next_id: u64,
    storages: HashMap<TypeId, Box<dyn Storage>>,
}

impl EntityStore {
    /// Creates a new entity.
    pub fn spawn(&mut self) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Inserts/replaces a component for an entity.
    pub fn insert<T: 'static + Send>(&mut self, entity: EntityId, component: T) {
        let storage = self
            .storages
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Box::new(BTreeMap::<EntityId, T>::new()));
        if let Some(storage) = storage.as_any_mut().downcast_mut::<BTreeMap<EntityId, T>>() {
            storage.insert(entity, component);
        }
    }

    /// Removes one component, returning it.
    pub fn remove<T: 'static + Send>(&mut self, entity: EntityId) -> Option<T> {
        self.storage_mut::<T>()
            .and_then(|storage| storage.remove(&entity))
    }

    /// Drops every component of an entity.
    pub fn despawn(&mut self, entity: EntityId) {
        for storage in self.storages.values_mut() {
            storage.remove(entity);
        }
    }

    pub fn get<T: 'static + Send>(&self, entity: EntityId) -> Option<&T> {
        self.storage::<T>().and_then(|storage| storage.get(&entity))
    }

    pub fn get_mut<T: 'static + Send>(&mut self, entity: EntityId) -> Option<&mut T> {
        self.storage_mut::<T>()
            .and_then(|storage| storage.get_mut(&entity))
    }

    /// Iterates entities with a given component.
    pub fn iter<T: 'static + Send>(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.storage::<T>()
            .into_iter()
            .flat_map(|storage| storage.iter().map(|(k, v)| (*k, v)))
    }

    pub fn iter_mut<T: 'static + Send>(&mut self) -> impl Iterator<Item = (EntityId, &mut T)> {
        self.storage_mut::<T>()
            .into_iter()
            .flat_map(|storage| storage.iter_mut().map(|(k, v)| (*k, v)))
    }

    fn storage<T: 'static + Send>(&self) -> Option<&BTreeMap<EntityId, T>> {
        self.storages
            .get(&TypeId::of::<T>())
            .and_then(|boxed| boxed.as_any().downcast_ref::<BTreeMap<EntityId, T>>())
    }

    fn storage_mut<T: 'static + Send>(&mut self) -> Option<&mut BTreeMap<EntityId, T>> {
        self.storages
            .get_mut(&TypeId::of::<T>())
            .and_then(|boxed| boxed.as_any_mut().downcast_mut::<BTreeMap<EntityId, T>>())
    }
}
