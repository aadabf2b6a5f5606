//! Canonical entity storage.
//!
//! Entities live in a sharded concurrent map keyed by id. Callers never keep
//! a reference across an await point: they read a copy with [`EntityStore::get`]
//! or mutate in place through [`EntityStore::update`], which holds the shard
//! lock only for the duration of the closure.

use crate::entity::Entity;
use dashmap::DashMap;
use shared::EntityId;
use std::sync::atomic::{AtomicU32, Ordering};

pub struct EntityStore {
    entities: DashMap<EntityId, Entity>,
    next_id: AtomicU32,
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            entities: DashMap::new(),
            next_id: AtomicU32::new(1),
        }
    }

    /// Hands out the next process-unique entity id.
    pub fn allocate_id(&self) -> EntityId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, entity: Entity) {
        self.entities.insert(entity.id, entity);
    }

    pub fn remove(&self, id: EntityId) -> Option<Entity> {
        self.entities.remove(&id).map(|(_, entity)| entity)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    /// Returns a copy of the entity.
    pub fn get(&self, id: EntityId) -> Option<Entity> {
        self.entities.get(&id).map(|entry| entry.value().clone())
    }

    /// Runs `f` against the entity while its shard is locked.
    ///
    /// `f` must not touch the store again; doing so can deadlock on the same shard.
    pub fn update<R>(&self, id: EntityId, f: impl FnOnce(&mut Entity) -> R) -> Option<R> {
        self.entities.get_mut(&id).map(|mut entry| f(entry.value_mut()))
    }

    /// Copies every entity out. No ordering guarantee.
    pub fn snapshot(&self) -> Vec<Entity> {
        self.entities
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Ids of entities matching `predicate`.
    pub fn ids_where(&self, predicate: impl Fn(&Entity) -> bool) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn count_where(&self, predicate: impl Fn(&Entity) -> bool) -> usize {
        self.entities
            .iter()
            .filter(|entry| predicate(entry.value()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityFlags;
    use shared::Vec3;
    use std::sync::Arc;
    use std::time::Instant;

    fn player(store: &EntityStore, name: &str) -> EntityId {
        let id = store.allocate_id();
        store.insert(Entity::new(
            id,
            name,
            Vec3::ZERO,
            EntityFlags::PLAYER,
            Instant::now(),
        ));
        id
    }

    #[test]
    fn test_ids_are_unique_and_start_at_one() {
        let store = EntityStore::new();
        assert_eq!(store.allocate_id(), 1);
        assert_eq!(store.allocate_id(), 2);
    }

    #[test]
    fn test_insert_get_remove() {
        let store = EntityStore::new();
        let id = player(&store, "Alice");

        assert!(store.contains(id));
        assert_eq!(store.get(id).map(|e| e.name), Some("Alice".to_string()));

        assert!(store.remove(id).is_some());
        assert!(store.remove(id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_update_in_place() {
        let store = EntityStore::new();
        let id = player(&store, "Bob");

        let moved = store.update(id, |entity| {
            entity.position.x = 4.0;
            entity.position.x
        });
        assert_eq!(moved, Some(4.0));
        assert_eq!(store.get(id).map(|e| e.position.x), Some(4.0));

        assert_eq!(store.update(999, |_| ()), None);
    }

    #[test]
    fn test_filters() {
        let store = EntityStore::new();
        player(&store, "Alice");
        let npc = store.allocate_id();
        store.insert(Entity::new(
            npc,
            "Guard",
            Vec3::ZERO,
            EntityFlags::NPC,
            Instant::now(),
        ));

        assert_eq!(store.count_where(|e| e.flags.is_npc), 1);
        assert_eq!(store.ids_where(|e| e.flags.is_npc), vec![npc]);
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn test_concurrent_inserts() {
        let store = Arc::new(EntityStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        player(&store, "P");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 800);
    }
}
