//! Thread-safe entity registry
//!
//! One lock guards the whole collection. Mutations from command dispatch,
//! script readers and the tick task are serialized through it, and `tick`
//! holds it for a full pass.

use parking_lot::Mutex;

use super::behavior;
use super::entity::{Entity, EntityId, Point};
use super::error::StoreError;

/// Result of an insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOutcome {
    /// Id the entity was stored under
    pub id: EntityId,
    /// Explicit id that was requested but already taken
    pub renumbered_from: Option<EntityId>,
}

struct StoreInner {
    entities: Vec<Entity>,
    next_id: EntityId,
}

/// Registry of live entities.
pub struct EntityStore {
    inner: Mutex<StoreInner>,
    capacity: usize,
}

impl EntityStore {
    /// Create an empty store holding at most `capacity` entities.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                entities: Vec::new(),
                next_id: 1,
            }),
            capacity,
        }
    }

    /// Insert `entity`.
    ///
    /// An id of 0 asks the store to assign one. An explicit id that is
    /// already live is replaced by the next free id and reported in
    /// [`AddOutcome::renumbered_from`].
    pub fn add(&self, mut entity: Entity) -> Result<AddOutcome, StoreError> {
        let mut inner = self.inner.lock();
        if inner.entities.len() >= self.capacity {
            return Err(StoreError::Full(self.capacity));
        }

        let requested = entity.id;
        let taken = requested != 0 && inner.entities.iter().any(|e| e.id == requested);
        if requested == 0 || taken {
            entity.id = inner.allocate();
        } else if requested >= inner.next_id {
            inner.next_id = requested.saturating_add(1);
        }

        let outcome = AddOutcome {
            id: entity.id,
            renumbered_from: taken.then_some(requested),
        };
        inner.entities.push(entity);
        Ok(outcome)
    }

    /// Remove the entity with `id`, returning it if it was live.
    pub fn remove(&self, id: EntityId) -> Option<Entity> {
        let mut inner = self.inner.lock();
        let index = inner.entities.iter().position(|e| e.id == id)?;
        Some(inner.entities.remove(index))
    }

    /// Apply `mutator` to the entity with `id`.
    pub fn update<R>(&self, id: EntityId, mutator: impl FnOnce(&mut Entity) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.entities.iter_mut().find(|e| e.id == id).map(mutator)
    }

    /// Copy of the entity with `id`.
    pub fn get(&self, id: EntityId) -> Option<Entity> {
        let inner = self.inner.lock();
        inner.entities.iter().find(|e| e.id == id).cloned()
    }

    /// Current position of the entity with `id`.
    pub fn position(&self, id: EntityId) -> Option<Point> {
        let inner = self.inner.lock();
        inner.entities.iter().find(|e| e.id == id).map(|e| e.position)
    }

    /// Whether an entity with `id` is live.
    pub fn contains(&self, id: EntityId) -> bool {
        self.inner.lock().entities.iter().any(|e| e.id == id)
    }

    /// Copy of every live entity, in insertion order.
    pub fn snapshot(&self) -> Vec<Entity> {
        self.inner.lock().entities.clone()
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.inner.lock().entities.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entity, returning them.
    pub fn clear(&self) -> Vec<Entity> {
        std::mem::take(&mut self.inner.lock().entities)
    }

    /// Step every entity by `dt` seconds against `reference`.
    pub fn tick(&self, dt: f64, reference: Point) {
        let mut inner = self.inner.lock();
        for entity in inner.entities.iter_mut() {
            behavior::step(entity, dt, reference);
        }
    }
}

impl StoreInner {
    fn allocate(&mut self) -> EntityId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.entities.iter().any(|e| e.id == id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::entity::{Behavior, BehaviorKind};

    fn mirror() -> Entity {
        Entity::new(Behavior::default())
    }

    fn with_id(id: EntityId) -> Entity {
        Entity { id, ..mirror() }
    }

    #[test]
    fn assigns_sequential_ids() {
        let store = EntityStore::new(16);
        assert_eq!(store.add(mirror()).unwrap().id, 1);
        assert_eq!(store.add(mirror()).unwrap().id, 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn explicit_id_bumps_counter() {
        let store = EntityStore::new(16);
        assert_eq!(store.add(with_id(10)).unwrap().id, 10);
        assert_eq!(store.add(mirror()).unwrap().id, 11);
        // A lower free id is accepted as-is.
        assert_eq!(store.add(with_id(3)).unwrap().id, 3);
        assert_eq!(store.add(mirror()).unwrap().id, 12);
    }

    #[test]
    fn duplicate_explicit_id_is_renumbered() {
        let store = EntityStore::new(16);
        store.add(with_id(5)).unwrap();
        let outcome = store.add(with_id(5)).unwrap();
        assert_eq!(outcome.id, 6);
        assert_eq!(outcome.renumbered_from, Some(5));

        let ids: Vec<_> = store.snapshot().iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![5, 6]);
    }

    #[test]
    fn remove_missing_id_leaves_store_unchanged() {
        let store = EntityStore::new(16);
        store.add(mirror()).unwrap();
        assert!(store.remove(42).is_none());
        assert_eq!(store.len(), 1);
        assert!(store.remove(1).is_some());
        assert!(store.is_empty());
    }

    #[test]
    fn capacity_is_enforced() {
        let store = EntityStore::new(2);
        store.add(mirror()).unwrap();
        store.add(mirror()).unwrap();
        assert_eq!(store.add(mirror()), Err(StoreError::Full(2)));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn update_only_touches_target() {
        let store = EntityStore::new(16);
        store.add(mirror()).unwrap();
        store.add(mirror()).unwrap();
        let changed = store.update(2, |e| {
            e.behavior = Behavior::default_for(BehaviorKind::Orbit);
        });
        assert!(changed.is_some());
        assert_eq!(store.get(1).unwrap().kind(), BehaviorKind::Mirror);
        assert_eq!(store.get(2).unwrap().kind(), BehaviorKind::Orbit);
        assert!(store.update(9, |_| ()).is_none());
    }

    #[test]
    fn tick_moves_every_entity() {
        let store = EntityStore::new(16);
        store
            .add(Entity::new(Behavior::Mirror {
                offset_x: 1.0,
                offset_y: 2.0,
            }))
            .unwrap();
        store
            .add(Entity::new(Behavior::Static {
                target: Point::new(9.0, 9.0),
            }))
            .unwrap();
        store.tick(0.016, Point::new(100.0, 100.0));
        assert_eq!(store.position(1), Some(Point::new(101.0, 102.0)));
        assert_eq!(store.position(2), Some(Point::new(9.0, 9.0)));
    }
}
