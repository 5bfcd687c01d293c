use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use crate::aerc::Owner;
use crate::component::{Component, ComponentIndex};
use crate::context::Context;
use crate::entity::{Entity, EntityRef};
use crate::error::{EcsError, Result, keep_first};
use crate::group::{GroupEventKind, GroupId, Subscriber};

/// Identifier of a registered index inside its [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexId(pub(crate) usize);

/// Bounds for index keys.
pub trait IndexKey: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> IndexKey for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// Storage behind a named entity index.
///
/// The context drives it from a group's added/removed events and handles
/// retention: an entity is retained once by the index while `insert`
/// reports it as newly tracked, and released when `remove` reports it gone.
pub trait EntityIndexStorage: Any + Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> String;

    /// Tracks `entity` under the keys derived from it.
    ///
    /// `component` is the component that triggered the update, or `None`
    /// when the index is being populated from an existing group. Returns
    /// `true` if the entity was not tracked before.
    fn insert(&mut self, entity: EntityRef<'_>, component: Option<&dyn Component>) -> Result<bool>;

    /// Stops tracking `entity`. Returns `true` if it was tracked.
    fn remove(&mut self, entity: Entity) -> bool;

    /// Forgets everything, returning the entities that were tracked.
    fn clear(&mut self) -> Vec<Entity>;

    fn as_any(&self) -> &dyn Any;
}

type KeysFn<K> = Box<dyn Fn(EntityRef<'_>, Option<&dyn Component>) -> Vec<K> + Send + Sync>;

/// Tracks the keys of each entity so removal never needs the (possibly
/// already detached) component.
struct KeyTable<K> {
    keys_of: HashMap<Entity, Vec<K>>,
}

impl<K: IndexKey> KeyTable<K> {
    fn new() -> Self {
        Self {
            keys_of: HashMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Non-unique index
// ---------------------------------------------------------------------------

/// Key → entities. Many entities may share a key.
///
/// ```
/// use entitas_ecs::{Context, EntityIndex, Matcher};
///
/// #[derive(Debug, Clone)]
/// struct Team(u8);
///
/// let mut ctx = Context::new(1);
/// let group = ctx.get_group(&Matcher::all_of([0])).unwrap();
/// let index = EntityIndex::new("Team", |e, c| {
///     c.or_else(|| e.get_component(0).ok())
///         .and_then(|c| c.downcast_ref::<Team>())
///         .map_or(0, |t| t.0)
/// });
/// ctx.add_entity_index(group, index).unwrap();
///
/// let e = ctx.create_entity();
/// ctx.add(e, 0, Team(3)).unwrap();
/// assert_eq!(ctx.get_entities_with_key("Team", &3u8).unwrap(), vec![e]);
/// ```
pub struct EntityIndex<K: IndexKey> {
    name: String,
    keys: KeysFn<K>,
    index: HashMap<K, Vec<Entity>>,
    table: KeyTable<K>,
}

impl<K: IndexKey> EntityIndex<K> {
    pub fn new(
        name: impl Into<String>,
        key: impl Fn(EntityRef<'_>, Option<&dyn Component>) -> K + Send + Sync + 'static,
    ) -> Self {
        Self::multi_key(name, move |e, c| vec![key(e, c)])
    }

    /// One entity may be listed under several keys.
    pub fn multi_key(
        name: impl Into<String>,
        keys: impl Fn(EntityRef<'_>, Option<&dyn Component>) -> Vec<K> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            keys: Box::new(keys),
            index: HashMap::new(),
            table: KeyTable::new(),
        }
    }

    /// Entities under `key`, in insertion order. Empty for unknown keys.
    pub fn get_entities(&self, key: &K) -> &[Entity] {
        self.index.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn key_count(&self) -> usize {
        self.index.len()
    }

    fn unlink(&mut self, entity: Entity, keys: Vec<K>) {
        for key in keys {
            if let Some(list) = self.index.get_mut(&key) {
                list.retain(|e| *e != entity);
                if list.is_empty() {
                    self.index.remove(&key);
                }
            }
        }
    }
}

impl<K: IndexKey> EntityIndexStorage for EntityIndex<K> {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!("EntityIndex({})", self.name)
    }

    fn insert(&mut self, entity: EntityRef<'_>, component: Option<&dyn Component>) -> Result<bool> {
        let id = entity.id();
        let keys = (self.keys)(entity, component);
        let previous = self.table.keys_of.remove(&id);
        let fresh = previous.is_none();
        if let Some(previous) = previous {
            self.unlink(id, previous);
        }
        for key in &keys {
            let list = self.index.entry(key.clone()).or_default();
            if !list.contains(&id) {
                list.push(id);
            }
        }
        self.table.keys_of.insert(id, keys);
        Ok(fresh)
    }

    fn remove(&mut self, entity: Entity) -> bool {
        match self.table.keys_of.remove(&entity) {
            Some(keys) => {
                self.unlink(entity, keys);
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) -> Vec<Entity> {
        self.index.clear();
        self.table.keys_of.drain().map(|(e, _)| e).collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Unique index
// ---------------------------------------------------------------------------

/// Key → single entity. A second entity claiming a taken key fails with
/// [`EcsError::DuplicateKey`].
pub struct PrimaryEntityIndex<K: IndexKey> {
    name: String,
    keys: KeysFn<K>,
    index: HashMap<K, Entity>,
    table: KeyTable<K>,
}

impl<K: IndexKey> PrimaryEntityIndex<K> {
    pub fn new(
        name: impl Into<String>,
        key: impl Fn(EntityRef<'_>, Option<&dyn Component>) -> K + Send + Sync + 'static,
    ) -> Self {
        Self::multi_key(name, move |e, c| vec![key(e, c)])
    }

    pub fn multi_key(
        name: impl Into<String>,
        keys: impl Fn(EntityRef<'_>, Option<&dyn Component>) -> Vec<K> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            keys: Box::new(keys),
            index: HashMap::new(),
            table: KeyTable::new(),
        }
    }

    pub fn get_entity(&self, key: &K) -> Option<Entity> {
        self.index.get(key).copied()
    }

    pub fn key_count(&self) -> usize {
        self.index.len()
    }
}

impl<K: IndexKey> EntityIndexStorage for PrimaryEntityIndex<K> {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!("PrimaryEntityIndex({})", self.name)
    }

    fn insert(&mut self, entity: EntityRef<'_>, component: Option<&dyn Component>) -> Result<bool> {
        let id = entity.id();
        let keys = (self.keys)(entity, component);
        if let Some(key) = keys
            .iter()
            .find(|key| self.index.get(*key).is_some_and(|owner| *owner != id))
        {
            return Err(EcsError::DuplicateKey {
                index: self.name.clone(),
                key: format!("{key:?}"),
            });
        }

        let fresh = match self.table.keys_of.remove(&id) {
            Some(previous) => {
                for key in previous {
                    self.index.remove(&key);
                }
                false
            }
            None => true,
        };
        for key in &keys {
            self.index.insert(key.clone(), id);
        }
        self.table.keys_of.insert(id, keys);
        Ok(fresh)
    }

    fn remove(&mut self, entity: Entity) -> bool {
        match self.table.keys_of.remove(&entity) {
            Some(keys) => {
                for key in keys {
                    self.index.remove(&key);
                }
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) -> Vec<Entity> {
        self.index.clear();
        self.table.keys_of.drain().map(|(e, _)| e).collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

pub(crate) struct IndexEntry {
    group: GroupId,
    owner: Owner,
    active: bool,
    storage: Box<dyn EntityIndexStorage>,
}

impl Context {
    /// Registers `index` under its name and populates it from `group`.
    ///
    /// Fails with [`EcsError::IndexAlreadyExists`] if the name is taken.
    pub fn add_entity_index(
        &mut self,
        group: GroupId,
        index: impl EntityIndexStorage,
    ) -> Result<IndexId> {
        let name = index.name().to_string();
        if self.index_names.contains_key(&name) {
            return Err(EcsError::IndexAlreadyExists {
                name,
                context: self.info.name.clone(),
            });
        }

        let id = IndexId(self.indices.len());
        log::debug!(
            "{}: registering {} over {}",
            self.info.name,
            index.description(),
            self.groups[group.0]
        );
        self.indices.push(IndexEntry {
            group,
            owner: Owner::new(),
            active: false,
            storage: Box::new(index),
        });
        self.index_names.insert(name, id);
        self.groups[group.0].subscribe(GroupEventKind::Added, Subscriber::Index(id));
        self.groups[group.0].subscribe(GroupEventKind::Removed, Subscriber::Index(id));
        self.activate_entity_index(id)?;
        Ok(id)
    }

    /// Fails with [`EcsError::IndexNotFound`] for unknown names.
    pub fn get_entity_index(&self, name: &str) -> Result<IndexId> {
        self.index_names
            .get(name)
            .copied()
            .ok_or_else(|| EcsError::IndexNotFound {
                name: name.to_string(),
                context: self.info.name.clone(),
            })
    }

    pub fn entity_index_storage(&self, id: IndexId) -> &dyn EntityIndexStorage {
        &*self.indices[id.0].storage
    }

    /// Typed access to a registered index.
    ///
    /// Fails with [`EcsError::IndexNotFound`] if no index of type `I` is
    /// registered under `name`.
    pub fn entity_index<I: EntityIndexStorage>(&self, name: &str) -> Result<&I> {
        let id = self.get_entity_index(name)?;
        self.indices[id.0]
            .storage
            .as_any()
            .downcast_ref::<I>()
            .ok_or_else(|| EcsError::IndexNotFound {
                name: name.to_string(),
                context: self.info.name.clone(),
            })
    }

    /// Entities under `key` in the [`EntityIndex<K>`] named `name`.
    pub fn get_entities_with_key<K: IndexKey>(&self, name: &str, key: &K) -> Result<Vec<Entity>> {
        Ok(self.entity_index::<EntityIndex<K>>(name)?.get_entities(key).to_vec())
    }

    /// Entity under `key` in the [`PrimaryEntityIndex<K>`] named `name`.
    pub fn get_entity_with_key<K: IndexKey>(&self, name: &str, key: &K) -> Result<Option<Entity>> {
        Ok(self.entity_index::<PrimaryEntityIndex<K>>(name)?.get_entity(key))
    }

    /// Stops maintaining the index and releases every tracked entity.
    pub fn deactivate_entity_index(&mut self, id: IndexId) -> Result<()> {
        let entry = &mut self.indices[id.0];
        entry.active = false;
        let owner = entry.owner;
        let tracked = entry.storage.clear();

        let mut first_err = None;
        for entity in tracked {
            keep_first(&mut first_err, self.release(entity, owner));
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Resumes maintenance, re-indexing the group's current members.
    pub fn activate_entity_index(&mut self, id: IndexId) -> Result<()> {
        let entry = &mut self.indices[id.0];
        if entry.active {
            return Ok(());
        }
        entry.active = true;
        let members = self.groups[entry.group.0].entities();
        for &entity in members.iter() {
            self.index_entity(id, entity, None)?;
        }
        Ok(())
    }

    pub(crate) fn index_entity_added(
        &mut self,
        id: IndexId,
        entity: Entity,
        index: ComponentIndex,
    ) -> Result<()> {
        self.index_entity(id, entity, Some(index))
    }

    fn index_entity(
        &mut self,
        id: IndexId,
        entity: Entity,
        trigger: Option<ComponentIndex>,
    ) -> Result<()> {
        if !self.indices[id.0].active {
            return Ok(());
        }
        let idx = self.check(entity)?;
        let slot = &self.slots[idx];
        let view = EntityRef::new(entity, slot, &self.names);
        let component = trigger
            .and_then(|i| slot.components.get(i))
            .and_then(|c| c.as_deref());

        let entry = &mut self.indices[id.0];
        let owner = entry.owner;
        if entry.storage.insert(view, component)? {
            self.retain(entity, owner)?;
        }
        Ok(())
    }

    pub(crate) fn index_entity_removed(&mut self, id: IndexId, entity: Entity) -> Result<()> {
        let entry = &mut self.indices[id.0];
        if !entry.active {
            return Ok(());
        }
        let owner = entry.owner;
        if entry.storage.remove(entity) {
            self.release(entity, owner)?;
        }
        Ok(())
    }
}
