use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use fixedbitset::FixedBitSet;

use crate::aerc::{AercFactory, Owner, SafeAerc};
use crate::collector::Collector;
use crate::component::{Component, ComponentFactory, ComponentIndex, ComponentPool};
use crate::context_info::ContextInfo;
use crate::entity::{Entity, EntityListeners, EntityRef, EntitySlot, missing, type_mismatch};
use crate::entity_index::IndexEntry;
use crate::error::{EcsError, Result, keep_first};
use crate::events::{
    ComponentChanged, ComponentHandler, EntityHandler, GroupCreatedHandler, ListenerId, Listeners,
};
use crate::group::{Group, GroupId};
use crate::matcher::Matcher;

/// Context-wide subscriber lists.
#[derive(Default)]
struct ContextListeners {
    created: Listeners<EntityHandler>,
    will_be_destroyed: Listeners<EntityHandler>,
    destroyed: Listeners<EntityHandler>,
    group_created: Listeners<GroupCreatedHandler>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and builds a [`Context`].
///
/// # Example
///
/// ```
/// use entitas_ecs::{ContextBuilder, ContextInfo, UnsafeAerc};
///
/// #[derive(Debug, Clone, Default)]
/// struct Position(f32, f32);
///
/// let ctx = ContextBuilder::new(2)
///     .info(ContextInfo::new("Game", vec!["Position".into(), "Velocity".into()]))
///     .start_creation_index(100)
///     .aerc(UnsafeAerc::factory())
///     .component_default::<Position>(0)
///     .build()
///     .unwrap();
/// assert_eq!(ctx.to_string(), "Game");
/// ```
pub struct ContextBuilder {
    total_components: usize,
    info: Option<ContextInfo>,
    start_creation_index: u32,
    aerc: AercFactory,
    factories: Vec<(ComponentIndex, ComponentFactory)>,
}

impl ContextBuilder {
    pub fn new(total_components: usize) -> Self {
        Self {
            total_components,
            info: None,
            start_creation_index: 0,
            aerc: SafeAerc::factory(),
            factories: Vec::new(),
        }
    }

    /// Identity descriptor. Defaults to [`ContextInfo::unnamed`].
    pub fn info(mut self, info: ContextInfo) -> Self {
        self.info = Some(info);
        self
    }

    pub fn start_creation_index(mut self, index: u32) -> Self {
        self.start_creation_index = index;
        self
    }

    /// Ownership strategy for every entity. Defaults to [`SafeAerc`].
    pub fn aerc(mut self, factory: AercFactory) -> Self {
        self.aerc = factory;
        self
    }

    /// Registers the constructor used when `index`'s pool is empty.
    pub fn component_factory(
        mut self,
        index: ComponentIndex,
        factory: impl Fn() -> Box<dyn Component> + Send + Sync + 'static,
    ) -> Self {
        self.factories.push((index, Arc::new(factory)));
        self
    }

    /// Registers `T::default()` as the constructor for `index`.
    pub fn component_default<T: Component + Default>(self, index: ComponentIndex) -> Self {
        self.component_factory(index, || Box::new(T::default()))
    }

    /// Fails with [`EcsError::ComponentNameCountMismatch`] if the info's
    /// name table does not cover every component index.
    pub fn build(mut self) -> Result<Context> {
        let info = self
            .info
            .take()
            .unwrap_or_else(|| ContextInfo::unnamed(self.total_components));
        info.validate(self.total_components)?;
        let factories = self.factory_table()?;
        Ok(self.into_context(info, factories))
    }

    fn factory_table(&mut self) -> Result<Vec<Option<ComponentFactory>>> {
        let total = self.total_components;
        let mut table: Vec<Option<ComponentFactory>> = vec![None; total];
        for (index, factory) in self.factories.drain(..) {
            let slot = table
                .get_mut(index)
                .ok_or(EcsError::ComponentIndexOutOfRange { index, total })?;
            *slot = Some(factory);
        }
        Ok(table)
    }

    fn into_context(self, info: ContextInfo, factories: Vec<Option<ComponentFactory>>) -> Context {
        let total = self.total_components;
        Context {
            names: info.shared_names(),
            info,
            total_components: total,
            owner: Owner::new(),
            slots: Vec::new(),
            free_list: Vec::new(),
            live: FixedBitSet::new(),
            live_count: 0,
            retained: FixedBitSet::new(),
            entities_cache: OnceLock::new(),
            start_creation_index: self.start_creation_index,
            creation_index: self.start_creation_index,
            component_pools: (0..total).map(|_| Vec::new()).collect(),
            factories,
            aerc_factory: self.aerc,
            groups: Vec::new(),
            group_lookup: HashMap::new(),
            groups_for_index: vec![Vec::new(); total],
            collectors: Vec::new(),
            indices: Vec::new(),
            index_names: HashMap::new(),
            listeners: ContextListeners::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Entity registry and the sole mutation entry point.
///
/// Owns the entity arena and free list, one object pool per component
/// index, the matcher→group cache, collectors and named entity indices.
/// Every mutation propagates synchronously: groups update their membership,
/// then collectors, indices and listeners observe the change before the
/// mutating call returns.
///
/// # Example
///
/// ```
/// use entitas_ecs::{Context, Matcher};
///
/// #[derive(Debug, Clone)]
/// struct Position(i32, i32);
///
/// let mut ctx = Context::new(3);
/// let e = ctx.create_entity();
/// ctx.add(e, 1, Position(0, 0)).unwrap();
///
/// let group = ctx.get_group(&Matcher::all_of([1])).unwrap();
/// assert!(ctx.group(group).contains(e));
/// ```
pub struct Context {
    pub(crate) info: ContextInfo,
    pub(crate) names: Arc<[String]>,
    pub(crate) total_components: usize,
    pub(crate) owner: Owner,
    pub(crate) slots: Vec<EntitySlot>,
    /// Recyclable slot indices (LIFO stack).
    free_list: Vec<u32>,
    live: FixedBitSet,
    live_count: usize,
    /// Destroyed slots still retained by some owner.
    retained: FixedBitSet,
    entities_cache: OnceLock<Arc<[Entity]>>,
    start_creation_index: u32,
    creation_index: u32,
    component_pools: Vec<ComponentPool>,
    factories: Vec<Option<ComponentFactory>>,
    aerc_factory: AercFactory,
    pub(crate) groups: Vec<Group>,
    pub(crate) group_lookup: HashMap<Matcher, GroupId>,
    pub(crate) groups_for_index: Vec<Vec<GroupId>>,
    pub(crate) collectors: Vec<Collector>,
    pub(crate) indices: Vec<IndexEntry>,
    pub(crate) index_names: HashMap<String, crate::entity_index::IndexId>,
    listeners: ContextListeners,
}

impl Context {
    /// Unnamed context with `total_components` slots per entity and the
    /// default [`SafeAerc`] strategy.
    pub fn new(total_components: usize) -> Self {
        ContextBuilder::new(total_components).into_context(
            ContextInfo::unnamed(total_components),
            vec![None; total_components],
        )
    }

    pub fn builder(total_components: usize) -> ContextBuilder {
        ContextBuilder::new(total_components)
    }

    pub fn info(&self) -> &ContextInfo {
        &self.info
    }

    pub fn component_names(&self) -> &[String] {
        &self.names
    }

    pub fn total_components(&self) -> usize {
        self.total_components
    }

    /// The owner token under which this context retains its own entities.
    pub fn owner(&self) -> Owner {
        self.owner
    }

    // -- handle resolution --------------------------------------------------

    /// Resolves a handle to its slot index, rejecting recycled handles.
    pub(crate) fn check(&self, entity: Entity) -> Result<usize> {
        let idx = entity.slot();
        match self.slots.get(idx) {
            Some(slot) if slot.alive && slot.generation == entity.generation() => Ok(idx),
            _ => Err(EcsError::UnknownEntity(entity)),
        }
    }

    pub(crate) fn check_index(&self, index: ComponentIndex) -> Result<()> {
        if index < self.total_components {
            Ok(())
        } else {
            Err(EcsError::ComponentIndexOutOfRange {
                index,
                total: self.total_components,
            })
        }
    }

    fn check_enabled(&self, idx: usize, action: &'static str) -> Result<()> {
        let slot = &self.slots[idx];
        if slot.enabled {
            Ok(())
        } else {
            Err(EcsError::NotEnabled {
                action,
                entity: slot.description().to_string(),
            })
        }
    }

    /// Read-only view of an entity. Works for destroyed entities that are
    /// still retained.
    pub fn entity(&self, entity: Entity) -> Result<EntityRef<'_>> {
        let idx = self.check(entity)?;
        Ok(EntityRef::new(entity, &self.slots[idx], &self.names))
    }

    /// `Entity_{creation_index}(Component, ...)`.
    pub fn describe(&self, entity: Entity) -> Result<Arc<str>> {
        Ok(self.entity(entity)?.description())
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Creates an entity, recycling a released slot when one is available.
    ///
    /// The context retains every entity it hands out.
    pub fn create_entity(&mut self) -> Entity {
        let creation_index = self.creation_index;
        self.creation_index = self.creation_index.wrapping_add(1);

        let idx = match self.free_list.pop() {
            Some(idx) => {
                log::trace!("Reusing entity slot {idx} for creation index {creation_index}");
                idx as usize
            }
            None => {
                self.slots
                    .push(EntitySlot::new(self.total_components, (self.aerc_factory)()));
                let len = self.slots.len();
                self.live.grow(len);
                self.retained.grow(len);
                len - 1
            }
        };

        let owner = self.owner;
        let slot = &mut self.slots[idx];
        slot.creation_index = creation_index;
        slot.alive = true;
        slot.enabled = true;
        slot.invalidate_composition();
        // A freshly recycled slot always has a zero count.
        if let Err(err) = slot.aerc.retain(owner) {
            log::error!("Context failed to retain new entity slot {idx}: {err}");
        }
        let entity = Entity::new(idx as u32, slot.generation);

        self.live.insert(idx);
        self.live_count += 1;
        self.entities_cache = OnceLock::new();

        for handler in self.listeners.created.snapshot() {
            handler(self, entity);
        }
        entity
    }

    /// Destroys an entity: removes every component (each removal fires its
    /// events), disables it and gives up the context's own retention.
    ///
    /// Fires "will be destroyed" while the entity is still fully queryable
    /// (it is already gone from [`get_entities`](Self::get_entities)) and
    /// "destroyed" afterwards. An entity no one else retains returns to the
    /// free list immediately; otherwise it stays destroyed-but-retained until
    /// the last owner releases it.
    pub fn destroy_entity(&mut self, entity: Entity) -> Result<()> {
        let idx = self.check(entity)?;
        self.check_enabled(idx, "destroy")?;

        for handler in self.slots[idx].listeners.destroying.snapshot() {
            handler(self, entity);
        }
        if self.check(entity).is_err() || !self.slots[idx].enabled {
            // Destroyed from inside a destroying handler.
            return Ok(());
        }

        self.live.set(idx, false);
        self.live_count -= 1;
        self.entities_cache = OnceLock::new();

        for handler in self.listeners.will_be_destroyed.snapshot() {
            handler(self, entity);
        }

        let mut first_err = None;
        self.slots[idx].enabled = false;
        keep_first(&mut first_err, self.remove_all_components_internal(entity, idx));
        self.slots[idx].listeners.clear_component_listeners();

        for handler in self.listeners.destroyed.snapshot() {
            handler(self, entity);
        }

        if self.slots[idx].aerc.retain_count() > 1 {
            self.retained.insert(idx);
        }
        let owner = self.owner;
        keep_first(&mut first_err, self.release(entity, owner));
        first_err.map_or(Ok(()), Err)
    }

    /// Destroys every live entity.
    ///
    /// Fails with [`EcsError::EntitiesStillRetained`] if any destroyed entity
    /// is still retained by an owner other than the context. Releasing those
    /// owners and calling again succeeds.
    pub fn destroy_all_entities(&mut self) -> Result<()> {
        let entities = self.get_entities();
        let mut first_err = None;
        for &entity in entities.iter() {
            if self.has_entity(entity) {
                keep_first(&mut first_err, self.destroy_entity(entity));
            }
        }
        if let Some(err) = first_err {
            return Err(err);
        }

        if self.retained.count_ones(..) > 0 {
            let retained: Vec<String> = self
                .retained
                .ones()
                .map(|idx| self.slots[idx].description().to_string())
                .collect();
            log::warn!(
                "{} still has {} retained entities after destroying all entities: {}",
                self.info.name,
                retained.len(),
                retained.join(", ")
            );
            return Err(EcsError::EntitiesStillRetained {
                context: self.info.name.clone(),
                entities: retained.join(", "),
            });
        }
        Ok(())
    }

    /// Restarts creation indices at the configured start value.
    pub fn reset_creation_index(&mut self) {
        self.creation_index = self.start_creation_index;
    }

    /// Destroys all entities, resets the creation index and drops every
    /// context-level event handler.
    pub fn reset(&mut self) -> Result<()> {
        self.destroy_all_entities()?;
        self.reset_creation_index();
        self.remove_all_event_handlers();
        Ok(())
    }

    /// `true` for live (created and not yet destroyed) entities.
    pub fn has_entity(&self, entity: Entity) -> bool {
        self.check(entity)
            .map(|idx| self.live.contains(idx))
            .unwrap_or(false)
    }

    /// Snapshot of all live entities in slot order. Cached until an entity
    /// is created or destroyed.
    pub fn get_entities(&self) -> Arc<[Entity]> {
        self.entities_cache
            .get_or_init(|| {
                self.live
                    .ones()
                    .map(|idx| Entity::new(idx as u32, self.slots[idx].generation))
                    .collect()
            })
            .clone()
    }

    /// Live entities matching `matcher` (through its group).
    pub fn get_entities_matching(&mut self, matcher: &Matcher) -> Result<Arc<[Entity]>> {
        let group = self.get_group(matcher)?;
        Ok(self.groups[group.0].entities())
    }

    /// Number of live entities.
    pub fn count(&self) -> usize {
        self.live_count
    }

    pub fn creation_index(&self) -> u32 {
        self.creation_index
    }

    /// Released slots waiting in the free list.
    pub fn reusable_entities_count(&self) -> usize {
        self.free_list.len()
    }

    /// Destroyed entities still retained by other owners.
    pub fn retained_entities_count(&self) -> usize {
        self.retained.count_ones(..)
    }

    // -- retain / release ---------------------------------------------------

    pub fn retain(&mut self, entity: Entity, owner: Owner) -> Result<()> {
        let idx = self.check(entity)?;
        let slot = &mut self.slots[idx];
        slot.aerc
            .retain(owner)
            .map_err(|err| EcsError::from_aerc(err, slot.description().to_string()))
    }

    /// Releases `owner`'s retention.
    ///
    /// Dropping the last retention of a destroyed entity fires its released
    /// listeners once and returns the slot to the free list. Dropping the
    /// last retention of a live entity fails with
    /// [`EcsError::EntityNotDestroyed`] and changes nothing.
    pub fn release(&mut self, entity: Entity, owner: Owner) -> Result<()> {
        let idx = self.check(entity)?;
        let slot = &mut self.slots[idx];
        if slot.enabled && slot.aerc.retain_count() == 1 && slot.aerc.is_retained_by(owner) {
            return Err(EcsError::EntityNotDestroyed(slot.description().to_string()));
        }
        slot.aerc
            .release(owner)
            .map_err(|err| EcsError::from_aerc(err, slot.description().to_string()))?;

        if slot.aerc.retain_count() == 0 {
            self.finish_release(entity, idx);
        }
        Ok(())
    }

    pub fn retain_count(&self, entity: Entity) -> Result<usize> {
        Ok(self.entity(entity)?.retain_count())
    }

    fn finish_release(&mut self, entity: Entity, idx: usize) {
        for handler in self.slots[idx].listeners.released.snapshot() {
            handler(self, entity);
        }
        let slot = &mut self.slots[idx];
        if slot.aerc.retain_count() != 0 {
            // Re-retained by a released handler.
            return;
        }
        slot.listeners = EntityListeners::default();
        slot.alive = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.retained.set(idx, false);
        self.free_list.push(idx as u32);
    }

    // -- component access ---------------------------------------------------

    /// Adds `component` at `index` and notifies groups and listeners.
    ///
    /// Fails with [`EcsError::NotEnabled`] for destroyed entities and
    /// [`EcsError::DuplicateComponent`] if the slot is occupied.
    pub fn add_component(
        &mut self,
        entity: Entity,
        index: ComponentIndex,
        component: Box<dyn Component>,
    ) -> Result<()> {
        let idx = self.check(entity)?;
        self.check_index(index)?;
        self.check_enabled(idx, "add component to")?;
        let slot = &mut self.slots[idx];
        if slot.has(index) {
            return Err(EcsError::DuplicateComponent {
                component: self.names[index].clone(),
                entity: slot.description().to_string(),
            });
        }

        slot.components[index] = Some(component);
        slot.mask.insert(index);
        slot.invalidate_composition();

        let mut first_err = None;
        keep_first(
            &mut first_err,
            self.update_groups_added_or_removed(entity, index, None),
        );
        let event = ComponentChanged {
            entity,
            index,
            previous: None,
        };
        let handlers = match self.check(entity) {
            Ok(_) => self.slots[idx].listeners.added.snapshot(),
            Err(_) => Vec::new(),
        };
        for handler in handlers {
            handler(self, &event);
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Typed [`add_component`](Self::add_component) that reuses a pooled
    /// instance of the same type when one is available.
    pub fn add<T: Component>(&mut self, entity: Entity, index: ComponentIndex, value: T) -> Result<()> {
        let component = self.create_component_with(index, value)?;
        self.add_component(entity, index, component)
    }

    /// Removes the component at `index`, returning the instance to the pool.
    pub fn remove_component(&mut self, entity: Entity, index: ComponentIndex) -> Result<()> {
        let idx = self.check(entity)?;
        self.check_index(index)?;
        self.check_enabled(idx, "remove component from")?;
        if !self.slots[idx].has(index) {
            return Err(missing(
                &self.names,
                &self.slots[idx],
                index,
                "remove",
                "removing",
            ));
        }
        self.remove_component_internal(entity, idx, index)
    }

    /// Replaces the component at `index`.
    ///
    /// Adds if the slot is empty and removes if `component` is `None`.
    /// Otherwise the new instance is installed first, groups and listeners
    /// see a single replacement, and the old instance goes to the pool.
    pub fn replace_component(
        &mut self,
        entity: Entity,
        index: ComponentIndex,
        component: Option<Box<dyn Component>>,
    ) -> Result<()> {
        let idx = self.check(entity)?;
        self.check_index(index)?;
        self.check_enabled(idx, "replace component of")?;

        let has = self.slots[idx].has(index);
        match component {
            None if has => self.remove_component_internal(entity, idx, index),
            None => Ok(()),
            Some(component) if !has => self.add_component(entity, index, component),
            Some(component) => {
                let slot = &mut self.slots[idx];
                let previous = slot.components[index].replace(component);
                slot.invalidate_description();
                let result = self.dispatch_replaced(entity, idx, index, previous.as_deref());
                if let Some(previous) = previous {
                    self.component_pools[index].push(previous);
                }
                result
            }
        }
    }

    /// Typed [`replace_component`](Self::replace_component).
    pub fn replace<T: Component>(
        &mut self,
        entity: Entity,
        index: ComponentIndex,
        value: T,
    ) -> Result<()> {
        let component = self.create_component_with(index, value)?;
        self.replace_component(entity, index, Some(component))
    }

    /// Mutates the stored instance in place and fires "replaced" with the
    /// same instance as old and new value.
    ///
    /// Cached component views are kept.
    pub fn update_component(
        &mut self,
        entity: Entity,
        index: ComponentIndex,
        f: impl FnOnce(&mut dyn Component),
    ) -> Result<()> {
        let idx = self.check(entity)?;
        self.check_index(index)?;
        self.check_enabled(idx, "replace component of")?;
        match self.slots[idx].components[index].as_deref_mut() {
            Some(component) => f(component),
            None => {
                return Err(missing(
                    &self.names,
                    &self.slots[idx],
                    index,
                    "replace",
                    "replacing",
                ));
            }
        }
        self.dispatch_replaced(entity, idx, index, None)
    }

    /// Typed [`update_component`](Self::update_component).
    pub fn update<T: Component>(
        &mut self,
        entity: Entity,
        index: ComponentIndex,
        f: impl FnOnce(&mut T),
    ) -> Result<()> {
        let view = self.entity(entity)?;
        if view.is_enabled() && view.has_component(index) && view.try_get::<T>(index).is_none() {
            return Err(type_mismatch::<T>(
                &self.names,
                &self.slots[entity.slot()],
                index,
            ));
        }
        self.update_component(entity, index, |component| {
            if let Some(value) = component.downcast_mut::<T>() {
                f(value);
            }
        })
    }

    /// Removes every component, one index at a time.
    pub fn remove_all_components(&mut self, entity: Entity) -> Result<()> {
        let idx = self.check(entity)?;
        self.check_enabled(idx, "remove all components from")?;
        self.remove_all_components_internal(entity, idx)
    }

    fn remove_all_components_internal(&mut self, entity: Entity, idx: usize) -> Result<()> {
        let mut first_err = None;
        let indices = self.slots[idx].component_indices();
        for &index in indices.iter() {
            if self.check(entity).is_err() {
                break;
            }
            if self.slots[idx].has(index) {
                keep_first(
                    &mut first_err,
                    self.remove_component_internal(entity, idx, index),
                );
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn remove_component_internal(
        &mut self,
        entity: Entity,
        idx: usize,
        index: ComponentIndex,
    ) -> Result<()> {
        let slot = &mut self.slots[idx];
        let Some(previous) = slot.components[index].take() else {
            return Ok(());
        };
        slot.mask.set(index, false);
        slot.invalidate_composition();

        let mut first_err = None;
        keep_first(
            &mut first_err,
            self.update_groups_added_or_removed(entity, index, Some(&*previous)),
        );
        let event = ComponentChanged {
            entity,
            index,
            previous: Some(&*previous),
        };
        let handlers = match self.check(entity) {
            Ok(_) => self.slots[idx].listeners.removed.snapshot(),
            Err(_) => Vec::new(),
        };
        for handler in handlers {
            handler(self, &event);
        }
        self.component_pools[index].push(previous);
        first_err.map_or(Ok(()), Err)
    }

    fn dispatch_replaced(
        &mut self,
        entity: Entity,
        idx: usize,
        index: ComponentIndex,
        previous: Option<&dyn Component>,
    ) -> Result<()> {
        let result = self.update_groups_replaced(entity, index, previous);
        let event = ComponentChanged {
            entity,
            index,
            previous,
        };
        let handlers = match self.check(entity) {
            Ok(_) => self.slots[idx].listeners.replaced.snapshot(),
            Err(_) => Vec::new(),
        };
        for handler in handlers {
            handler(self, &event);
        }
        result
    }

    pub fn has_component(&self, entity: Entity, index: ComponentIndex) -> Result<bool> {
        Ok(self.entity(entity)?.has_component(index))
    }

    pub fn get_component(&self, entity: Entity, index: ComponentIndex) -> Result<&dyn Component> {
        self.entity(entity)?.get_component(index)
    }

    /// Typed read. Fails with [`EcsError::ComponentTypeMismatch`] if the
    /// slot holds another type.
    pub fn get<T: Component>(&self, entity: Entity, index: ComponentIndex) -> Result<&T> {
        self.entity(entity)?.get::<T>(index)
    }

    pub fn get_components(&self, entity: Entity) -> Result<Vec<&dyn Component>> {
        Ok(self.entity(entity)?.get_components())
    }

    pub fn get_component_indices(&self, entity: Entity) -> Result<Arc<[ComponentIndex]>> {
        Ok(self.entity(entity)?.get_component_indices())
    }

    /// Copies components of `source` onto `target`.
    ///
    /// `indices` restricts the copy; `None` copies every component. Copies
    /// are written into pooled instances of `target`'s context when the type
    /// matches. Without `replace_existing`, an occupied target slot fails
    /// with [`EcsError::DuplicateComponent`].
    pub fn copy_to(
        &mut self,
        source: Entity,
        target: Entity,
        replace_existing: bool,
        indices: Option<&[ComponentIndex]>,
    ) -> Result<()> {
        let src = self.check(source)?;
        self.check(target)?;
        let indices: Vec<ComponentIndex> = match indices {
            Some(indices) => indices.to_vec(),
            None => self.slots[src].component_indices().to_vec(),
        };

        for index in indices {
            self.check_index(index)?;
            let Some(original) = self.slots[src].components[index].as_deref() else {
                return Err(missing(&self.names, &self.slots[src], index, "get", "getting"));
            };
            let pool = &mut self.component_pools[index];
            let copy = match pool.pop() {
                Some(mut pooled) => {
                    if original.clone_into_component(&mut *pooled) {
                        pooled
                    } else {
                        pool.push(pooled);
                        original.clone_boxed()
                    }
                }
                None => original.clone_boxed(),
            };

            if replace_existing {
                self.replace_component(target, index, Some(copy))?;
            } else {
                self.add_component(target, index, copy)?;
            }
        }
        Ok(())
    }

    // -- component pools ----------------------------------------------------

    /// Pops a pooled instance for `index` or builds one with the registered
    /// factory.
    pub fn create_component(&mut self, index: ComponentIndex) -> Result<Box<dyn Component>> {
        self.check_index(index)?;
        if let Some(pooled) = self.component_pools[index].pop() {
            return Ok(pooled);
        }
        match &self.factories[index] {
            Some(factory) => Ok(factory()),
            None => Err(EcsError::NoComponentFactory(self.names[index].clone())),
        }
    }

    /// Boxes `value`, reusing a pooled instance of type `T` if available.
    pub fn create_component_with<T: Component>(
        &mut self,
        index: ComponentIndex,
        value: T,
    ) -> Result<Box<dyn Component>> {
        self.check_index(index)?;
        let pool = &mut self.component_pools[index];
        if let Some(mut pooled) = pool.pop() {
            if let Some(slot) = pooled.downcast_mut::<T>() {
                *slot = value;
                return Ok(pooled);
            }
            pool.push(pooled);
        }
        Ok(Box::new(value))
    }

    pub fn get_component_pool(&self, index: ComponentIndex) -> Result<&ComponentPool> {
        self.check_index(index)?;
        Ok(&self.component_pools[index])
    }

    pub fn get_component_pool_mut(&mut self, index: ComponentIndex) -> Result<&mut ComponentPool> {
        self.check_index(index)?;
        Ok(&mut self.component_pools[index])
    }

    /// Discards pooled instances of one index. Live components are untouched.
    pub fn clear_component_pool(&mut self, index: ComponentIndex) -> Result<()> {
        self.check_index(index)?;
        self.component_pools[index].clear();
        Ok(())
    }

    pub fn clear_component_pools(&mut self) {
        for pool in &mut self.component_pools {
            pool.clear();
        }
    }

    // -- events -------------------------------------------------------------

    pub fn on_entity_created(
        &mut self,
        handler: impl Fn(&mut Context, Entity) + Send + Sync + 'static,
    ) -> ListenerId {
        self.listeners.created.add(Arc::new(handler))
    }

    /// Fires before a destroyed entity loses its components.
    pub fn on_entity_will_be_destroyed(
        &mut self,
        handler: impl Fn(&mut Context, Entity) + Send + Sync + 'static,
    ) -> ListenerId {
        self.listeners.will_be_destroyed.add(Arc::new(handler))
    }

    pub fn on_entity_destroyed(
        &mut self,
        handler: impl Fn(&mut Context, Entity) + Send + Sync + 'static,
    ) -> ListenerId {
        self.listeners.destroyed.add(Arc::new(handler))
    }

    pub fn on_group_created(
        &mut self,
        handler: impl Fn(&mut Context, GroupId) + Send + Sync + 'static,
    ) -> ListenerId {
        self.listeners.group_created.add(Arc::new(handler))
    }

    pub(crate) fn fire_group_created(&mut self, group: GroupId) {
        for handler in self.listeners.group_created.snapshot() {
            handler(self, group);
        }
    }

    /// Unsubscribes a context-level listener.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let l = &mut self.listeners;
        l.created.remove(id)
            || l.will_be_destroyed.remove(id)
            || l.destroyed.remove(id)
            || l.group_created.remove(id)
    }

    /// Drops every context-level handler. Idempotent.
    ///
    /// Group, collector and index subscriptions are unaffected.
    pub fn remove_all_event_handlers(&mut self) {
        self.listeners = ContextListeners::default();
    }

    fn entity_listeners(&mut self, entity: Entity) -> Result<&mut EntityListeners> {
        let idx = self.check(entity)?;
        Ok(&mut self.slots[idx].listeners)
    }

    pub fn on_component_added(
        &mut self,
        entity: Entity,
        handler: impl Fn(&mut Context, &ComponentChanged<'_>) + Send + Sync + 'static,
    ) -> Result<ListenerId> {
        let handler: Arc<ComponentHandler> = Arc::new(handler);
        Ok(self.entity_listeners(entity)?.added.add(handler))
    }

    pub fn on_component_removed(
        &mut self,
        entity: Entity,
        handler: impl Fn(&mut Context, &ComponentChanged<'_>) + Send + Sync + 'static,
    ) -> Result<ListenerId> {
        let handler: Arc<ComponentHandler> = Arc::new(handler);
        Ok(self.entity_listeners(entity)?.removed.add(handler))
    }

    pub fn on_component_replaced(
        &mut self,
        entity: Entity,
        handler: impl Fn(&mut Context, &ComponentChanged<'_>) + Send + Sync + 'static,
    ) -> Result<ListenerId> {
        let handler: Arc<ComponentHandler> = Arc::new(handler);
        Ok(self.entity_listeners(entity)?.replaced.add(handler))
    }

    /// Fires when a destroy starts, before any component is removed.
    pub fn on_entity_destroying(
        &mut self,
        entity: Entity,
        handler: impl Fn(&mut Context, Entity) + Send + Sync + 'static,
    ) -> Result<ListenerId> {
        Ok(self
            .entity_listeners(entity)?
            .destroying
            .add(Arc::new(handler)))
    }

    /// Fires once when the last retention of a destroyed entity is released.
    pub fn on_entity_released(
        &mut self,
        entity: Entity,
        handler: impl Fn(&mut Context, Entity) + Send + Sync + 'static,
    ) -> Result<ListenerId> {
        Ok(self.entity_listeners(entity)?.released.add(Arc::new(handler)))
    }

    pub fn remove_entity_listener(&mut self, entity: Entity, id: ListenerId) -> Result<bool> {
        let l = self.entity_listeners(entity)?;
        Ok(l.added.remove(id)
            || l.removed.remove(id)
            || l.replaced.remove(id)
            || l.destroying.remove(id)
            || l.released.remove(id))
    }

    /// Drops every listener attached to one entity. Idempotent.
    pub fn remove_all_entity_event_handlers(&mut self, entity: Entity) -> Result<()> {
        *self.entity_listeners(entity)? = EntityListeners::default();
        Ok(())
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.info.name)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.info.name)
            .field("entities", &self.live_count)
            .field("groups", &self.groups.len())
            .finish()
    }
}
