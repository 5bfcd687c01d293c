use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};

use fixedbitset::FixedBitSet;

use crate::aerc::{Aerc, Owner};
use crate::component::{Component, ComponentIndex};
use crate::error::{EcsError, Result};
use crate::events::{ComponentHandler, EntityHandler, Listeners};

/// A generational handle to an entity slot of a [`Context`](crate::Context).
///
/// Layout: `u32 index` + `u32 generation`.
///
/// - **index**: slot index in the context's entity arena
/// - **generation**: bumped whenever the slot returns to the free list, so
///   handles to a recycled slot are detected as stale
///
/// # Example
///
/// ```
/// use entitas_ecs::Context;
///
/// let mut ctx = Context::new(2);
/// let e = ctx.create_entity();
/// assert!(ctx.has_entity(e));
/// assert_eq!(e.index(), 0);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    index: u32,
    generation: u32,
}

impl Entity {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns the slot index of this entity.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn slot(&self) -> usize {
        self.index as usize
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Entity({}@{})", self.index, self.generation)
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Entity({}@{})", self.index, self.generation)
    }
}

// ---------------------------------------------------------------------------
// Slot storage
// ---------------------------------------------------------------------------

/// Per-entity listener lists.
#[derive(Default)]
pub(crate) struct EntityListeners {
    pub added: Listeners<ComponentHandler>,
    pub removed: Listeners<ComponentHandler>,
    pub replaced: Listeners<ComponentHandler>,
    pub destroying: Listeners<EntityHandler>,
    pub released: Listeners<EntityHandler>,
}

impl EntityListeners {
    /// Clears everything except the released list.
    pub fn clear_component_listeners(&mut self) {
        self.added.clear();
        self.removed.clear();
        self.replaced.clear();
        self.destroying.clear();
    }
}

/// Storage for one entity inside the context arena.
pub(crate) struct EntitySlot {
    pub generation: u32,
    pub creation_index: u32,
    /// Handed out and not yet returned to the free list.
    pub alive: bool,
    /// Cleared by destroy; a disabled entity rejects mutation.
    pub enabled: bool,
    pub components: Vec<Option<Box<dyn Component>>>,
    pub mask: FixedBitSet,
    pub aerc: Box<dyn Aerc>,
    pub listeners: EntityListeners,
    indices_cache: OnceLock<Arc<[ComponentIndex]>>,
    description_cache: OnceLock<Arc<str>>,
}

impl EntitySlot {
    pub fn new(total_components: usize, aerc: Box<dyn Aerc>) -> Self {
        Self {
            generation: 0,
            creation_index: 0,
            alive: false,
            enabled: false,
            components: (0..total_components).map(|_| None).collect(),
            mask: FixedBitSet::with_capacity(total_components),
            aerc,
            listeners: EntityListeners::default(),
            indices_cache: OnceLock::new(),
            description_cache: OnceLock::new(),
        }
    }

    /// Drops cached views after the composition changed.
    pub fn invalidate_composition(&mut self) {
        self.indices_cache = OnceLock::new();
        self.description_cache = OnceLock::new();
    }

    /// Drops the description only (instance swapped, same composition).
    pub fn invalidate_description(&mut self) {
        self.description_cache = OnceLock::new();
    }

    pub fn has(&self, index: ComponentIndex) -> bool {
        self.mask.contains(index)
    }

    pub fn component_indices(&self) -> Arc<[ComponentIndex]> {
        self.indices_cache
            .get_or_init(|| self.mask.ones().collect())
            .clone()
    }

    pub fn description(&self) -> Arc<str> {
        self.description_cache
            .get_or_init(|| {
                let mut text = format!("Entity_{}(", self.creation_index);
                for (n, component) in self.components.iter().flatten().enumerate() {
                    if n > 0 {
                        text.push_str(", ");
                    }
                    let _ = write!(text, "{component:?}");
                }
                text.push(')');
                text.into()
            })
            .clone()
    }
}

fn component_name(names: &[String], index: ComponentIndex) -> String {
    names
        .get(index)
        .cloned()
        .unwrap_or_else(|| format!("Index {index}"))
}

pub(crate) fn missing(
    names: &[String],
    slot: &EntitySlot,
    index: ComponentIndex,
    action: &'static str,
    action_ing: &'static str,
) -> EcsError {
    EcsError::ComponentMissing {
        action,
        action_ing,
        component: component_name(names, index),
        entity: slot.description().to_string(),
    }
}

pub(crate) fn type_mismatch<T: Component>(
    names: &[String],
    slot: &EntitySlot,
    index: ComponentIndex,
) -> EcsError {
    EcsError::ComponentTypeMismatch {
        component: component_name(names, index),
        entity: slot.description().to_string(),
        expected: std::any::type_name::<T>(),
    }
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

/// Read-only view of one entity.
///
/// Obtained from [`Context::entity`](crate::Context::entity); also handed to
/// reactive filters and entity-index key functions.
#[derive(Clone, Copy)]
pub struct EntityRef<'a> {
    entity: Entity,
    slot: &'a EntitySlot,
    names: &'a [String],
}

impl<'a> EntityRef<'a> {
    pub(crate) fn new(entity: Entity, slot: &'a EntitySlot, names: &'a [String]) -> Self {
        Self {
            entity,
            slot,
            names,
        }
    }

    pub fn id(&self) -> Entity {
        self.entity
    }

    pub fn creation_index(&self) -> u32 {
        self.slot.creation_index
    }

    pub fn is_enabled(&self) -> bool {
        self.slot.enabled
    }

    pub fn total_components(&self) -> usize {
        self.slot.components.len()
    }

    pub fn retain_count(&self) -> usize {
        self.slot.aerc.retain_count()
    }

    pub fn is_retained_by(&self, owner: Owner) -> bool {
        self.slot.aerc.is_retained_by(owner)
    }

    pub fn has_component(&self, index: ComponentIndex) -> bool {
        self.slot.has(index)
    }

    /// `true` if every index in `indices` is present.
    pub fn has_components(&self, indices: &[ComponentIndex]) -> bool {
        indices.iter().all(|&i| self.slot.has(i))
    }

    /// `true` if at least one index in `indices` is present.
    pub fn has_any_component(&self, indices: &[ComponentIndex]) -> bool {
        indices.iter().any(|&i| self.slot.has(i))
    }

    pub fn get_component(&self, index: ComponentIndex) -> Result<&'a dyn Component> {
        self.slot
            .components
            .get(index)
            .and_then(|c| c.as_deref())
            .ok_or_else(|| missing(self.names, self.slot, index, "get", "getting"))
    }

    /// Typed read of a component slot.
    pub fn get<T: Component>(&self, index: ComponentIndex) -> Result<&'a T> {
        self.get_component(index)?
            .downcast_ref::<T>()
            .ok_or_else(|| type_mismatch::<T>(self.names, self.slot, index))
    }

    /// Typed read that yields `None` for empty or differently-typed slots.
    pub fn try_get<T: Component>(&self, index: ComponentIndex) -> Option<&'a T> {
        self.slot
            .components
            .get(index)
            .and_then(|c| c.as_deref())
            .and_then(|c| c.downcast_ref::<T>())
    }

    /// Components in index order.
    pub fn get_components(&self) -> Vec<&'a dyn Component> {
        self.slot
            .components
            .iter()
            .flatten()
            .map(|c| &**c)
            .collect()
    }

    /// Occupied indices, memoised until the composition changes.
    pub fn get_component_indices(&self) -> Arc<[ComponentIndex]> {
        self.slot.component_indices()
    }

    /// `Entity_{creation_index}(Component, ...)`, memoised.
    pub fn description(&self) -> Arc<str> {
        self.slot.description()
    }
}

impl std::fmt::Debug for EntityRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.description())
    }
}

/// Mutable view of one entity's component values.
///
/// Writes through this view mutate components in place and fire no events;
/// composition changes must go through the [`Context`](crate::Context).
pub struct EntityMut<'a> {
    entity: Entity,
    slot: &'a mut EntitySlot,
    names: &'a [String],
}

impl<'a> EntityMut<'a> {
    pub(crate) fn new(entity: Entity, slot: &'a mut EntitySlot, names: &'a [String]) -> Self {
        Self {
            entity,
            slot,
            names,
        }
    }

    pub fn id(&self) -> Entity {
        self.entity
    }

    pub fn creation_index(&self) -> u32 {
        self.slot.creation_index
    }

    pub fn has_component(&self, index: ComponentIndex) -> bool {
        self.slot.has(index)
    }

    pub fn get<T: Component>(&self, index: ComponentIndex) -> Result<&T> {
        EntityRef::new(self.entity, self.slot, self.names).get::<T>(index)
    }

    pub fn get_component_mut(&mut self, index: ComponentIndex) -> Result<&mut dyn Component> {
        let names = self.names;
        let slot = &mut *self.slot;
        if !slot.has(index) {
            return Err(missing(names, slot, index, "get", "getting"));
        }
        match slot.components[index].as_deref_mut() {
            Some(component) => Ok(component),
            None => Err(EcsError::ComponentIndexOutOfRange {
                index,
                total: names.len(),
            }),
        }
    }

    pub fn get_mut<T: Component>(&mut self, index: ComponentIndex) -> Result<&mut T> {
        let names = self.names;
        if !self.slot.has(index) {
            return Err(missing(names, self.slot, index, "get", "getting"));
        }
        if !self.slot.components[index]
            .as_deref()
            .is_some_and(|c| c.is::<T>())
        {
            return Err(type_mismatch::<T>(names, self.slot, index));
        }
        self.slot.components[index]
            .as_deref_mut()
            .and_then(|c| c.downcast_mut::<T>())
            .ok_or_else(|| EcsError::ComponentIndexOutOfRange {
                index,
                total: names.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aerc::SafeAerc;

    #[derive(Debug, Clone)]
    struct ComponentA;

    #[derive(Debug, Clone, PartialEq)]
    struct NameAge {
        name: String,
        age: u32,
    }

    fn names() -> Vec<String> {
        (0..3).map(|i| format!("Index {i}")).collect()
    }

    fn slot_with(components: Vec<(usize, Box<dyn Component>)>) -> EntitySlot {
        let mut slot = EntitySlot::new(3, Box::new(SafeAerc::new()));
        slot.alive = true;
        slot.enabled = true;
        for (index, c) in components {
            slot.components[index] = Some(c);
            slot.mask.insert(index);
        }
        slot
    }

    #[test]
    fn entity_equality_uses_generation() {
        assert_eq!(Entity::new(1, 0), Entity::new(1, 0));
        assert_ne!(Entity::new(1, 0), Entity::new(1, 1));
        assert_eq!(format!("{:?}", Entity::new(3, 2)), "Entity(3@2)");
    }

    #[test]
    fn description_lists_components_in_index_order() {
        let slot = slot_with(vec![
            (
                2,
                Box::new(NameAge {
                    name: "Max".into(),
                    age: 42,
                }) as Box<dyn Component>,
            ),
            (0, Box::new(ComponentA) as Box<dyn Component>),
        ]);
        assert_eq!(
            &*slot.description(),
            "Entity_0(ComponentA, NameAge { name: \"Max\", age: 42 })"
        );
    }

    #[test]
    fn caches_are_shared_until_invalidated() {
        let mut slot = slot_with(vec![(0, Box::new(ComponentA) as Box<dyn Component>)]);
        let indices = slot.component_indices();
        assert!(Arc::ptr_eq(&indices, &slot.component_indices()));
        let text = slot.description();
        assert!(Arc::ptr_eq(&text, &slot.description()));

        slot.invalidate_composition();
        assert!(!Arc::ptr_eq(&indices, &slot.component_indices()));
        assert!(!Arc::ptr_eq(&text, &slot.description()));
    }

    #[test]
    fn entity_ref_reads() {
        let names = names();
        let slot = slot_with(vec![(1, Box::new(ComponentA) as Box<dyn Component>)]);
        let view = EntityRef::new(Entity::new(0, 0), &slot, &names);

        assert!(view.has_component(1));
        assert!(view.has_components(&[1]));
        assert!(!view.has_components(&[0, 1]));
        assert!(view.has_any_component(&[0, 1]));
        assert!(view.get::<ComponentA>(1).is_ok());
        assert!(matches!(
            view.get_component(0),
            Err(EcsError::ComponentMissing { .. })
        ));
        assert!(matches!(
            view.get::<NameAge>(1),
            Err(EcsError::ComponentTypeMismatch { .. })
        ));
        assert_eq!(&*view.get_component_indices(), &[1]);
    }

    #[test]
    fn entity_mut_writes_in_place() {
        let names = names();
        let mut slot = slot_with(vec![(
            0,
            Box::new(NameAge {
                name: "Max".into(),
                age: 1,
            }) as Box<dyn Component>,
        )]);
        let mut view = EntityMut::new(Entity::new(0, 0), &mut slot, &names);
        view.get_mut::<NameAge>(0).unwrap().age = 2;
        assert_eq!(view.get::<NameAge>(0).unwrap().age, 2);
        assert!(view.get_mut::<ComponentA>(0).is_err());
        assert!(view.get_component_mut(1).is_err());
    }
}
