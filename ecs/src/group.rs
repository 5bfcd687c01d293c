use std::fmt;
use std::sync::{Arc, OnceLock};

use fixedbitset::FixedBitSet;

use crate::aerc::Owner;
use crate::collector::CollectorId;
use crate::component::{Component, ComponentIndex};
use crate::context::Context;
use crate::entity::Entity;
use crate::entity_index::IndexId;
use crate::error::{EcsError, Result, keep_first};
use crate::events::{GroupChanged, GroupHandler, ListenerId};
use crate::matcher::Matcher;

/// Identifier of a group inside its [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub(crate) usize);

impl GroupId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupEventKind {
    Added,
    Removed,
    Updated,
}

/// One entry of a group's ordered subscriber list.
///
/// Collectors and indices live inside the context and are addressed by id;
/// user handlers are stored directly.
#[derive(Clone)]
pub(crate) enum Subscriber {
    Collector(CollectorId),
    Index(IndexId),
    Listener(ListenerId, Arc<GroupHandler>),
}

/// The live set of entities matching one [`Matcher`].
///
/// Groups are created and cached by [`Context::get_group`]; there is exactly
/// one group per distinct matcher. A group retains each member under its own
/// [`Owner`].
pub struct Group {
    id: GroupId,
    matcher: Matcher,
    owner: Owner,
    members: FixedBitSet,
    /// Generation of the member occupying each slot bit.
    generations: Vec<u32>,
    count: usize,
    entities_cache: OnceLock<Arc<[Entity]>>,
    single_cache: OnceLock<Option<Entity>>,
    added: Vec<Subscriber>,
    removed: Vec<Subscriber>,
    updated: Vec<Subscriber>,
}

impl Group {
    pub(crate) fn new(id: GroupId, matcher: Matcher) -> Self {
        Self {
            id,
            matcher,
            owner: Owner::new(),
            members: FixedBitSet::new(),
            generations: Vec::new(),
            count: 0,
            entities_cache: OnceLock::new(),
            single_cache: OnceLock::new(),
            added: Vec::new(),
            removed: Vec::new(),
            updated: Vec::new(),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn contains(&self, entity: Entity) -> bool {
        let idx = entity.slot();
        self.members.contains(idx) && self.generations[idx] == entity.generation()
    }

    /// Members in slot order, cached until membership changes.
    pub fn entities(&self) -> Arc<[Entity]> {
        self.entities_cache
            .get_or_init(|| self.iter().collect())
            .clone()
    }

    /// Appends the members to `buffer` without touching the cache.
    pub fn entities_into(&self, buffer: &mut Vec<Entity>) {
        buffer.extend(self.iter());
    }

    pub fn iter(&self) -> impl Iterator<Item = Entity> + '_ {
        self.members
            .ones()
            .map(|idx| Entity::new(idx as u32, self.generations[idx]))
    }

    /// The only member, `None` if empty.
    ///
    /// Fails with [`EcsError::GroupSingleEntity`] when there are several.
    pub fn single_entity(&self) -> Result<Option<Entity>> {
        if self.count > 1 {
            return Err(EcsError::GroupSingleEntity {
                group: self.to_string(),
                count: self.count,
            });
        }
        Ok(*self.single_cache.get_or_init(|| self.iter().next()))
    }

    pub fn on_entity_added(
        &mut self,
        handler: impl Fn(&mut Context, &GroupChanged<'_>) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId::next();
        self.added.push(Subscriber::Listener(id, Arc::new(handler)));
        id
    }

    pub fn on_entity_removed(
        &mut self,
        handler: impl Fn(&mut Context, &GroupChanged<'_>) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId::next();
        self.removed.push(Subscriber::Listener(id, Arc::new(handler)));
        id
    }

    /// Fires for members whose component at a watched index was replaced.
    pub fn on_entity_updated(
        &mut self,
        handler: impl Fn(&mut Context, &GroupChanged<'_>) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId::next();
        self.updated.push(Subscriber::Listener(id, Arc::new(handler)));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.added.len() + self.removed.len() + self.updated.len();
        let keep = |s: &Subscriber| !matches!(s, Subscriber::Listener(l, _) if *l == id);
        self.added.retain(keep);
        self.removed.retain(keep);
        self.updated.retain(keep);
        before != self.added.len() + self.removed.len() + self.updated.len()
    }

    /// Drops user handlers. Collectors and indices stay subscribed.
    pub fn remove_all_event_handlers(&mut self) {
        let keep = |s: &Subscriber| !matches!(s, Subscriber::Listener(..));
        self.added.retain(keep);
        self.removed.retain(keep);
        self.updated.retain(keep);
    }

    pub(crate) fn subscribe(&mut self, kind: GroupEventKind, subscriber: Subscriber) {
        self.list_mut(kind).push(subscriber);
    }

    pub(crate) fn unsubscribe_collector(&mut self, collector: CollectorId) {
        let keep = |s: &Subscriber| !matches!(s, Subscriber::Collector(c) if *c == collector);
        self.added.retain(keep);
        self.removed.retain(keep);
    }

    fn list_mut(&mut self, kind: GroupEventKind) -> &mut Vec<Subscriber> {
        match kind {
            GroupEventKind::Added => &mut self.added,
            GroupEventKind::Removed => &mut self.removed,
            GroupEventKind::Updated => &mut self.updated,
        }
    }

    fn subscribers(&self, kind: GroupEventKind) -> Vec<Subscriber> {
        match kind {
            GroupEventKind::Added => self.added.clone(),
            GroupEventKind::Removed => self.removed.clone(),
            GroupEventKind::Updated => self.updated.clone(),
        }
    }

    /// Adds without notifying. Returns `false` if already a member.
    fn insert(&mut self, entity: Entity) -> bool {
        let idx = entity.slot();
        if self.members.contains(idx) {
            return false;
        }
        self.members.grow(idx + 1);
        self.members.insert(idx);
        if self.generations.len() <= idx {
            self.generations.resize(idx + 1, 0);
        }
        self.generations[idx] = entity.generation();
        self.count += 1;
        self.invalidate();
        true
    }

    /// Removes without notifying. Returns `false` if not a member.
    fn take(&mut self, entity: Entity) -> bool {
        if !self.contains(entity) {
            return false;
        }
        self.members.set(entity.slot(), false);
        self.count -= 1;
        self.invalidate();
        true
    }

    fn invalidate(&mut self) {
        self.entities_cache = OnceLock::new();
        self.single_cache = OnceLock::new();
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Group({})", self.matcher)
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("matcher", &self.matcher)
            .field("count", &self.count)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Group maintenance
// ---------------------------------------------------------------------------

impl Context {
    /// Returns the group for `matcher`, creating and populating it on first
    /// request. Equal matchers always yield the same group.
    ///
    /// Fails with [`EcsError::EmptyMatcher`] for a matcher without allOf or
    /// anyOf indices.
    pub fn get_group(&mut self, matcher: &Matcher) -> Result<GroupId> {
        if matcher.is_empty() {
            return Err(EcsError::EmptyMatcher(matcher.to_string()));
        }
        if let Some(&id) = self.group_lookup.get(matcher) {
            return Ok(id);
        }
        let indices = matcher.indices();
        for &index in indices.iter() {
            self.check_index(index)?;
        }

        let mut matcher = matcher.clone();
        matcher.set_component_names(self.names.clone());
        let id = GroupId(self.groups.len());
        self.groups.push(Group::new(id, matcher.clone()));

        for &entity in self.get_entities().iter() {
            self.handle_entity_silently(id, entity)?;
        }
        for &index in indices.iter() {
            self.groups_for_index[index].push(id);
        }
        log::debug!(
            "{}: created {} with {} entities",
            self.info.name,
            self.groups[id.0],
            self.groups[id.0].count
        );
        self.group_lookup.insert(matcher, id);

        self.fire_group_created(id);
        Ok(id)
    }

    pub fn group(&self, id: GroupId) -> &Group {
        &self.groups[id.0]
    }

    /// Mutable access for subscribing group listeners.
    pub fn group_mut(&mut self, id: GroupId) -> &mut Group {
        &mut self.groups[id.0]
    }

    /// All groups created so far, in creation order.
    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Re-evaluates `entity` against the group without firing events.
    pub fn handle_entity_silently(&mut self, group: GroupId, entity: Entity) -> Result<()> {
        let idx = self.check(entity)?;
        let slot = &self.slots[idx];
        let target = &mut self.groups[group.0];
        let owner = target.owner;
        if slot.enabled && target.matcher.matches_mask(&slot.mask) {
            if target.insert(entity) {
                self.retain(entity, owner)?;
            }
        } else if target.take(entity) {
            self.release(entity, owner)?;
        }
        Ok(())
    }

    /// Updates membership of every group watching `index` after an add or a
    /// remove, then notifies.
    ///
    /// All memberships are settled before the first event fires, so every
    /// subscriber observes the final composition.
    pub(crate) fn update_groups_added_or_removed(
        &mut self,
        entity: Entity,
        index: ComponentIndex,
        previous: Option<&dyn Component>,
    ) -> Result<()> {
        let Some(watching) = self.groups_for_index.get(index).cloned() else {
            return Ok(());
        };
        let idx = entity.slot();
        let mut first_err = None;
        let mut changes = Vec::new();

        for id in watching {
            let slot = &self.slots[idx];
            let group = &mut self.groups[id.0];
            let owner = group.owner;
            if slot.enabled && group.matcher.matches_mask(&slot.mask) {
                if group.insert(entity) {
                    keep_first(&mut first_err, self.retain(entity, owner));
                    changes.push((id, GroupEventKind::Added));
                }
            } else if group.take(entity) {
                changes.push((id, GroupEventKind::Removed));
            }
        }

        for (id, kind) in changes {
            // An earlier subscriber may have destroyed the entity or moved it
            // back out of this group.
            let stale = self.check(entity).is_err()
                || (kind == GroupEventKind::Added && !self.groups[id.0].contains(entity));
            if stale {
                continue;
            }
            keep_first(
                &mut first_err,
                self.dispatch_group_event(id, kind, entity, index, previous),
            );
            if kind == GroupEventKind::Removed {
                let owner = self.groups[id.0].owner;
                keep_first(&mut first_err, self.release(entity, owner));
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Member groups see a replacement as removed, added, then updated.
    pub(crate) fn update_groups_replaced(
        &mut self,
        entity: Entity,
        index: ComponentIndex,
        previous: Option<&dyn Component>,
    ) -> Result<()> {
        let Some(watching) = self.groups_for_index.get(index).cloned() else {
            return Ok(());
        };
        let mut first_err = None;
        for id in watching {
            if !self.groups[id.0].contains(entity) {
                continue;
            }
            for (kind, previous) in [
                (GroupEventKind::Removed, previous),
                (GroupEventKind::Added, None),
                (GroupEventKind::Updated, previous),
            ] {
                if self.check(entity).is_err() || !self.groups[id.0].contains(entity) {
                    break;
                }
                keep_first(
                    &mut first_err,
                    self.dispatch_group_event(id, kind, entity, index, previous),
                );
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn dispatch_group_event(
        &mut self,
        group: GroupId,
        kind: GroupEventKind,
        entity: Entity,
        index: ComponentIndex,
        previous: Option<&dyn Component>,
    ) -> Result<()> {
        let subscribers = self.groups[group.0].subscribers(kind);
        if subscribers.is_empty() {
            return Ok(());
        }
        let event = GroupChanged {
            group,
            entity,
            index,
            previous,
        };
        let mut first_err = None;
        for subscriber in subscribers {
            match subscriber {
                Subscriber::Collector(collector) => {
                    keep_first(&mut first_err, self.collect(collector, entity));
                }
                Subscriber::Index(id) => {
                    let result = match kind {
                        GroupEventKind::Removed => self.index_entity_removed(id, entity),
                        _ => self.index_entity_added(id, entity, index),
                    };
                    keep_first(&mut first_err, result);
                }
                Subscriber::Listener(_, handler) => handler(self, &event),
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
