use std::collections::HashSet;
use std::fmt;

use crate::aerc::Owner;
use crate::context::Context;
use crate::entity::Entity;
use crate::error::{EcsError, Result, keep_first};
use crate::group::{GroupEventKind, GroupId, Subscriber};
use crate::matcher::Matcher;

/// Which group transitions a collector records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupEvent {
    Added,
    Removed,
    AddedOrRemoved,
}

impl GroupEvent {
    fn kinds(self) -> &'static [GroupEventKind] {
        match self {
            GroupEvent::Added => &[GroupEventKind::Added],
            GroupEvent::Removed => &[GroupEventKind::Removed],
            GroupEvent::AddedOrRemoved => &[GroupEventKind::Added, GroupEventKind::Removed],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectorId(pub(crate) usize);

/// Accumulates the distinct entities that entered and/or left a set of
/// groups since the last clear.
///
/// Each collected entity is retained once by the collector, so it stays
/// addressable even if destroyed before the consumer runs.
pub struct Collector {
    id: CollectorId,
    owner: Owner,
    groups: Vec<GroupId>,
    events: Vec<GroupEvent>,
    active: bool,
    /// Arrival order.
    pending: Vec<Entity>,
    pending_set: HashSet<Entity>,
    description: String,
}

impl Collector {
    pub fn id(&self) -> CollectorId {
        self.id
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn groups(&self) -> &[GroupId] {
        &self.groups
    }

    pub fn events(&self) -> &[GroupEvent] {
        &self.events
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.pending_set.contains(&entity)
    }

    /// Collected entities in the order they were first observed.
    pub fn entities(&self) -> &[Entity] {
        &self.pending
    }
}

impl fmt::Display for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("groups", &self.groups)
            .field("events", &self.events)
            .field("active", &self.active)
            .field("count", &self.pending.len())
            .finish()
    }
}

impl Context {
    /// Creates an active collector observing `groups[i]` for `events[i]`.
    ///
    /// Fails with [`EcsError::GroupEventCountMismatch`] if the two slices
    /// differ in length.
    pub fn create_collector(
        &mut self,
        groups: &[GroupId],
        events: &[GroupEvent],
    ) -> Result<CollectorId> {
        if groups.len() != events.len() {
            return Err(EcsError::GroupEventCountMismatch {
                groups: groups.len(),
                events: events.len(),
            });
        }
        let description = format!(
            "Collector({})",
            groups
                .iter()
                .map(|g| self.groups[g.0].to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        let id = CollectorId(self.collectors.len());
        self.collectors.push(Collector {
            id,
            owner: Owner::new(),
            groups: groups.to_vec(),
            events: events.to_vec(),
            active: false,
            pending: Vec::new(),
            pending_set: HashSet::new(),
            description,
        });
        self.activate_collector(id);
        Ok(id)
    }

    /// Collector over the group for `matcher`.
    pub fn create_collector_for(
        &mut self,
        matcher: &Matcher,
        event: GroupEvent,
    ) -> Result<CollectorId> {
        let group = self.get_group(matcher)?;
        self.create_collector(&[group], &[event])
    }

    pub fn collector(&self, id: CollectorId) -> &Collector {
        &self.collectors[id.0]
    }

    /// Subscribes to the observed groups. No-op if already active.
    pub fn activate_collector(&mut self, id: CollectorId) {
        let collector = &mut self.collectors[id.0];
        if collector.active {
            return;
        }
        collector.active = true;
        for (group, event) in collector.groups.iter().zip(&collector.events) {
            for &kind in event.kinds() {
                self.groups[group.0].subscribe(kind, Subscriber::Collector(id));
            }
        }
    }

    /// Unsubscribes and releases everything collected so far.
    pub fn deactivate_collector(&mut self, id: CollectorId) -> Result<()> {
        let collector = &mut self.collectors[id.0];
        if collector.active {
            collector.active = false;
            for group in &collector.groups {
                self.groups[group.0].unsubscribe_collector(id);
            }
        }
        self.clear_collected_entities(id)
    }

    /// Releases and forgets every collected entity.
    pub fn clear_collected_entities(&mut self, id: CollectorId) -> Result<()> {
        let collector = &mut self.collectors[id.0];
        let owner = collector.owner;
        let pending = std::mem::take(&mut collector.pending);
        collector.pending_set.clear();

        let mut first_err = None;
        for entity in pending {
            keep_first(&mut first_err, self.release(entity, owner));
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Records `entity` once, retaining it under the collector's owner.
    pub(crate) fn collect(&mut self, id: CollectorId, entity: Entity) -> Result<()> {
        let collector = &self.collectors[id.0];
        if !collector.active || collector.pending_set.contains(&entity) {
            return Ok(());
        }
        let owner = collector.owner;
        self.retain(entity, owner)?;
        let collector = &mut self.collectors[id.0];
        collector.pending_set.insert(entity);
        collector.pending.push(entity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct A;
    #[derive(Debug, Clone)]
    struct B;

    fn setup() -> (Context, GroupId) {
        let mut ctx = Context::new(3);
        let group = ctx.get_group(&Matcher::all_of([1])).unwrap();
        (ctx, group)
    }

    #[test]
    fn collects_added_entities_once() {
        let (mut ctx, group) = setup();
        let collector = ctx.create_collector(&[group], &[GroupEvent::Added]).unwrap();
        let e = ctx.create_entity();
        ctx.add(e, 1, A).unwrap();
        ctx.remove_component(e, 1).unwrap();
        ctx.add(e, 1, A).unwrap();

        let c = ctx.collector(collector);
        assert_eq!(c.entities(), &[e]);
        assert!(ctx.entity(e).unwrap().is_retained_by(c.owner()));
    }

    #[test]
    fn removed_only_ignores_additions() {
        let (mut ctx, group) = setup();
        let collector = ctx
            .create_collector(&[group], &[GroupEvent::Removed])
            .unwrap();
        let e = ctx.create_entity();
        ctx.add(e, 1, A).unwrap();
        assert!(ctx.collector(collector).is_empty());
        ctx.remove_component(e, 1).unwrap();
        assert_eq!(ctx.collector(collector).entities(), &[e]);
    }

    #[test]
    fn mismatched_event_count_is_rejected() {
        let (mut ctx, group) = setup();
        assert!(matches!(
            ctx.create_collector(&[group], &[]),
            Err(EcsError::GroupEventCountMismatch { groups: 1, events: 0 })
        ));
    }

    #[test]
    fn multiple_groups_keep_arrival_order() {
        let mut ctx = Context::new(3);
        let g1 = ctx.get_group(&Matcher::all_of([1])).unwrap();
        let g2 = ctx.get_group(&Matcher::all_of([2])).unwrap();
        let collector = ctx
            .create_collector(&[g1, g2], &[GroupEvent::Added, GroupEvent::AddedOrRemoved])
            .unwrap();
        assert_eq!(
            ctx.collector(collector).to_string(),
            "Collector(Group(AllOf(Index 1)), Group(AllOf(Index 2)))"
        );

        let e1 = ctx.create_entity();
        let e2 = ctx.create_entity();
        ctx.add(e2, 2, B).unwrap();
        ctx.add(e1, 1, A).unwrap();
        ctx.add(e2, 1, A).unwrap();
        assert_eq!(ctx.collector(collector).entities(), &[e2, e1]);
    }

    #[test]
    fn collected_entity_survives_destroy_until_cleared() {
        let (mut ctx, group) = setup();
        let collector = ctx
            .create_collector(&[group], &[GroupEvent::AddedOrRemoved])
            .unwrap();
        let e = ctx.create_entity();
        ctx.add(e, 1, A).unwrap();
        ctx.destroy_entity(e).unwrap();

        assert_eq!(ctx.retained_entities_count(), 1);
        assert!(ctx.entity(e).is_ok());

        ctx.clear_collected_entities(collector).unwrap();
        assert_eq!(ctx.retained_entities_count(), 0);
        assert!(ctx.entity(e).is_err());
    }

    #[test]
    fn deactivate_releases_and_stops_collecting() {
        let (mut ctx, group) = setup();
        let collector = ctx.create_collector(&[group], &[GroupEvent::Added]).unwrap();
        let e = ctx.create_entity();
        ctx.add(e, 1, A).unwrap();

        ctx.deactivate_collector(collector).unwrap();
        assert!(ctx.collector(collector).is_empty());
        assert!(!ctx.collector(collector).is_active());
        assert_eq!(ctx.retain_count(e).unwrap(), 2);

        let other = ctx.create_entity();
        ctx.add(other, 1, A).unwrap();
        assert!(ctx.collector(collector).is_empty());

        ctx.activate_collector(collector);
        ctx.activate_collector(collector);
        let third = ctx.create_entity();
        ctx.add(third, 1, A).unwrap();
        assert_eq!(ctx.collector(collector).entities(), &[third]);
    }
}
