use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::component::{Component, ComponentIndex};
use crate::context::Context;
use crate::entity::Entity;
use crate::group::GroupId;

/// Handle returned by every subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

impl ListenerId {
    pub(crate) fn next() -> Self {
        Self(NEXT_LISTENER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A component slot of one entity changed.
///
/// `previous` holds the instance that just left the slot (removed or
/// replaced). It is `None` for additions and for in-place updates, where
/// the current value is read back through the [`Context`].
pub struct ComponentChanged<'a> {
    pub entity: Entity,
    pub index: ComponentIndex,
    pub previous: Option<&'a dyn Component>,
}

/// A group gained, lost or updated a member.
///
/// Same `previous` convention as [`ComponentChanged`].
pub struct GroupChanged<'a> {
    pub group: GroupId,
    pub entity: Entity,
    pub index: ComponentIndex,
    pub previous: Option<&'a dyn Component>,
}

pub type ComponentHandler = dyn Fn(&mut Context, &ComponentChanged<'_>) + Send + Sync;
pub type EntityHandler = dyn Fn(&mut Context, Entity) + Send + Sync;
pub type GroupHandler = dyn Fn(&mut Context, &GroupChanged<'_>) + Send + Sync;
pub type GroupCreatedHandler = dyn Fn(&mut Context, GroupId) + Send + Sync;

/// Ordered subscriber list.
///
/// Dispatch works on a [`snapshot`](Listeners::snapshot) so handlers may
/// subscribe or unsubscribe while an event is being delivered.
pub(crate) struct Listeners<F: ?Sized> {
    entries: Vec<(ListenerId, Arc<F>)>,
}

impl<F: ?Sized> Listeners<F> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, handler: Arc<F>) -> ListenerId {
        let id = ListenerId::next();
        self.entries.push((id, handler));
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries.iter().map(|(_, f)| f.clone()).collect()
    }
}

impl<F: ?Sized> Default for Listeners<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Counter = dyn Fn(&mut u32) + Send + Sync;

    #[test]
    fn listeners_fire_in_subscription_order() {
        let mut listeners: Listeners<dyn Fn(&mut Vec<u32>) + Send + Sync> = Listeners::new();
        listeners.add(Arc::new(|v: &mut Vec<u32>| v.push(1)));
        listeners.add(Arc::new(|v: &mut Vec<u32>| v.push(2)));

        let mut out = Vec::new();
        for f in listeners.snapshot() {
            f(&mut out);
        }
        assert_eq!(out, vec![1, 2]);
    }

    #[test]
    fn remove_by_id() {
        let mut listeners: Listeners<Counter> = Listeners::new();
        let a = listeners.add(Arc::new(|n: &mut u32| *n += 1));
        listeners.add(Arc::new(|n: &mut u32| *n += 10));

        assert!(listeners.remove(a));
        assert!(!listeners.remove(a));
        assert_eq!(listeners.len(), 1);

        let mut n = 0;
        for f in listeners.snapshot() {
            f(&mut n);
        }
        assert_eq!(n, 10);

        listeners.clear();
        assert!(listeners.is_empty());
    }
}
