//! Collector-driven systems.
//!
//! A reactive system owns one (or several) [`Collector`](crate::Collector)s
//! and, on every `execute`, drains the batch collected since the previous
//! call:
//!
//! 1. snapshot the pending entities in arrival order
//! 2. keep those passing [`Reactive::filter`], retaining them
//! 3. clear the collector (releasing its retention)
//! 4. run the user logic once if anything survived
//! 5. release the kept entities, even if the logic failed
//!
//! Mutations made by the logic may feed the collector again; they are
//! picked up by the next `execute`.

use std::collections::HashSet;
use std::fmt;

use crate::aerc::Owner;
use crate::collector::CollectorId;
use crate::context::Context;
use crate::entity::{Entity, EntityRef};
use crate::error::{EcsError, keep_first};
use crate::system::{System, SystemError};

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// User logic of a [`ReactiveSystem`].
///
/// # Example
///
/// ```
/// use entitas_ecs::{
///     CollectorId, Context, EcsError, Entity, GroupEvent, Matcher, Reactive, ReactiveSystem,
///     System, SystemError,
/// };
///
/// #[derive(Debug, Clone)]
/// struct Hit(u32);
///
/// struct CountHits(usize);
///
/// impl Reactive for CountHits {
///     fn trigger(&self, ctx: &mut Context) -> Result<CollectorId, EcsError> {
///         ctx.create_collector_for(&Matcher::all_of([0]), GroupEvent::Added)
///     }
///
///     fn execute(&mut self, _ctx: &mut Context, entities: &[Entity]) -> Result<(), SystemError> {
///         self.0 += entities.len();
///         Ok(())
///     }
/// }
///
/// let mut ctx = Context::new(1);
/// let mut system = ReactiveSystem::new(&mut ctx, CountHits(0)).unwrap();
/// let e = ctx.create_entity();
/// ctx.add(e, 0, Hit(3)).unwrap();
/// system.execute(&mut ctx).unwrap();
/// system.execute(&mut ctx).unwrap();
/// assert_eq!(system.logic().0, 1);
/// ```
pub trait Reactive: Send {
    fn name(&self) -> &str {
        short_type_name::<Self>()
    }

    /// Creates the collector feeding this system.
    fn trigger(&self, ctx: &mut Context) -> Result<CollectorId, EcsError>;

    /// Per-entity gate applied when the batch is drained.
    fn filter(&self, _entity: EntityRef<'_>) -> bool {
        true
    }

    /// Processes the filtered batch. Never called with an empty slice.
    fn execute(&mut self, ctx: &mut Context, entities: &[Entity]) -> Result<(), SystemError>;

    /// Phases below are forwarded unchanged by [`ReactiveSystem`].
    fn initialize(&mut self, _ctx: &mut Context) -> Result<(), SystemError> {
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut Context) -> Result<(), SystemError> {
        Ok(())
    }

    fn tear_down(&mut self, _ctx: &mut Context) -> Result<(), SystemError> {
        Ok(())
    }
}

/// User logic of a [`MultiReactiveSystem`].
pub trait MultiReactive: Send {
    fn name(&self) -> &str {
        short_type_name::<Self>()
    }

    /// Creates the collectors feeding this system.
    fn triggers(&self, ctx: &mut Context) -> Result<Vec<CollectorId>, EcsError>;

    fn filter(&self, _entity: EntityRef<'_>) -> bool {
        true
    }

    fn execute(&mut self, ctx: &mut Context, entities: &[Entity]) -> Result<(), SystemError>;

    fn initialize(&mut self, _ctx: &mut Context) -> Result<(), SystemError> {
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut Context) -> Result<(), SystemError> {
        Ok(())
    }

    fn tear_down(&mut self, _ctx: &mut Context) -> Result<(), SystemError> {
        Ok(())
    }
}

/// Moves the collectors' batches into `buffer`, retaining each kept entity
/// once under `owner`. An entity collected by several collectors appears
/// once, at its first position.
fn drain_batch(
    ctx: &mut Context,
    collectors: &[CollectorId],
    owner: Owner,
    filter: impl Fn(EntityRef<'_>) -> bool,
    buffer: &mut Vec<Entity>,
) -> Result<(), EcsError> {
    let mut seen = HashSet::new();
    let mut first_err = None;
    for &collector in collectors {
        let pending = ctx.collector(collector).entities().to_vec();
        for entity in pending {
            if !seen.insert(entity) {
                continue;
            }
            let keep = match ctx.entity(entity) {
                Ok(view) => filter(view),
                Err(err) => {
                    keep_first(&mut first_err, Err(err));
                    false
                }
            };
            if keep {
                match ctx.retain(entity, owner) {
                    Ok(()) => buffer.push(entity),
                    Err(err) => keep_first(&mut first_err, Err(err)),
                }
            }
        }
        keep_first(&mut first_err, ctx.clear_collected_entities(collector));
    }
    first_err.map_or(Ok(()), Err)
}

fn release_batch(ctx: &mut Context, owner: Owner, buffer: &mut Vec<Entity>) -> Result<(), EcsError> {
    let mut first_err = None;
    for entity in buffer.drain(..) {
        keep_first(&mut first_err, ctx.release(entity, owner));
    }
    first_err.map_or(Ok(()), Err)
}

fn pending(ctx: &Context, collectors: &[CollectorId]) -> bool {
    collectors.iter().any(|&c| !ctx.collector(c).is_empty())
}

// ---------------------------------------------------------------------------
// Single collector
// ---------------------------------------------------------------------------

/// Runs [`Reactive`] logic over the batch of one collector.
pub struct ReactiveSystem<R: Reactive> {
    logic: R,
    collectors: [CollectorId; 1],
    owner: Owner,
    buffer: Vec<Entity>,
}

impl<R: Reactive> ReactiveSystem<R> {
    /// Creates the collector via [`Reactive::trigger`].
    pub fn new(ctx: &mut Context, logic: R) -> Result<Self, EcsError> {
        let collector = logic.trigger(ctx)?;
        Ok(Self::with_collector(collector, logic))
    }

    /// Uses an existing collector instead of calling the trigger.
    pub fn with_collector(collector: CollectorId, logic: R) -> Self {
        Self {
            logic,
            collectors: [collector],
            owner: Owner::new(),
            buffer: Vec::new(),
        }
    }

    pub fn collector(&self) -> CollectorId {
        self.collectors[0]
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn logic(&self) -> &R {
        &self.logic
    }

    pub fn logic_mut(&mut self) -> &mut R {
        &mut self.logic
    }
}

impl<R: Reactive> System for ReactiveSystem<R> {
    fn name(&self) -> &str {
        self.logic.name()
    }

    fn execute(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        if !pending(ctx, &self.collectors) {
            return Ok(());
        }
        let logic = &self.logic;
        let drained = drain_batch(
            ctx,
            &self.collectors,
            self.owner,
            |e| logic.filter(e),
            &mut self.buffer,
        );
        let result = match drained {
            Ok(()) if !self.buffer.is_empty() => self.logic.execute(ctx, &self.buffer),
            Ok(()) => Ok(()),
            Err(err) => Err(err.into()),
        };
        let released = release_batch(ctx, self.owner, &mut self.buffer);
        result.and(released.map_err(SystemError::from))
    }

    fn initialize(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        self.logic.initialize(ctx)
    }

    fn cleanup(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        self.logic.cleanup(ctx)
    }

    fn tear_down(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        self.logic.tear_down(ctx)
    }

    fn activate(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        ctx.activate_collector(self.collector());
        Ok(())
    }

    fn deactivate(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        Ok(ctx.deactivate_collector(self.collector())?)
    }

    fn clear(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        Ok(ctx.clear_collected_entities(self.collector())?)
    }
}

impl<R: Reactive> fmt::Display for ReactiveSystem<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReactiveSystem({})", self.logic.name())
    }
}

// ---------------------------------------------------------------------------
// Several collectors
// ---------------------------------------------------------------------------

/// Runs [`MultiReactive`] logic over the merged batches of several
/// collectors.
pub struct MultiReactiveSystem<R: MultiReactive> {
    logic: R,
    collectors: Vec<CollectorId>,
    owner: Owner,
    buffer: Vec<Entity>,
}

impl<R: MultiReactive> MultiReactiveSystem<R> {
    pub fn new(ctx: &mut Context, logic: R) -> Result<Self, EcsError> {
        let collectors = logic.triggers(ctx)?;
        Ok(Self {
            logic,
            collectors,
            owner: Owner::new(),
            buffer: Vec::new(),
        })
    }

    pub fn collectors(&self) -> &[CollectorId] {
        &self.collectors
    }

    pub fn logic(&self) -> &R {
        &self.logic
    }

    pub fn logic_mut(&mut self) -> &mut R {
        &mut self.logic
    }
}

impl<R: MultiReactive> System for MultiReactiveSystem<R> {
    fn name(&self) -> &str {
        self.logic.name()
    }

    fn execute(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        if !pending(ctx, &self.collectors) {
            return Ok(());
        }
        let logic = &self.logic;
        let drained = drain_batch(
            ctx,
            &self.collectors,
            self.owner,
            |e| logic.filter(e),
            &mut self.buffer,
        );
        let result = match drained {
            Ok(()) if !self.buffer.is_empty() => self.logic.execute(ctx, &self.buffer),
            Ok(()) => Ok(()),
            Err(err) => Err(err.into()),
        };
        let released = release_batch(ctx, self.owner, &mut self.buffer);
        result.and(released.map_err(SystemError::from))
    }

    fn initialize(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        self.logic.initialize(ctx)
    }

    fn cleanup(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        self.logic.cleanup(ctx)
    }

    fn tear_down(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        self.logic.tear_down(ctx)
    }

    fn activate(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        for &collector in &self.collectors {
            ctx.activate_collector(collector);
        }
        Ok(())
    }

    fn deactivate(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        for &collector in &self.collectors {
            ctx.deactivate_collector(collector)?;
        }
        Ok(())
    }

    fn clear(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        for &collector in &self.collectors {
            ctx.clear_collected_entities(collector)?;
        }
        Ok(())
    }
}

impl<R: MultiReactive> fmt::Display for MultiReactiveSystem<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MultiReactiveSystem({})", self.logic.name())
    }
}
