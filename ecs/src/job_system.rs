//! Parallel per-entity processing over a group.
//!
//! [`JobSystem`] snapshots a group's members, splits them into contiguous
//! near-equal partitions and runs one worker per partition under
//! [`std::thread::scope`], falling back to sequential iteration on WASM
//! where threads are unavailable. Workers only receive [`EntityMut`] views
//! of their own partition, so writes stay confined to each entity's own
//! components and fire no events.

use std::error::Error;
use std::fmt;

use parking_lot::Mutex;

use crate::context::Context;
use crate::entity::{Entity, EntityMut};
use crate::error::EcsError;
use crate::group::GroupId;
use crate::matcher::Matcher;
use crate::system::{System, SystemError};

/// Worker configuration.
#[derive(Debug, Clone, Default)]
pub struct JobConfig {
    /// Number of worker threads. `None` uses
    /// [`std::thread::available_parallelism`]. Default: `None`.
    pub num_threads: Option<usize>,
}

impl JobConfig {
    pub fn with_threads(num_threads: usize) -> Self {
        Self {
            num_threads: Some(num_threads),
        }
    }

    pub fn effective_threads(&self) -> usize {
        self.num_threads
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }
}

/// Per-entity callback of a [`JobSystem`]. Called concurrently from
/// several workers.
pub trait Job: Sync {
    type Error: Into<Box<dyn Error + Send + Sync>>;

    fn name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base)
    }

    fn execute(&self, entity: &mut EntityMut<'_>) -> Result<(), Self::Error>;
}

/// Splits `count` items into at most `threads` contiguous partitions whose
/// sizes differ by at most one. Earlier partitions take the remainder.
///
/// ```
/// use entitas_ecs::partition_sizes;
///
/// assert_eq!(partition_sizes(103, 4), vec![26, 26, 26, 25]);
/// assert_eq!(partition_sizes(2, 4), vec![1, 1]);
/// assert!(partition_sizes(0, 4).is_empty());
/// ```
pub fn partition_sizes(count: usize, threads: usize) -> Vec<usize> {
    let parts = threads.max(1).min(count);
    if parts == 0 {
        return Vec::new();
    }
    let base = count / parts;
    let extra = count % parts;
    (0..parts)
        .map(|i| if i < extra { base + 1 } else { base })
        .collect()
}

/// Runs a [`Job`] over every member of a group on worker threads.
///
/// The caller blocks until every worker has finished. A worker stops at
/// its own first failure while the others complete their partitions; the
/// first recorded failure is then returned as [`EcsError::JobFailed`]. The
/// system stays usable after a failure.
///
/// # Example
///
/// ```
/// use entitas_ecs::{Context, EcsError, EntityMut, Job, JobConfig, JobSystem, Matcher};
///
/// #[derive(Debug, Clone)]
/// struct Position(f32);
///
/// struct Advance;
///
/// impl Job for Advance {
///     type Error = EcsError;
///
///     fn execute(&self, entity: &mut EntityMut<'_>) -> Result<(), EcsError> {
///         entity.get_mut::<Position>(0)?.0 += 1.0;
///         Ok(())
///     }
/// }
///
/// let mut ctx = Context::new(1);
/// let e = ctx.create_entity();
/// ctx.add(e, 0, Position(0.0)).unwrap();
///
/// let mut system =
///     JobSystem::new(&mut ctx, &Matcher::all_of([0]), Advance, JobConfig::with_threads(2)).unwrap();
/// system.run(&mut ctx).unwrap();
/// assert_eq!(ctx.get::<Position>(e, 0).unwrap().0, 1.0);
/// ```
pub struct JobSystem<J: Job> {
    job: J,
    group: GroupId,
    config: JobConfig,
    last_partition: Vec<usize>,
}

impl<J: Job> JobSystem<J> {
    pub fn new(
        ctx: &mut Context,
        matcher: &Matcher,
        job: J,
        config: JobConfig,
    ) -> Result<Self, EcsError> {
        let group = ctx.get_group(matcher)?;
        Ok(Self::with_group(group, job, config))
    }

    pub fn with_group(group: GroupId, job: J, config: JobConfig) -> Self {
        Self {
            job,
            group,
            config,
            last_partition: Vec::new(),
        }
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn job(&self) -> &J {
        &self.job
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Partition sizes used by the most recent run.
    pub fn last_partition(&self) -> &[usize] {
        &self.last_partition
    }

    /// Processes the group's current members. Blocks until all workers
    /// have joined.
    pub fn run(&mut self, ctx: &mut Context) -> Result<(), EcsError> {
        let group = &ctx.groups[self.group.0];
        let names = ctx.names.clone();
        let mut items: Vec<EntityMut<'_>> = ctx
            .slots
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, slot)| {
                let entity = Entity::new(idx as u32, slot.generation);
                group
                    .contains(entity)
                    .then(|| EntityMut::new(entity, slot, &names))
            })
            .collect();

        let sizes = partition_sizes(items.len(), self.config.effective_threads());
        log::trace!(
            "{}: {} entities in partitions {:?}",
            self.job.name(),
            items.len(),
            sizes
        );

        let first_error = Mutex::new(None);
        run_partitions(&self.job, &mut items, &sizes, &first_error);
        self.last_partition = sizes;

        match first_error.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn run_chunk<J: Job>(job: &J, chunk: &mut [EntityMut<'_>], first_error: &Mutex<Option<EcsError>>) {
    for item in chunk.iter_mut() {
        if let Err(err) = job.execute(item) {
            let err = EcsError::JobFailed {
                job: job.name().to_string(),
                entity: item.id(),
                source: err.into(),
            };
            let mut slot = first_error.lock();
            if slot.is_none() {
                *slot = Some(err);
            } else {
                log::debug!("Suppressed follow-up job failure: {err}");
            }
            return;
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn run_partitions<J: Job>(
    job: &J,
    items: &mut [EntityMut<'_>],
    sizes: &[usize],
    first_error: &Mutex<Option<EcsError>>,
) {
    if sizes.len() <= 1 {
        run_chunk(job, items, first_error);
        return;
    }
    std::thread::scope(|scope| {
        let mut rest = items;
        for &size in sizes {
            let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(size);
            rest = tail;
            scope.spawn(move || run_chunk(job, chunk, first_error));
        }
    });
}

/// WASM fallback: partitions run one after another.
#[cfg(target_arch = "wasm32")]
fn run_partitions<J: Job>(
    job: &J,
    items: &mut [EntityMut<'_>],
    sizes: &[usize],
    first_error: &Mutex<Option<EcsError>>,
) {
    let mut rest = items;
    for &size in sizes {
        let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(size);
        rest = tail;
        run_chunk(job, chunk, first_error);
    }
}

impl<J: Job + Send> System for JobSystem<J> {
    fn name(&self) -> &str {
        self.job.name()
    }

    fn execute(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        Ok(self.run(ctx)?)
    }
}

impl<J: Job> fmt::Display for JobSystem<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobSystem({})", self.job.name())
    }
}
