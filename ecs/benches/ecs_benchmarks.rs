#![allow(dead_code)]

use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};

use entitas_ecs::{
    CollectorId, Context, EcsError, Entity, EntityMut, GroupEvent, Job, JobConfig, JobSystem,
    Matcher, Reactive, ReactiveSystem, System, SystemError,
};

// ---------------------------------------------------------------------------
// Helper component types
// ---------------------------------------------------------------------------

const POSITION: usize = 0;
const VELOCITY: usize = 1;
const HEALTH: usize = 2;
const TOTAL: usize = 3;

#[derive(Debug, Clone, Copy)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Debug, Clone, Copy)]
struct Velocity {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Debug, Clone, Copy)]
struct Health(f32);

fn populated(count: usize) -> (Context, Vec<Entity>) {
    let mut ctx = Context::new(TOTAL);
    let entities = (0..count)
        .map(|i| {
            let e = ctx.create_entity();
            ctx.add(
                e,
                POSITION,
                Position {
                    x: i as f32,
                    y: 0.0,
                    z: 0.0,
                },
            )
            .unwrap();
            ctx.add(
                e,
                VELOCITY,
                Velocity {
                    x: 1.0,
                    y: 0.0,
                    z: 0.0,
                },
            )
            .unwrap();
            e
        })
        .collect();
    (ctx, entities)
}

// ---------------------------------------------------------------------------
// Entity lifecycle
// ---------------------------------------------------------------------------

fn bench_create_entities_1k(c: &mut Criterion) {
    c.bench_function("create_1k_entities", |b| {
        b.iter_batched(
            || Context::new(TOTAL),
            |mut ctx| {
                for _ in 0..1_000 {
                    black_box(ctx.create_entity());
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_create_destroy_recycling(c: &mut Criterion) {
    c.bench_function("create_destroy_recycle_1k", |b| {
        b.iter_batched(
            || {
                let mut ctx = Context::new(TOTAL);
                let entities: Vec<_> = (0..1_000).map(|_| ctx.create_entity()).collect();
                for e in entities {
                    ctx.destroy_entity(e).unwrap();
                }
                ctx
            },
            |mut ctx| {
                for _ in 0..1_000 {
                    black_box(ctx.create_entity());
                }
            },
            BatchSize::SmallInput,
        );
    });
}

// ---------------------------------------------------------------------------
// Component operations
// ---------------------------------------------------------------------------

fn bench_add_component_1k(c: &mut Criterion) {
    c.bench_function("add_component_1k", |b| {
        b.iter_batched(
            || {
                let mut ctx = Context::new(TOTAL);
                let entities: Vec<_> = (0..1_000).map(|_| ctx.create_entity()).collect();
                (ctx, entities)
            },
            |(mut ctx, entities)| {
                for e in entities {
                    ctx.add(e, HEALTH, Health(100.0)).unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_remove_component_1k(c: &mut Criterion) {
    c.bench_function("remove_component_1k", |b| {
        b.iter_batched(
            || populated(1_000),
            |(mut ctx, entities)| {
                for e in entities {
                    ctx.remove_component(e, VELOCITY).unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_replace_with_group_1k(c: &mut Criterion) {
    c.bench_function("replace_component_grouped_1k", |b| {
        b.iter_batched(
            || {
                let (mut ctx, entities) = populated(1_000);
                ctx.get_group(&Matcher::all_of([POSITION, VELOCITY])).unwrap();
                (ctx, entities)
            },
            |(mut ctx, entities)| {
                for e in entities {
                    ctx.replace(
                        e,
                        POSITION,
                        Position {
                            x: 1.0,
                            y: 1.0,
                            z: 1.0,
                        },
                    )
                    .unwrap();
                }
            },
            BatchSize::SmallInput,
        );
    });
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

fn bench_group_churn_1k(c: &mut Criterion) {
    c.bench_function("group_churn_1k", |b| {
        b.iter_batched(
            || {
                let (mut ctx, entities) = populated(1_000);
                let group = ctx
                    .get_group(&Matcher::all_of([POSITION]).none_of([HEALTH]))
                    .unwrap();
                (ctx, entities, group)
            },
            |(mut ctx, entities, group)| {
                for &e in &entities {
                    ctx.add(e, HEALTH, Health(1.0)).unwrap();
                }
                black_box(ctx.group(group).count());
                for &e in &entities {
                    ctx.remove_component(e, HEALTH).unwrap();
                }
                black_box(ctx.group(group).count());
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_group_snapshot_10k(c: &mut Criterion) {
    let (mut ctx, _) = populated(10_000);
    let group = ctx.get_group(&Matcher::all_of([POSITION, VELOCITY])).unwrap();
    c.bench_function("group_snapshot_10k", |b| {
        b.iter(|| {
            let mut sum = 0.0f32;
            for e in ctx.group(group).iter() {
                sum += ctx.get::<Position>(e, POSITION).unwrap().x;
            }
            black_box(sum);
        });
    });
}

// ---------------------------------------------------------------------------
// Systems
// ---------------------------------------------------------------------------

struct Damage;

impl Reactive for Damage {
    fn trigger(&self, ctx: &mut Context) -> Result<CollectorId, EcsError> {
        ctx.create_collector_for(&Matcher::all_of([HEALTH]), GroupEvent::Added)
    }

    fn execute(&mut self, ctx: &mut Context, entities: &[Entity]) -> Result<(), SystemError> {
        for &e in entities {
            ctx.update::<Health>(e, HEALTH, |h| h.0 -= 1.0)?;
        }
        Ok(())
    }
}

fn bench_reactive_execute_1k(c: &mut Criterion) {
    c.bench_function("reactive_execute_1k", |b| {
        b.iter_batched(
            || {
                let (mut ctx, entities) = populated(1_000);
                let system = ReactiveSystem::new(&mut ctx, Damage).unwrap();
                for e in entities {
                    ctx.add(e, HEALTH, Health(10.0)).unwrap();
                }
                (ctx, system)
            },
            |(mut ctx, mut system)| {
                system.execute(&mut ctx).unwrap();
            },
            BatchSize::SmallInput,
        );
    });
}

struct Integrate;

impl Job for Integrate {
    type Error = EcsError;

    fn execute(&self, entity: &mut EntityMut<'_>) -> Result<(), EcsError> {
        let v = *entity.get::<Velocity>(VELOCITY)?;
        let p = entity.get_mut::<Position>(POSITION)?;
        p.x += v.x;
        p.y += v.y;
        p.z += v.z;
        Ok(())
    }
}

fn bench_job_system_10k(c: &mut Criterion) {
    let (mut ctx, _) = populated(10_000);
    let mut system = JobSystem::new(
        &mut ctx,
        &Matcher::all_of([POSITION, VELOCITY]),
        Integrate,
        JobConfig::default(),
    )
    .unwrap();
    c.bench_function("job_system_10k", |b| {
        b.iter(|| system.run(&mut ctx).unwrap());
    });
}

criterion_group!(
    benches,
    bench_create_entities_1k,
    bench_create_destroy_recycling,
    bench_add_component_1k,
    bench_remove_component_1k,
    bench_replace_with_group_1k,
    bench_group_churn_1k,
    bench_group_snapshot_10k,
    bench_reactive_execute_1k,
    bench_job_system_10k,
);
criterion_main!(benches);
