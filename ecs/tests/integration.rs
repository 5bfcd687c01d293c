use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use entitas_ecs::{
    CollectorId, Context, ContextBuilder, ContextInfo, EcsError, Entity, EntityMut, EntityRef,
    GroupEvent, Job, JobConfig, JobSystem, Matcher, Owner, PrimaryEntityIndex, Reactive,
    ReactiveSystem, System, SystemError, Systems,
};

// ---------------------------------------------------------------------------
// Helper component types
// ---------------------------------------------------------------------------

const POSITION: usize = 0;
const VELOCITY: usize = 1;
const NAME: usize = 2;
const TOTAL: usize = 3;

#[derive(Debug, Clone, PartialEq)]
struct Position(i32, i32);

#[derive(Debug, Clone, PartialEq)]
struct Velocity(i32, i32);

#[derive(Debug, Clone, PartialEq)]
struct Name(String);

fn game_context() -> Context {
    ContextBuilder::new(TOTAL)
        .info(ContextInfo::new(
            "Game",
            vec!["Position".into(), "Velocity".into(), "Name".into()],
        ))
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Groups
// ---------------------------------------------------------------------------

#[test]
fn group_releases_retention_when_entity_leaves() {
    let mut ctx = game_context();
    let e = ctx.create_entity();
    let baseline = ctx.retain_count(e).unwrap();

    ctx.add(e, VELOCITY, Velocity(1, 0)).unwrap();
    ctx.add(e, NAME, Name("Max".into())).unwrap();
    let group = ctx.get_group(&Matcher::all_of([VELOCITY, NAME])).unwrap();
    assert_eq!(&*ctx.group(group).entities(), &[e]);
    assert_eq!(ctx.group(group).to_string(), "Group(AllOf(Velocity, Name))");

    ctx.remove_component(e, VELOCITY).unwrap();
    assert!(!ctx.group(group).contains(e));
    assert_eq!(ctx.retain_count(e).unwrap(), baseline);
}

/// Small deterministic generator for mutation sequences.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }
}

#[test]
fn groups_always_equal_matching_live_entities() {
    let mut ctx = game_context();
    let matchers = [
        Matcher::all_of([POSITION, VELOCITY]),
        Matcher::any_of([VELOCITY, NAME]),
        Matcher::all_of([POSITION]).none_of([NAME]),
        Matcher::all_of([NAME]).and_any_of([POSITION, VELOCITY]),
    ];
    let groups: Vec<_> = matchers
        .iter()
        .map(|m| ctx.get_group(m).unwrap())
        .collect();

    let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);
    let mut live: Vec<Entity> = Vec::new();

    for _ in 0..2_000 {
        match rng.below(6) {
            0 => live.push(ctx.create_entity()),
            1 if !live.is_empty() => {
                let e = live.swap_remove(rng.below(live.len()));
                ctx.destroy_entity(e).unwrap();
            }
            _ if !live.is_empty() => {
                let e = live[rng.below(live.len())];
                let index = rng.below(TOTAL);
                if ctx.has_component(e, index).unwrap() {
                    if rng.below(2) == 0 {
                        ctx.remove_component(e, index).unwrap();
                    } else {
                        ctx.replace(e, index, Position(1, 1)).unwrap();
                    }
                } else {
                    ctx.add(e, index, Position(0, 0)).unwrap();
                }
            }
            _ => {}
        }

        for (matcher, &group) in matchers.iter().zip(&groups) {
            let expected: BTreeSet<Entity> = ctx
                .get_entities()
                .iter()
                .copied()
                .filter(|&e| {
                    let view = ctx.entity(e).unwrap();
                    let has = |i: &usize| view.has_component(*i);
                    matcher.all_of_indices().iter().all(has)
                        && (matcher.any_of_indices().is_empty()
                            || matcher.any_of_indices().iter().any(has))
                        && !matcher.none_of_indices().iter().any(has)
                })
                .collect();
            let actual: BTreeSet<Entity> = ctx.group(group).entities().iter().copied().collect();
            assert_eq!(actual, expected, "group {}", ctx.group(group));
        }
    }

    assert_eq!(ctx.get_entities().len(), live.len());
}

#[test]
fn has_component_agrees_with_get_component() {
    let mut ctx = game_context();
    let e = ctx.create_entity();
    ctx.add(e, NAME, Name("Max".into())).unwrap();
    for index in 0..TOTAL {
        assert_eq!(
            ctx.has_component(e, index).unwrap(),
            ctx.get_component(e, index).is_ok()
        );
    }
}

#[test]
fn matchers_compare_by_index_sets() {
    let a = Matcher::all_of([VELOCITY, POSITION, POSITION]).none_of([NAME]);
    let b = Matcher::all_of([POSITION, VELOCITY]).none_of([NAME]);
    assert_eq!(a, b);
    assert_ne!(a, Matcher::all_of([POSITION, VELOCITY]));

    let mut ctx = game_context();
    assert_eq!(ctx.get_group(&a).unwrap(), ctx.get_group(&b).unwrap());
}

#[test]
fn collector_holds_each_entity_once() {
    let mut ctx = game_context();
    let collector = ctx
        .create_collector_for(&Matcher::any_of([POSITION, VELOCITY]), GroupEvent::AddedOrRemoved)
        .unwrap();

    let e = ctx.create_entity();
    let baseline = ctx.retain_count(e).unwrap();
    ctx.add(e, POSITION, Position(0, 0)).unwrap();
    ctx.remove_component(e, POSITION).unwrap();
    ctx.add(e, VELOCITY, Velocity(0, 0)).unwrap();

    assert_eq!(ctx.collector(collector).entities(), &[e]);
    assert_eq!(ctx.retain_count(e).unwrap(), baseline + 2);

    ctx.clear_collected_entities(collector).unwrap();
    assert!(ctx.collector(collector).is_empty());
    assert_eq!(ctx.retain_count(e).unwrap(), baseline + 1);
}

// ---------------------------------------------------------------------------
// Entity indices
// ---------------------------------------------------------------------------

fn name_key(e: EntityRef<'_>, c: Option<&dyn entitas_ecs::Component>) -> String {
    c.or_else(|| e.get_component(NAME).ok())
        .and_then(|c| c.downcast_ref::<Name>())
        .map(|n| n.0.clone())
        .unwrap_or_default()
}

#[test]
fn primary_index_rejects_duplicates_and_releases_on_removal() {
    let mut ctx = game_context();
    let group = ctx.get_group(&Matcher::all_of([NAME])).unwrap();
    ctx.add_entity_index(group, PrimaryEntityIndex::new("Name", name_key))
        .unwrap();

    let e1 = ctx.create_entity();
    let baseline = ctx.retain_count(e1).unwrap();
    ctx.add(e1, NAME, Name("Max".into())).unwrap();

    let e2 = ctx.create_entity();
    let err = ctx.add(e2, NAME, Name("Max".into())).unwrap_err();
    assert!(matches!(err, EcsError::DuplicateKey { .. }));

    ctx.remove_component(e1, NAME).unwrap();
    assert_eq!(
        ctx.get_entity_with_key("Name", &"Max".to_string()).unwrap(),
        None
    );
    assert_eq!(ctx.retain_count(e1).unwrap(), baseline);
}

// ---------------------------------------------------------------------------
// Reactive systems
// ---------------------------------------------------------------------------

struct MoveSystem {
    runs: usize,
}

impl Reactive for MoveSystem {
    fn trigger(&self, ctx: &mut Context) -> Result<CollectorId, EcsError> {
        ctx.create_collector_for(&Matcher::all_of([VELOCITY]), GroupEvent::Added)
    }

    fn filter(&self, entity: EntityRef<'_>) -> bool {
        entity.has_component(POSITION)
    }

    fn execute(&mut self, ctx: &mut Context, entities: &[Entity]) -> Result<(), SystemError> {
        self.runs += 1;
        for &e in entities {
            let v = ctx.get::<Velocity>(e, VELOCITY)?.clone();
            ctx.update::<Position>(e, POSITION, |p| {
                p.0 += v.0;
                p.1 += v.1;
            })?;
        }
        Ok(())
    }
}

#[test]
fn reactive_system_runs_once_per_batch() {
    let mut ctx = game_context();
    let mut system = ReactiveSystem::new(&mut ctx, MoveSystem { runs: 0 }).unwrap();

    let e = ctx.create_entity();
    ctx.add(e, POSITION, Position(0, 0)).unwrap();
    ctx.add(e, VELOCITY, Velocity(2, 3)).unwrap();

    system.execute(&mut ctx).unwrap();
    system.execute(&mut ctx).unwrap();
    assert_eq!(system.logic().runs, 1);
    assert_eq!(ctx.get::<Position>(e, POSITION).unwrap(), &Position(2, 3));
}

#[test]
fn systems_drive_reactive_lifecycle() {
    let mut ctx = game_context();
    let reactive = ReactiveSystem::new(&mut ctx, MoveSystem { runs: 0 }).unwrap();
    let mut systems = Systems::named("Game").with(reactive);
    systems.initialize(&mut ctx).unwrap();

    let e = ctx.create_entity();
    ctx.add(e, POSITION, Position(0, 0)).unwrap();
    ctx.add(e, VELOCITY, Velocity(1, 1)).unwrap();

    // Collected but never executed: retained until cleared.
    ctx.destroy_entity(e).unwrap();
    assert!(matches!(
        ctx.destroy_all_entities(),
        Err(EcsError::EntitiesStillRetained { .. })
    ));

    systems.deactivate_reactive_systems(&mut ctx).unwrap();
    systems.clear_reactive_systems(&mut ctx).unwrap();
    ctx.destroy_all_entities().unwrap();
    systems.tear_down(&mut ctx).unwrap();
}

// ---------------------------------------------------------------------------
// Job system
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Visits(u32);

struct CountVisits {
    fail_at: Option<u32>,
    seen: Mutex<Vec<u32>>,
}

impl Job for CountVisits {
    type Error = String;

    fn execute(&self, entity: &mut EntityMut<'_>) -> Result<(), String> {
        if Some(entity.creation_index()) == self.fail_at {
            return Err(format!("refusing entity {}", entity.creation_index()));
        }
        entity
            .get_mut::<Visits>(POSITION)
            .map_err(|e| e.to_string())?
            .0 += 1;
        self.seen.lock().push(entity.creation_index());
        Ok(())
    }
}

fn visit_context(count: usize) -> (Context, Vec<Entity>) {
    let mut ctx = Context::new(TOTAL);
    let entities = (0..count)
        .map(|_| {
            let e = ctx.create_entity();
            ctx.add(e, POSITION, Visits(0)).unwrap();
            e
        })
        .collect();
    (ctx, entities)
}

#[test]
fn job_system_processes_every_entity_once() {
    let (mut ctx, entities) = visit_context(103);
    let job = CountVisits {
        fail_at: None,
        seen: Mutex::new(Vec::new()),
    };
    let mut system =
        JobSystem::new(&mut ctx, &Matcher::all_of([POSITION]), job, JobConfig::with_threads(4))
            .unwrap();
    system.run(&mut ctx).unwrap();

    let partition = system.last_partition();
    assert_eq!(partition.iter().sum::<usize>(), 103);
    let max = partition.iter().max().unwrap();
    let min = partition.iter().min().unwrap();
    assert!(max - min <= 1);

    for &e in &entities {
        assert_eq!(ctx.get::<Visits>(e, POSITION).unwrap().0, 1);
    }
    let mut seen = system.job().seen.lock().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..103).collect::<Vec<u32>>());
}

#[test]
fn job_failure_surfaces_after_all_workers_finish() {
    let (mut ctx, entities) = visit_context(103);
    let job = CountVisits {
        fail_at: Some(10),
        seen: Mutex::new(Vec::new()),
    };
    let mut system =
        JobSystem::new(&mut ctx, &Matcher::all_of([POSITION]), job, JobConfig::with_threads(4))
            .unwrap();

    let err = system.run(&mut ctx).unwrap_err();
    match &err {
        EcsError::JobFailed { entity, .. } => assert_eq!(*entity, entities[10]),
        other => panic!("unexpected error: {other}"),
    }

    // The failing worker owns slots 0..26 and stops at 10; the others finish.
    let visits = |e: Entity| ctx.get::<Visits>(e, POSITION).unwrap().0;
    assert!(entities[..10].iter().all(|&e| visits(e) == 1));
    assert!(entities[10..26].iter().all(|&e| visits(e) == 0));
    assert!(entities[26..].iter().all(|&e| visits(e) == 1));

    // Still usable afterwards.
    let err = system.run(&mut ctx).unwrap_err();
    assert!(matches!(err, EcsError::JobFailed { .. }));
}

// ---------------------------------------------------------------------------
// Teardown
// ---------------------------------------------------------------------------

#[test]
fn destroy_all_entities_requires_released_retentions() {
    let mut ctx = game_context();
    let owner = Owner::new();
    let kept = ctx.create_entity();
    ctx.create_entity();
    ctx.retain(kept, owner).unwrap();

    assert!(matches!(
        ctx.destroy_all_entities(),
        Err(EcsError::EntitiesStillRetained { .. })
    ));

    ctx.release(kept, owner).unwrap();
    ctx.destroy_all_entities().unwrap();
    assert!(ctx.get_entities().is_empty());
    assert_eq!(ctx.reusable_entities_count(), 2);
}

#[test]
fn reset_restarts_creation_and_drops_handlers() {
    let mut ctx = game_context();
    let created = Arc::new(Mutex::new(0));
    let count = created.clone();
    ctx.on_entity_created(move |_, _| *count.lock() += 1);

    ctx.create_entity();
    ctx.create_entity();
    ctx.reset().unwrap();

    let e = ctx.create_entity();
    assert_eq!(ctx.entity(e).unwrap().creation_index(), 0);
    assert_eq!(*created.lock(), 2);
}

#[test]
fn event_handlers_see_consistent_state_during_cascade() {
    let mut ctx = game_context();
    let names = ctx.get_group(&Matcher::all_of([NAME])).unwrap();

    // Every named entity spawns a positioned companion.
    ctx.group_mut(names).on_entity_added(|ctx, ev| {
        let companion = ctx.create_entity();
        let label = ctx.get::<Name>(ev.entity, NAME).unwrap().0.clone();
        ctx.add(companion, POSITION, Position(label.len() as i32, 0))
            .unwrap();
    });

    let positioned = ctx.get_group(&Matcher::all_of([POSITION])).unwrap();
    let e = ctx.create_entity();
    ctx.add(e, NAME, Name("Max".into())).unwrap();

    assert_eq!(ctx.group(positioned).count(), 1);
    let companion = ctx.group(positioned).single_entity().unwrap().unwrap();
    assert_eq!(
        ctx.get::<Position>(companion, POSITION).unwrap(),
        &Position(3, 0)
    );
}
