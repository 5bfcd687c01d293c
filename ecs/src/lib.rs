//! # Entitas ECS
//!
//! Reactive Entity-Component-System core with matcher-driven groups,
//! collectors and reference-counted entity lifetimes.
//!
//! ## Core Types
//!
//! - [`Context`]: Entity arena, component pools, group cache and named indices
//! - [`Entity`]: Generational entity handle; [`EntityRef`] / [`EntityMut`] are views
//! - [`Component`]: Any `Clone + Debug + Send + Sync` value stored in an index slot
//! - [`Matcher`]: AllOf / AnyOf / NoneOf predicate over component indices
//! - [`Group`]: Incrementally maintained set of entities matching one matcher
//! - [`Collector`]: Batch of entities that entered or left groups
//!
//! ## Ownership
//!
//! - [`Owner`]: Opaque retaining identity
//! - [`Aerc`]: Retain/release strategy: [`SafeAerc`] (owner set) or [`UnsafeAerc`] (counter)
//!
//! ## Indices
//!
//! - [`EntityIndex`]: Key → entities
//! - [`PrimaryEntityIndex`]: Key → unique entity
//!
//! ## Systems
//!
//! - [`System`] / [`Systems`]: Phased per-frame logic and its ordered composite
//! - [`ReactiveSystem`] / [`MultiReactiveSystem`]: Logic driven by collector batches
//! - [`JobSystem`]: Parallel per-entity processing over a group
//!
//! All propagation is synchronous: a mutation updates every interested
//! group, collector, index and listener before the mutating call returns.

mod aerc;
mod collector;
mod component;
mod context;
mod context_info;
mod entity;
mod entity_index;
mod error;
mod events;
mod group;
mod job_system;
mod matcher;
mod reactive_system;
mod system;

pub use aerc::{Aerc, AercFactory, Owner, SafeAerc, UnsafeAerc};
pub use collector::{Collector, CollectorId, GroupEvent};
pub use component::{Component, ComponentFactory, ComponentIndex, ComponentPool};
pub use context::{Context, ContextBuilder};
pub use context_info::ContextInfo;
pub use entity::{Entity, EntityMut, EntityRef};
pub use entity_index::{EntityIndex, EntityIndexStorage, IndexId, IndexKey, PrimaryEntityIndex};
pub use error::{AercError, EcsError, Result};
pub use events::{
    ComponentChanged, ComponentHandler, EntityHandler, GroupChanged, GroupCreatedHandler,
    GroupHandler, ListenerId,
};
pub use group::{Group, GroupId};
pub use job_system::{Job, JobConfig, JobSystem, partition_sizes};
pub use matcher::{Matcher, MatcherKind};
pub use reactive_system::{MultiReactive, MultiReactiveSystem, Reactive, ReactiveSystem};
pub use system::{System, SystemError, SystemId, Systems};
