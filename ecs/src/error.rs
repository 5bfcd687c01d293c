use thiserror::Error;

use crate::aerc::Owner;

/// Errors reported by the ownership strategy of a single entity.
///
/// The context turns these into [`EcsError`] values that carry the
/// description of the offending entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AercError {
    /// The owner already holds a retention on the entity.
    #[error("{0} already retains this entity")]
    AlreadyRetained(Owner),
    /// The owner holds no retention on the entity, or the count would underflow.
    #[error("{0} does not retain this entity")]
    NotRetained(Owner),
}

/// Every contract violation the ECS core can report.
///
/// Messages follow a `message\nhint` layout so they read well both in logs
/// and in test failure output.
#[derive(Debug, Error)]
pub enum EcsError {
    // --- lifecycle ---------------------------------------------------------
    /// The entity was destroyed and can no longer be mutated.
    #[error("Cannot {action} {entity}!\nThe entity was already destroyed. You cannot modify a destroyed entity.")]
    NotEnabled { action: &'static str, entity: String },

    /// The handle points at a slot that was recycled or never existed.
    #[error("Unknown entity {0:?}!\nThe handle refers to a released or foreign entity.")]
    UnknownEntity(crate::Entity),

    /// Releasing the last retention of an entity that is still alive.
    #[error("Entity is not destroyed yet: {0}!\nAn entity can only be released by its context after it was destroyed.")]
    EntityNotDestroyed(String),

    // --- composition -------------------------------------------------------
    /// `add_component` on an occupied slot.
    #[error("Cannot add component '{component}' to {entity}!\nYou should check if an entity already has the component before adding it or use replace_component().")]
    DuplicateComponent { component: String, entity: String },

    /// Reading or removing an empty slot.
    #[error("Cannot {action} component '{component}' from {entity}!\nYou should check if an entity has the component before {action_ing} it.")]
    ComponentMissing {
        action: &'static str,
        action_ing: &'static str,
        component: String,
        entity: String,
    },

    /// Typed read of a slot holding a different concrete type.
    #[error("Component '{component}' of {entity} is not a {expected}!\nThe slot holds a different component type.")]
    ComponentTypeMismatch {
        component: String,
        entity: String,
        expected: &'static str,
    },

    /// Component index outside `[0, total_components)`.
    #[error("Component index {index} is out of range!\nThe context only has {total} component slots.")]
    ComponentIndexOutOfRange { index: usize, total: usize },

    /// No pooled instance and no registered factory for the index.
    #[error("Cannot create component '{0}'!\nRegister a factory for this component index on the context builder.")]
    NoComponentFactory(String),

    // --- ownership ---------------------------------------------------------
    /// The owner already retains the entity.
    #[error("Entity is already retained by {owner}: {entity}!\nThe same owner cannot retain an entity twice.")]
    AlreadyRetainedByOwner { owner: Owner, entity: String },

    /// Release by an owner that holds no retention.
    #[error("Entity is not retained by {owner}: {entity}!\nAn owner can only release an entity it retained before.")]
    NotRetainedByOwner { owner: Owner, entity: String },

    // --- structure ---------------------------------------------------------
    /// Merging a matcher that has more than one index of its own.
    #[error("Cannot merge matcher {0}!\nEach merged matcher must have exactly one index.")]
    InvalidMatcherMerge(String),

    /// A matcher without any allOf or anyOf index cannot back a group.
    #[error("Cannot create a group for an empty matcher {0}!\nA matcher needs at least one allOf or anyOf index.")]
    EmptyMatcher(String),

    /// Collector groups and event kinds must pair up.
    #[error("Unbalanced count with groups ({groups}) and group events ({events}).\nGroup and group events count must be equal.")]
    GroupEventCountMismatch { groups: usize, events: usize },

    /// Context info name table does not match the component count.
    #[error("Invalid ContextInfo for '{context}'!\nExpected {expected} component_name(s) but got {actual}.")]
    ComponentNameCountMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// `get_single_entity` on a group with more than one member.
    #[error("Cannot get the single entity from {group}!\nGroup contains {count} entities.")]
    GroupSingleEntity { group: String, count: usize },

    // --- indices -----------------------------------------------------------
    /// A primary index got a second entity for the same key.
    #[error("Entity for key '{key}' already exists in {index}!\nOnly one entity for a primary key is allowed.")]
    DuplicateKey { index: String, key: String },

    /// Lookup of an index that was never registered (or has another type).
    #[error("Cannot get entity index '{name}' from {context}!\nNo entity index with this name has been added.")]
    IndexNotFound { name: String, context: String },

    /// Registering an index under a name already in use.
    #[error("Cannot add entity index '{name}' to {context}!\nAn entity index with this name has already been added.")]
    IndexAlreadyExists { name: String, context: String },

    // --- teardown ----------------------------------------------------------
    /// `destroy_all_entities` found retentions held by other owners.
    #[error("{context} detected retained entities although all entities got destroyed!\nDid you release all entities? Try calling systems.deactivate_reactive_systems() and systems.clear_reactive_systems() before calling context.destroy_all_entities() to avoid memory leaks. Retained: {entities}")]
    EntitiesStillRetained { context: String, entities: String },

    // --- parallel processing -----------------------------------------------
    /// A job worker callback failed; raised after all workers joined.
    #[error("Job '{job}' failed while processing {entity:?}: {source}")]
    JobFailed {
        job: String,
        entity: crate::Entity,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl EcsError {
    pub(crate) fn from_aerc(err: AercError, entity: String) -> Self {
        match err {
            AercError::AlreadyRetained(owner) => EcsError::AlreadyRetainedByOwner { owner, entity },
            AercError::NotRetained(owner) => EcsError::NotRetainedByOwner { owner, entity },
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = EcsError> = std::result::Result<T, E>;

/// Records `result`'s error unless an earlier one is already held.
///
/// Event propagation keeps delivering after a subscriber fails and reports
/// the first failure once the whole change has been observed.
pub(crate) fn keep_first(first: &mut Option<EcsError>, result: Result<()>) {
    if let Err(err) = result {
        if first.is_none() {
            *first = Some(err);
        } else {
            log::debug!("Suppressed follow-up error during event propagation: {err}");
        }
    }
}
