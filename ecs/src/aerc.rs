//! Automatic Entity Reference Counting.
//!
//! Every entity carries one [`Aerc`] instance that tracks who still holds
//! on to it. A destroyed entity only returns to its context's free list
//! once the count drops to zero.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::AercError;

/// Opaque identity of something that can retain entities.
///
/// Contexts, groups, collectors, indices and reactive systems each allocate
/// one; user code can allocate its own with [`Owner::new`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Owner(u64);

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

impl Owner {
    /// Allocates a process-unique owner token.
    pub fn new() -> Self {
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl Default for Owner {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Owner({})", self.0)
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Owner({})", self.0)
    }
}

/// Ownership-tracking strategy for a single entity.
pub trait Aerc: Send + Sync {
    /// Number of retentions currently held.
    fn retain_count(&self) -> usize;

    fn retain(&mut self, owner: Owner) -> Result<(), AercError>;

    fn release(&mut self, owner: Owner) -> Result<(), AercError>;

    /// Whether `owner` holds a retention. Strategies without owner
    /// tracking answer `true` while any retention is held.
    fn is_retained_by(&self, owner: Owner) -> bool;
}

/// Builds a fresh [`Aerc`] for every newly allocated entity slot.
pub type AercFactory = Arc<dyn Fn() -> Box<dyn Aerc> + Send + Sync>;

/// Tracks the set of distinct owners.
///
/// Double retains by the same owner and releases by a non-owner are errors.
#[derive(Debug, Default, Clone)]
pub struct SafeAerc {
    owners: HashSet<Owner>,
}

impl SafeAerc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory for [`ContextBuilder::aerc`](crate::ContextBuilder::aerc).
    pub fn factory() -> AercFactory {
        Arc::new(|| Box::new(SafeAerc::new()))
    }

    pub fn owners(&self) -> impl Iterator<Item = Owner> + '_ {
        self.owners.iter().copied()
    }
}

impl Aerc for SafeAerc {
    fn retain_count(&self) -> usize {
        self.owners.len()
    }

    fn retain(&mut self, owner: Owner) -> Result<(), AercError> {
        if self.owners.insert(owner) {
            Ok(())
        } else {
            Err(AercError::AlreadyRetained(owner))
        }
    }

    fn release(&mut self, owner: Owner) -> Result<(), AercError> {
        if self.owners.remove(&owner) {
            Ok(())
        } else {
            Err(AercError::NotRetained(owner))
        }
    }

    fn is_retained_by(&self, owner: Owner) -> bool {
        self.owners.contains(&owner)
    }
}

/// Plain counter with no owner validation.
///
/// Only an underflow is reported. Use when the caller guarantees balanced
/// retain/release pairs and wants to skip the set bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsafeAerc {
    count: usize,
}

impl UnsafeAerc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory() -> AercFactory {
        Arc::new(|| Box::new(UnsafeAerc::new()))
    }
}

impl Aerc for UnsafeAerc {
    fn retain_count(&self) -> usize {
        self.count
    }

    fn retain(&mut self, _owner: Owner) -> Result<(), AercError> {
        self.count += 1;
        Ok(())
    }

    fn release(&mut self, owner: Owner) -> Result<(), AercError> {
        self.count = self
            .count
            .checked_sub(1)
            .ok_or(AercError::NotRetained(owner))?;
        Ok(())
    }

    fn is_retained_by(&self, _owner: Owner) -> bool {
        self.count > 0
    }
}
