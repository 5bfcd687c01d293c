use std::fmt;

use crate::context::Context;
use crate::error::EcsError;

/// Failure raised by a system phase.
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error(transparent)]
    Ecs(#[from] EcsError),
    #[error("{0}")]
    Custom(Box<dyn std::error::Error + Send + Sync>),
}

impl SystemError {
    /// Wraps an arbitrary error raised by user logic.
    pub fn custom(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        SystemError::Custom(err.into())
    }
}

/// Unit of per-frame logic operating on a [`Context`].
///
/// Every phase defaults to a no-op, so a system implements only what it
/// needs. The reactive phases (`activate`, `deactivate`, `clear`) are
/// meaningful for collector-driven systems and forwarded by [`Systems`].
///
/// # Example
///
/// ```
/// use entitas_ecs::{Context, System, SystemError};
///
/// struct Tick(u32);
///
/// impl System for Tick {
///     fn execute(&mut self, _ctx: &mut Context) -> Result<(), SystemError> {
///         self.0 += 1;
///         Ok(())
///     }
/// }
///
/// let mut ctx = Context::new(1);
/// let mut tick = Tick(0);
/// tick.execute(&mut ctx).unwrap();
/// assert_eq!(tick.0, 1);
/// ```
pub trait System: Send {
    /// Human-readable name for logs and diagnostics.
    fn name(&self) -> &str {
        let full = std::any::type_name::<Self>();
        let base = full.split('<').next().unwrap_or(full);
        base.rsplit("::").next().unwrap_or(base)
    }

    fn initialize(&mut self, _ctx: &mut Context) -> Result<(), SystemError> {
        Ok(())
    }

    fn execute(&mut self, _ctx: &mut Context) -> Result<(), SystemError> {
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut Context) -> Result<(), SystemError> {
        Ok(())
    }

    fn tear_down(&mut self, _ctx: &mut Context) -> Result<(), SystemError> {
        Ok(())
    }

    fn activate(&mut self, _ctx: &mut Context) -> Result<(), SystemError> {
        Ok(())
    }

    fn deactivate(&mut self, _ctx: &mut Context) -> Result<(), SystemError> {
        Ok(())
    }

    fn clear(&mut self, _ctx: &mut Context) -> Result<(), SystemError> {
        Ok(())
    }
}

/// Identifier returned by [`Systems::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SystemId(u32);

/// Ordered composite of systems, itself a [`System`].
///
/// Phases run over the children in insertion order and stop at the first
/// error. Nested `Systems` receive every phase recursively.
pub struct Systems {
    name: String,
    systems: Vec<(SystemId, Box<dyn System>)>,
    next_id: u32,
}

impl Systems {
    pub fn new() -> Self {
        Self::named("Systems")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            systems: Vec::new(),
            next_id: 0,
        }
    }

    pub fn add(&mut self, system: impl System + 'static) -> SystemId {
        let id = SystemId(self.next_id);
        self.next_id += 1;
        log::trace!("{}: added system {}", self.name, system.name());
        self.systems.push((id, Box::new(system)));
        id
    }

    /// Chaining variant of [`add`](Self::add).
    pub fn with(mut self, system: impl System + 'static) -> Self {
        self.add(system);
        self
    }

    /// Removes and returns a system. Returns `None` for unknown ids.
    pub fn remove(&mut self, id: SystemId) -> Option<Box<dyn System>> {
        let pos = self.systems.iter().position(|(sid, _)| *sid == id)?;
        Some(self.systems.remove(pos).1)
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.systems.iter().map(|(_, s)| s.name())
    }

    fn run(
        &mut self,
        ctx: &mut Context,
        phase: &str,
        f: impl Fn(&mut dyn System, &mut Context) -> Result<(), SystemError>,
    ) -> Result<(), SystemError> {
        for (_, system) in &mut self.systems {
            if let Err(err) = f(&mut **system, ctx) {
                log::debug!("{}: {} failed in {phase}: {err}", self.name, system.name());
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn activate_reactive_systems(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        self.activate(ctx)
    }

    pub fn deactivate_reactive_systems(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        self.deactivate(ctx)
    }

    pub fn clear_reactive_systems(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        self.clear(ctx)
    }
}

impl Default for Systems {
    fn default() -> Self {
        Self::new()
    }
}

impl System for Systems {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        self.run(ctx, "initialize", |s, ctx| s.initialize(ctx))
    }

    fn execute(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        self.run(ctx, "execute", |s, ctx| s.execute(ctx))
    }

    fn cleanup(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        self.run(ctx, "cleanup", |s, ctx| s.cleanup(ctx))
    }

    fn tear_down(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        self.run(ctx, "tear_down", |s, ctx| s.tear_down(ctx))
    }

    fn activate(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        self.run(ctx, "activate", |s, ctx| s.activate(ctx))
    }

    fn deactivate(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        self.run(ctx, "deactivate", |s, ctx| s.deactivate(ctx))
    }

    fn clear(&mut self, ctx: &mut Context) -> Result<(), SystemError> {
        self.run(ctx, "clear", |s, ctx| s.clear(ctx))
    }
}

impl fmt::Display for Systems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (n, name) in self.names().enumerate() {
            if n > 0 {
                f.write_str(", ")?;
            }
            f.write_str(name)?;
        }
        f.write_str(")")
    }
}

impl fmt::Debug for Systems {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Systems")
            .field("name", &self.name)
            .field("systems", &self.names().collect::<Vec<_>>())
            .finish()
    }
}
