use std::any::{Any, type_name};
use std::fmt;

/// Index of a component slot inside an entity.
pub type ComponentIndex = usize;

/// Opaque unit of data attached to an entity slot.
///
/// Implemented automatically for every `'static + Send + Sync + Clone + Debug`
/// type, so plain structs work as components without any boilerplate:
///
/// ```
/// use entitas_ecs::Component;
///
/// #[derive(Debug, Clone, Default)]
/// struct Position { x: f32, y: f32 }
///
/// let boxed: Box<dyn Component> = Box::new(Position { x: 1.0, y: 2.0 });
/// assert_eq!(boxed.downcast_ref::<Position>().unwrap().x, 1.0);
/// ```
///
/// `Clone` backs entity copying (values are written into pooled instances),
/// `Debug` backs entity descriptions.
pub trait Component: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Boxes a fresh copy of this component.
    fn clone_boxed(&self) -> Box<dyn Component>;

    /// Overwrites `target` with a copy of `self` when both share a concrete type.
    ///
    /// Returns `false` (and leaves `target` untouched) on a type mismatch.
    fn clone_into_component(&self, target: &mut dyn Component) -> bool;

    /// Rust type name of the concrete component.
    fn component_type_name(&self) -> &'static str;
}

impl<T> Component for T
where
    T: Any + Send + Sync + Clone + fmt::Debug,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn clone_boxed(&self) -> Box<dyn Component> {
        Box::new(self.clone())
    }

    fn clone_into_component(&self, target: &mut dyn Component) -> bool {
        match target.as_any_mut().downcast_mut::<T>() {
            Some(slot) => {
                slot.clone_from(self);
                true
            }
            None => false,
        }
    }

    fn component_type_name(&self) -> &'static str {
        type_name::<T>()
    }
}

impl dyn Component {
    /// Returns `true` if the concrete type is `T`.
    pub fn is<T: Component>(&self) -> bool {
        self.as_any().is::<T>()
    }

    pub fn downcast_ref<T: Component>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Component>(&mut self) -> Option<&mut T> {
        self.as_any_mut().downcast_mut::<T>()
    }
}

/// Reusable instances for one component index (LIFO stack).
pub type ComponentPool = Vec<Box<dyn Component>>;

/// Default constructor registered per component index.
///
/// Used by [`Context::create_component`](crate::Context::create_component)
/// when the index's pool is empty.
pub type ComponentFactory = std::sync::Arc<dyn Fn() -> Box<dyn Component> + Send + Sync>;

/// Address of a component instance.
#[cfg(test)]
pub(crate) fn component_addr(component: &dyn Component) -> *const () {
    component as *const dyn Component as *const ()
}
