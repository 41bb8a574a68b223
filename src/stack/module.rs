//! Module contract
//!
//! Every stack component is a [`Module`]: it declares its dependencies,
//! is started once they are all running, and is stopped before any of
//! them. Dependencies are looked up by type, so a module only ever sees a
//! strongly typed `Arc<D>`.
//!
//! ## Lifecycle
//!
//! ```text
//! Unstarted ─► Starting ─► Running ─► Stopping ─► Unstarted
//!              (deps are     (after               (entry removed
//!               started)     start() returned)     after stop())
//! ```

use crate::stack::Handler;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A stack component managed by the
/// [`ModuleRegistry`](super::ModuleRegistry).
///
/// Methods take `&self`; modules keep mutable state behind their own locks
/// and touch it only from their handler.
pub trait Module: Send + Sync + 'static {
    /// Build an instance for the registry.
    ///
    /// Modules that need construction parameters keep the default `None`
    /// and must be supplied through
    /// [`ModuleRegistry::inject`](super::ModuleRegistry::inject).
    fn create() -> Option<Self>
    where
        Self: Sized,
    {
        None
    }

    /// Declare the modules that must be running before `start`.
    fn list_dependencies(&self, _list: &mut ModuleList) {}

    /// Called once, after every declared dependency is running.
    fn start(&self, context: &ModuleContext);

    /// Called once, after every module depending on this one has stopped.
    fn stop(&self);

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Per-module lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Unstarted,
    Starting,
    Running,
    Stopping,
}

/// A type-erased module instance: the lifecycle view plus a typed handle
/// for dependency lookup.
#[derive(Clone)]
pub(crate) struct ModuleInstance {
    pub(crate) module: Arc<dyn Module>,
    pub(crate) any: Arc<dyn Any + Send + Sync>,
}

impl ModuleInstance {
    pub(crate) fn new<T: Module>(module: T) -> Self {
        let module = Arc::new(module);
        Self {
            module: Arc::clone(&module) as Arc<dyn Module>,
            any: module as Arc<dyn Any + Send + Sync>,
        }
    }

    pub(crate) fn downcast<T: Module>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.any).downcast::<T>().ok()
    }
}

/// Identity and constructor of one module type.
#[derive(Clone, Copy)]
pub struct ModuleDescriptor {
    id: TypeId,
    name: &'static str,
    construct: fn() -> Option<ModuleInstance>,
}

impl ModuleDescriptor {
    pub fn of<T: Module>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            construct: construct::<T>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn id(&self) -> TypeId {
        self.id
    }

    pub(crate) fn construct(&self) -> Option<ModuleInstance> {
        (self.construct)()
    }
}

impl PartialEq for ModuleDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ModuleDescriptor {}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

fn construct<T: Module>() -> Option<ModuleInstance> {
    T::create().map(ModuleInstance::new)
}

/// Ordered set of module types.
#[derive(Debug, Clone, Default)]
pub struct ModuleList {
    descriptors: Vec<ModuleDescriptor>,
}

impl ModuleList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `T`; adding a type twice keeps the first position.
    pub fn add<T: Module>(&mut self) -> &mut Self {
        let descriptor = ModuleDescriptor::of::<T>();
        if !self.descriptors.contains(&descriptor) {
            self.descriptors.push(descriptor);
        }
        self
    }

    pub fn contains<T: Module>(&self) -> bool {
        let id = TypeId::of::<T>();
        self.descriptors.iter().any(|d| d.id == id)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.descriptors.iter()
    }
}

/// What a module sees while it starts: its own handler and its declared,
/// already running dependencies.
pub struct ModuleContext {
    name: &'static str,
    handler: Handler,
    dependencies: HashMap<TypeId, ModuleInstance>,
}

impl ModuleContext {
    pub(crate) fn new(
        name: &'static str,
        handler: Handler,
        dependencies: HashMap<TypeId, ModuleInstance>,
    ) -> Self {
        Self {
            name,
            handler,
            dependencies,
        }
    }

    /// The module's own execution context.
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// A dependency declared in `list_dependencies`.
    ///
    /// # Panics
    /// If `D` was not declared.
    pub fn get_dependency<D: Module>(&self) -> Arc<D> {
        self.dependencies
            .get(&TypeId::of::<D>())
            .and_then(ModuleInstance::downcast::<D>)
            .unwrap_or_else(|| {
                panic!(
                    "module {} requested undeclared dependency {}",
                    self.name,
                    std::any::type_name::<D>()
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Radio;

    impl Module for Radio {
        fn create() -> Option<Self> {
            Some(Radio)
        }
        fn start(&self, _context: &ModuleContext) {}
        fn stop(&self) {}
    }

    struct Antenna;

    impl Module for Antenna {
        fn start(&self, _context: &ModuleContext) {}
        fn stop(&self) {}
    }

    #[test]
    fn test_module_list_deduplicates() {
        let mut list = ModuleList::new();
        list.add::<Radio>().add::<Antenna>().add::<Radio>();
        assert_eq!(list.len(), 2);
        assert!(list.contains::<Radio>());
        assert_eq!(
            list.iter().map(|d| d.name()).collect::<Vec<_>>(),
            vec![
                std::any::type_name::<Radio>(),
                std::any::type_name::<Antenna>()
            ]
        );
    }

    #[test]
    fn test_descriptor_construct() {
        assert!(ModuleDescriptor::of::<Radio>().construct().is_some());
        assert!(ModuleDescriptor::of::<Antenna>().construct().is_none());
    }

    #[test]
    fn test_instance_downcast() {
        let instance = ModuleInstance::new(Radio);
        assert!(instance.downcast::<Radio>().is_some());
        assert!(instance.downcast::<Antenna>().is_none());
    }
}
