//! Module registry - dependency-ordered start, reverse-ordered stop.
//!
//! ## Architecture
//! ```text
//! start::<T>(thread)
//!   ├─► already running?       → return it
//!   ├─► instantiate T           (injected instance, else T::create())
//!   ├─► bind a fresh Handler to thread
//!   ├─► start every dependency  (recursively, same thread)
//!   ├─► T.start(context)
//!   └─► mark Running, append to start order
//!
//! stop_all()
//!   └─► for each module, newest first:
//!         clear handler → wait (bounded) → stop() → tear handler down
//! ```
//!
//! ## Rules
//! - A module is instantiated and started at most once
//! - `is_started::<T>()` turns true only after `T.start()` returned
//! - Cycles, missing factories and double stops are fatal
//! - The registry is driven from one thread at a time

use crate::stack::module::{ModuleContext, ModuleDescriptor, ModuleInstance, ModuleState};
use crate::stack::{lock, Handler, Module, ModuleList, Thread};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long `stop_all` waits for each module's handler to drain.
pub const DEFAULT_MODULE_STOP_TIMEOUT: Duration = Duration::from_millis(20);

struct ModuleEntry {
    name: &'static str,
    instance: ModuleInstance,
    handler: Handler,
    state: ModuleState,
}

#[derive(Default)]
struct RegistryState {
    modules: HashMap<TypeId, ModuleEntry>,
    start_order: Vec<TypeId>,
    injected: HashMap<TypeId, ModuleInstance>,
}

pub struct ModuleRegistry {
    state: Mutex<RegistryState>,
    stop_timeout: Duration,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::with_stop_timeout(DEFAULT_MODULE_STOP_TIMEOUT)
    }

    pub fn with_stop_timeout(stop_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            stop_timeout,
        }
    }

    /// Supply the instance to use when `T` is started.
    ///
    /// # Panics
    /// If `T` was already injected or instantiated.
    pub fn inject<T: Module>(&self, module: T) {
        let id = TypeId::of::<T>();
        let mut state = lock(&self.state);
        assert!(
            !state.modules.contains_key(&id) && !state.injected.contains_key(&id),
            "module {} is already present in the registry",
            std::any::type_name::<T>()
        );
        state.injected.insert(id, ModuleInstance::new(module));
    }

    /// Start `T` and everything it depends on, returning the running instance.
    pub fn start<T: Module>(&self, thread: &Thread) -> Arc<T> {
        let instance = self.start_descriptor(&ModuleDescriptor::of::<T>(), thread);
        instance
            .downcast::<T>()
            .unwrap_or_else(|| panic!("registry entry for {} has the wrong type", std::any::type_name::<T>()))
    }

    /// Start every module in `list`, in list order.
    pub fn start_list(&self, list: &ModuleList, thread: &Thread) {
        for descriptor in list.iter() {
            self.start_descriptor(descriptor, thread);
        }
    }

    pub fn is_started<T: Module>(&self) -> bool {
        self.state::<T>() == ModuleState::Running
    }

    pub fn state<T: Module>(&self) -> ModuleState {
        lock(&self.state)
            .modules
            .get(&TypeId::of::<T>())
            .map_or(ModuleState::Unstarted, |entry| entry.state)
    }

    /// The running instance of `T`, if any.
    pub fn get<T: Module>(&self) -> Option<Arc<T>> {
        let state = lock(&self.state);
        state
            .modules
            .get(&TypeId::of::<T>())
            .filter(|entry| entry.state == ModuleState::Running)
            .and_then(|entry| entry.instance.downcast::<T>())
    }

    /// Names of running modules, in start order.
    pub fn started_modules(&self) -> Vec<&'static str> {
        let state = lock(&self.state);
        state
            .start_order
            .iter()
            .filter_map(|id| state.modules.get(id))
            .map(|entry| entry.name)
            .collect()
    }

    /// Stop every running module, newest first, then forget them all.
    pub fn stop_all(&self) {
        let order: Vec<TypeId> = {
            let mut state = lock(&self.state);
            std::mem::take(&mut state.start_order)
        };

        for id in order.into_iter().rev() {
            let (name, instance, handler) = {
                let mut state = lock(&self.state);
                let Some(entry) = state.modules.get_mut(&id) else {
                    continue;
                };
                assert!(
                    entry.state == ModuleState::Running,
                    "module {} stopped twice",
                    entry.name
                );
                entry.state = ModuleState::Stopping;
                (entry.name, entry.instance.clone(), entry.handler.clone())
            };

            debug!("Stopping module {}", name);
            handler.clear();
            if !handler.wait_until_stopped(self.stop_timeout) {
                warn!(
                    "Module {} still busy after {:?}; stopping anyway",
                    name, self.stop_timeout
                );
            }
            instance.module.stop();
            handler.stop();

            lock(&self.state).modules.remove(&id);
            info!("Module {} stopped", name);
        }
    }

    fn start_descriptor(&self, descriptor: &ModuleDescriptor, thread: &Thread) -> ModuleInstance {
        let id = descriptor.id();
        let (instance, handler) = {
            let mut state = lock(&self.state);
            if let Some(entry) = state.modules.get(&id) {
                match entry.state {
                    ModuleState::Running => return entry.instance.clone(),
                    ModuleState::Starting => {
                        panic!("dependency cycle detected at module {}", entry.name)
                    }
                    other => panic!("module {} cannot be started while {:?}", entry.name, other),
                }
            }

            let instance = state
                .injected
                .remove(&id)
                .or_else(|| descriptor.construct())
                .unwrap_or_else(|| {
                    panic!(
                        "module {} has no factory and was not injected",
                        descriptor.name()
                    )
                });
            let handler = Handler::new(thread);
            state.modules.insert(
                id,
                ModuleEntry {
                    name: descriptor.name(),
                    instance: instance.clone(),
                    handler: handler.clone(),
                    state: ModuleState::Starting,
                },
            );
            (instance, handler)
        };

        let mut dependencies = ModuleList::new();
        instance.module.list_dependencies(&mut dependencies);

        let mut resolved = HashMap::with_capacity(dependencies.len());
        for dependency in dependencies.iter() {
            let running = self.start_descriptor(dependency, thread);
            resolved.insert(dependency.id(), running);
        }

        debug!("Starting module {} on thread {}", descriptor.name(), thread.name());
        let context = ModuleContext::new(descriptor.name(), handler, resolved);
        instance.module.start(&context);

        let mut state = lock(&self.state);
        if let Some(entry) = state.modules.get_mut(&id) {
            entry.state = ModuleState::Running;
        }
        state.start_order.push(id);
        info!("Module {} started", descriptor.name());
        instance
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::OnceLock;

    /// Modules below check the registry from inside their own lifecycle
    /// callbacks, so they reach it through this per-test slot.
    struct Harness {
        registry: Arc<ModuleRegistry>,
        events: Mutex<Vec<String>>,
    }

    impl Harness {
        fn record(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    macro_rules! test_module {
        ($name:ident, slot: $slot:ident, deps: [$($dep:ident),*], dependents: [$($dependent:ident),*]) => {
            struct $name {
                harness: Arc<Harness>,
            }

            impl Module for $name {
                fn create() -> Option<Self> {
                    $slot.get().map(|harness| $name { harness: Arc::clone(harness) })
                }

                fn list_dependencies(&self, _list: &mut ModuleList) {
                    $(_list.add::<$dep>();)*
                }

                fn start(&self, _context: &ModuleContext) {
                    let registry = &self.harness.registry;
                    assert!(!registry.is_started::<$name>(), "{} running before start returned", stringify!($name));
                    assert_eq!(registry.state::<$name>(), ModuleState::Starting);
                    $(
                        assert!(registry.is_started::<$dep>(), "{} started before {}", stringify!($name), stringify!($dep));
                        let _ = _context.get_dependency::<$dep>();
                    )*
                    self.harness.record(concat!("start ", stringify!($name)));
                }

                fn stop(&self) {
                    let registry = &self.harness.registry;
                    assert_eq!(registry.state::<$name>(), ModuleState::Stopping);
                    $(
                        assert!(!registry.is_started::<$dependent>(), "{} stopped before {}", stringify!($name), stringify!($dependent));
                    )*
                    self.harness.record(concat!("stop ", stringify!($name)));
                }
            }
        };
    }

    // Diamond: Top -> (Left, Right) -> Bottom
    static DIAMOND: OnceLock<Arc<Harness>> = OnceLock::new();
    test_module!(Bottom, slot: DIAMOND, deps: [], dependents: [Left, Right, Top]);
    test_module!(Left, slot: DIAMOND, deps: [Bottom], dependents: [Top]);
    test_module!(Right, slot: DIAMOND, deps: [Bottom], dependents: [Top]);
    test_module!(Top, slot: DIAMOND, deps: [Left, Right], dependents: []);

    fn harness(slot: &'static OnceLock<Arc<Harness>>) -> Arc<Harness> {
        Arc::clone(slot.get_or_init(|| {
            Arc::new(Harness {
                registry: Arc::new(ModuleRegistry::new()),
                events: Mutex::new(Vec::new()),
            })
        }))
    }

    #[test]
    fn test_start_order_and_reverse_stop() {
        let harness = harness(&DIAMOND);
        let registry = &harness.registry;
        let thread = Thread::new("registry_diamond").unwrap();

        let top = registry.start::<Top>(&thread);
        assert!(registry.is_started::<Top>());
        assert!(registry.is_started::<Left>());
        assert!(registry.is_started::<Right>());
        assert!(registry.is_started::<Bottom>());

        // Idempotent: same instance, no second start.
        let again = registry.start::<Top>(&thread);
        assert!(Arc::ptr_eq(&top, &again));

        let names = registry.started_modules();
        assert_eq!(names.len(), 4);
        assert!(names[0].ends_with("Bottom"));
        assert!(names[3].ends_with("Top"));

        registry.stop_all();
        assert_eq!(registry.state::<Top>(), ModuleState::Unstarted);
        assert!(!registry.is_started::<Bottom>());
        assert!(registry.get::<Left>().is_none());

        assert_eq!(
            harness.events(),
            vec![
                "start Bottom",
                "start Left",
                "start Right",
                "start Top",
                "stop Top",
                "stop Right",
                "stop Left",
                "stop Bottom",
            ]
        );
    }

    struct Configured {
        label: &'static str,
    }

    impl Module for Configured {
        fn start(&self, _context: &ModuleContext) {}
        fn stop(&self) {}
    }

    struct UsesConfigured {
        seen: Mutex<Option<&'static str>>,
    }

    impl Module for UsesConfigured {
        fn create() -> Option<Self> {
            Some(Self {
                seen: Mutex::new(None),
            })
        }

        fn list_dependencies(&self, list: &mut ModuleList) {
            list.add::<Configured>();
        }

        fn start(&self, context: &ModuleContext) {
            let configured = context.get_dependency::<Configured>();
            *self.seen.lock().unwrap() = Some(configured.label);
        }

        fn stop(&self) {}
    }

    #[test]
    fn test_injected_instance_is_used() {
        let registry = ModuleRegistry::new();
        let thread = Thread::new("registry_inject").unwrap();

        registry.inject(Configured { label: "from test" });
        let user = registry.start::<UsesConfigured>(&thread);
        assert_eq!(*user.seen.lock().unwrap(), Some("from test"));
        assert_eq!(registry.get::<Configured>().map(|c| c.label), Some("from test"));

        registry.stop_all();
    }

    #[test]
    fn test_start_list() {
        let registry = ModuleRegistry::new();
        let thread = Thread::new("registry_list").unwrap();
        registry.inject(Configured { label: "listed" });

        let mut list = ModuleList::new();
        list.add::<UsesConfigured>();
        registry.start_list(&list, &thread);

        assert!(registry.is_started::<UsesConfigured>());
        assert!(registry.is_started::<Configured>());
        registry.stop_all();
    }

    #[test]
    #[should_panic(expected = "has no factory and was not injected")]
    fn test_missing_factory_is_fatal() {
        let registry = ModuleRegistry::new();
        let thread = Thread::new("registry_no_factory").unwrap();
        registry.start::<Configured>(&thread);
    }

    #[test]
    #[should_panic(expected = "already present in the registry")]
    fn test_double_inject_is_fatal() {
        let registry = ModuleRegistry::new();
        registry.inject(Configured { label: "a" });
        registry.inject(Configured { label: "b" });
    }

    struct CycleA;
    struct CycleB;

    impl Module for CycleA {
        fn create() -> Option<Self> {
            Some(CycleA)
        }
        fn list_dependencies(&self, list: &mut ModuleList) {
            list.add::<CycleB>();
        }
        fn start(&self, _context: &ModuleContext) {}
        fn stop(&self) {}
    }

    impl Module for CycleB {
        fn create() -> Option<Self> {
            Some(CycleB)
        }
        fn list_dependencies(&self, list: &mut ModuleList) {
            list.add::<CycleA>();
        }
        fn start(&self, _context: &ModuleContext) {}
        fn stop(&self) {}
    }

    #[test]
    #[should_panic(expected = "dependency cycle detected")]
    fn test_cycle_is_fatal() {
        let registry = ModuleRegistry::new();
        let thread = Thread::new("registry_cycle").unwrap();
        registry.start::<CycleA>(&thread);
    }

    struct Sneaky;

    impl Module for Sneaky {
        fn create() -> Option<Self> {
            Some(Sneaky)
        }
        fn start(&self, context: &ModuleContext) {
            let _ = context.get_dependency::<CycleA>();
        }
        fn stop(&self) {}
    }

    #[test]
    #[should_panic(expected = "requested undeclared dependency")]
    fn test_undeclared_dependency_is_fatal() {
        let registry = ModuleRegistry::new();
        let thread = Thread::new("registry_undeclared").unwrap();
        registry.start::<Sneaky>(&thread);
    }

    struct Busy {
        ran_after_clear: Arc<Mutex<bool>>,
    }

    impl Module for Busy {
        fn start(&self, context: &ModuleContext) {
            let handler = context.handler().clone();
            let flag = Arc::clone(&self.ran_after_clear);
            context.handler().post(move || {
                std::thread::sleep(Duration::from_millis(50));
                let _ = handler.enqueue(Box::new(move || *flag.lock().unwrap() = true));
            });
        }
        fn stop(&self) {}
    }

    #[test]
    fn test_stop_all_tolerates_a_busy_handler() {
        let registry = ModuleRegistry::with_stop_timeout(Duration::from_millis(5));
        let thread = Thread::new("registry_busy").unwrap();
        let ran_after_clear = Arc::new(Mutex::new(false));
        registry.inject(Busy {
            ran_after_clear: Arc::clone(&ran_after_clear),
        });
        registry.start::<Busy>(&thread);

        std::thread::sleep(Duration::from_millis(10));
        registry.stop_all();
        assert!(!registry.is_started::<Busy>());
        std::thread::sleep(Duration::from_millis(100));
        assert!(!*ran_after_clear.lock().unwrap());
    }
}
