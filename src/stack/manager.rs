//! Stack Manager
//!
//! Entry point for bringing the whole stack up and down. The registry
//! runs on a dedicated management thread; callers block on a bounded
//! handshake instead of running module callbacks on their own thread.
//!
//! ```text
//! caller ──start_up()──► management handler ──► registry.start_list()
//!    ▲                                                  │
//!    └──────────── done (or StartTimeout) ◄─────────────┘
//! ```

use crate::error::StackError;
use crate::stack::{Handler, Module, ModuleList, ModuleRegistry, Thread};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_millis(5000);

pub struct StackManager {
    registry: Arc<ModuleRegistry>,
    management_thread: Thread,
    management_handler: Handler,
    start_timeout: Duration,
    stop_timeout: Duration,
}

impl StackManager {
    pub fn new() -> Result<Self, StackError> {
        Self::with_registry(
            ModuleRegistry::new(),
            DEFAULT_START_TIMEOUT,
            DEFAULT_STOP_TIMEOUT,
        )
    }

    pub fn with_registry(
        registry: ModuleRegistry,
        start_timeout: Duration,
        stop_timeout: Duration,
    ) -> Result<Self, StackError> {
        let management_thread = Thread::new("management_thread")?;
        let management_handler = Handler::new(&management_thread);
        Ok(Self {
            registry: Arc::new(registry),
            management_thread,
            management_handler,
            start_timeout,
            stop_timeout,
        })
    }

    /// The registry, for injecting instances before `start_up`.
    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Start `modules` (and their dependencies) on `stack_thread`.
    pub fn start_up(&self, modules: ModuleList, stack_thread: Arc<Thread>) -> Result<(), StackError> {
        info!("Starting stack with {} module(s)", modules.len());
        let registry = Arc::clone(&self.registry);
        let (done_tx, done_rx) = mpsc::channel();

        self.management_handler.post(move || {
            registry.start_list(&modules, &stack_thread);
            let _ = done_tx.send(());
        });

        if done_rx.recv_timeout(self.start_timeout).is_err() {
            error!("Stack start did not finish within {:?}", self.start_timeout);
            return Err(StackError::StartTimeout(self.start_timeout));
        }
        info!("Stack started: {:?}", self.registry.started_modules());
        Ok(())
    }

    /// Stop every started module, newest first.
    pub fn shut_down(&self) -> Result<(), StackError> {
        info!("Shutting down stack");
        let registry = Arc::clone(&self.registry);
        let (done_tx, done_rx) = mpsc::channel();

        self.management_handler.post(move || {
            registry.stop_all();
            let _ = done_tx.send(());
        });

        if done_rx.recv_timeout(self.stop_timeout).is_err() {
            error!("Stack shutdown did not finish within {:?}", self.stop_timeout);
            return Err(StackError::StopTimeout(self.stop_timeout));
        }
        info!("Stack stopped");
        Ok(())
    }

    /// A running module, if it was started.
    pub fn get_instance<T: Module>(&self) -> Option<Arc<T>> {
        self.registry.get::<T>()
    }
}

impl Drop for StackManager {
    fn drop(&mut self) {
        self.management_handler.clear();
        self.management_handler.stop();
        self.management_thread.stop();
    }
}
