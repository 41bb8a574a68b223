//! Stack runtime
//!
//! Execution contexts and the component lifecycle every other layer is
//! built on.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                 StackManager                  │
//! │   (management thread, start_up / shut_down)   │
//! └──────────────────────┬───────────────────────┘
//!                        │
//!                        ▼
//!               ┌─────────────────┐
//!               │ ModuleRegistry  │
//!               │ - start order   │
//!               │ - reverse stop  │
//!               └────────┬────────┘
//!                        │ one Handler per module
//!                        ▼
//!   ┌─────────┐   ┌─────────┐   ┌─────────┐
//!   │ Handler │   │ Handler │   │ Handler │
//!   └────┬────┘   └────┬────┘   └────┬────┘
//!        └─────────────┼─────────────┘
//!                      ▼
//!                 ┌─────────┐
//!                 │ Thread  │
//!                 └─────────┘
//! ```
//!
//! ## Modules
//!
//! - [`thread`] - Named worker thread driving a single-threaded runtime
//! - [`handler`] - Serialized task queue bound to a thread
//! - [`alarm`] - One-shot delayed task on a handler
//! - [`module`] - Module contract, descriptors and start context
//! - [`registry`] - Dependency-ordered lifecycle
//! - [`manager`] - Top-level start / stop with timeouts

pub mod alarm;
pub mod handler;
pub mod manager;
pub mod module;
pub mod registry;
pub mod thread;

pub use alarm::Alarm;
pub use handler::Handler;
pub use manager::StackManager;
pub use module::{Module, ModuleContext, ModuleDescriptor, ModuleList, ModuleState};
pub use registry::ModuleRegistry;
pub use thread::Thread;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, ignoring poisoning.
///
/// A panicking task aborts the process, so a poisoned lock only shows up
/// while a test is unwinding.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
