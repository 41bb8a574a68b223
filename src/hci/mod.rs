//! HCI correlation layer
//!
//! ## Modules
//!
//! - [`commands`] - Command credit and pending-command FIFO
//! - [`queue`] - Duplex ACL / SCO data queues
//! - [`layer`] - The `HciLayer` module

pub mod commands;
pub mod layer;
pub mod queue;

pub use commands::{CommandQueue, CommandResponse, ResponseKind};
pub use layer::HciLayer;
pub use queue::DataQueueEnd;
