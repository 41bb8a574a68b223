//! Bluetooth host control core
//!
//! Component lifecycle and HCI transport for a host-side Bluetooth stack.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │        feature modules (external)              │
//! └──────────────────────┬────────────────────────┘
//!                        │ commands / events / data
//!                        ▼
//! ┌───────────────────────────────────────────────┐
//! │  hci::HciLayer   credit flow, FIFO responses,  │
//! │                  event fan-out, data queues    │
//! └──────────────────────┬────────────────────────┘
//!                        │ ControllerPacket
//!                        ▼
//! ┌───────────────────────────────────────────────┐
//! │  infrastructure::hal::HciHal   H4 framing,     │
//! │                                capture         │
//! └──────────────────────┬────────────────────────┘
//!                        │ bytes
//!                        ▼
//!                   controller
//!
//! stack: Thread / Handler / ModuleRegistry / StackManager underneath all
//! ```
//!
//! ## Modules
//!
//! - [`stack`] - Execution contexts and module lifecycle
//! - [`infrastructure`] - Controller HAL, capture, logging
//! - [`hci`] - HCI correlation layer
//! - [`domain`] - Packet types and settings

pub mod domain;
pub mod error;
pub mod hci;
pub mod infrastructure;
pub mod stack;
