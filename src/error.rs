//! Recoverable errors.
//!
//! Contract violations are not represented here; they panic at the point
//! of violation.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StackError {
    #[error("failed to spawn thread {name}: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("thread {name} exited before its runtime was ready")]
    ThreadStartup { name: String },

    #[error("stack did not start within {0:?}")]
    StartTimeout(Duration),

    #[error("stack did not stop within {0:?}")]
    StopTimeout(Duration),
}

#[derive(Debug, Error)]
pub enum HalError {
    #[error("failed to connect to controller at {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn the link reader: {0}")]
    ReaderSpawn(#[source] std::io::Error),

    #[error("controller link is down")]
    LinkDown,

    #[error(transparent)]
    Framing(#[from] crate::infrastructure::hal::h4::H4Error),
}

/// The other end of a data queue is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("data queue closed")]
pub struct QueueClosed;
