//! One-shot delayed task on a [`Handler`].
//!
//! Callers build their own timeouts on top of this, for example a feature
//! module giving up on a command whose response never arrives.

use crate::stack::{lock, Handler};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

pub struct Alarm {
    handler: Handler,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Alarm {
    pub fn new(handler: &Handler) -> Self {
        Self {
            handler: handler.clone(),
            pending: Mutex::new(None),
        }
    }

    /// Post `task` to the handler after `delay`, replacing any earlier schedule.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let handler = self.handler.clone();
        let timer = self.handler.spawn(async move {
            tokio::time::sleep(delay).await;
            if handler.enqueue(Box::new(task)).is_err() {
                warn!(
                    "Alarm fired after its handler on thread {} stopped; dropping",
                    handler.thread_name()
                );
            }
        });

        if let Some(previous) = lock(&self.pending).replace(timer) {
            previous.abort();
        }
    }

    /// Cancel the pending task, if it has not been posted yet.
    pub fn cancel(&self) {
        if let Some(timer) = lock(&self.pending).take() {
            timer.abort();
        }
    }
}

impl Drop for Alarm {
    fn drop(&mut self) {
        self.cancel();
    }
}
