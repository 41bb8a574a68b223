//! Worker Thread
//!
//! A named OS thread that drives a single-threaded tokio runtime. Every
//! [`Handler`](super::Handler) is bound to exactly one `Thread`; several
//! handlers may share one.

use crate::error::StackError;
use crate::stack::lock;
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};
use tokio::runtime;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub struct Thread {
    name: String,
    runtime: runtime::Handle,
    thread_id: ThreadId,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Thread {
    /// Spawn the thread and wait until its runtime accepts work.
    pub fn new(name: impl Into<String>) -> Result<Self, StackError> {
        let name = name.into();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let rt = match runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok((rt.handle().clone(), thread::current().id())));
                rt.block_on(async {
                    let _ = shutdown_rx.await;
                });
            })
            .map_err(|source| StackError::ThreadSpawn {
                name: name.clone(),
                source,
            })?;

        let (runtime, thread_id) = match ready_rx.recv() {
            Ok(Ok(ready)) => ready,
            Ok(Err(source)) => {
                let _ = join.join();
                return Err(StackError::ThreadSpawn { name, source });
            }
            Err(_) => {
                let _ = join.join();
                return Err(StackError::ThreadStartup { name });
            }
        };

        debug!("Thread {} started", name);
        Ok(Self {
            name,
            runtime,
            thread_id,
            shutdown: Mutex::new(Some(shutdown_tx)),
            join: Mutex::new(Some(join)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when called from this thread.
    pub fn is_same_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Stop the runtime and join the thread. Idempotent.
    ///
    /// Tasks still pending on the runtime are dropped. Joining is skipped
    /// when called from the thread itself.
    pub fn stop(&self) {
        let Some(shutdown) = lock(&self.shutdown).take() else {
            return;
        };
        let _ = shutdown.send(());

        if self.is_same_thread() {
            warn!("Thread {} stopped from itself; not joining", self.name);
            return;
        }
        if let Some(join) = lock(&self.join).take() {
            if join.join().is_err() {
                warn!("Thread {} panicked", self.name);
            }
        }
        debug!("Thread {} stopped", self.name);
    }

    pub(crate) fn runtime(&self) -> &runtime::Handle {
        &self.runtime
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_runs_spawned_work_on_its_own_thread() {
        let thread = Thread::new("test_worker").unwrap();
        assert_eq!(thread.name(), "test_worker");
        assert!(!thread.is_same_thread());

        let (tx, rx) = std::sync::mpsc::channel();
        thread.runtime().spawn(async move {
            let _ = tx.send(thread::current().name().map(str::to_string));
        });
        let name = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(name.as_deref(), Some("test_worker"));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let thread = Thread::new("test_stop").unwrap();
        thread.stop();
        thread.stop();
    }
}
