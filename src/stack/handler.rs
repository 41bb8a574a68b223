//! Handler (execution context)
//!
//! A FIFO of closures executed one at a time on the [`Thread`] the handler
//! is bound to. All of a module's business logic runs on its handler, so a
//! module never races with itself.
//!
//! ```text
//!   post() ──► [queue] ──► drain task on Thread ──► task()
//!   (any thread)             one task at a time, post order
//! ```
//!
//! ## Rules
//! - Tasks from one handler never overlap and run in post order
//! - Handlers sharing a thread interleave between tasks
//! - A task that panics aborts the process
//! - Posting to a handler that was torn down is a contract violation

use crate::stack::{lock, Thread};
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::error;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct QueueState {
    tasks: VecDeque<Task>,
    executing: bool,
    stopped: bool,
}

impl QueueState {
    fn is_idle(&self) -> bool {
        !self.executing && self.tasks.is_empty()
    }
}

struct HandlerInner {
    thread_name: String,
    runtime: tokio::runtime::Handle,
    state: Mutex<QueueState>,
    idle: Condvar,
    wake: Notify,
}

/// Serialized execution context bound to a worker [`Thread`].
///
/// Cloning a `Handler` yields another reference to the same queue.
#[derive(Clone)]
pub struct Handler {
    inner: Arc<HandlerInner>,
}

impl Handler {
    pub fn new(thread: &Thread) -> Self {
        let inner = Arc::new(HandlerInner {
            thread_name: thread.name().to_string(),
            runtime: thread.runtime().clone(),
            state: Mutex::new(QueueState::default()),
            idle: Condvar::new(),
            wake: Notify::new(),
        });
        thread.runtime().spawn(drain(Arc::clone(&inner)));
        Self { inner }
    }

    /// Queue `task` behind everything already posted. Safe from any thread.
    ///
    /// # Panics
    /// If the handler was torn down.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.enqueue(Box::new(task)).is_err() {
            panic!(
                "task posted to a stopped handler on thread {}",
                self.inner.thread_name
            );
        }
    }

    /// Discard every queued task that has not started yet.
    pub fn clear(&self) {
        let mut state = lock(&self.inner.state);
        state.tasks.clear();
        if !state.executing {
            self.inner.idle.notify_all();
        }
    }

    /// Block until no task is running and none is queued, or `timeout`
    /// elapses. Returns `false` on timeout.
    ///
    /// Calling this from a task of the same handler always times out.
    pub fn wait_until_stopped(&self, timeout: Duration) -> bool {
        let state = lock(&self.inner.state);
        let (_state, result) = self
            .inner
            .idle
            .wait_timeout_while(state, timeout, |s| !s.is_idle())
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        !result.timed_out()
    }

    /// True until the handler is torn down.
    pub fn is_running(&self) -> bool {
        !lock(&self.inner.state).stopped
    }

    pub fn thread_name(&self) -> &str {
        &self.inner.thread_name
    }

    /// Tear the handler down: drop queued tasks and refuse further posts.
    pub(crate) fn stop(&self) {
        {
            let mut state = lock(&self.inner.state);
            state.tasks.clear();
            state.stopped = true;
        }
        self.inner.idle.notify_all();
        self.inner.wake.notify_one();
    }

    /// Queue a task, handing it back if the handler is stopped.
    pub(crate) fn enqueue(&self, task: Task) -> Result<(), Task> {
        {
            let mut state = lock(&self.inner.state);
            if state.stopped {
                return Err(task);
            }
            state.tasks.push_back(task);
        }
        self.inner.wake.notify_one();
        Ok(())
    }

    /// Run a future on the handler's thread, outside the task queue.
    pub(crate) fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.runtime.spawn(future)
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("thread", &self.inner.thread_name)
            .finish()
    }
}

async fn drain(inner: Arc<HandlerInner>) {
    loop {
        inner.wake.notified().await;

        while let Some(task) = next_task(&inner) {
            if let Err(panic_err) = panic::catch_unwind(AssertUnwindSafe(task)) {
                let msg = panic_err
                    .downcast_ref::<&'static str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic_err.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(
                    "Task on thread {} panicked: {}; aborting",
                    inner.thread_name, msg
                );
                std::process::abort();
            }
            finish_task(&inner);
            tokio::task::yield_now().await;
        }

        if lock(&inner.state).stopped {
            break;
        }
    }
}

fn next_task(inner: &HandlerInner) -> Option<Task> {
    let mut state = lock(&inner.state);
    if state.stopped {
        return None;
    }
    let task = state.tasks.pop_front();
    state.executing = task.is_some();
    task
}

fn finish_task(inner: &HandlerInner) {
    let mut state = lock(&inner.state);
    state.executing = false;
    if state.tasks.is_empty() {
        inner.idle.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(2);

    #[test]
    fn test_tasks_run_in_post_order() {
        let thread = Thread::new("handler_order").unwrap();
        let handler = Handler::new(&thread);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let seen = Arc::clone(&seen);
            handler.post(move || seen.lock().unwrap().push(i));
        }

        assert!(handler.wait_until_stopped(WAIT));
        assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_tasks_never_overlap() {
        let thread_a = Thread::new("handler_overlap_a").unwrap();
        let thread_b = Thread::new("handler_overlap_b").unwrap();
        let handler = Handler::new(&thread_a);
        let in_task = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let poster = {
            let handler = handler.clone();
            let in_task = Arc::clone(&in_task);
            let overlaps = Arc::clone(&overlaps);
            std::thread::spawn(move || {
                for _ in 0..200 {
                    let in_task = Arc::clone(&in_task);
                    let overlaps = Arc::clone(&overlaps);
                    handler.post(move || {
                        if in_task.swap(true, Ordering::SeqCst) {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        std::thread::yield_now();
                        in_task.store(false, Ordering::SeqCst);
                    });
                }
            })
        };
        // Unrelated handler on another thread keeps running alongside.
        let other = Handler::new(&thread_b);
        other.post(|| std::thread::sleep(Duration::from_millis(5)));

        poster.join().unwrap();
        assert!(handler.wait_until_stopped(WAIT));
        assert!(other.wait_until_stopped(WAIT));
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handlers_sharing_a_thread_interleave() {
        let thread = Thread::new("handler_shared").unwrap();
        let first = Handler::new(&thread);
        let second = Handler::new(&thread);
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let a = Arc::clone(&seen);
            first.post(move || a.lock().unwrap().push(("first", i)));
            let b = Arc::clone(&seen);
            second.post(move || b.lock().unwrap().push(("second", i)));
        }

        assert!(first.wait_until_stopped(WAIT));
        assert!(second.wait_until_stopped(WAIT));
        let seen = seen.lock().unwrap();
        let firsts: Vec<_> = seen.iter().filter(|(h, _)| *h == "first").map(|(_, i)| *i).collect();
        let seconds: Vec<_> = seen.iter().filter(|(h, _)| *h == "second").map(|(_, i)| *i).collect();
        assert_eq!(firsts, vec![0, 1, 2]);
        assert_eq!(seconds, vec![0, 1, 2]);
    }

    #[test]
    fn test_clear_discards_queued_tasks() {
        let thread = Thread::new("handler_clear").unwrap();
        let handler = Handler::new(&thread);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let ran = Arc::new(AtomicUsize::new(0));

        handler.post(move || {
            let _ = started_tx.send(());
            let _ = release_rx.recv_timeout(WAIT);
        });
        started_rx.recv_timeout(WAIT).unwrap();
        for _ in 0..5 {
            let ran = Arc::clone(&ran);
            handler.post(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        handler.clear();
        release_tx.send(()).unwrap();
        assert!(handler.wait_until_stopped(WAIT));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wait_until_stopped_times_out_on_a_busy_handler() {
        let thread = Thread::new("handler_busy").unwrap();
        let handler = Handler::new(&thread);
        let (release_tx, release_rx) = mpsc::channel::<()>();

        handler.post(move || {
            let _ = release_rx.recv_timeout(WAIT);
        });

        assert!(!handler.wait_until_stopped(Duration::from_millis(20)));
        release_tx.send(()).unwrap();
        assert!(handler.wait_until_stopped(WAIT));
    }

    #[test]
    #[should_panic(expected = "task posted to a stopped handler")]
    fn test_post_after_stop_is_fatal() {
        let thread = Thread::new("handler_stopped").unwrap();
        let handler = Handler::new(&thread);
        handler.stop();
        assert!(!handler.is_running());
        handler.post(|| {});
    }
}
