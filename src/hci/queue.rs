//! Duplex data queue
//!
//! ACL and SCO traffic bypasses the command queue. The client side of each
//! direction is a bounded channel, so a slow consumer pushes back on the
//! stack instead of losing packets. The link reader never waits: inbound
//! packets are staged and a pump task on the owning handler's thread
//! absorbs the backpressure, so events keep flowing past unread data.
//!
//! ```text
//!             inbound (controller → client)
//! link reader ──stage──► [ staging ] ──pump task──► [ bounded ] ──recv──► DataQueueEnd
//!
//!             outbound (client → controller)
//! DataQueueEnd ──send──► [ bounded ] ──forwarder task──► HciHal
//! ```

use crate::error::QueueClosed;
use crate::stack::{lock, Handler};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub const DEFAULT_DATA_QUEUE_CAPACITY: usize = 16;

/// The client's side of a data queue.
pub struct DataQueueEnd<T> {
    outbound: mpsc::Sender<T>,
    inbound: mpsc::Receiver<T>,
}

impl<T: Send + 'static> DataQueueEnd<T> {
    /// Queue a packet for the controller, waiting for room.
    pub async fn send(&self, packet: T) -> Result<(), QueueClosed> {
        self.outbound.send(packet).await.map_err(|_| QueueClosed)
    }

    /// Blocking form of [`send`](Self::send). Must not be called from a
    /// handler task.
    pub fn blocking_send(&self, packet: T) -> Result<(), QueueClosed> {
        self.outbound.blocking_send(packet).map_err(|_| QueueClosed)
    }

    /// Next packet from the controller; `None` once the queue is closed.
    pub async fn recv(&mut self) -> Option<T> {
        self.inbound.recv().await
    }

    /// Blocking form of [`recv`](Self::recv). Must not be called from a
    /// handler task.
    pub fn blocking_recv(&mut self) -> Option<T> {
        self.inbound.blocking_recv()
    }

    /// Next packet if one is already waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.inbound.try_recv().ok()
    }
}

/// The stack's side of a data queue.
pub(crate) struct DataQueue<T> {
    label: &'static str,
    staged: mpsc::UnboundedSender<T>,
    staging: Mutex<Option<mpsc::UnboundedReceiver<T>>>,
    inbound: mpsc::Sender<T>,
    client_end: Mutex<Option<DataQueueEnd<T>>>,
    outbound: Mutex<Option<mpsc::Receiver<T>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> DataQueue<T> {
    pub(crate) fn new(label: &'static str, capacity: usize) -> Self {
        let (staged_tx, staged_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        Self {
            label,
            staged: staged_tx,
            staging: Mutex::new(Some(staged_rx)),
            inbound: inbound_tx,
            client_end: Mutex::new(Some(DataQueueEnd {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })),
            outbound: Mutex::new(Some(outbound_rx)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Hand the client end out. There is exactly one.
    ///
    /// # Panics
    /// If it was already taken.
    pub(crate) fn take_client_end(&self) -> DataQueueEnd<T> {
        lock(&self.client_end)
            .take()
            .unwrap_or_else(|| panic!("{} queue end already taken", self.label))
    }

    /// Stage a packet from the controller for the client. Never blocks.
    pub(crate) fn deliver_inbound(&self, packet: T) {
        if lock(&self.client_end).is_some() {
            debug!("No {} consumer attached; dropping packet", self.label);
            return;
        }
        if self.staged.send(packet).is_err() {
            debug!("{} queue stopped; dropping packet", self.label);
        }
    }

    /// Start the inbound pump and the outbound forwarder on `handler`'s
    /// thread. Client packets go to `transmit`.
    pub(crate) fn start<F>(&self, handler: &Handler, transmit: F)
    where
        F: Fn(T) + Send + 'static,
    {
        let label = self.label;
        let mut tasks = lock(&self.tasks);

        if let Some(mut staging) = lock(&self.staging).take() {
            let inbound = self.inbound.clone();
            tasks.push(handler.spawn(async move {
                while let Some(packet) = staging.recv().await {
                    // Waits here while the client queue is full.
                    if inbound.send(packet).await.is_err() {
                        debug!("{} consumer went away; dropping packet", label);
                    }
                }
            }));
        }

        if let Some(mut outbound) = lock(&self.outbound).take() {
            tasks.push(handler.spawn(async move {
                while let Some(packet) = outbound.recv().await {
                    trace!("Forwarding {} packet", label);
                    transmit(packet);
                }
                debug!("{} outbound queue closed", label);
            }));
        }
    }

    /// Abort both tasks. Staged packets are dropped and later inbound
    /// packets are refused.
    pub(crate) fn stop(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        lock(&self.staging).take();
    }
}
