//! HCI Layer
//!
//! Turns the raw controller link into request/response and
//! publish/subscribe APIs for feature modules.
//!
//! ## Architecture
//!
//! ```text
//!  feature module                HciLayer handler                 HciHal
//! ───────────────               ──────────────────              ────────
//! enqueue_command ──post──►  CommandQueue::enqueue
//!                            next_to_send() ─────────────────► send_hci_command
//!
//!                            on_event  ◄──────post─────────────── link reader
//!                             ├─ Command Complete / Status
//!                             │    on_response() → pop head
//!                             │    post callback to its handler
//!                             │    next_to_send()
//!                             ├─ LE Meta → subevent table
//!                             └─ other   → event table
//!
//! ACL / SCO: link reader ──► DataQueue staging ──► pump task ──► client
//!            (never queued behind events or commands)
//! ```
//!
//! ## Rules
//! - Command state is touched only from the layer's own handler
//! - Every callback runs on the handler its registrant supplied
//! - Command Complete, Command Status and LE Meta codes are reserved

use crate::domain::packets::{
    AclPacket, CommandCompleteView, CommandPacket, CommandStatusView, ControllerPacket, EventCode,
    EventPacket, LeMetaEventView, ScoPacket, SubeventCode,
};
use crate::hci::commands::{CommandQueue, CommandResponse, ResponseKind};
use crate::hci::queue::{DataQueue, DataQueueEnd, DEFAULT_DATA_QUEUE_CAPACITY};
use crate::infrastructure::hal::HciHal;
use crate::stack::{lock, Handler, Module, ModuleContext, ModuleList};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace, warn};

type CompleteCallback = Box<dyn FnOnce(CommandCompleteView) + Send + 'static>;
type StatusCallback = Box<dyn FnOnce(CommandStatusView) + Send + 'static>;
type Task = Box<dyn FnOnce() + Send + 'static>;

enum OnResponse {
    Complete(CompleteCallback),
    Status(StatusCallback),
}

struct PendingCommand {
    command: CommandPacket,
    on_response: OnResponse,
    handler: Handler,
}

struct Registration<V> {
    callback: Arc<dyn Fn(V) + Send + Sync + 'static>,
    handler: Handler,
}

/// Event-code keyed callbacks, at most one per code.
struct RegistrationTable<K, V> {
    what: &'static str,
    entries: Mutex<HashMap<K, Registration<V>>>,
}

impl<K, V> RegistrationTable<K, V>
where
    K: Eq + Hash + Copy + std::fmt::Display,
    V: Send + 'static,
{
    fn new(what: &'static str) -> Self {
        Self {
            what,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, key: K, registration: Registration<V>) {
        let mut entries = lock(&self.entries);
        assert!(
            !entries.contains_key(&key),
            "{} {} already has a handler",
            self.what,
            key
        );
        entries.insert(key, registration);
    }

    fn unregister(&self, key: K) {
        let removed = lock(&self.entries).remove(&key);
        assert!(removed.is_some(), "{} {} has no handler to unregister", self.what, key);
    }

    /// Post `value` to the registrant of `key`; false when nobody listens.
    fn dispatch(&self, key: K, value: V) -> bool {
        let target = lock(&self.entries)
            .get(&key)
            .map(|r| (Arc::clone(&r.callback), r.handler.clone()));
        match target {
            Some((callback, handler)) => {
                handler.post(move || callback(value));
                true
            }
            None => false,
        }
    }

    fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

struct HciLayerImpl {
    hal: Arc<HciHal>,
    handler: Handler,
    commands: Mutex<CommandQueue<PendingCommand>>,
    events: RegistrationTable<EventCode, EventPacket>,
    le_events: RegistrationTable<SubeventCode, LeMetaEventView>,
    acl: DataQueue<AclPacket>,
    sco: DataQueue<ScoPacket>,
}

impl HciLayerImpl {
    fn enqueue(&self, pending: PendingCommand) {
        let expects = match pending.on_response {
            OnResponse::Complete(_) => ResponseKind::Complete,
            OnResponse::Status(_) => ResponseKind::Status,
        };
        trace!("Queueing command {}", pending.command.opcode);
        lock(&self.commands).enqueue(pending.command.opcode, expects, pending);
        self.send_next_command();
    }

    fn send_next_command(&self) {
        let next = lock(&self.commands)
            .next_to_send()
            .map(|pending| pending.command.clone());
        if let Some(command) = next {
            debug!("Sending command {}", command.opcode);
            self.hal.send_hci_command(command);
        }
    }

    fn on_incoming(self: &Arc<Self>, packet: ControllerPacket) {
        match packet {
            ControllerPacket::Event(event) => {
                let layer = Arc::clone(self);
                if self.handler.enqueue(Box::new(move || layer.on_event(event))).is_err() {
                    debug!("HciLayer stopped; dropping event");
                }
            }
            ControllerPacket::Acl(data) => self.acl.deliver_inbound(data),
            ControllerPacket::Sco(data) => self.sco.deliver_inbound(data),
            ControllerPacket::Command(command) => {
                warn!("Controller sent a command packet ({}); ignoring", command.opcode)
            }
        }
    }

    fn on_event(&self, event: EventPacket) {
        match event.code {
            EventCode::COMMAND_COMPLETE => {
                let view = event
                    .as_command_complete()
                    .unwrap_or_else(|e| panic!("malformed Command Complete from controller: {}", e));
                let response = CommandResponse {
                    kind: ResponseKind::Complete,
                    opcode: view.command_opcode,
                    num_hci_command_packets: view.num_hci_command_packets,
                };
                self.on_command_response(response, |on_response| -> Task {
                    match on_response {
                        OnResponse::Complete(callback) => Box::new(move || callback(view)),
                        OnResponse::Status(_) => unreachable!("kind checked by the command queue"),
                    }
                });
            }
            EventCode::COMMAND_STATUS => {
                let view = event
                    .as_command_status()
                    .unwrap_or_else(|e| panic!("malformed Command Status from controller: {}", e));
                let response = CommandResponse {
                    kind: ResponseKind::Status,
                    opcode: view.command_opcode,
                    num_hci_command_packets: view.num_hci_command_packets,
                };
                self.on_command_response(response, |on_response| -> Task {
                    match on_response {
                        OnResponse::Status(callback) => Box::new(move || callback(view)),
                        OnResponse::Complete(_) => unreachable!("kind checked by the command queue"),
                    }
                });
            }
            EventCode::LE_META_EVENT => match event.as_le_meta_event() {
                Ok(view) => {
                    let subevent = view.subevent_code;
                    if !self.le_events.dispatch(subevent, view) {
                        debug!("No handler for LE subevent {}; dropping", subevent);
                    }
                }
                Err(e) => warn!("Dropping malformed LE Meta event: {}", e),
            },
            code => {
                if !self.events.dispatch(code, event) {
                    debug!("No handler for event {}; dropping", code);
                }
            }
        }
    }

    fn on_command_response<F>(&self, response: CommandResponse, bind: F)
    where
        F: FnOnce(OnResponse) -> Task,
    {
        let answered = lock(&self.commands).on_response(response);
        if let Some(pending) = answered {
            trace!("{} resolves command {}", response.kind, pending.command.opcode);
            pending.handler.post(bind(pending.on_response));
        }
        self.send_next_command();
    }
}

/// The HCI correlation layer module.
pub struct HciLayer {
    data_queue_capacity: usize,
    inner: Mutex<Option<Arc<HciLayerImpl>>>,
}

impl HciLayer {
    pub fn new() -> Self {
        Self::with_data_queue_capacity(DEFAULT_DATA_QUEUE_CAPACITY)
    }

    pub fn with_data_queue_capacity(capacity: usize) -> Self {
        Self {
            data_queue_capacity: capacity.max(1),
            inner: Mutex::new(None),
        }
    }

    /// Send `command` once credit allows; `on_complete` runs on `handler`
    /// with the matching Command Complete.
    pub fn enqueue_command_with_complete<F>(&self, command: CommandPacket, on_complete: F, handler: &Handler)
    where
        F: FnOnce(CommandCompleteView) + Send + 'static,
    {
        self.enqueue(PendingCommand {
            command,
            on_response: OnResponse::Complete(Box::new(on_complete)),
            handler: handler.clone(),
        });
    }

    /// Send `command` once credit allows; `on_status` runs on `handler`
    /// with the matching Command Status.
    pub fn enqueue_command_with_status<F>(&self, command: CommandPacket, on_status: F, handler: &Handler)
    where
        F: FnOnce(CommandStatusView) + Send + 'static,
    {
        self.enqueue(PendingCommand {
            command,
            on_response: OnResponse::Status(Box::new(on_status)),
            handler: handler.clone(),
        });
    }

    /// Route every `code` event to `callback` on `handler`.
    ///
    /// # Panics
    /// If `code` is reserved or already has a handler.
    pub fn register_event_handler<F>(&self, code: EventCode, callback: F, handler: &Handler)
    where
        F: Fn(EventPacket) + Send + Sync + 'static,
    {
        assert!(
            !matches!(
                code,
                EventCode::COMMAND_COMPLETE | EventCode::COMMAND_STATUS | EventCode::LE_META_EVENT
            ),
            "event {} is reserved by the HCI layer",
            code
        );
        self.started().events.register(
            code,
            Registration {
                callback: Arc::new(callback),
                handler: handler.clone(),
            },
        );
        debug!("Registered handler for event {}", code);
    }

    /// # Panics
    /// If `code` has no handler.
    pub fn unregister_event_handler(&self, code: EventCode) {
        self.started().events.unregister(code);
        debug!("Unregistered handler for event {}", code);
    }

    /// Route every LE Meta event with `subevent` to `callback` on `handler`.
    ///
    /// # Panics
    /// If `subevent` already has a handler.
    pub fn register_le_event_handler<F>(&self, subevent: SubeventCode, callback: F, handler: &Handler)
    where
        F: Fn(LeMetaEventView) + Send + Sync + 'static,
    {
        self.started().le_events.register(
            subevent,
            Registration {
                callback: Arc::new(callback),
                handler: handler.clone(),
            },
        );
        debug!("Registered handler for LE subevent {}", subevent);
    }

    /// # Panics
    /// If `subevent` has no handler.
    pub fn unregister_le_event_handler(&self, subevent: SubeventCode) {
        self.started().le_events.unregister(subevent);
        debug!("Unregistered handler for LE subevent {}", subevent);
    }

    /// The client end of the ACL data queue.
    ///
    /// # Panics
    /// If it was already taken.
    pub fn acl_queue_end(&self) -> DataQueueEnd<AclPacket> {
        self.started().acl.take_client_end()
    }

    /// The client end of the SCO data queue.
    ///
    /// # Panics
    /// If it was already taken.
    pub fn sco_queue_end(&self) -> DataQueueEnd<ScoPacket> {
        self.started().sco.take_client_end()
    }

    fn enqueue(&self, pending: PendingCommand) {
        let layer = self.started();
        let target = Arc::clone(&layer);
        layer.handler.post(move || target.enqueue(pending));
    }

    fn started(&self) -> Arc<HciLayerImpl> {
        lock(&self.inner)
            .clone()
            .unwrap_or_else(|| panic!("HciLayer used while not running"))
    }

    #[cfg(test)]
    fn handler(&self) -> Handler {
        self.started().handler.clone()
    }
}

impl Default for HciLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for HciLayer {
    fn create() -> Option<Self> {
        Some(Self::new())
    }

    fn list_dependencies(&self, list: &mut ModuleList) {
        list.add::<HciHal>();
    }

    fn start(&self, context: &ModuleContext) {
        let hal = context.get_dependency::<HciHal>();
        let layer = Arc::new(HciLayerImpl {
            hal: Arc::clone(&hal),
            handler: context.handler().clone(),
            commands: Mutex::new(CommandQueue::new()),
            events: RegistrationTable::new("event"),
            le_events: RegistrationTable::new("LE subevent"),
            acl: DataQueue::new("ACL", self.data_queue_capacity),
            sco: DataQueue::new("SCO", self.data_queue_capacity),
        });

        let acl_hal = Arc::clone(&hal);
        layer
            .acl
            .start(context.handler(), move |data| acl_hal.send_acl_data(data));
        let sco_hal = Arc::clone(&hal);
        layer
            .sco
            .start(context.handler(), move |data| sco_hal.send_sco_data(data));

        let listener = Arc::clone(&layer);
        hal.register_incoming_packet_callback(move |packet| listener.on_incoming(packet));

        *lock(&self.inner) = Some(layer);
        info!("HCI layer started");
    }

    fn stop(&self) {
        let Some(layer) = lock(&self.inner).take() else {
            return;
        };
        layer.hal.unregister_incoming_packet_callback();
        layer.acl.stop();
        layer.sco.stop();

        let unanswered = lock(&layer.commands).len();
        if unanswered > 0 {
            warn!("HCI layer stopping with {} unanswered command(s)", unanswered);
        }
        let registered = layer.events.len() + layer.le_events.len();
        if registered > 0 {
            warn!("HCI layer stopping with {} event handler(s) still registered", registered);
        }
        info!("HCI layer stopped");
    }
}
