//! Controller HAL
//!
//! Boundary between the stack and the controller link.
//!
//! ## Architecture
//!
//! ```text
//!               send_hci_command / send_acl_data / send_sco_data
//!                                   │
//! ┌─────────────────────────────────▼───────────────────────────┐
//! │                           HciHal                             │
//! │   capture (outgoing) ──► HalBackend::send                    │
//! │                                                              │
//! │   PacketSink::deliver ◄── backend reader thread              │
//! │     ├─► capture (incoming, always)                           │
//! │     └─► registered listener (at most one)                    │
//! │                                                              │
//! │   PacketSink::link_closed ──► LinkState::Closed              │
//! │   PacketSink::link_failed ──► LinkState::Failed ──► abort    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`h4`] - H4 byte-stream framer
//! - [`socket`] - H4 backend over TCP or a local socket
//! - [`snoop`] - Capture sinks (btsnoop file, in-memory)

pub mod h4;
pub mod snoop;
pub mod socket;

#[cfg(test)]
pub(crate) mod fake;

pub use snoop::{BtSnoopLogger, CaptureSink, Direction, MemoryCapture};
pub use socket::H4SocketBackend;

use crate::domain::packets::{AclPacket, CommandPacket, ControllerPacket, ScoPacket};
use crate::error::HalError;
use crate::stack::{lock, Module, ModuleContext};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, trace, warn};

/// Receives every packet the controller sends.
pub type PacketCallback = Arc<dyn Fn(ControllerPacket) + Send + Sync>;

type FatalFaultHandler = Arc<dyn Fn(&HalError) + Send + Sync>;

/// A controller link.
///
/// Implementations read on their own thread and hand complete packets to
/// the [`PacketSink`] given to `open`.
pub trait HalBackend: Send + Sync + 'static {
    fn open(&self, sink: PacketSink) -> Result<(), HalError>;

    fn send(&self, packet: &ControllerPacket) -> Result<(), HalError>;

    /// Close the link; the reader must stop delivering shortly after.
    fn close(&self);
}

/// Where the controller link stands. `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Up,
    /// The host is closing the link; faults seen now are expected.
    Closing,
    Closed,
    Failed,
}

struct Link {
    capture: Arc<dyn CaptureSink>,
    listener: Mutex<Option<PacketCallback>>,
    state: Mutex<LinkState>,
    on_fatal: Mutex<FatalFaultHandler>,
}

impl Link {
    fn state(&self) -> LinkState {
        *lock(&self.state)
    }

    fn set_state(&self, state: LinkState) {
        *lock(&self.state) = state;
    }

    /// The peer ended the stream between packets.
    fn closed(&self) {
        let mut state = lock(&self.state);
        if *state == LinkState::Up {
            warn!("Controller closed the link");
            *state = LinkState::Closed;
        } else {
            debug!("Controller link closed in state {:?}", *state);
        }
    }

    /// Malformed traffic, a stream cut mid-packet or an I/O error.
    fn failed(&self, fault: HalError) {
        {
            let mut state = lock(&self.state);
            if *state != LinkState::Up {
                debug!("Ignoring link fault in state {:?}: {}", *state, fault);
                return;
            }
            *state = LinkState::Failed;
        }
        error!("Controller link failed: {}", fault);
        let on_fatal = lock(&self.on_fatal).clone();
        on_fatal(&fault);
    }
}

fn abort_on_link_fault(fault: &HalError) {
    error!("Aborting after controller link fault: {}", fault);
    std::process::abort();
}

/// Where a backend delivers incoming packets and reports the link ending.
#[derive(Clone)]
pub struct PacketSink {
    link: Arc<Link>,
}

impl PacketSink {
    /// Capture `packet`, then hand it to the listener if one is registered.
    pub fn deliver(&self, packet: ControllerPacket) {
        self.link.capture.capture(&packet, Direction::Incoming);
        trace!("Incoming {} packet", packet.kind());

        let listener = lock(&self.link.listener).clone();
        match listener {
            Some(listener) => listener(packet),
            None => debug!("No listener registered; dropping {} packet", packet.kind()),
        }
    }

    /// The stream ended cleanly. The link moves to [`LinkState::Closed`].
    pub fn link_closed(&self) {
        self.link.closed();
    }

    /// The link broke. Fatal unless the host is already closing it.
    pub fn link_failed(&self, fault: HalError) {
        self.link.failed(fault);
    }
}

/// The controller transport module.
///
/// Has no factory: it needs a backend, so it is built with
/// [`HciHal::new`] and injected into the registry. A broken link
/// (malformed traffic, a stream cut mid-packet, a failed read or write)
/// aborts the process.
pub struct HciHal {
    backend: Box<dyn HalBackend>,
    link: Arc<Link>,
}

impl HciHal {
    pub fn new(backend: impl HalBackend, capture: Arc<dyn CaptureSink>) -> Self {
        Self {
            backend: Box::new(backend),
            link: Arc::new(Link {
                capture,
                listener: Mutex::new(None),
                state: Mutex::new(LinkState::Idle),
                on_fatal: Mutex::new(Arc::new(abort_on_link_fault)),
            }),
        }
    }

    /// Replace the abort on a broken link with `handler`.
    #[cfg(test)]
    pub(crate) fn with_fatal_fault_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&HalError) + Send + Sync + 'static,
    {
        *lock(&self.link.on_fatal) = Arc::new(handler);
        self
    }

    /// Install the single consumer of incoming packets.
    ///
    /// # Panics
    /// If a callback is already registered.
    pub fn register_incoming_packet_callback<F>(&self, callback: F)
    where
        F: Fn(ControllerPacket) + Send + Sync + 'static,
    {
        let mut listener = lock(&self.link.listener);
        assert!(listener.is_none(), "incoming packet callback registered twice");
        *listener = Some(Arc::new(callback));
    }

    /// # Panics
    /// If no callback is registered.
    pub fn unregister_incoming_packet_callback(&self) {
        let previous = lock(&self.link.listener).take();
        assert!(
            previous.is_some(),
            "no incoming packet callback to unregister"
        );
    }

    pub fn send_hci_command(&self, command: CommandPacket) {
        self.transmit(ControllerPacket::Command(command));
    }

    pub fn send_acl_data(&self, data: AclPacket) {
        self.transmit(ControllerPacket::Acl(data));
    }

    pub fn send_sco_data(&self, data: ScoPacket) {
        self.transmit(ControllerPacket::Sco(data));
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    pub fn is_link_up(&self) -> bool {
        self.link_state() == LinkState::Up
    }

    fn transmit(&self, packet: ControllerPacket) {
        self.link.capture.capture(&packet, Direction::Outgoing);

        let state = self.link_state();
        if state != LinkState::Up {
            error!("Controller link is {:?}; dropping outgoing {} packet", state, packet.kind());
            return;
        }
        trace!("Outgoing {} packet", packet.kind());
        if let Err(e) = self.backend.send(&packet) {
            self.link.failed(e);
        }
    }
}

impl Module for HciHal {
    fn start(&self, _context: &ModuleContext) {
        let sink = PacketSink {
            link: Arc::clone(&self.link),
        };
        self.link.set_state(LinkState::Up);
        if let Err(e) = self.backend.open(sink) {
            error!("Failed to open controller link: {}", e);
            panic!("controller link could not be opened: {}", e);
        }
        info!("Controller link open");
    }

    fn stop(&self) {
        if lock(&self.link.listener).is_some() {
            warn!("HciHal stopping with a packet callback still registered");
        }
        let previous = std::mem::replace(&mut *lock(&self.link.state), LinkState::Closing);
        self.backend.close();
        self.link.set_state(match previous {
            LinkState::Failed => LinkState::Failed,
            _ => LinkState::Closed,
        });
        info!("Controller link closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::packets::{EventCode, EventPacket, OpCode};
    use crate::infrastructure::hal::fake::FakeBackend;
    use crate::infrastructure::hal::h4::H4Error;
    use crate::stack::{ModuleRegistry, Thread};

    fn started_hal() -> (ModuleRegistry, Thread, Arc<HciHal>, FakeBackend, Arc<MemoryCapture>) {
        let registry = ModuleRegistry::new();
        let thread = Thread::new("hal_test").unwrap();
        let backend = FakeBackend::new();
        let capture = Arc::new(MemoryCapture::new());
        registry.inject(HciHal::new(backend.clone(), capture.clone()));
        let hal = registry.start::<HciHal>(&thread);
        (registry, thread, hal, backend, capture)
    }

    #[test]
    fn test_delivers_to_listener_and_capture() {
        let (registry, _thread, hal, backend, capture) = started_hal();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        hal.register_incoming_packet_callback(move |packet| sink.lock().unwrap().push(packet));

        let event = ControllerPacket::Event(EventPacket::new(EventCode::INQUIRY_COMPLETE, vec![0]));
        backend.inject(event.clone());

        assert_eq!(*received.lock().unwrap(), vec![event.clone()]);
        assert_eq!(capture.records(), vec![(Direction::Incoming, event)]);

        hal.unregister_incoming_packet_callback();
        registry.stop_all();
        assert!(backend.is_closed());
    }

    #[test]
    fn test_capture_sees_packets_without_listener() {
        let (registry, _thread, _hal, backend, capture) = started_hal();
        let event = ControllerPacket::Event(EventPacket::new(EventCode::VENDOR_SPECIFIC, vec![]));
        backend.inject(event.clone());
        assert_eq!(capture.records(), vec![(Direction::Incoming, event)]);
        registry.stop_all();
    }

    #[test]
    fn test_outgoing_packets_reach_backend() {
        let (registry, _thread, hal, backend, capture) = started_hal();
        hal.send_hci_command(CommandPacket::new(OpCode::RESET, vec![]));

        let sent = ControllerPacket::Command(CommandPacket::new(OpCode::RESET, vec![]));
        assert_eq!(backend.sent(), vec![sent.clone()]);
        assert_eq!(capture.records(), vec![(Direction::Outgoing, sent)]);
        registry.stop_all();
    }

    type Faults = Arc<Mutex<Vec<String>>>;

    /// Like `started_hal`, but faults are recorded instead of aborting.
    fn started_hal_recording_faults() -> (ModuleRegistry, Thread, Arc<HciHal>, FakeBackend, Arc<MemoryCapture>, Faults) {
        let registry = ModuleRegistry::new();
        let thread = Thread::new("hal_fault_test").unwrap();
        let backend = FakeBackend::new();
        let capture = Arc::new(MemoryCapture::new());
        let faults = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&faults);
        registry.inject(
            HciHal::new(backend.clone(), capture.clone())
                .with_fatal_fault_handler(move |fault| seen.lock().unwrap().push(fault.to_string())),
        );
        let hal = registry.start::<HciHal>(&thread);
        (registry, thread, hal, backend, capture, faults)
    }

    #[test]
    fn test_send_failure_is_fatal() {
        let (registry, _thread, hal, backend, capture, faults) = started_hal_recording_faults();
        backend.fail_sends();

        hal.send_hci_command(CommandPacket::new(OpCode::RESET, vec![]));
        assert_eq!(hal.link_state(), LinkState::Failed);
        assert_eq!(*faults.lock().unwrap(), vec!["controller link is down".to_string()]);

        // Terminal: later sends are captured and dropped, not retried.
        hal.send_hci_command(CommandPacket::new(OpCode::READ_BD_ADDR, vec![]));
        assert!(backend.sent().is_empty());
        assert_eq!(capture.records().len(), 2);
        assert_eq!(faults.lock().unwrap().len(), 1);

        registry.stop_all();
        assert_eq!(hal.link_state(), LinkState::Failed);
    }

    #[test]
    fn test_reader_fault_is_fatal() {
        let (registry, _thread, hal, backend, _capture, faults) = started_hal_recording_faults();
        backend.fail_link(HalError::Framing(H4Error::UnknownType(0x09)));

        assert_eq!(hal.link_state(), LinkState::Failed);
        assert_eq!(*faults.lock().unwrap(), vec!["unknown packet type 0x09".to_string()]);
        registry.stop_all();
    }

    #[test]
    fn test_clean_close_is_terminal_but_not_fatal() {
        let (registry, _thread, hal, backend, _capture, faults) = started_hal_recording_faults();
        backend.hang_up();

        assert_eq!(hal.link_state(), LinkState::Closed);
        assert!(faults.lock().unwrap().is_empty());
        registry.stop_all();
        assert_eq!(hal.link_state(), LinkState::Closed);
    }

    #[test]
    fn test_fault_while_closing_is_ignored() {
        let (registry, _thread, hal, backend, _capture, faults) = started_hal_recording_faults();
        backend.fail_on_close(HalError::LinkDown);

        registry.stop_all();
        assert_eq!(hal.link_state(), LinkState::Closed);
        assert!(faults.lock().unwrap().is_empty());
    }

    #[test]
    #[should_panic(expected = "incoming packet callback registered twice")]
    fn test_double_registration_is_fatal() {
        let hal = HciHal::new(FakeBackend::new(), Arc::new(MemoryCapture::new()));
        hal.register_incoming_packet_callback(|_| {});
        hal.register_incoming_packet_callback(|_| {});
    }

    #[test]
    #[should_panic(expected = "no incoming packet callback to unregister")]
    fn test_unregister_without_callback_is_fatal() {
        let hal = HciHal::new(FakeBackend::new(), Arc::new(MemoryCapture::new()));
        hal.unregister_incoming_packet_callback();
    }
}
