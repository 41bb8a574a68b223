//! In-process controller link for tests.

use crate::domain::packets::{CommandPacket, ControllerPacket};
use crate::error::HalError;
use crate::infrastructure::hal::{HalBackend, PacketSink};
use crate::stack::lock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct FakeState {
    sink: Mutex<Option<PacketSink>>,
    sent: Mutex<Vec<ControllerPacket>>,
    failing: AtomicBool,
    fault_on_close: Mutex<Option<HalError>>,
    closed: AtomicBool,
}

/// Records everything sent and lets the test play the controller.
#[derive(Clone, Default)]
pub(crate) struct FakeBackend {
    state: Arc<FakeState>,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Deliver `packet` as if the controller sent it, on the calling thread.
    pub(crate) fn inject(&self, packet: ControllerPacket) {
        let sink = lock(&self.state.sink).clone();
        match sink {
            Some(sink) => sink.deliver(packet),
            None => panic!("packet injected before the link was opened"),
        }
    }

    pub(crate) fn sent(&self) -> Vec<ControllerPacket> {
        lock(&self.state.sent).clone()
    }

    pub(crate) fn sent_commands(&self) -> Vec<CommandPacket> {
        self.sent()
            .into_iter()
            .filter_map(|packet| match packet {
                ControllerPacket::Command(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    /// Make every later send fail.
    pub(crate) fn fail_sends(&self) {
        self.state.failing.store(true, Ordering::SeqCst);
    }

    /// Report a reader failure, as a broken stream would.
    pub(crate) fn fail_link(&self, fault: HalError) {
        self.opened_sink().link_failed(fault);
    }

    /// End the stream cleanly, as a controller hanging up would.
    pub(crate) fn hang_up(&self) {
        self.opened_sink().link_closed();
    }

    /// Have the reader report `fault` while the host closes the link.
    pub(crate) fn fail_on_close(&self, fault: HalError) {
        *lock(&self.state.fault_on_close) = Some(fault);
    }

    fn opened_sink(&self) -> PacketSink {
        lock(&self.state.sink)
            .clone()
            .unwrap_or_else(|| panic!("link used before it was opened"))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

impl HalBackend for FakeBackend {
    fn open(&self, sink: PacketSink) -> Result<(), HalError> {
        *lock(&self.state.sink) = Some(sink);
        Ok(())
    }

    fn send(&self, packet: &ControllerPacket) -> Result<(), HalError> {
        if self.state.failing.load(Ordering::SeqCst) {
            return Err(HalError::LinkDown);
        }
        lock(&self.state.sent).push(packet.clone());
        Ok(())
    }

    fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        let sink = lock(&self.state.sink).take();
        let fault = lock(&self.state.fault_on_close).take();
        if let (Some(sink), Some(fault)) = (sink, fault) {
            sink.link_failed(fault);
        }
    }
}
