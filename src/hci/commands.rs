//! Command flow control
//!
//! Pending-command FIFO plus the controller's command credit.
//!
//! ```text
//! enqueue ──► [c1][c2][c3] ──► next_to_send()  (credits > 0, nothing in flight)
//!                 ▲                 │ credits -= 1
//!                 │                 ▼
//!           on_response() ◄── controller answers the oldest command
//!             credits = reported count, head popped
//! ```
//!
//! Responses are attributed strictly in FIFO order; the opcode carried by
//! a response is only used for diagnostics. A response with opcode 0x0000
//! carries a credit update and answers nothing.

use crate::domain::packets::OpCode;
use std::collections::VecDeque;
use std::fmt;
use tracing::warn;

/// The credit assumed before the controller has reported any.
pub const INITIAL_COMMAND_CREDITS: u8 = 1;

/// Which response event a command is answered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Complete,
    Status,
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complete => write!(f, "Command Complete"),
            Self::Status => write!(f, "Command Status"),
        }
    }
}

/// The flow-control fields of a Command Complete or Command Status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandResponse {
    pub kind: ResponseKind,
    pub opcode: OpCode,
    pub num_hci_command_packets: u8,
}

struct Pending<T> {
    opcode: OpCode,
    expects: ResponseKind,
    entry: T,
}

pub struct CommandQueue<T> {
    pending: VecDeque<Pending<T>>,
    credits: u8,
    in_flight: bool,
}

impl<T> CommandQueue<T> {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            credits: INITIAL_COMMAND_CREDITS,
            in_flight: false,
        }
    }

    pub fn enqueue(&mut self, opcode: OpCode, expects: ResponseKind, entry: T) {
        self.pending.push_back(Pending {
            opcode,
            expects,
            entry,
        });
    }

    /// The head command, if it may be transmitted now. Returning it spends
    /// one credit and marks it in flight.
    pub fn next_to_send(&mut self) -> Option<&T> {
        if self.credits == 0 || self.in_flight {
            return None;
        }
        let head = self.pending.front()?;
        self.credits -= 1;
        self.in_flight = true;
        Some(&head.entry)
    }

    /// Apply a controller response; returns the command it answers.
    ///
    /// # Panics
    /// If a non-NOP response arrives with no command in flight, or the
    /// response kind differs from what the command expects.
    pub fn on_response(&mut self, response: CommandResponse) -> Option<T> {
        self.credits = response.num_hci_command_packets;
        if response.opcode == OpCode::NONE {
            return None;
        }

        assert!(
            self.in_flight,
            "{} for opcode {} with no command in flight",
            response.kind, response.opcode
        );
        let head = self
            .pending
            .pop_front()
            .unwrap_or_else(|| panic!("command in flight but the pending queue is empty"));
        self.in_flight = false;

        assert!(
            head.expects == response.kind,
            "command {} expects {} but got {}",
            head.opcode,
            head.expects,
            response.kind
        );
        if head.opcode != response.opcode {
            warn!(
                "Response for opcode {} attributed to pending command {}",
                response.opcode, head.opcode
            );
        }
        Some(head.entry)
    }

    pub fn credits(&self) -> u8 {
        self.credits
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Commands not yet answered, including the one in flight.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<T> Default for CommandQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
