//! Controller Packets
//!
//! Typed packets exchanged with a Bluetooth controller, plus the read-only
//! views the correlation layer hands to its clients.
//!
//! # Packet Layout (H4 framing)
//!
//! ```text
//! Command : [0x01][opcode u16 LE][len u8 ][params ...]
//! ACL     : [0x02][handle+flags u16 LE][len u16 LE][payload ...]
//! SCO     : [0x03][handle+flags u16 LE][len u8 ][payload ...]
//! Event   : [0x04][event code u8][len u8 ][params ...]
//! ```
//!
//! The packet types here never carry the type indicator or the length;
//! both are derived when framing (see `infrastructure::hal::h4`).

use std::fmt;
use thiserror::Error;

/// HCI command opcode (OGF in the upper 6 bits, OCF in the lower 10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpCode(pub u16);

impl OpCode {
    /// No-operation opcode. Controllers use it to report credits without
    /// answering a command.
    pub const NONE: OpCode = OpCode(0x0000);
    /// HCI_Reset
    pub const RESET: OpCode = OpCode(0x0C03);
    /// HCI_Read_BD_ADDR
    pub const READ_BD_ADDR: OpCode = OpCode(0x1009);

    pub fn ogf(self) -> u8 {
        (self.0 >> 10) as u8
    }

    pub fn ocf(self) -> u16 {
        self.0 & 0x03FF
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// HCI event code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventCode(pub u8);

impl EventCode {
    pub const INQUIRY_COMPLETE: EventCode = EventCode(0x01);
    pub const CONNECTION_COMPLETE: EventCode = EventCode(0x03);
    pub const DISCONNECTION_COMPLETE: EventCode = EventCode(0x05);
    pub const COMMAND_COMPLETE: EventCode = EventCode(0x0E);
    pub const COMMAND_STATUS: EventCode = EventCode(0x0F);
    pub const LE_META_EVENT: EventCode = EventCode(0x3E);
    pub const VENDOR_SPECIFIC: EventCode = EventCode(0xFF);
}

impl fmt::Display for EventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Sub-event code carried in the first parameter byte of an LE Meta event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubeventCode(pub u8);

impl SubeventCode {
    pub const CONNECTION_COMPLETE: SubeventCode = SubeventCode(0x01);
    pub const ADVERTISING_REPORT: SubeventCode = SubeventCode(0x02);
    pub const CONNECTION_UPDATE_COMPLETE: SubeventCode = SubeventCode(0x03);
    pub const ENHANCED_CONNECTION_COMPLETE: SubeventCode = SubeventCode(0x0A);
}

impl fmt::Display for SubeventCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Outbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    pub opcode: OpCode,
    pub parameters: Vec<u8>,
}

impl CommandPacket {
    pub fn new(opcode: OpCode, parameters: Vec<u8>) -> Self {
        Self { opcode, parameters }
    }
}

/// Event sent by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventPacket {
    pub code: EventCode,
    pub parameters: Vec<u8>,
}

impl EventPacket {
    pub fn new(code: EventCode, parameters: Vec<u8>) -> Self {
        Self { code, parameters }
    }

    /// Interpret this event as a Command Complete.
    ///
    /// ```text
    /// [0]    : Num_HCI_Command_Packets
    /// [1-2]  : Command_Opcode (u16 little-endian)
    /// [3..]  : Return parameters
    /// ```
    pub fn as_command_complete(&self) -> Result<CommandCompleteView, PacketError> {
        self.expect_code(EventCode::COMMAND_COMPLETE)?;
        let p = &self.parameters;
        if p.len() < 3 {
            return Err(PacketError::TooShort {
                what: "command complete",
                needed: 3,
                actual: p.len(),
            });
        }
        Ok(CommandCompleteView {
            num_hci_command_packets: p[0],
            command_opcode: OpCode(u16::from_le_bytes([p[1], p[2]])),
            return_parameters: p[3..].to_vec(),
        })
    }

    /// Interpret this event as a Command Status.
    ///
    /// ```text
    /// [0]    : Status
    /// [1]    : Num_HCI_Command_Packets
    /// [2-3]  : Command_Opcode (u16 little-endian)
    /// ```
    pub fn as_command_status(&self) -> Result<CommandStatusView, PacketError> {
        self.expect_code(EventCode::COMMAND_STATUS)?;
        let p = &self.parameters;
        if p.len() < 4 {
            return Err(PacketError::TooShort {
                what: "command status",
                needed: 4,
                actual: p.len(),
            });
        }
        Ok(CommandStatusView {
            status: p[0],
            num_hci_command_packets: p[1],
            command_opcode: OpCode(u16::from_le_bytes([p[2], p[3]])),
        })
    }

    /// Interpret this event as an LE Meta event (`[0]` is the sub-event code).
    pub fn as_le_meta_event(&self) -> Result<LeMetaEventView, PacketError> {
        self.expect_code(EventCode::LE_META_EVENT)?;
        let (subevent, rest) = self.parameters.split_first().ok_or(PacketError::TooShort {
            what: "le meta event",
            needed: 1,
            actual: 0,
        })?;
        Ok(LeMetaEventView {
            subevent_code: SubeventCode(*subevent),
            parameters: rest.to_vec(),
        })
    }

    fn expect_code(&self, expected: EventCode) -> Result<(), PacketError> {
        if self.code != expected {
            return Err(PacketError::WrongEvent {
                expected,
                actual: self.code,
            });
        }
        Ok(())
    }
}

/// ACL packet boundary flag (bits 12-13 of the handle field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketBoundary {
    FirstNonAutomaticallyFlushable,
    Continuing,
    FirstAutomaticallyFlushable,
    Complete,
}

impl PacketBoundary {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::FirstNonAutomaticallyFlushable,
            1 => Self::Continuing,
            2 => Self::FirstAutomaticallyFlushable,
            _ => Self::Complete,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::FirstNonAutomaticallyFlushable => 0,
            Self::Continuing => 1,
            Self::FirstAutomaticallyFlushable => 2,
            Self::Complete => 3,
        }
    }
}

/// ACL data packet, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclPacket {
    /// Connection handle (12 bits)
    pub handle: u16,
    pub boundary: PacketBoundary,
    /// Broadcast flag (2 bits)
    pub broadcast: u8,
    pub payload: Vec<u8>,
}

impl AclPacket {
    pub fn new(handle: u16, boundary: PacketBoundary, payload: Vec<u8>) -> Self {
        Self {
            handle,
            boundary,
            broadcast: 0,
            payload,
        }
    }

    pub(crate) fn header_word(&self) -> u16 {
        (self.handle & 0x0FFF)
            | (u16::from(self.boundary.bits()) << 12)
            | (u16::from(self.broadcast & 0x03) << 14)
    }

    pub(crate) fn from_header_word(word: u16, payload: Vec<u8>) -> Self {
        Self {
            handle: word & 0x0FFF,
            boundary: PacketBoundary::from_bits((word >> 12) as u8),
            broadcast: ((word >> 14) & 0x03) as u8,
            payload,
        }
    }
}

/// SCO data packet, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoPacket {
    /// Connection handle (12 bits)
    pub handle: u16,
    /// Packet status flag (2 bits)
    pub status: u8,
    pub payload: Vec<u8>,
}

impl ScoPacket {
    pub fn new(handle: u16, payload: Vec<u8>) -> Self {
        Self {
            handle,
            status: 0,
            payload,
        }
    }

    pub(crate) fn header_word(&self) -> u16 {
        (self.handle & 0x0FFF) | (u16::from(self.status & 0x03) << 12)
    }

    pub(crate) fn from_header_word(word: u16, payload: Vec<u8>) -> Self {
        Self {
            handle: word & 0x0FFF,
            status: ((word >> 12) & 0x03) as u8,
            payload,
        }
    }
}

/// Any fully framed packet crossing the controller link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerPacket {
    Command(CommandPacket),
    Event(EventPacket),
    Acl(AclPacket),
    Sco(ScoPacket),
}

impl ControllerPacket {
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::Command(_) => PacketKind::Command,
            Self::Event(_) => PacketKind::Event,
            Self::Acl(_) => PacketKind::Acl,
            Self::Sco(_) => PacketKind::Sco,
        }
    }
}

/// Packet type, with its H4 type indicator as the discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    Command = 0x01,
    Acl = 0x02,
    Sco = 0x03,
    Event = 0x04,
}

impl PacketKind {
    pub fn from_indicator(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Command),
            0x02 => Some(Self::Acl),
            0x03 => Some(Self::Sco),
            0x04 => Some(Self::Event),
            _ => None,
        }
    }

    pub fn indicator(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Command => "command",
            Self::Acl => "acl",
            Self::Sco => "sco",
            Self::Event => "event",
        };
        f.write_str(name)
    }
}

/// Command Complete, as seen by the command's issuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandCompleteView {
    pub num_hci_command_packets: u8,
    pub command_opcode: OpCode,
    pub return_parameters: Vec<u8>,
}

impl CommandCompleteView {
    /// First return parameter; by convention the HCI status code.
    pub fn status(&self) -> Option<u8> {
        self.return_parameters.first().copied()
    }
}

/// Command Status, as seen by the command's issuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatusView {
    pub status: u8,
    pub num_hci_command_packets: u8,
    pub command_opcode: OpCode,
}

/// LE Meta event with the sub-event code split out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeMetaEventView {
    pub subevent_code: SubeventCode,
    pub parameters: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("{what} needs at least {needed} parameter bytes, got {actual}")]
    TooShort {
        what: &'static str,
        needed: usize,
        actual: usize,
    },
    #[error("expected event {expected}, got {actual}")]
    WrongEvent {
        expected: EventCode,
        actual: EventCode,
    },
}
