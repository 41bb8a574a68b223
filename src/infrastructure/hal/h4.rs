//! H4 Byte-Stream Framer
//!
//! Reads and writes [`ControllerPacket`]s on a byte stream that does not
//! preserve message boundaries.
//!
//! # Frame Structure
//!
//! ```text
//! [0]     : Packet type (0x01 command, 0x02 ACL, 0x03 SCO, 0x04 event)
//!
//! Command : [1-2] opcode (u16 LE)        [3]    parameter length
//! ACL     : [1-2] handle + flags (u16 LE) [3-4] payload length (u16 LE)
//! SCO     : [1-2] handle + flags (u16 LE) [3]    payload length
//! Event   : [1]   event code              [2]    parameter length
//!
//! then exactly `length` payload bytes
//! ```
//!
//! Short reads are retried until the requested size is satisfied. Only the
//! stream closing can cut a packet short, and a cut packet is never
//! returned.

use crate::domain::packets::{
    AclPacket, CommandPacket, ControllerPacket, EventCode, EventPacket, OpCode, PacketKind,
    ScoPacket,
};
use std::io::{self, Read, Write};
use thiserror::Error;
use tracing::trace;

const COMMAND_HEADER_SIZE: usize = 3;
const ACL_HEADER_SIZE: usize = 4;
const SCO_HEADER_SIZE: usize = 3;
const EVENT_HEADER_SIZE: usize = 2;

#[derive(Debug, Error)]
pub enum H4Error {
    /// The stream ended cleanly between packets.
    #[error("link closed")]
    Closed,

    /// The stream ended in the middle of a packet.
    #[error("link closed while reading {context}")]
    Truncated { context: &'static str },

    #[error("unknown packet type 0x{0:02x}")]
    UnknownType(u8),

    #[error("{kind} payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge {
        kind: PacketKind,
        len: usize,
        max: usize,
    },

    #[error("link I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Read one complete packet.
///
/// Returns [`H4Error::Closed`] when the stream ends before a type byte and
/// [`H4Error::Truncated`] when it ends anywhere after.
pub fn read_packet<R: Read>(reader: &mut R) -> Result<ControllerPacket, H4Error> {
    let mut indicator = [0u8; 1];
    if fill(reader, &mut indicator)? == 0 {
        return Err(H4Error::Closed);
    }
    let kind = PacketKind::from_indicator(indicator[0]).ok_or(H4Error::UnknownType(indicator[0]))?;

    let packet = match kind {
        PacketKind::Command => {
            let mut header = [0u8; COMMAND_HEADER_SIZE];
            read_exact(reader, &mut header, "command header")?;
            let opcode = OpCode(u16::from_le_bytes([header[0], header[1]]));
            let parameters = read_payload(reader, usize::from(header[2]), "command parameters")?;
            ControllerPacket::Command(CommandPacket::new(opcode, parameters))
        }
        PacketKind::Acl => {
            let mut header = [0u8; ACL_HEADER_SIZE];
            read_exact(reader, &mut header, "ACL header")?;
            let word = u16::from_le_bytes([header[0], header[1]]);
            let len = usize::from(u16::from_le_bytes([header[2], header[3]]));
            let payload = read_payload(reader, len, "ACL payload")?;
            ControllerPacket::Acl(AclPacket::from_header_word(word, payload))
        }
        PacketKind::Sco => {
            let mut header = [0u8; SCO_HEADER_SIZE];
            read_exact(reader, &mut header, "SCO header")?;
            let word = u16::from_le_bytes([header[0], header[1]]);
            let payload = read_payload(reader, usize::from(header[2]), "SCO payload")?;
            ControllerPacket::Sco(ScoPacket::from_header_word(word, payload))
        }
        PacketKind::Event => {
            let mut header = [0u8; EVENT_HEADER_SIZE];
            read_exact(reader, &mut header, "event header")?;
            let parameters = read_payload(reader, usize::from(header[1]), "event parameters")?;
            ControllerPacket::Event(EventPacket::new(EventCode(header[0]), parameters))
        }
    };

    trace!("H4 read {:?}", packet);
    Ok(packet)
}

/// Frame `packet` and write it as one unit.
pub fn write_packet<W: Write>(writer: &mut W, packet: &ControllerPacket) -> Result<(), H4Error> {
    let frame = encode(packet)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    trace!("H4 wrote {} bytes ({})", frame.len(), packet.kind());
    Ok(())
}

/// The complete H4 frame for `packet`, type byte included.
pub fn encode(packet: &ControllerPacket) -> Result<Vec<u8>, H4Error> {
    let kind = packet.kind();
    let mut frame = Vec::with_capacity(5 + payload_len(packet));
    frame.push(kind.indicator());

    match packet {
        ControllerPacket::Command(command) => {
            let len = checked_len(kind, command.parameters.len(), u8::MAX as usize)?;
            frame.extend_from_slice(&command.opcode.0.to_le_bytes());
            frame.push(len as u8);
            frame.extend_from_slice(&command.parameters);
        }
        ControllerPacket::Acl(acl) => {
            let len = checked_len(kind, acl.payload.len(), u16::MAX as usize)?;
            frame.extend_from_slice(&acl.header_word().to_le_bytes());
            frame.extend_from_slice(&(len as u16).to_le_bytes());
            frame.extend_from_slice(&acl.payload);
        }
        ControllerPacket::Sco(sco) => {
            let len = checked_len(kind, sco.payload.len(), u8::MAX as usize)?;
            frame.extend_from_slice(&sco.header_word().to_le_bytes());
            frame.push(len as u8);
            frame.extend_from_slice(&sco.payload);
        }
        ControllerPacket::Event(event) => {
            let len = checked_len(kind, event.parameters.len(), u8::MAX as usize)?;
            frame.push(event.code.0);
            frame.push(len as u8);
            frame.extend_from_slice(&event.parameters);
        }
    }

    Ok(frame)
}

fn payload_len(packet: &ControllerPacket) -> usize {
    match packet {
        ControllerPacket::Command(c) => c.parameters.len(),
        ControllerPacket::Event(e) => e.parameters.len(),
        ControllerPacket::Acl(a) => a.payload.len(),
        ControllerPacket::Sco(s) => s.payload.len(),
    }
}

fn checked_len(kind: PacketKind, len: usize, max: usize) -> Result<usize, H4Error> {
    if len > max {
        return Err(H4Error::PayloadTooLarge { kind, len, max });
    }
    Ok(len)
}

fn read_payload<R: Read>(reader: &mut R, len: usize, context: &'static str) -> Result<Vec<u8>, H4Error> {
    let mut payload = vec![0u8; len];
    read_exact(reader, &mut payload, context)?;
    Ok(payload)
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], context: &'static str) -> Result<(), H4Error> {
    if fill(reader, buf)? < buf.len() {
        return Err(H4Error::Truncated { context });
    }
    Ok(())
}

/// Read until `buf` is full or the stream ends; returns the bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, H4Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(H4Error::Io(e)),
        }
    }
    Ok(filled)
}
