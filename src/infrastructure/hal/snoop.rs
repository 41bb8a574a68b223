//! Packet capture
//!
//! Every packet crossing the controller link is handed to a
//! [`CaptureSink`] before anything else sees it. The sink is a passive
//! audit trail and never influences delivery.
//!
//! # btsnoop File Format
//!
//! ```text
//! File header (16 bytes):
//! [0-7]   : "btsnoop\0"
//! [8-11]  : Version (u32 BE, 1)
//! [12-15] : Datalink type (u32 BE, 1002 = H4)
//!
//! Record (24-byte header + data):
//! [0-3]   : Original length (u32 BE)
//! [4-7]   : Included length (u32 BE)
//! [8-11]  : Flags (u32 BE)
//!           bit 0: direction (0 sent, 1 received)
//!           bit 1: command / event (vs. data)
//! [12-15] : Cumulative drops (u32 BE, always 0)
//! [16-23] : Timestamp (i64 BE, microseconds since 0000-01-01)
//! [24-..] : H4 frame, type byte included
//! ```

use crate::domain::packets::{ControllerPacket, PacketKind};
use crate::infrastructure::hal::h4;
use crate::stack::lock;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{error, info};

const BTSNOOP_MAGIC: &[u8; 8] = b"btsnoop\0";
const BTSNOOP_VERSION: u32 = 1;
const BTSNOOP_DATALINK_H4: u32 = 1002;

/// Microseconds between 0000-01-01 and the Unix epoch.
const BTSNOOP_EPOCH_DELTA_US: i64 = 0x00dc_ddb3_0f2f_8000;

/// Which way a packet crossed the link, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// Passive observer of link traffic.
pub trait CaptureSink: Send + Sync {
    fn capture(&self, packet: &ControllerPacket, direction: Direction);
}

/// Writes captured packets to a btsnoop file.
pub struct BtSnoopLogger {
    writer: Option<Mutex<BufWriter<File>>>,
}

impl BtSnoopLogger {
    /// A logger that accepts packets and writes nothing.
    pub fn disabled() -> Self {
        Self { writer: None }
    }

    /// Create (or truncate) `path` and write the file header.
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(BTSNOOP_MAGIC)?;
        writer.write_all(&BTSNOOP_VERSION.to_be_bytes())?;
        writer.write_all(&BTSNOOP_DATALINK_H4.to_be_bytes())?;
        writer.flush()?;

        info!("btsnoop capture enabled at {}", path.display());
        Ok(Self {
            writer: Some(Mutex::new(writer)),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.writer.is_some()
    }
}

impl CaptureSink for BtSnoopLogger {
    fn capture(&self, packet: &ControllerPacket, direction: Direction) {
        let Some(writer) = &self.writer else {
            return;
        };
        let frame = match h4::encode(packet) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Cannot capture {} packet: {}", packet.kind(), e);
                return;
            }
        };

        let mut writer = lock(writer);
        if let Err(e) = write_record(&mut *writer, &frame, flags(packet.kind(), direction), timestamp_us()) {
            error!("Failed to write btsnoop record: {}", e);
        }
    }
}

fn flags(kind: PacketKind, direction: Direction) -> u32 {
    let received = u32::from(direction == Direction::Incoming);
    let control = u32::from(matches!(kind, PacketKind::Command | PacketKind::Event));
    received | (control << 1)
}

fn timestamp_us() -> i64 {
    let since_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0);
    BTSNOOP_EPOCH_DELTA_US + since_unix
}

fn write_record<W: Write>(writer: &mut W, frame: &[u8], flags: u32, timestamp: i64) -> std::io::Result<()> {
    let len = frame.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&flags.to_be_bytes())?;
    writer.write_all(&0u32.to_be_bytes())?;
    writer.write_all(&timestamp.to_be_bytes())?;
    writer.write_all(frame)?;
    writer.flush()
}

/// Keeps captured packets in memory.
#[derive(Default)]
pub struct MemoryCapture {
    records: Mutex<Vec<(Direction, ControllerPacket)>>,
}

impl MemoryCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything captured so far, oldest first.
    pub fn records(&self) -> Vec<(Direction, ControllerPacket)> {
        lock(&self.records).clone()
    }
}

impl CaptureSink for MemoryCapture {
    fn capture(&self, packet: &ControllerPacket, direction: Direction) {
        lock(&self.records).push((direction, packet.clone()));
    }
}
