//! H4 over a stream socket
//!
//! Connects to a controller (or a controller simulator such as root-canal)
//! over TCP or a local socket and frames traffic with [`h4`].
//!
//! The reader runs on its own OS thread so a silent controller never
//! stalls a module handler.

use crate::domain::packets::ControllerPacket;
use crate::error::HalError;
use crate::infrastructure::hal::h4::{self, H4Error};
use crate::infrastructure::hal::{HalBackend, PacketSink};
use crate::stack::lock;
use interprocess::local_socket::{traits::Stream as _, GenericFilePath, Stream as LocalStream, ToFsName};
use interprocess::TryClone;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

type Closer = Box<dyn Fn() + Send + Sync>;

pub struct H4SocketBackend {
    description: String,
    writer: Mutex<Box<dyn Write + Send>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    closer: Option<Closer>,
    reader_thread: Mutex<Option<JoinHandle<()>>>,
}

impl H4SocketBackend {
    /// Connect to `host:port` over TCP.
    pub fn connect_tcp(host: &str, port: u16) -> Result<Self, HalError> {
        let target = format!("{}:{}", host, port);
        let connect_err = |source| HalError::Connect {
            target: target.clone(),
            source,
        };

        let stream = TcpStream::connect((host, port)).map_err(connect_err)?;
        stream.set_nodelay(true).map_err(connect_err)?;
        let reader = stream.try_clone().map_err(connect_err)?;
        let shutdown_handle = stream.try_clone().map_err(connect_err)?;

        info!("Connected to controller at tcp://{}", target);
        Ok(Self {
            description: format!("tcp://{}", target),
            writer: Mutex::new(Box::new(stream)),
            reader: Mutex::new(Some(Box::new(reader))),
            closer: Some(Box::new(move || {
                let _ = shutdown_handle.shutdown(Shutdown::Both);
            })),
            reader_thread: Mutex::new(None),
        })
    }

    /// Connect to a local socket (a named pipe on Windows).
    pub fn connect_local(name: &str) -> Result<Self, HalError> {
        let connect_err = |source| HalError::Connect {
            target: name.to_string(),
            source,
        };

        let fs_name = name.to_fs_name::<GenericFilePath>().map_err(connect_err)?;
        let stream = LocalStream::connect(fs_name).map_err(connect_err)?;
        let reader = stream.try_clone().map_err(connect_err)?;

        info!("Connected to controller at local socket {}", name);
        Ok(Self {
            description: format!("local://{}", name),
            writer: Mutex::new(Box::new(stream)),
            reader: Mutex::new(Some(Box::new(reader))),
            closer: None,
            reader_thread: Mutex::new(None),
        })
    }
}

impl HalBackend for H4SocketBackend {
    fn open(&self, sink: PacketSink) -> Result<(), HalError> {
        let Some(reader) = lock(&self.reader).take() else {
            return Err(HalError::LinkDown);
        };
        let description = self.description.clone();
        let handle = std::thread::Builder::new()
            .name("hci_link_reader".to_string())
            .spawn(move || read_loop(reader, sink, description))
            .map_err(HalError::ReaderSpawn)?;
        *lock(&self.reader_thread) = Some(handle);
        Ok(())
    }

    fn send(&self, packet: &ControllerPacket) -> Result<(), HalError> {
        let mut writer = lock(&self.writer);
        h4::write_packet(&mut *writer, packet)?;
        Ok(())
    }

    fn close(&self) {
        let reader_thread = lock(&self.reader_thread).take();
        match &self.closer {
            Some(close) => {
                close();
                if let Some(handle) = reader_thread {
                    if handle.join().is_err() {
                        warn!("Link reader for {} panicked", self.description);
                    }
                }
            }
            // Local sockets cannot be shut down from another handle; the
            // reader exits when the peer goes away.
            None => debug!("Detaching link reader for {}", self.description),
        }
    }
}

fn read_loop(mut reader: Box<dyn Read + Send>, sink: PacketSink, description: String) {
    debug!("Link reader for {} running", description);
    loop {
        match h4::read_packet(&mut reader) {
            Ok(packet) => sink.deliver(packet),
            Err(H4Error::Closed) => {
                info!("Controller closed the link {}", description);
                sink.link_closed();
                break;
            }
            Err(e) => {
                error!("Link {} broke: {}", description, e);
                sink.link_failed(e.into());
                break;
            }
        }
    }
    debug!("Link reader for {} exiting", description);
}
