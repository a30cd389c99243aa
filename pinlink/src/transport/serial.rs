//! [`Transport`] over the `serialport` crate.
//!
//! `serialport` is blocking, so every read and write runs on the blocking pool.
//! Reads use a short poll timeout and re-check readability between polls,
//! which bounds how long a cancelled or closed reader keeps its handle.

use std::{
    io::{Read, Write},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::Serialize;
use serialport::{SerialPort, SerialPortType};

use super::{OpenOptions, Port, ReadChunk, StreamLock, StreamReader, StreamWriter, Transport};
use crate::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const READ_BUFFER_SIZE: usize = 4 * 1024;

type Handle = Box<dyn SerialPort>;

/// Native stand-in for a device chooser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSelector {
    Named(String),
    Usb { vid: u16, pid: u16 },
    /// First USB serial device, otherwise the first device of any kind.
    FirstAvailable,
}

impl PortSelector {
    fn select(&self, ports: &[serialport::SerialPortInfo]) -> Option<String> {
        let found = match self {
            PortSelector::Named(name) => return Some(name.clone()),
            PortSelector::Usb { vid, pid } => ports.iter().find(|port| match &port.port_type {
                SerialPortType::UsbPort(usb) => usb.vid == *vid && usb.pid == *pid,
                _ => false,
            }),
            PortSelector::FirstAvailable => ports
                .iter()
                .find(|port| matches!(port.port_type, SerialPortType::UsbPort(_)))
                .or_else(|| ports.first()),
        };

        found.map(|port| port.port_name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortInfo {
    pub port_name: String,
    pub port_type: &'static str,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl From<serialport::SerialPortInfo> for PortInfo {
    fn from(port: serialport::SerialPortInfo) -> Self {
        let (port_type, manufacturer, product, vid, pid) = match port.port_type {
            SerialPortType::UsbPort(usb) => (
                "usb",
                usb.manufacturer,
                usb.product,
                Some(usb.vid),
                Some(usb.pid),
            ),
            SerialPortType::BluetoothPort => ("bluetooth", None, None, None, None),
            SerialPortType::PciPort => ("pci", None, None, None, None),
            SerialPortType::Unknown => ("unknown", None, None, None, None),
        };

        Self {
            port_name: port.port_name,
            port_type,
            manufacturer,
            product,
            vid,
            pid,
        }
    }
}

pub struct SerialTransport {
    selector: PortSelector,
}

impl SerialTransport {
    pub fn new(selector: PortSelector) -> Self {
        Self { selector }
    }

    pub fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(PortInfo::from).collect())
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn request_port(&self) -> Result<Box<dyn Port>> {
        let ports = match &self.selector {
            PortSelector::Named(_) => Vec::new(),
            _ => serialport::available_ports()?,
        };

        let port_name = self.selector.select(&ports).ok_or(Error::DeviceNotFound)?;
        tracing::debug!(port_name, "serial device selected");

        Ok(Box::new(SerialDevice::new(port_name)))
    }
}

pub struct SerialDevice {
    port_name: String,
    handle: Mutex<Option<Handle>>,
    readable: Arc<AtomicBool>,
    reader_lock: Arc<AtomicBool>,
    writer_lock: Arc<AtomicBool>,
}

impl SerialDevice {
    fn new(port_name: String) -> Self {
        Self {
            port_name,
            handle: Mutex::new(None),
            readable: Arc::new(AtomicBool::new(false)),
            reader_lock: Arc::new(AtomicBool::new(false)),
            writer_lock: Arc::new(AtomicBool::new(false)),
        }
    }

    fn handle(&self) -> Result<MutexGuard<'_, Option<Handle>>> {
        self.handle
            .lock()
            .map_err(|_| Error::Io(std::io::Error::other("serial handle poisoned")))
    }

    fn clone_handle(&self) -> Result<Arc<Mutex<Handle>>> {
        let handle = self.handle()?;
        let com = handle.as_ref().ok_or(Error::NotConnected)?.try_clone()?;
        Ok(Arc::new(Mutex::new(com)))
    }
}

#[async_trait]
impl Port for SerialDevice {
    async fn open(&self, options: OpenOptions) -> Result<()> {
        if self.handle()?.is_some() {
            return Err(Error::AlreadyConnected);
        }

        let port_name = self.port_name.clone();
        tracing::debug!(port_name, baud_rate = options.baud_rate, "opening serial port");
        let com = tokio::task::spawn_blocking(move || {
            serialport::new(&port_name, options.baud_rate)
                .timeout(POLL_INTERVAL)
                .open()
        })
        .await??;

        *self.handle()? = Some(com);
        self.readable.store(true, Ordering::Release);
        Ok(())
    }

    fn readable(&self) -> bool {
        self.readable.load(Ordering::Acquire)
    }

    fn reader(&self) -> Result<Box<dyn StreamReader>> {
        if !self.readable() {
            return Err(Error::NotConnected);
        }
        let lock = StreamLock::acquire(&self.reader_lock, "reader")?;
        let com = self.clone_handle()?;

        Ok(Box::new(SerialReader {
            com,
            readable: Arc::clone(&self.readable),
            _lock: lock,
        }))
    }

    fn writer(&self) -> Result<Box<dyn StreamWriter>> {
        let lock = StreamLock::acquire(&self.writer_lock, "writer")?;
        let com = self.clone_handle()?;

        Ok(Box::new(SerialWriter {
            com: Some(com),
            readable: Arc::clone(&self.readable),
            lock: Some(lock),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.readable.store(false, Ordering::Release);
        if self.handle()?.take().is_some() {
            tracing::debug!(port_name = self.port_name, "serial port closed");
        }
        Ok(())
    }
}

fn lock_com(com: &Mutex<Handle>) -> std::io::Result<MutexGuard<'_, Handle>> {
    com.lock()
        .map_err(|_| std::io::Error::other("serial handle poisoned"))
}

struct SerialReader {
    com: Arc<Mutex<Handle>>,
    readable: Arc<AtomicBool>,
    _lock: StreamLock,
}

#[async_trait]
impl StreamReader for SerialReader {
    async fn read(&mut self) -> Result<ReadChunk> {
        loop {
            if !self.readable.load(Ordering::Acquire) {
                return Ok(ReadChunk::Done);
            }

            let com = Arc::clone(&self.com);
            let attempt = tokio::task::spawn_blocking(move || -> std::io::Result<Option<Vec<u8>>> {
                let mut com = lock_com(&com)?;
                let mut buf = vec![0; READ_BUFFER_SIZE];
                match com.read(&mut buf) {
                    Ok(len) => {
                        buf.truncate(len);
                        Ok(Some(buf))
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await?;

            match attempt {
                Ok(None) => continue,
                Ok(Some(buf)) if buf.is_empty() => return Ok(ReadChunk::Done),
                Ok(Some(buf)) => return Ok(ReadChunk::Data(buf)),
                Err(err) => {
                    self.readable.store(false, Ordering::Release);
                    return Err(err.into());
                }
            }
        }
    }
}

struct SerialWriter {
    com: Option<Arc<Mutex<Handle>>>,
    readable: Arc<AtomicBool>,
    lock: Option<StreamLock>,
}

impl SerialWriter {
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Handle) -> std::io::Result<T> + Send + 'static,
    {
        let com = self.com.clone().ok_or(Error::NotConnected)?;
        let result = tokio::task::spawn_blocking(move || {
            let mut com = lock_com(&com)?;
            op(&mut *com)
        })
        .await?;

        result.map_err(|err| {
            if err.kind() != std::io::ErrorKind::TimedOut {
                self.readable.store(false, Ordering::Release);
            }
            err.into()
        })
    }
}

#[async_trait]
impl StreamWriter for SerialWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let data = data.to_vec();
        self.run(move |com| {
            com.write_all(&data)?;
            com.flush()
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        if self.com.is_none() {
            return Ok(());
        }
        let flushed = self.run(|com| com.flush()).await;
        self.com = None;
        self.lock = None;
        flushed
    }
}
