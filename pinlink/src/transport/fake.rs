//! Scriptable in-memory transport for tests. Built for this crate's own tests
//! and, with the `test-support` feature, for dependents.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{OpenOptions, Port, ReadChunk, StreamLock, StreamReader, StreamWriter, Transport};
use crate::{Error, Result};

pub enum FakeRead {
    Data(Vec<u8>),
    Done,
    /// Read error that leaves the port readable.
    Transient,
    /// Read error that makes the port unreadable.
    Fatal,
}

/// Shared state of one fake device. Tests keep an `Arc` to script reads and
/// inspect what the session did.
pub struct FakeDevice {
    feed: mpsc::UnboundedSender<FakeRead>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<FakeRead>>,
    pub fail_open: AtomicBool,
    pub fail_writer_close: AtomicBool,
    pub opened_with: Mutex<Option<OpenOptions>>,
    readable: AtomicBool,
    pub reader_lock: Arc<AtomicBool>,
    pub writer_lock: Arc<AtomicBool>,
    pub readers_acquired: AtomicUsize,
    pub writers_acquired: AtomicUsize,
    pub closes: AtomicUsize,
    pub writes: Mutex<Vec<Vec<u8>>>,
}

impl FakeDevice {
    pub fn new() -> Arc<Self> {
        let (feed, inbound) = mpsc::unbounded_channel();
        Arc::new(Self {
            feed,
            inbound: tokio::sync::Mutex::new(inbound),
            fail_open: AtomicBool::new(false),
            fail_writer_close: AtomicBool::new(false),
            opened_with: Mutex::new(None),
            readable: AtomicBool::new(false),
            reader_lock: Arc::new(AtomicBool::new(false)),
            writer_lock: Arc::new(AtomicBool::new(false)),
            readers_acquired: AtomicUsize::new(0),
            writers_acquired: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, read: FakeRead) {
        let _ = self.feed.send(read);
    }

    pub fn push_text(&self, text: &str) {
        self.push(FakeRead::Data(text.as_bytes().to_vec()));
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn reader_held(&self) -> bool {
        self.reader_lock.load(Ordering::Acquire)
    }

    pub fn writer_held(&self) -> bool {
        self.writer_lock.load(Ordering::Acquire)
    }
}

pub struct FakeTransport {
    device: Option<Arc<FakeDevice>>,
}

impl FakeTransport {
    pub fn with(device: &Arc<FakeDevice>) -> Self {
        Self {
            device: Some(Arc::clone(device)),
        }
    }

    /// Nothing gets picked in the chooser.
    pub fn empty() -> Self {
        Self { device: None }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn request_port(&self) -> Result<Box<dyn Port>> {
        let device = self.device.clone().ok_or(Error::DeviceNotFound)?;
        Ok(Box::new(FakePort { device }))
    }
}

struct FakePort {
    device: Arc<FakeDevice>,
}

#[async_trait]
impl Port for FakePort {
    async fn open(&self, options: OpenOptions) -> Result<()> {
        if self.device.fail_open.load(Ordering::Acquire) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "open rejected",
            )));
        }
        *self.device.opened_with.lock().unwrap() = Some(options);
        self.device.readable.store(true, Ordering::Release);
        Ok(())
    }

    fn readable(&self) -> bool {
        self.device.readable.load(Ordering::Acquire)
    }

    fn reader(&self) -> Result<Box<dyn StreamReader>> {
        let lock = StreamLock::acquire(&self.device.reader_lock, "reader")?;
        self.device.readers_acquired.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(FakeReader {
            device: Arc::clone(&self.device),
            _lock: lock,
        }))
    }

    fn writer(&self) -> Result<Box<dyn StreamWriter>> {
        let lock = StreamLock::acquire(&self.device.writer_lock, "writer")?;
        self.device.writers_acquired.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(FakeWriter {
            device: Arc::clone(&self.device),
            lock: Some(lock),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.device.readable.store(false, Ordering::Release);
        self.device.closes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

struct FakeReader {
    device: Arc<FakeDevice>,
    _lock: StreamLock,
}

#[async_trait]
impl StreamReader for FakeReader {
    async fn read(&mut self) -> Result<ReadChunk> {
        let next = self.device.inbound.lock().await.recv().await;
        match next {
            Some(FakeRead::Data(bytes)) => Ok(ReadChunk::Data(bytes)),
            Some(FakeRead::Done) => Ok(ReadChunk::Done),
            Some(FakeRead::Transient) => Err(Error::Io(std::io::Error::other("line noise"))),
            Some(FakeRead::Fatal) => {
                self.device.readable.store(false, Ordering::Release);
                Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "device unplugged",
                )))
            }
            None => std::future::pending().await,
        }
    }
}

struct FakeWriter {
    device: Arc<FakeDevice>,
    lock: Option<StreamLock>,
}

#[async_trait]
impl StreamWriter for FakeWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.lock.is_none() {
            return Err(Error::NotConnected);
        }
        self.device.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.lock = None;
        if self.device.fail_writer_close.load(Ordering::Acquire) {
            return Err(Error::Io(std::io::Error::other("flush failed")));
        }
        Ok(())
    }
}
