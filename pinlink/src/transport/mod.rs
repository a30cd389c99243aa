//! Platform side of a serial connection.
//!
//! A [`Transport`] hands out user-selected [`Port`]s. An open port exposes a
//! readable and a writable side; each side is guarded by a lock so at most one
//! [`StreamReader`] and one [`StreamWriter`] exist at a time. Dropping a reader
//! or writer releases its lock.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;

use crate::{Error, Result};

#[cfg(any(test, feature = "test-support"))]
pub mod fake;
pub mod serial;

pub const BAUD_RATE: u32 = 115_200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    pub baud_rate: u32,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ReadChunk {
    Data(Vec<u8>),
    /// End of stream. The port may still be readable afterwards.
    Done,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Picks a device. Fails with [`Error::DeviceNotFound`] when nothing is selected.
    async fn request_port(&self) -> Result<Box<dyn Port>>;
}

#[async_trait]
pub trait Port: Send + Sync {
    async fn open(&self, options: OpenOptions) -> Result<()>;

    /// `false` once the port is closed or its readable side failed.
    fn readable(&self) -> bool;

    fn reader(&self) -> Result<Box<dyn StreamReader>>;

    fn writer(&self) -> Result<Box<dyn StreamWriter>>;

    /// Closing an already closed port succeeds.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait StreamReader: Send {
    /// Must be cancel safe: dropping the future may lose at most the bytes of
    /// the read in flight.
    async fn read(&mut self) -> Result<ReadChunk>;
}

#[async_trait]
pub trait StreamWriter: Send {
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Flushes and releases the writer. Closing twice succeeds.
    async fn close(&mut self) -> Result<()>;
}

/// Held by a reader or writer for as long as it lives.
pub(crate) struct StreamLock {
    flag: Arc<AtomicBool>,
}

impl StreamLock {
    pub(crate) fn acquire(flag: &Arc<AtomicBool>, side: &'static str) -> Result<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            return Err(Error::Locked(side));
        }
        Ok(Self {
            flag: Arc::clone(flag),
        })
    }
}

impl Drop for StreamLock {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_use_fixed_baud_rate() {
        assert_eq!(OpenOptions::default().baud_rate, 115_200);
    }

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let flag = Arc::new(AtomicBool::new(false));

        let first = StreamLock::acquire(&flag, "reader").unwrap();
        assert!(matches!(
            StreamLock::acquire(&flag, "reader"),
            Err(Error::Locked("reader"))
        ));

        drop(first);
        assert!(StreamLock::acquire(&flag, "reader").is_ok());
    }
}
