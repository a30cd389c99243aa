//! One device connection: port lifecycle, background read loop, writes.

use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{Mutex, watch},
    task::JoinHandle,
};

use crate::{
    Error, Result, error_chain,
    sink::{SinkError, TextDecoder, TextSink},
    transport::{OpenOptions, Port, ReadChunk, StreamWriter, Transport},
};

/// Pause between a released reader and the next acquisition, so a port that
/// keeps ending its stream does not spin the loop.
const REACQUIRE_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Open,
}

struct OpenSession {
    generation: u64,
    port: Arc<dyn Port>,
    writer: Option<Box<dyn StreamWriter>>,
    cancel: watch::Sender<bool>,
    read_task: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    open: Option<OpenSession>,
    generation: u64,
}

pub struct SerialSession {
    transport: Box<dyn Transport>,
    sink: Arc<dyn TextSink>,
    slot: Arc<Mutex<Slot>>,
    state: Arc<watch::Sender<SessionState>>,
}

impl SerialSession {
    pub fn new(transport: impl Transport + 'static, sink: impl TextSink) -> Self {
        let (state, _) = watch::channel(SessionState::Closed);
        Self {
            transport: Box::new(transport),
            sink: Arc::new(sink),
            slot: Arc::new(Mutex::new(Slot::default())),
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub async fn connect(&self) -> Result<()> {
        if self.slot.lock().await.open.is_some() {
            return Err(Error::AlreadyConnected);
        }

        let port: Arc<dyn Port> = self
            .transport
            .request_port()
            .await
            .map_err(|err| Error::TransportUnavailable(Box::new(err)))?
            .into();

        let options = OpenOptions::default();
        port.open(options)
            .await
            .map_err(|err| Error::TransportUnavailable(Box::new(err)))?;

        let mut slot = self.slot.lock().await;
        if slot.open.is_some() {
            drop(slot);
            log_teardown("close port", port.close().await);
            return Err(Error::AlreadyConnected);
        }

        slot.generation += 1;
        let generation = slot.generation;
        let (cancel, cancelled) = watch::channel(false);
        let read_task = tokio::spawn(run_reader(
            Arc::clone(&port),
            Arc::clone(&self.sink),
            cancelled,
            Arc::clone(&self.slot),
            Arc::clone(&self.state),
            generation,
        ));

        slot.open = Some(OpenSession {
            generation,
            port,
            writer: None,
            cancel,
            read_task,
        });
        self.state.send_replace(SessionState::Open);
        tracing::info!(baud_rate = options.baud_rate, "serial session open");
        Ok(())
    }

    /// Tears the session down. Never fails; each step's error is logged and the
    /// remaining steps still run. A no-op when already closed.
    pub async fn disconnect(&self) {
        let Some(open) = self.slot.lock().await.open.take() else {
            return;
        };

        teardown(open, true).await;
        self.state.send_replace(SessionState::Closed);
        tracing::info!("serial session closed");
    }

    pub async fn send(&self, data: &str) -> Result<()> {
        let mut slot = self.slot.lock().await;
        let open = slot.open.as_mut().ok_or(Error::NotConnected)?;

        let writer = match &mut open.writer {
            Some(writer) => writer,
            None => open.writer.insert(open.port.writer()?),
        };
        writer.write(data.as_bytes()).await?;

        tracing::debug!(len = data.len(), "sent");
        Ok(())
    }
}

async fn teardown(open: OpenSession, join: bool) {
    let OpenSession {
        generation,
        port,
        writer,
        cancel,
        read_task,
    } = open;
    tracing::debug!(generation, "tearing down serial session");

    // the loop may already be gone, in which case nobody is listening
    let _ = cancel.send(true);
    if join {
        if let Err(err) = read_task.await {
            log_teardown("join reader", Err(err.into()));
        }
    }

    if let Some(mut writer) = writer {
        log_teardown("close writer", writer.close().await);
    }

    log_teardown("close port", port.close().await);
}

fn log_teardown(step: &'static str, result: Result<()>) {
    if let Err(source) = result {
        let err = Error::Teardown {
            step,
            source: Box::new(source),
        };
        tracing::warn!("{}", error_chain(&err));
    }
}

async fn run_reader(
    port: Arc<dyn Port>,
    sink: Arc<dyn TextSink>,
    cancelled: watch::Receiver<bool>,
    slot: Arc<Mutex<Slot>>,
    state: Arc<watch::Sender<SessionState>>,
    generation: u64,
) {
    if !read_loop(port.as_ref(), sink.as_ref(), cancelled).await {
        return;
    }

    // port became unreadable on its own; close unless disconnect got here first
    let mut slot = slot.lock().await;
    match slot.open.take_if(|open| open.generation == generation) {
        Some(open) => {
            tracing::warn!(generation, "serial port no longer readable, closing session");
            teardown(open, false).await;
            state.send_replace(SessionState::Closed);
        }
        None => tracing::debug!(generation, "read loop ended"),
    }
}

/// Drains the port until it stops being readable or the session cancels.
/// Returns `true` when the loop ended because the port became unreadable.
async fn read_loop(
    port: &dyn Port,
    sink: &dyn TextSink,
    mut cancelled: watch::Receiver<bool>,
) -> bool {
    let mut decoder = TextDecoder::new();

    while port.readable() {
        let mut reader = match port.reader() {
            Ok(reader) => reader,
            Err(err) => {
                tracing::warn!("failed to acquire reader: {err}");
                break;
            }
        };

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancelled.changed() => {
                    tracing::debug!("read cancelled");
                    return false;
                }
                chunk = reader.read() => chunk,
            };

            match chunk {
                Ok(ReadChunk::Data(bytes)) => deliver(&mut decoder, sink, &bytes),
                Ok(ReadChunk::Done) => break,
                Err(err) => {
                    tracing::warn!("read failed: {err}");
                    break;
                }
            }
        }

        // releases the reader lock before the next acquisition
        drop(reader);
        tokio::select! {
            biased;
            _ = cancelled.changed() => return false,
            _ = tokio::time::sleep(REACQUIRE_DELAY) => {}
        }
    }

    true
}

fn deliver(decoder: &mut TextDecoder, sink: &dyn TextSink, bytes: &[u8]) {
    let decoded = decoder.decode(bytes);
    for err in &decoded.errors {
        tracing::warn!(len = bytes.len(), "skipping invalid bytes: {}", error_chain(err));
    }

    if decoded.text.is_empty() {
        return;
    }

    // a panicking sink counts as a failed delivery
    let result = catch_unwind(AssertUnwindSafe(|| sink.deliver(&decoded.text)))
        .unwrap_or_else(|payload| Err(panic_error(&*payload)));
    if let Err(err) = result {
        tracing::warn!("{}", error_chain(&Error::Sink(err)));
    }
}

fn panic_error(payload: &(dyn Any + Send)) -> SinkError {
    let message = payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause");
    format!("consumer panicked: {message}").into()
}
