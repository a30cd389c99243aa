//! Serial connection core: one device session with a background read loop,
//! on-demand writes and a UI-facing connect/disconnect controller.

pub mod controller;
pub mod session;
pub mod sink;
pub mod transport;

pub use controller::{ConnectionController, Labels, StatusLabel};
pub use session::{SerialSession, SessionState};
pub use sink::{Decoded, LogSink, SinkError, TextDecoder, TextSink};
pub use transport::{
    BAUD_RATE, OpenOptions, Port, ReadChunk, StreamReader, StreamWriter, Transport,
    serial::{PortInfo, PortSelector, SerialTransport},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("device not found")]
    DeviceNotFound,
    #[error("transport unavailable")]
    TransportUnavailable(#[source] Box<Error>),
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("{0} is locked")]
    Locked(&'static str),
    #[error("received bytes are not valid utf-8")]
    ReadDecode(#[from] std::str::Utf8Error),
    #[error("consumer rejected chunk")]
    Sink(#[source] SinkError),
    #[error("teardown step `{step}` failed")]
    Teardown {
        step: &'static str,
        #[source]
        source: Box<Error>,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serial(#[from] serialport::Error),
    #[error(transparent)]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Renders an error and all of its sources on one line.
pub fn error_chain(err: &dyn std::error::Error) -> String {
    std::iter::successors(err.source(), |err| err.source())
        .fold(err.to_string(), |acc, err| format!("{acc}: {err}"))
}
