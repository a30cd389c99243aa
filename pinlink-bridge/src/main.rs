use pinlink::{ConnectionController, Labels, SerialTransport};
use tokio::sync::{broadcast, watch};

use crate::{
    config::Config,
    server::Server,
    websocket::{AppState, PageSink},
};

mod config;
mod protocol;
mod server;
mod websocket;

const DATA_CAPACITY: usize = 256;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into())
            }),
        )
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S".to_owned(),
        ))
        .init();

    if let Err(err) = start().await {
        tracing::error!("{}", pinlink::error_chain(&*err));
    }
}

async fn start() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    tracing::info!(selector = ?config.selector, "serial device selection");

    let (label, label_rx) = watch::channel(String::new());
    let (data, _) = broadcast::channel(DATA_CAPACITY);

    let controller = ConnectionController::new(
        SerialTransport::new(config.selector),
        PageSink::new(data.clone()),
        label,
        Labels::default(),
    );

    let state = AppState::new(controller.clone(), label_rx, data);
    let server = Server::new(&config.bind_address, state).await?;
    let served = server.run().await;

    // release the port even when the server failed
    controller.session().disconnect().await;
    served
}
