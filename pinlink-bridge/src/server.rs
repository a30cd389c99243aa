use anyhow::Context;
use axum::{Json, Router, http::StatusCode, routing::get};
use pinlink::{PortInfo, SerialTransport};
use tokio::net::TcpListener;

use crate::websocket::{AppState, ws_handler};

pub struct Server {
    listener: TcpListener,
    router: Router,
}

impl Server {
    pub async fn new(bind_addr: &str, state: AppState) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;

        let router = Router::new()
            .route("/ws", get(ws_handler))
            .route("/ports", get(list_ports))
            .with_state(state);

        tracing::info!(bind_addr, "server started");

        Ok(Self { listener, router })
    }

    /// Serves until ctrl-c.
    pub async fn run(self) -> anyhow::Result<()> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async {
                _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await?;
        Ok(())
    }
}

async fn list_ports() -> Result<Json<Vec<PortInfo>>, (StatusCode, String)> {
    tokio::task::spawn_blocking(SerialTransport::list_ports)
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?
        .map(Json)
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, pinlink::error_chain(&err)))
}
