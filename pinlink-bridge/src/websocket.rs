use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use pinlink::{ConnectionController, LogSink, SinkError, TextSink};
use tokio::sync::{broadcast, mpsc, watch};

use crate::protocol::{Command, Event};

/// Fans decoded device text out to every connected page.
pub struct PageSink {
    data: broadcast::Sender<String>,
}

impl PageSink {
    pub fn new(data: broadcast::Sender<String>) -> Self {
        Self { data }
    }
}

impl TextSink for PageSink {
    fn deliver(&self, text: &str) -> Result<(), SinkError> {
        LogSink.deliver(text)?;
        self.data.deliver(text)
    }
}

#[derive(Clone)]
pub struct AppState {
    controller: Arc<ConnectionController>,
    label: watch::Receiver<String>,
    data: broadcast::Sender<String>,
}

impl AppState {
    pub fn new(
        controller: Arc<ConnectionController>,
        label: watch::Receiver<String>,
        data: broadcast::Sender<String>,
    ) -> Self {
        Self {
            controller,
            label,
            data,
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sender, receiver) = socket.split();
    let (reply_tx, reply_rx) = mpsc::channel(16);

    tracing::info!("page connected");

    let sender_task = handle_sender(sender, state.label.clone(), state.data.subscribe(), reply_rx);
    let receiver_task = handle_receiver(receiver, Arc::clone(&state.controller), reply_tx);

    // whichever side finishes first ends the page session
    let result = tokio::select! {
        result = sender_task => result,
        result = receiver_task => result,
    };
    if let Err(err) = result {
        tracing::debug!("page session ended: {err}");
    }

    tracing::info!("page disconnected");
}

async fn handle_sender(
    mut sender: SplitSink<WebSocket, Message>,
    mut label: watch::Receiver<String>,
    mut data: broadcast::Receiver<String>,
    mut replies: mpsc::Receiver<Event>,
) -> anyhow::Result<()> {
    let text = label.borrow_and_update().clone();
    send_event(&mut sender, &Event::Label { text }).await?;

    loop {
        let event = tokio::select! {
            changed = label.changed() => {
                changed?;
                let text = label.borrow_and_update().clone();
                Event::Label { text }
            }
            received = data.recv() => match received {
                Ok(text) => Event::Data { text },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "page too slow, dropped chunks");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            reply = replies.recv() => match reply {
                Some(event) => event,
                None => break,
            },
        };

        send_event(&mut sender, &event).await?;
    }

    Ok(())
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &Event,
) -> anyhow::Result<()> {
    let bytes = event.encode()?;
    sender.send(Message::Binary(bytes.into())).await?;
    Ok(())
}

async fn handle_receiver(
    mut receiver: SplitStream<WebSocket>,
    controller: Arc<ConnectionController>,
    replies: mpsc::Sender<Event>,
) -> anyhow::Result<()> {
    loop {
        match receiver.next().await {
            Some(Ok(Message::Binary(bytes))) => {
                handle_message(&bytes, &controller, &replies).await?;
            }
            Some(Ok(Message::Close(_))) => break,
            Some(Err(_)) => break,
            None => break,
            _ => continue,
        }
    }
    Ok(())
}

async fn handle_message(
    bytes: &[u8],
    controller: &ConnectionController,
    replies: &mpsc::Sender<Event>,
) -> anyhow::Result<()> {
    let command = match Command::decode(bytes) {
        Ok(command) => command,
        Err(err) => {
            tracing::warn!("ignoring page message: {err}");
            return Ok(());
        }
    };

    match command {
        Command::Toggle => {
            let state = controller.toggle().await;
            tracing::debug!(?state, "toggled");
        }
        Command::Send { data } => {
            tracing::debug!(len = data.len(), "page send");
            if let Err(err) = controller.send(&data).await {
                tracing::warn!("send failed: {}", pinlink::error_chain(&err));
                replies
                    .send(Event::Error {
                        message: err.to_string(),
                    })
                    .await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use pinlink::{
        Labels, SessionState,
        transport::fake::{FakeDevice, FakeTransport},
    };

    use super::*;

    fn controller(device: &Arc<FakeDevice>) -> Arc<ConnectionController> {
        let (label, _) = watch::channel(String::new());
        let (data, _) = broadcast::channel(4);
        ConnectionController::new(
            FakeTransport::with(device),
            PageSink::new(data),
            label,
            Labels::default(),
        )
    }

    fn encode(command: &Command) -> Vec<u8> {
        rmp_serde::to_vec_named(command).unwrap()
    }

    #[tokio::test]
    async fn send_while_closed_replies_with_error() {
        let device = FakeDevice::new();
        let controller = controller(&device);
        let (replies, mut rx) = mpsc::channel(4);

        let send = encode(&Command::Send {
            data: "D13=1\n".to_owned(),
        });
        handle_message(&send, &controller, &replies).await.unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            Event::Error {
                message: "not connected".to_owned()
            }
        );
        assert!(device.written().is_empty());
    }

    #[tokio::test]
    async fn toggle_opens_then_send_writes() {
        let device = FakeDevice::new();
        let controller = controller(&device);
        let (replies, mut rx) = mpsc::channel(4);

        handle_message(&encode(&Command::Toggle), &controller, &replies)
            .await
            .unwrap();
        assert_eq!(controller.state(), SessionState::Open);

        let send = encode(&Command::Send {
            data: "D13=1\n".to_owned(),
        });
        handle_message(&send, &controller, &replies).await.unwrap();
        assert_eq!(device.written(), vec![b"D13=1\n".to_vec()]);
        assert!(rx.try_recv().is_err());

        handle_message(&encode(&Command::Toggle), &controller, &replies)
            .await
            .unwrap();
        assert_eq!(controller.state(), SessionState::Closed);
        assert_eq!(device.closes.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn unreadable_message_is_ignored() {
        let device = FakeDevice::new();
        let controller = controller(&device);
        let (replies, mut rx) = mpsc::channel(4);

        assert!(handle_message(b"\xc1", &controller, &replies).await.is_ok());
        assert!(handle_message(b"", &controller, &replies).await.is_ok());

        assert!(rx.try_recv().is_err());
        assert_eq!(controller.state(), SessionState::Closed);
        assert_eq!(device.readers_acquired.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn page_sink_broadcasts_to_subscribers() {
        let (data, mut rx) = broadcast::channel(4);
        let sink = PageSink::new(data);

        sink.deliver("A0=512\n").unwrap();
        assert_eq!(rx.recv().await.unwrap(), "A0=512\n");
    }
}
