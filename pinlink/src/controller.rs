use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, watch};

use crate::{
    Result, error_chain,
    session::{SerialSession, SessionState},
    sink::TextSink,
    transport::Transport,
};

/// The connect button's label, the only state a user sees.
pub trait StatusLabel: Send + Sync + 'static {
    fn set_text(&self, text: &str);
}

impl StatusLabel for watch::Sender<String> {
    fn set_text(&self, text: &str) {
        self.send_replace(text.to_owned());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    /// Shown while closed: the next action is to connect.
    pub connect: String,
    pub connecting: String,
    /// Shown while open: the next action is to disconnect.
    pub disconnect: String,
}

impl Default for Labels {
    fn default() -> Self {
        Self {
            connect: "Connect".to_owned(),
            connecting: "Connecting…".to_owned(),
            disconnect: "Disconnect".to_owned(),
        }
    }
}

impl Labels {
    fn for_state(&self, state: SessionState) -> &str {
        match state {
            SessionState::Closed => &self.connect,
            SessionState::Open => &self.disconnect,
        }
    }
}

/// Turns the single connect/disconnect toggle into session calls and keeps the
/// label in line with the session.
pub struct ConnectionController {
    session: SerialSession,
    label: StdMutex<Box<dyn StatusLabel>>,
    labels: Labels,
    toggling: Mutex<()>,
}

impl ConnectionController {
    /// Creates the controller with a closed session. Must be called inside a
    /// tokio runtime: a background task resets the label when the session
    /// closes on its own.
    pub fn new(
        transport: impl Transport + 'static,
        sink: impl TextSink,
        label: impl StatusLabel,
        labels: Labels,
    ) -> Arc<Self> {
        let session = SerialSession::new(transport, sink);
        label.set_text(&labels.connect);

        let controller = Arc::new(Self {
            session,
            label: StdMutex::new(Box::new(label)),
            labels,
            toggling: Mutex::new(()),
        });

        tokio::spawn(label_task(
            controller.session.subscribe(),
            Arc::downgrade(&controller),
        ));

        controller
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &SerialSession {
        &self.session
    }

    /// Connects when closed, disconnects when open. Connect failures are
    /// logged and leave the label on the connect text. Concurrent toggles run
    /// one after the other.
    pub async fn toggle(&self) -> SessionState {
        let _toggling = self.toggling.lock().await;

        match self.session.state() {
            SessionState::Closed => self.connect().await,
            SessionState::Open => self.disconnect().await,
        }

        self.sync_label();
        self.session.state()
    }

    pub async fn send(&self, data: &str) -> Result<()> {
        self.session.send(data).await
    }

    async fn connect(&self) {
        self.set_label(&self.labels.connecting);

        match self.session.connect().await {
            Ok(()) => tracing::info!("connected"),
            Err(err) => tracing::error!("connection failed: {}", error_chain(&err)),
        }
    }

    async fn disconnect(&self) {
        self.session.disconnect().await;
        tracing::info!("disconnected");
    }

    fn set_label(&self, text: &str) {
        if let Ok(label) = self.label.lock() {
            label.set_text(text);
        }
    }

    fn sync_label(&self) {
        // state is read under the label lock so the last writer always shows
        // the latest state
        if let Ok(label) = self.label.lock() {
            label.set_text(self.labels.for_state(self.session.state()));
        }
    }
}

async fn label_task(
    mut state: watch::Receiver<SessionState>,
    controller: std::sync::Weak<ConnectionController>,
) {
    while state.changed().await.is_ok() {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        if *state.borrow_and_update() == SessionState::Closed {
            controller.sync_label();
        }
    }
}
