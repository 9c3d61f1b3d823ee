//! Shared message channel to the detection service.
//!
//! One connection serves every camera overlay in a session. Inbound
//! `boundingBoxes` messages are routed to the single listener registered for
//! their camera, object notices are broadcast to everyone, and outbound
//! commands are serialized onto the same connection.
//!
//! Reconnection is not attempted here; the connection state is published so
//! an outside supervisor (or the UI) can decide what to do.

use crate::model::{CameraId, FrameBatch};
use crate::protocol::{decode_inbound, Inbound, ObjectEvent, OutboundCommand};
use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Errors that can occur on the message channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel is not open (state: {0:?})")]
    NotOpen(ConnectionState),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

/// State of the connection to the detection service.
///
/// `Disconnected -> Connecting -> Open -> {Closing | Error} -> Disconnected`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Error => "error",
        }
    }
}

/// Outgoing half of a text connection.
pub type TextSink = Pin<Box<dyn Sink<String, Error = ChannelError> + Send>>;

/// Incoming half of a text connection.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, ChannelError>> + Send>>;

/// Establishes text connections to the detection service.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<(TextSink, TextStream), ChannelError>;
}

/// WebSocket connector, optionally presenting a bearer credential during the
/// handshake.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    bearer_token: Option<String>,
}

impl WebSocketConnector {
    pub fn new(bearer_token: Option<String>) -> Self {
        Self { bearer_token }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<(TextSink, TextStream), ChannelError> {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;
        use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
        use tokio_tungstenite::tungstenite::Message;

        let mut request = url
            .into_client_request()
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

        if let Some(ref token) = self.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (socket, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;

        let (write, read) = socket.split();

        let sink = write
            .sink_map_err(|e| ChannelError::Transport(e.to_string()))
            .with(|text: String| {
                futures::future::ready(Ok::<_, ChannelError>(Message::Text(text)))
            });

        let stream = read.filter_map(|message| {
            futures::future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => String::from_utf8(bytes).ok().map(Ok),
                Ok(_) => None,
                Err(e) => Some(Err(ChannelError::Transport(e.to_string()))),
            })
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}

/// Callback receiving the batches addressed to one camera.
pub type BatchCallback = Arc<dyn Fn(FrameBatch) + Send + Sync>;

struct Listener {
    id: u64,
    callback: BatchCallback,
}

/// Counters for the channel.
#[derive(Debug, Default, Clone)]
pub struct ChannelStats {
    pub messages_received: u64,
    pub batches_dispatched: u64,
    pub batches_unrouted: u64,
    pub object_events: u64,
    pub invalid_messages: u64,
    pub commands_sent: u64,
    pub connections_opened: u64,
}

struct Session {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct ChannelInner {
    connector: Arc<dyn Connector>,
    url: RwLock<String>,
    state_tx: watch::Sender<ConnectionState>,
    listeners: RwLock<HashMap<CameraId, Listener>>,
    next_listener_id: AtomicU64,
    object_tx: broadcast::Sender<ObjectEvent>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    session: Mutex<Option<Session>>,
    stats: RwLock<ChannelStats>,
}

impl ChannelInner {
    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = previous.as_str(), to = state.as_str(), "Channel state changed");
        }
    }

    fn handle_inbound(&self, text: &str) {
        self.stats.write().messages_received += 1;
        metrics::counter!("overlay.channel.messages").increment(1);

        match decode_inbound(text) {
            Ok(Inbound::Batch(batch)) => self.dispatch_batch(batch),
            Ok(Inbound::Object(event)) => {
                self.stats.write().object_events += 1;
                debug!(event = ?event, "Received object notice");
                // No receivers is fine
                let _ = self.object_tx.send(event);
            }
            Err(e) => {
                self.stats.write().invalid_messages += 1;
                metrics::counter!("overlay.channel.invalid_messages").increment(1);
                warn!(error = %e, "Dropping invalid message from detection service");
            }
        }
    }

    fn dispatch_batch(&self, batch: FrameBatch) {
        // Clone the callback out so listeners may unsubscribe while handling.
        let callback = self
            .listeners
            .read()
            .get(&batch.camera_id)
            .map(|listener| listener.callback.clone());

        match callback {
            Some(callback) => {
                self.stats.write().batches_dispatched += 1;
                callback(batch);
            }
            None => {
                self.stats.write().batches_unrouted += 1;
                trace!(
                    camera_id = %batch.camera_id,
                    frame_id = batch.frame_id,
                    "No listener for camera, dropping batch"
                );
            }
        }
    }

    fn remove_listener(&self, camera_id: &CameraId, id: u64) {
        let mut listeners = self.listeners.write();
        if listeners.get(camera_id).map(|l| l.id) == Some(id) {
            listeners.remove(camera_id);
            debug!(camera_id = %camera_id, "Camera listener removed");
        }
    }
}

/// Handle to the shared channel. Cloning yields another handle to the same
/// connection.
#[derive(Clone)]
pub struct MessageChannel {
    inner: Arc<ChannelInner>,
}

impl MessageChannel {
    /// Create a channel for `url`. No connection is made until
    /// [`connect`](Self::connect) is called.
    pub fn new(url: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (object_tx, _) = broadcast::channel(64);

        Self {
            inner: Arc::new(ChannelInner {
                connector,
                url: RwLock::new(url.into()),
                state_tx,
                listeners: RwLock::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                object_tx,
                outbound: Mutex::new(None),
                session: Mutex::new(None),
                stats: RwLock::new(ChannelStats::default()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Receiver observing every connection state change.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn url(&self) -> String {
        self.inner.url.read().clone()
    }

    pub fn stats(&self) -> ChannelStats {
        self.inner.stats.read().clone()
    }

    /// Start a connection session if none is running.
    pub fn connect(&self) {
        let mut session = self.inner.session.lock();
        if let Some(ref existing) = *session {
            if !existing.handle.is_finished() {
                debug!("Connection session already running");
                return;
            }
        }

        let token = CancellationToken::new();
        let url = self.url();
        let handle = tokio::spawn(run_session(self.inner.clone(), url, token.clone()));
        *session = Some(Session { token, handle });
    }

    /// Tear down the current connection, if any, and wait for it to finish.
    pub async fn close(&self) {
        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            session.token.cancel();
            if let Err(e) = session.handle.await {
                error!(error = %e, "Connection session task failed");
            }
        }
        *self.inner.outbound.lock() = None;
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Point the channel at a new endpoint, restarting from `Connecting`.
    pub async fn set_url(&self, url: impl Into<String>) {
        let url = url.into();
        info!(url = %url, "Replacing detection service endpoint");
        self.close().await;
        *self.inner.url.write() = url;
        self.connect();
    }

    /// Serialize and transmit a command.
    pub fn send(&self, command: &OutboundCommand) -> Result<(), ChannelError> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(ChannelError::NotOpen(state));
        }

        let text = command.to_json()?;
        let outbound = self.inner.outbound.lock();
        let sender = outbound.as_ref().ok_or(ChannelError::NotOpen(state))?;
        sender
            .send(text)
            .map_err(|_| ChannelError::Closed)?;

        self.inner.stats.write().commands_sent += 1;
        debug!(command = command.kind(), "Queued command for detection service");
        Ok(())
    }

    /// Register the listener for `camera_id`, replacing any previous one.
    ///
    /// The listener stays registered until the returned [`Subscription`] is
    /// dropped.
    pub fn subscribe<F>(&self, camera_id: CameraId, callback: F) -> Subscription
    where
        F: Fn(FrameBatch) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let replaced = self.inner.listeners.write().insert(
            camera_id.clone(),
            Listener {
                id,
                callback: Arc::new(callback),
            },
        );

        if replaced.is_some() {
            warn!(camera_id = %camera_id, "Replacing existing camera listener");
        } else {
            debug!(camera_id = %camera_id, "Camera listener registered");
        }

        Subscription {
            camera_id,
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Receiver for session-wide object notices.
    pub fn object_events(&self) -> broadcast::Receiver<ObjectEvent> {
        self.inner.object_tx.subscribe()
    }

    /// Feed one inbound text frame through decoding and dispatch.
    pub fn handle_inbound(&self, text: &str) {
        self.inner.handle_inbound(text);
    }

    pub fn has_listener(&self, camera_id: &CameraId) -> bool {
        self.inner.listeners.read().contains_key(camera_id)
    }
}

/// Keeps a camera listener registered; dropping it unsubscribes.
pub struct Subscription {
    camera_id: CameraId,
    id: u64,
    inner: Weak<ChannelInner>,
}

impl Subscription {
    pub fn camera_id(&self) -> &CameraId {
        &self.camera_id
    }

    /// Unsubscribe now.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove_listener(&self.camera_id, self.id);
        }
    }
}

/// Drive one connection from `Connecting` until it ends or is cancelled.
async fn run_session(inner: Arc<ChannelInner>, url: String, token: CancellationToken) {
    inner.set_state(ConnectionState::Connecting);
    info!(url = %url, "Connecting to detection service");

    let connected = tokio::select! {
        _ = token.cancelled() => {
            inner.set_state(ConnectionState::Disconnected);
            return;
        }
        result = inner.connector.connect(&url) => result,
    };

    let (mut sink, mut stream) = match connected {
        Ok(halves) => halves,
        Err(e) => {
            error!(url = %url, error = %e, "Failed to connect to detection service");
            inner.set_state(ConnectionState::Error);
            inner.set_state(ConnectionState::Disconnected);
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    *inner.outbound.lock() = Some(tx);
    inner.stats.write().connections_opened += 1;
    inner.set_state(ConnectionState::Open);
    info!(url = %url, "Connected to detection service");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                *inner.outbound.lock() = None;
                inner.set_state(ConnectionState::Closing);
                if let Err(e) = sink.close().await {
                    debug!(error = %e, "Error while closing connection");
                }
                break;
            }
            Some(text) = rx.recv() => {
                if let Err(e) = sink.send(text).await {
                    error!(error = %e, "Failed to write to detection service");
                    inner.set_state(ConnectionState::Error);
                    break;
                }
                metrics::counter!("overlay.channel.commands_sent").increment(1);
            }
            message = stream.next() => match message {
                Some(Ok(text)) => inner.handle_inbound(&text),
                Some(Err(e)) => {
                    warn!(error = %e, "Detection service connection failed");
                    inner.set_state(ConnectionState::Error);
                    break;
                }
                None => {
                    info!(url = %url, "Detection service closed the connection");
                    inner.set_state(ConnectionState::Closing);
                    break;
                }
            },
        }
    }

    *inner.outbound.lock() = None;
    inner.set_state(ConnectionState::Disconnected);
}

/// In-memory connector for tests.
#[cfg(test)]
pub(crate) mod memory {
    use super::*;
    use futures::channel::mpsc as fmpsc;

    /// Server side of one in-memory connection.
    pub struct MemoryServer {
        pub to_client: fmpsc::UnboundedSender<Result<String, ChannelError>>,
        pub from_client: fmpsc::UnboundedReceiver<String>,
    }

    #[derive(Default)]
    pub struct MemoryConnector {
        pub servers: Mutex<Vec<MemoryServer>>,
        pub urls: Mutex<Vec<String>>,
        pub refuse: bool,
    }

    impl MemoryConnector {
        pub fn refusing() -> Self {
            Self {
                refuse: true,
                ..Default::default()
            }
        }

        pub fn take_server(&self) -> Option<MemoryServer> {
            self.servers.lock().pop()
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self, url: &str) -> Result<(TextSink, TextStream), ChannelError> {
            self.urls.lock().push(url.to_string());
            if self.refuse {
                return Err(ChannelError::ConnectionFailed("refused".to_string()));
            }

            let (client_tx, from_client) = fmpsc::unbounded::<String>();
            let (to_client, client_rx) = fmpsc::unbounded::<Result<String, ChannelError>>();
            self.servers.lock().push(MemoryServer {
                to_client,
                from_client,
            });

            let sink = client_tx.sink_map_err(|e| ChannelError::Transport(e.to_string()));
            Ok((Box::pin(sink), Box::pin(client_rx)))
        }
    }
}
