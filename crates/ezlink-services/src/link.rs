//! Link manager: a single FIFO command queue in front of a message transport.
//!
//! The radio stack corrupts in-flight state when operations overlap, so
//! every outbound message, whatever its origin, goes through one queue
//! serviced by one worker task with a short settle pause between writes.
//!
//! Inbound traffic flows the other way: the transport holds a [`LinkSink`]
//! and pushes payloads and connection changes into it. The link owns a
//! single-slot message handler and the connect/disconnect observer lists.

use std::borrow::Cow;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};

/// The physical message channel to the board.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write one message. Fails with [`LinkError::NotConnected`] when down.
    async fn write(&self, message: &str) -> Result<(), LinkError>;

    fn is_connected(&self) -> bool;

    /// Hand the transport the sink it reports inbound traffic to.
    fn attach(&self, sink: LinkSink);
}

/// One inbound transport message, as the radio delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPayload {
    Bytes(Bytes),
    Text(String),
}

impl InboundPayload {
    /// Lossy UTF-8 view. Never fails.
    pub fn to_text(&self) -> Cow<'_, str> {
        match self {
            InboundPayload::Bytes(b) => String::from_utf8_lossy(b),
            InboundPayload::Text(t) => Cow::Borrowed(t),
        }
    }
}

impl From<&str> for InboundPayload {
    fn from(text: &str) -> Self {
        InboundPayload::Text(text.to_string())
    }
}

impl From<String> for InboundPayload {
    fn from(text: String) -> Self {
        InboundPayload::Text(text)
    }
}

impl From<Bytes> for InboundPayload {
    fn from(bytes: Bytes) -> Self {
        InboundPayload::Bytes(bytes)
    }
}

impl From<Vec<u8>> for InboundPayload {
    fn from(bytes: Vec<u8>) -> Self {
        InboundPayload::Bytes(Bytes::from(bytes))
    }
}

pub type MessageHandler = Arc<dyn Fn(InboundPayload) + Send + Sync>;
pub type LinkCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,
    #[error("transport write failed: {0}")]
    Write(String),
    #[error("command queue closed")]
    Closed,
}

struct Queued {
    message: String,
    reply: oneshot::Sender<Result<(), LinkError>>,
}

struct Shared {
    connected: watch::Sender<bool>,
    handler: Mutex<Option<MessageHandler>>,
    on_connected: Mutex<Vec<LinkCallback>>,
    on_disconnected: Mutex<Vec<LinkCallback>>,
}

// Callbacks never run while a lock is held, so a poisoned lock only means a
// panicking callback elsewhere. The data is still consistent.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn set_connected(&self, connected: bool) {
        let changed = self.connected.send_if_modified(|c| {
            let changed = *c != connected;
            *c = connected;
            changed
        });
        if !changed {
            return;
        }

        tracing::info!(connected, "link state changed");
        let observers = if connected {
            lock(&self.on_connected).clone()
        } else {
            lock(&self.on_disconnected).clone()
        };
        for cb in observers {
            cb();
        }
    }

    fn deliver(&self, payload: InboundPayload) {
        let handler = lock(&self.handler).clone();
        match handler {
            Some(handler) => handler(payload),
            None => tracing::debug!(message = %payload.to_text(), "no message handler, dropping"),
        }
    }
}

/// The transport's handle back into the link.
///
/// Holds the link weakly; once every [`Link`] clone is gone, deliveries
/// are dropped.
#[derive(Clone)]
pub struct LinkSink {
    shared: Weak<Shared>,
}

impl LinkSink {
    pub fn deliver(&self, payload: impl Into<InboundPayload>) {
        if let Some(shared) = self.shared.upgrade() {
            shared.deliver(payload.into());
        }
    }

    pub fn set_connected(&self, connected: bool) {
        if let Some(shared) = self.shared.upgrade() {
            shared.set_connected(connected);
        }
    }
}

/// Explicitly constructed link service. Clone to share.
#[derive(Clone)]
pub struct Link {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<Queued>,
}

impl Link {
    /// Attach to `transport` and spawn the queue worker. Must be called
    /// inside a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, command_settle: Duration) -> Self {
        let (connected, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            connected,
            handler: Mutex::new(None),
            on_connected: Mutex::new(Vec::new()),
            on_disconnected: Mutex::new(Vec::new()),
        });

        transport.attach(LinkSink {
            shared: Arc::downgrade(&shared),
        });
        shared.set_connected(transport.is_connected());

        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_queue(transport, rx, command_settle));

        Self { shared, queue }
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Watch the connected flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    /// Queue `message` and wait for the transport's verdict on it.
    pub async fn send(&self, message: impl Into<String>) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let (reply, verdict) = oneshot::channel();
        self.queue
            .send(Queued {
                message: message.into(),
                reply,
            })
            .map_err(|_| LinkError::Closed)?;
        verdict.await.map_err(|_| LinkError::Closed)?
    }

    /// Install the inbound message handler. Last registration wins.
    pub fn on_message(&self, handler: impl Fn(InboundPayload) + Send + Sync + 'static) {
        *lock(&self.shared.handler) = Some(Arc::new(handler));
    }

    pub fn clear_message_handler(&self) {
        *lock(&self.shared.handler) = None;
    }

    /// Observe connects. If the link is already up, `cb` runs immediately
    /// as well, so late subscribers never miss the current state.
    pub fn on_connected(&self, cb: impl Fn() + Send + Sync + 'static) {
        let cb: LinkCallback = Arc::new(cb);
        lock(&self.shared.on_connected).push(cb.clone());
        if self.is_connected() {
            cb();
        }
    }

    /// Observe disconnects. No replay.
    pub fn on_disconnected(&self, cb: impl Fn() + Send + Sync + 'static) {
        lock(&self.shared.on_disconnected).push(Arc::new(cb));
    }
}

async fn run_queue(
    transport: Arc<dyn Transport>,
    mut rx: mpsc::UnboundedReceiver<Queued>,
    settle: Duration,
) {
    while let Some(Queued { message, reply }) = rx.recv().await {
        let result = transport.write(&message).await;
        if let Err(e) = &result {
            tracing::debug!(error = %e, "queued write failed");
        }
        // Caller may have given up waiting.
        let _ = reply.send(result);
        tokio::time::sleep(settle).await;
    }
    tracing::debug!("link dropped, command queue exiting");
}
