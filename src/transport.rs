//! Message-oriented duplex transport to a DevTools endpoint
//!
//! The trait is the seam the client multiplexer sees: whole text frames in
//! order, a bounded blocking receive, and a notification hook that fires
//! when a frame arrives while nobody is waiting. The production
//! implementation runs the WebSocket reader as a background task feeding an
//! in-process frame queue; the reader never touches client state.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, warn};

use crate::timeout::Deadline;

/// Callback fired by the transport when a frame is buffered.
///
/// Runs on the transport's reader task. It must not call back into the
/// client; it only signals that a future drain pass has work to do.
pub type NotificationHandler = Arc<dyn Fn() + Send + Sync>;

/// Outcome of one bounded receive.
#[derive(Debug)]
pub enum Received {
    /// One complete text frame
    Message(String),
    /// The deadline expired with no frame buffered
    Timeout,
    /// The channel is gone; no further frames will arrive
    Disconnected,
}

/// A message-oriented duplex channel to a DevTools endpoint.
#[async_trait]
pub trait DevToolsTransport: Send + Sync + fmt::Debug {
    /// Open the channel. A second call while connected is a no-op returning
    /// `true`.
    async fn connect(&self, url: &str) -> bool;

    /// Enqueue one text frame. Fails when disconnected.
    async fn send(&self, message: &str) -> bool;

    /// Block up to `deadline` for the next frame. Buffered frames are
    /// returned even when the deadline is already expired, so a zero
    /// deadline drains without blocking.
    async fn receive_next(&self, deadline: &Deadline) -> Received;

    /// Non-blocking check for buffered inbound frames.
    fn has_next(&self) -> bool;

    /// Install or clear the arrival notification handler.
    fn set_notification(&self, handler: Option<NotificationHandler>);

    fn is_connected(&self) -> bool;
}

type WsSink =
    futures::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Shared between the transport handle and its reader task.
struct Shared {
    frames: Mutex<VecDeque<String>>,
    notify: Notify,
    connected: AtomicBool,
    notification: Mutex<Option<NotificationHandler>>,
    sink: tokio::sync::Mutex<Option<WsSink>>,
}

impl Shared {
    fn push_frame(&self, frame: String) {
        self.frames.lock().push_back(frame);
        self.notify.notify_waiters();
        let handler = self.notification.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
        let handler = self.notification.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

/// WebSocket-backed [`DevToolsTransport`].
pub struct WebSocketTransport {
    shared: Arc<Shared>,
}

impl fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("connected", &self.is_connected())
            .field("buffered", &self.shared.frames.lock().len())
            .finish()
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                frames: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                connected: AtomicBool::new(false),
                notification: Mutex::new(None),
                sink: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Reader loop for one connection. Exits on close or error, marking the
    /// transport disconnected so waiting receivers observe it.
    async fn reader_loop(
        shared: Arc<Shared>,
        mut stream: futures::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    ) {
        while let Some(result) = stream.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    shared.push_frame(text);
                }
                Ok(Message::Ping(data)) => {
                    let mut sink = shared.sink.lock().await;
                    if let Some(sink) = sink.as_mut() {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            warn!("Failed to send pong: {}", e);
                        }
                    }
                }
                Ok(Message::Close(_)) => {
                    debug!("WebSocket close frame received");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("WebSocket error: {}", e);
                    break;
                }
            }
        }
        shared.mark_disconnected();
        debug!("WebSocket reader task exited");
    }
}

#[async_trait]
impl DevToolsTransport for WebSocketTransport {
    async fn connect(&self, url: &str) -> bool {
        if self.is_connected() {
            return true;
        }

        debug!("Connecting to WebSocket: {}", url);
        let stream = match connect_async(url).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!("Failed to connect to {}: {}", url, e);
                return false;
            }
        };

        let (sink, stream) = stream.split();
        *self.shared.sink.lock().await = Some(sink);
        self.shared.frames.lock().clear();
        self.shared.connected.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(Self::reader_loop(shared, stream));

        debug!("WebSocket connection established");
        true
    }

    async fn send(&self, message: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut sink = self.shared.sink.lock().await;
        let Some(sink) = sink.as_mut() else {
            return false;
        };
        match sink.send(Message::Text(message.to_string())).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to send message: {}", e);
                self.shared.mark_disconnected();
                false
            }
        }
    }

    async fn receive_next(&self, deadline: &Deadline) -> Received {
        loop {
            if let Some(frame) = self.shared.frames.lock().pop_front() {
                return Received::Message(frame);
            }
            if !self.is_connected() {
                return Received::Disconnected;
            }
            if deadline.is_expired() {
                return Received::Timeout;
            }

            // Register before re-checking the queue so a frame pushed in
            // between cannot be missed.
            let notified = self.shared.notify.notified();
            if !self.shared.frames.lock().is_empty() || !self.is_connected() {
                continue;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline.instant()) => {}
            }
        }
    }

    fn has_next(&self) -> bool {
        !self.shared.frames.lock().is_empty()
    }

    fn set_notification(&self, handler: Option<NotificationHandler>) {
        *self.shared.notification.lock() = handler;
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}
