//! Mock transport for testing
//!
//! A scriptable in-process [`DevToolsTransport`]: records every command the
//! client sends, answers through a pluggable responder (by default every
//! command succeeds with `{"param": 1}`), and lets tests push event frames
//! as if the browser had emitted them.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use uuid::Uuid;

use crate::timeout::Deadline;
use crate::transport::{DevToolsTransport, NotificationHandler, Received};

/// Produces the frames to queue in reaction to one sent command.
pub type Responder = Box<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

/// Scriptable mock [`DevToolsTransport`].
pub struct MockTransport {
    #[allow(dead_code)]
    id: String,
    connected: AtomicBool,
    connect_count: AtomicUsize,
    /// Scripted outcomes for upcoming `connect` calls; empty means succeed.
    connect_results: Mutex<VecDeque<bool>>,
    /// When false, `send` reports failure without recording.
    send_ok: AtomicBool,
    /// When the frame queue runs dry, report Disconnected (like a closed
    /// socket) instead of waiting for the deadline. On by default so a
    /// missing scripted response fails a test instead of stalling it.
    disconnect_when_drained: AtomicBool,
    frames: Mutex<VecDeque<String>>,
    sent: Mutex<Vec<Value>>,
    responder: Mutex<Option<Responder>>,
    notification: Mutex<Option<NotificationHandler>>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("connected", &self.is_connected())
            .field("buffered", &self.frames.lock().len())
            .field("sent", &self.sent.lock().len())
            .finish()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            connected: AtomicBool::new(false),
            connect_count: AtomicUsize::new(0),
            connect_results: Mutex::new(VecDeque::new()),
            send_ok: AtomicBool::new(true),
            disconnect_when_drained: AtomicBool::new(true),
            frames: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            notification: Mutex::new(None),
        }
    }

    /// Replace the default responder. The closure sees each parsed command
    /// and returns whole frames to queue in order.
    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock() = Some(responder);
    }

    /// Script outcomes for the next `connect` calls; once the script runs
    /// out, further connects succeed.
    pub fn script_connect_results(&self, results: impl IntoIterator<Item = bool>) {
        self.connect_results.lock().extend(results);
    }

    /// Make subsequent `send` calls fail.
    pub fn fail_sends(&self) {
        self.send_ok.store(false, Ordering::SeqCst);
    }

    /// When the queue runs dry, wait for the deadline instead of reporting
    /// Disconnected.
    pub fn wait_when_drained(&self) {
        self.disconnect_when_drained.store(false, Ordering::SeqCst);
    }

    /// Sever the connection as if the remote end closed it.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handler) = self.notification.lock().clone() {
            handler();
        }
    }

    /// Queue an inbound frame, as the browser would push an event.
    pub fn push_frame(&self, frame: impl Into<String>) {
        self.frames.lock().push_back(frame.into());
        if let Some(handler) = self.notification.lock().clone() {
            handler();
        }
    }

    /// Queue an event frame.
    pub fn push_event(&self, method: &str, params: Value, session_id: &str) {
        let mut event = json!({ "method": method, "params": params });
        if !session_id.is_empty() {
            event["sessionId"] = json!(session_id);
        }
        self.push_frame(event.to_string());
    }

    /// Queue a response frame.
    pub fn push_response(&self, id: i64, result: Value, session_id: &str) {
        let mut response = json!({ "id": id, "result": result });
        if !session_id.is_empty() {
            response["sessionId"] = json!(session_id);
        }
        self.push_frame(response.to_string());
    }

    /// Every command sent so far, parsed, in order.
    pub fn sent_commands(&self) -> Vec<Value> {
        self.sent.lock().clone()
    }

    /// Methods of every command sent so far, in order.
    pub fn sent_methods(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|command| command.get("method"))
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// The default reply: success with `{"param": 1}`, echoing the
    /// command's session id the way the browser does. Custom responders can
    /// call this for the commands they do not script.
    pub fn default_response(command: &Value) -> String {
        let id = command.get("id").and_then(Value::as_i64).unwrap_or(0);
        let mut response = json!({ "id": id, "result": { "param": 1 } });
        if let Some(session_id) = command.get("sessionId") {
            response["sessionId"] = session_id.clone();
        }
        response.to_string()
    }
}

#[async_trait]
impl DevToolsTransport for MockTransport {
    async fn connect(&self, _url: &str) -> bool {
        if self.is_connected() {
            return true;
        }
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        let outcome = self.connect_results.lock().pop_front().unwrap_or(true);
        if outcome {
            self.frames.lock().clear();
            self.connected.store(true, Ordering::SeqCst);
        }
        outcome
    }

    async fn send(&self, message: &str) -> bool {
        if !self.is_connected() || !self.send_ok.load(Ordering::SeqCst) {
            return false;
        }
        let Ok(command) = serde_json::from_str::<Value>(message) else {
            return false;
        };
        self.sent.lock().push(command.clone());

        let frames = match &*self.responder.lock() {
            Some(responder) => responder(&command),
            None => vec![Self::default_response(&command)],
        };
        for frame in frames {
            self.push_frame(frame);
        }
        true
    }

    async fn receive_next(&self, deadline: &Deadline) -> Received {
        loop {
            if let Some(frame) = self.frames.lock().pop_front() {
                return Received::Message(frame);
            }
            if !self.is_connected() || self.disconnect_when_drained.load(Ordering::SeqCst) {
                return Received::Disconnected;
            }
            if deadline.is_expired() {
                return Received::Timeout;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn has_next(&self) -> bool {
        !self.frames.lock().is_empty()
    }

    fn set_notification(&self, handler: Option<NotificationHandler>) {
        *self.notification.lock() = handler;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_responder_echoes_id_and_session() {
        let transport = MockTransport::new();
        assert!(transport.connect("http://url").await);
        assert!(
            transport
                .send("{\"id\":5,\"method\":\"m\",\"params\":{},\"sessionId\":\"S\"}")
                .await
        );

        let Received::Message(frame) = transport.receive_next(&Deadline::zero()).await else {
            panic!("expected a frame");
        };
        let response: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(response["id"], 5);
        assert_eq!(response["sessionId"], "S");
        assert_eq!(response["result"]["param"], 1);
    }

    #[tokio::test]
    async fn test_scripted_connect_results() {
        let transport = MockTransport::new();
        transport.script_connect_results([false, true]);
        assert!(!transport.connect("http://url").await);
        assert!(transport.connect("http://url").await);
        assert_eq!(transport.connect_count(), 2);
        // Connecting while connected is a no-op.
        assert!(transport.connect("http://url").await);
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_notification_fires_on_push() {
        let transport = MockTransport::new();
        let fired = std::sync::Arc::new(AtomicUsize::new(0));
        let fired_clone = std::sync::Arc::clone(&fired);
        transport.set_notification(Some(std::sync::Arc::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        })));

        transport.push_event("Page.loadEventFired", json!({}), "");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(transport.has_next());
    }
}
