//! DevTools session nodes and the re-entrant message pump
//!
//! A [`DevToolsClient`] is one logical CDP session. The root owns the
//! transport and the command counter; attached children share both and are
//! addressed by the browser-assigned `sessionId`. The tree is flat: one
//! root, any number of leaves.
//!
//! Command callers block inside the pump until their response arrives.
//! While they wait, every received frame is parsed, routed to its session,
//! and delivered to that session's listeners, which may themselves send
//! commands: the pump re-enters on the same task and the per-message
//! notification queues keep each listener seeing each message exactly once
//! in arrival order.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::listener::{DevToolsEventListener, WebViewOwner};
use crate::message::{
    self, InspectorCommandResponse, InspectorEvent, InspectorMessage,
};
use crate::timeout::Deadline;
use crate::transport::{DevToolsTransport, Received};

/// Id of the browser-wide client. The browser session and service workers
/// skip per-connection setup.
pub const BROWSERWIDE_CLIENT_ID: &str = "browser";

/// Preserves canonical globals before page scripts can shadow them; later
/// automation relies on these copies.
const SETUP_SCRIPT: &str = "(function(){window.cdc_adoQpoasnfa76pfcZLmcfl_Array=window.Array; \
     window.cdc_adoQpoasnfa76pfcZLmcfl_Promise=window.Promise; \
     window.cdc_adoQpoasnfa76pfcZLmcfl_Symbol=window.Symbol;})();";

/// Hook invoked on first connect failure so the embedder can close an
/// inspector frontend holding the debugger before the retry.
pub type FrontendCloser = Arc<dyn Fn() -> Result<()> + Send + Sync>;

/// Response-slot lifecycle. `Waiting -> Received` on the matching
/// response; `Waiting -> Blocked` when dialog detection finds the command
/// stalled; `Blocked -> Ignored` once the caller translated the block into
/// an error and stopped caring about the eventual response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseState {
    Waiting,
    Blocked,
    Ignored,
    Received,
}

/// One in-flight command. Shared between the waiting caller and the
/// delivery site, which both observe the state transition.
#[derive(Debug)]
struct ResponseSlot {
    state: ResponseState,
    method: String,
    response: Option<InspectorCommandResponse>,
    command_timeout: Option<Duration>,
}

type SharedSlot = Arc<Mutex<ResponseSlot>>;

/// The event currently being delivered to a node's listeners.
struct EventNotification {
    method: String,
    params: Value,
}

/// A command success currently being delivered to a node's listeners.
struct CommandNotification {
    method: String,
    result: Value,
    command_timeout: Option<Duration>,
}

/// Scoped pump-depth counter; `connect_if_necessary` refuses to run while
/// any pump frame is live on the node.
struct StackGuard {
    counter: Arc<AtomicUsize>,
}

impl StackGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

fn noop_frontend_closer() -> FrontendCloser {
    Arc::new(|| Ok(()))
}

/// One CDP session multiplexed on a shared WebSocket connection.
pub struct DevToolsClient {
    id: String,
    session_id: String,
    url: String,
    config: Config,
    transport: Option<Arc<dyn DevToolsTransport>>,
    parent: Mutex<Weak<DevToolsClient>>,
    children: Mutex<HashMap<String, Arc<DevToolsClient>>>,
    owner: Mutex<Option<Weak<dyn WebViewOwner>>>,
    listeners: Mutex<Vec<Arc<dyn DevToolsEventListener>>>,
    pending: Mutex<HashMap<i32, SharedSlot>>,
    next_id: AtomicI32,
    crashed: AtomicBool,
    detached: AtomicBool,
    is_remote_end_configured: AtomicBool,
    is_main_page: AtomicBool,
    stack_count: Arc<AtomicUsize>,
    frontend_closer: Mutex<FrontendCloser>,
    unnotified_connect_listeners: Mutex<VecDeque<Arc<dyn DevToolsEventListener>>>,
    unnotified_event_listeners: Mutex<VecDeque<Arc<dyn DevToolsEventListener>>>,
    unnotified_event: Mutex<Option<Arc<EventNotification>>>,
    unnotified_cmd_response_listeners: Mutex<VecDeque<Arc<dyn DevToolsEventListener>>>,
    unnotified_cmd_response: Mutex<Option<Arc<CommandNotification>>>,
}

impl DevToolsClient {
    /// Create a root client owning `transport`. The connection is not
    /// opened until [`connect_if_necessary`](Self::connect_if_necessary).
    pub fn with_transport(
        id: impl Into<String>,
        session_id: impl Into<String>,
        url: impl Into<String>,
        transport: Arc<dyn DevToolsTransport>,
    ) -> Arc<Self> {
        Self::with_transport_and_config(id, session_id, url, transport, Config::default())
    }

    /// Create a root client with explicit tunables.
    pub fn with_transport_and_config(
        id: impl Into<String>,
        session_id: impl Into<String>,
        url: impl Into<String>,
        transport: Arc<dyn DevToolsTransport>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self::bare(
            id.into(),
            session_id.into(),
            url.into(),
            Some(transport),
            config,
        ))
    }

    /// Create a detached child client; it becomes usable after
    /// [`attach`](Self::attach) links it under a connected root.
    pub fn new(id: impl Into<String>, session_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::bare(
            id.into(),
            session_id.into(),
            String::new(),
            None,
            Config::default(),
        ))
    }

    fn bare(
        id: String,
        session_id: String,
        url: String,
        transport: Option<Arc<dyn DevToolsTransport>>,
        config: Config,
    ) -> Self {
        Self {
            id,
            session_id,
            url,
            config,
            transport,
            parent: Mutex::new(Weak::<DevToolsClient>::new()),
            children: Mutex::new(HashMap::new()),
            owner: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicI32::new(1),
            crashed: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            is_remote_end_configured: AtomicBool::new(false),
            is_main_page: AtomicBool::new(false),
            stack_count: Arc::new(AtomicUsize::new(0)),
            frontend_closer: Mutex::new(noop_frontend_closer()),
            unnotified_connect_listeners: Mutex::new(VecDeque::new()),
            unnotified_event_listeners: Mutex::new(VecDeque::new()),
            unnotified_event: Mutex::new(None),
            unnotified_cmd_response_listeners: Mutex::new(VecDeque::new()),
            unnotified_cmd_response: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn was_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// A client with neither a transport nor a parent cannot do anything
    /// yet; it is waiting to be attached.
    pub fn is_null(&self) -> bool {
        self.transport.is_none() && self.parent.lock().upgrade().is_none()
    }

    pub fn is_connected(&self) -> bool {
        if let Some(parent) = self.parent.lock().upgrade() {
            return parent.is_connected();
        }
        self.transport
            .as_ref()
            .map(|transport| transport.is_connected())
            .unwrap_or(false)
    }

    pub fn is_main_page(&self) -> bool {
        self.is_main_page.load(Ordering::SeqCst)
    }

    pub fn set_main_page(&self, value: bool) {
        self.is_main_page.store(value, Ordering::SeqCst);
    }

    /// Next command id the root would allocate; does not advance it.
    pub fn next_message_id(&self) -> i32 {
        if let Some(parent) = self.parent.lock().upgrade() {
            return parent.next_message_id();
        }
        self.next_id.load(Ordering::SeqCst)
    }

    fn advance_next_message_id(&self) -> i32 {
        if let Some(parent) = self.parent.lock().upgrade() {
            return parent.advance_next_message_id();
        }
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn parent_client(&self) -> Option<Arc<DevToolsClient>> {
        self.parent.lock().upgrade()
    }

    pub fn root_client(self: &Arc<Self>) -> Arc<DevToolsClient> {
        match self.parent.lock().upgrade() {
            Some(parent) => parent,
            None => Arc::clone(self),
        }
    }

    pub fn owner(&self) -> Option<Arc<dyn WebViewOwner>> {
        self.owner.lock().as_ref().and_then(Weak::upgrade)
    }

    pub fn set_owner(&self, owner: &Arc<dyn WebViewOwner>) {
        *self.owner.lock() = Some(Arc::downgrade(owner));
    }

    pub fn set_frontend_closer(&self, closer: FrontendCloser) {
        *self.frontend_closer.lock() = closer;
    }

    /// Mark this session as detached from its target; subsequent pumping
    /// on it fails with [`Error::TargetDetached`].
    pub fn set_detached(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }

    /// Register a listener. Connection listeners must be registered while
    /// disconnected, otherwise their connect notification never comes.
    pub fn add_listener(&self, listener: Arc<dyn DevToolsEventListener>) {
        if self.is_connected() && listener.listens_to_connections() {
            warn!(
                id = %self.id,
                "subscribing a connection listener to an already connected \
                 DevToolsClient; the connection notification will not arrive"
            );
        }
        self.listeners.lock().push(listener);
    }

    /// Insert this client as a child of `parent`, which must be a root.
    /// If the parent is already connected the child is reset and taken
    /// through per-session setup immediately.
    pub async fn attach(self: &Arc<Self>, parent: &Arc<DevToolsClient>) -> Result<()> {
        if !self.is_null() {
            return Err(Error::unknown(
                "attaching a non-null DevToolsClient to a new parent is prohibited",
            ));
        }
        // The hierarchy is flat: children hang off the root only.
        if parent.parent_client().is_some() {
            return Err(Error::unknown(
                "a DevToolsClient can be attached only to the root client",
            ));
        }

        if parent.is_connected() {
            self.reset_listeners();
            *self.parent.lock() = Arc::downgrade(parent);
            parent
                .children
                .lock()
                .insert(self.session_id.clone(), Arc::clone(self));
            self.on_connected().await?;
        } else {
            *self.parent.lock() = Arc::downgrade(parent);
            parent
                .children
                .lock()
                .insert(self.session_id.clone(), Arc::clone(self));
        }
        Ok(())
    }

    /// Unlink this client from its root. In-flight responses for the
    /// session are swallowed by the root afterwards (see
    /// `process_command_response`).
    pub fn detach_from_parent(&self) {
        let parent = self.parent.lock().upgrade();
        if let Some(parent) = parent {
            parent.children.lock().remove(&self.session_id);
        }
        *self.parent.lock() = Weak::<DevToolsClient>::new();
    }

    /// Open the connection if it is not already open. On the first connect
    /// failure the frontend closer runs, then the connect is retried.
    /// Fails when called from inside a listener callback.
    pub fn connect_if_necessary(self: &Arc<Self>) -> BoxFuture<'_, Result<()>> {
        async move {
            if self.stack_count.load(Ordering::SeqCst) > 0 {
                return Err(Error::unknown("cannot connect when nested"));
            }
            if self.is_null() {
                return Err(Error::unknown("cannot connect without a socket"));
            }

            if let Some(parent) = self.parent_client() {
                return parent.connect_if_necessary().await;
            }

            let Some(transport) = self.transport() else {
                return Err(Error::unknown("cannot connect without a socket"));
            };
            if transport.is_connected() {
                return Ok(());
            }

            self.reset_listeners();

            if !transport.connect(&self.url).await {
                // Close a devtools frontend that may hold the debugger,
                // then reconnect.
                let closer = self.frontend_closer.lock().clone();
                closer()?;
                let mut connected = false;
                for _ in 0..self.config.connect_retries {
                    if transport.connect(&self.url).await {
                        connected = true;
                        break;
                    }
                }
                if !connected {
                    return Err(Error::disconnected("unable to connect to renderer"));
                }
            }

            self.on_connected().await
        }
        .boxed()
    }

    fn transport(&self) -> Option<Arc<dyn DevToolsTransport>> {
        self.transport.as_ref().map(Arc::clone)
    }

    /// Forget per-connection state ahead of a (re)connect: the remote end
    /// must be reconfigured, connect listeners queue up again, and stale
    /// slots die.
    fn reset_listeners(&self) {
        self.is_remote_end_configured.store(false, Ordering::SeqCst);

        let connect_queue: VecDeque<_> = self
            .listeners
            .lock()
            .iter()
            .filter(|listener| listener.listens_to_connections())
            .cloned()
            .collect();
        *self.unnotified_connect_listeners.lock() = connect_queue;
        self.unnotified_event_listeners.lock().clear();
        *self.unnotified_event.lock() = None;
        self.pending.lock().clear();

        for child in self.children.lock().values() {
            child.reset_listeners();
        }
    }

    /// Post-connect setup: configure the remote end, notify connect
    /// listeners (now, so their errors surface here and they can send
    /// commands before other clients), then bring up the children.
    fn on_connected(self: &Arc<Self>) -> BoxFuture<'_, Result<()>> {
        async move {
            if !self.is_connected() {
                return Err(Error::unknown(
                    "the remote end can be configured only if the connection is established",
                ));
            }

            self.setup_devtools().await?;
            self.ensure_listeners_notified_of_connect().await?;

            let children: Vec<_> = self.children.lock().values().cloned().collect();
            for child in children {
                child.on_connected().await?;
            }
            Ok(())
        }
        .boxed()
    }

    async fn setup_devtools(self: &Arc<Self>) -> Result<()> {
        if self.is_remote_end_configured.load(Ordering::SeqCst) {
            return Ok(());
        }

        let is_service_worker = self
            .owner()
            .map(|owner| owner.is_service_worker())
            .unwrap_or(false);
        if self.id != BROWSERWIDE_CLIENT_ID && !is_service_worker {
            self.send_command_and_ignore_response(
                "Page.addScriptToEvaluateOnNewDocument",
                json!({ "source": SETUP_SCRIPT }),
            )
            .await?;
            self.send_command_and_ignore_response(
                "Runtime.evaluate",
                json!({ "expression": SETUP_SCRIPT }),
            )
            .await?;
        }

        self.is_remote_end_configured.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Send a command and wait for its response, discarding the result.
    pub async fn send_command(self: &Arc<Self>, method: &str, params: Value) -> Result<()> {
        self.send_command_internal(method, params, true, true, None, None)
            .await
            .map(|_| ())
    }

    /// Send a command and wait up to `timeout` for its response.
    pub async fn send_command_with_timeout(
        self: &Arc<Self>,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<()> {
        self.send_command_internal(method, params, true, true, None, Some(timeout))
            .await
            .map(|_| ())
    }

    /// Send a command and return its result object.
    pub async fn send_command_and_get_result(
        self: &Arc<Self>,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let result = self
            .send_command_internal(method, params, true, true, None, None)
            .await?;
        if !result.is_object() {
            return Err(Error::unknown("inspector response missing result"));
        }
        Ok(result)
    }

    /// Send a command and return its result object, bounded by `timeout`.
    pub async fn send_command_and_get_result_with_timeout(
        self: &Arc<Self>,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let result = self
            .send_command_internal(method, params, true, true, None, Some(timeout))
            .await?;
        if !result.is_object() {
            return Err(Error::unknown("inspector response missing result"));
        }
        Ok(result)
    }

    /// Fire a command without a response slot; whatever comes back for it
    /// later is an unexpected response.
    pub async fn send_command_async(self: &Arc<Self>, method: &str, params: Value) -> Result<()> {
        self.send_command_internal(method, params, false, false, None, None)
            .await
            .map(|_| ())
    }

    /// Fire a command and allocate a slot so the response is consumed on
    /// arrival, but return without waiting.
    pub async fn send_command_and_ignore_response(
        self: &Arc<Self>,
        method: &str,
        params: Value,
    ) -> Result<()> {
        self.send_command_internal(method, params, true, false, None, None)
            .await
            .map(|_| ())
    }

    /// Fire a command carrying an externally allocated id (the WebSocket
    /// command surface manages its own correlation). No slot, no wait.
    pub async fn send_command_from_websocket(
        self: &Arc<Self>,
        method: &str,
        params: Value,
        client_command_id: i32,
    ) -> Result<()> {
        self.send_command_internal(method, params, false, false, Some(client_command_id), None)
            .await
            .map(|_| ())
    }

    /// Tunnel a BiDi command to the mapper through `Runtime.evaluate`.
    /// The command's user-space id is rewritten onto the first user
    /// channel; the codec restores it on the way back.
    pub async fn post_bidi_command(self: &Arc<Self>, command: Value) -> Result<()> {
        self.post_bidi_command_internal(message::RESERVED_CHANNEL_COUNT, command)
            .await
    }

    async fn post_bidi_command_internal(
        self: &Arc<Self>,
        bidi_channel: i64,
        mut command: Value,
    ) -> Result<()> {
        let Some(cmd_id) = command.get("id").and_then(Value::as_i64) else {
            return Err(Error::invalid_argument("BiDi command id not found"));
        };
        if !(0..message::MAX_CHANNEL_COUNT).contains(&bidi_channel) {
            return Err(Error::unknown("BiDi channel id is out of range"));
        }
        command["id"] = json!(cmd_id * message::MAX_CHANNEL_COUNT + bidi_channel);

        let serialized = serde_json::to_string(&command)?;
        // Double-encoded: the expression carries the message as a JSON
        // string literal.
        let argument = serde_json::to_string(&serialized)?;
        let expression = format!("onBidiMessage({})", argument);

        self.send_command_and_ignore_response("Runtime.evaluate", json!({ "expression": expression }))
            .await
    }

    async fn send_command_internal(
        self: &Arc<Self>,
        method: &str,
        params: Value,
        expect_response: bool,
        wait_for_response: bool,
        external_id: Option<i32>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let root = self.root_client();
        let Some(transport) = root.transport() else {
            return Err(Error::unknown("cannot send without a socket"));
        };
        if !transport.is_connected() {
            return Err(Error::disconnected("not connected to DevTools"));
        }

        let command_id = external_id.unwrap_or_else(|| self.advance_next_message_id());
        let command = message::build_command(command_id, method, params, &self.session_id);
        let frame = message::serialize_command(&command)?;

        debug!(
            "DevTools WebSocket Command: {} (id={}) (session_id={}) {} {}",
            method, command_id, self.session_id, self.id, command["params"]
        );

        if !transport.send(&frame).await {
            return Err(Error::disconnected("unable to send message to renderer"));
        }

        if !expect_response {
            return Ok(json!({}));
        }

        let slot: SharedSlot = Arc::new(Mutex::new(ResponseSlot {
            state: ResponseState::Waiting,
            method: method.to_string(),
            response: None,
            command_timeout: timeout,
        }));
        self.pending.lock().insert(command_id, Arc::clone(&slot));

        if !wait_for_response {
            return Ok(json!({}));
        }

        let deadline =
            Deadline::new(timeout.unwrap_or_else(|| root.config.default_command_timeout()));
        while slot.lock().state == ResponseState::Waiting {
            if let Err(err) = self
                .process_next_message(Some(command_id), true, deadline, self)
                .await
            {
                if slot.lock().state == ResponseState::Received {
                    // The response arrived anyway; the error is stale.
                    self.pending.lock().remove(&command_id);
                }
                return Err(err);
            }
        }

        if slot.lock().state == ResponseState::Blocked {
            slot.lock().state = ResponseState::Ignored;
            let alert_text = self
                .owner()
                .and_then(|owner| owner.dialog_message().ok());
            return Err(Error::UnexpectedAlertOpen { alert_text });
        }

        let response = {
            let mut slot = slot.lock();
            debug_assert_eq!(slot.state, ResponseState::Received);
            slot.response.take()
        };
        let Some(response) = response else {
            return Err(Error::unknown("command response is missing"));
        };
        match response.result {
            Some(result) => Ok(result),
            None => Err(message::parse_inspector_error(&response.error)),
        }
    }

    /// Drain everything the transport has buffered, without blocking.
    pub async fn handle_received_events(self: &Arc<Self>) -> Result<()> {
        self.handle_events_until(|| Ok(true), Deadline::zero()).await
    }

    /// Pump messages until `predicate` reports done and the transport has
    /// no more buffered frames, or `deadline` expires. The predicate is
    /// re-polled at least every poll interval even when nothing arrives,
    /// because another client on the same connection may be the one
    /// advancing the condition.
    pub async fn handle_events_until<F>(
        self: &Arc<Self>,
        mut predicate: F,
        deadline: Deadline,
    ) -> Result<()>
    where
        F: FnMut() -> Result<bool>,
    {
        let root = self.root_client();
        let Some(transport) = root.transport() else {
            return Err(Error::unknown("cannot pump without a socket"));
        };
        if !transport.is_connected() {
            return Err(Error::disconnected("not connected to DevTools"));
        }

        loop {
            if !transport.has_next() && predicate()? {
                return Ok(());
            }

            let interval = Deadline::bounded(root.config.poll_interval(), &deadline);
            match self.process_next_message(None, false, interval, self).await {
                Ok(()) => {}
                Err(Error::Timeout(_)) => {
                    if deadline.is_expired() {
                        let err = format!(
                            "Timed out receiving message from renderer: {:.3}",
                            deadline.duration().as_secs_f64()
                        );
                        error!("{}", err);
                        return Err(Error::timeout(err));
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Pump one message. Queued notifications from an interrupted outer
    /// delivery drain first; then the expected slot is re-checked (it may
    /// have completed or blocked during those callbacks); then one frame is
    /// received, parsed, routed and dispatched.
    fn process_next_message<'a>(
        self: &'a Arc<Self>,
        expected_id: Option<i32>,
        log_timeout: bool,
        deadline: Deadline,
        caller: &'a Arc<DevToolsClient>,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let _depth = StackGuard::enter(&self.stack_count);

            self.ensure_listeners_notified_of_connect().await?;
            self.ensure_listeners_notified_of_event().await?;
            self.ensure_listeners_notified_of_command_response().await?;

            if let Some(expected_id) = expected_id {
                let done = match self.pending.lock().get(&expected_id) {
                    None => true,
                    Some(slot) => slot.lock().state != ResponseState::Waiting,
                };
                if done {
                    return Ok(());
                }
            }

            if self.crashed.load(Ordering::SeqCst) {
                return Err(Error::TabCrashed);
            }
            if self.detached.load(Ordering::SeqCst) {
                return Err(Error::TargetDetached);
            }

            if let Some(parent) = self.parent_client() {
                return parent
                    .process_next_message(None, log_timeout, deadline, caller)
                    .await;
            }

            let Some(transport) = self.transport() else {
                return Err(Error::unknown("cannot pump without a socket"));
            };
            let frame = match transport.receive_next(&deadline).await {
                Received::Message(frame) => frame,
                Received::Disconnected => {
                    let err = "Unable to receive message from renderer";
                    error!("{}", err);
                    return Err(Error::disconnected(err));
                }
                Received::Timeout => {
                    let err = format!(
                        "Timed out receiving message from renderer: {:.3}",
                        deadline.duration().as_secs_f64()
                    );
                    if log_timeout {
                        error!("{}", err);
                    }
                    return Err(Error::timeout(err));
                }
            };

            self.handle_message(&frame, caller).await
        }
        .boxed()
    }

    /// Route a parsed frame to its session and dispatch it there. Errors
    /// from sessions other than the caller's (and the root's) are
    /// swallowed: the connection keeps making progress for everyone, and a
    /// failing sibling surfaces its state on its own next access.
    async fn handle_message(
        self: &Arc<Self>,
        frame: &str,
        caller: &Arc<DevToolsClient>,
    ) -> Result<()> {
        let Ok(parsed) = message::parse_inspector_message(frame) else {
            error!("Bad inspector message: {}", frame);
            return Err(Error::unknown(format!("bad inspector message: {}", frame)));
        };

        let routed = if parsed.session_id == self.session_id {
            Arc::clone(self)
        } else {
            let child = self.children.lock().get(&parsed.session_id).cloned();
            match child {
                Some(child) => child,
                // Only auto-attached targets are known here; sessions of
                // other target types are expected noise.
                None => return Ok(()),
            }
        };

        // Pin the owning web view for the delivery: a listener may trigger
        // its teardown while callbacks are still running.
        let _owner_holder = routed.owner();

        let status = match parsed.message {
            InspectorMessage::Event(event) => routed.process_event(event).await,
            InspectorMessage::CommandResponse(response) => {
                routed.process_command_response(response).await
            }
        };

        if Arc::ptr_eq(&routed, caller) || Arc::ptr_eq(&routed, self) {
            status
        } else {
            if let Err(err) = status {
                debug!(
                    "swallowing error from session {} (id={}): {}",
                    routed.session_id, routed.id, err
                );
            }
            Ok(())
        }
    }

    /// Deliver one event to this node's listeners, then act on the methods
    /// the pump itself must react to.
    async fn process_event(self: &Arc<Self>, event: InspectorEvent) -> Result<()> {
        debug!(
            "DevTools WebSocket Event: {} (session_id={}) {} {}",
            event.method, self.session_id, self.id, event.params
        );

        let method = event.method.clone();
        {
            let snapshot: VecDeque<_> = self.listeners.lock().iter().cloned().collect();
            *self.unnotified_event_listeners.lock() = snapshot;
            *self.unnotified_event.lock() = Some(Arc::new(EventNotification {
                method: event.method,
                params: event.params,
            }));
        }
        let status = self.ensure_listeners_notified_of_event().await;
        *self.unnotified_event.lock() = None;
        status?;

        if method == "Inspector.detached" {
            return Err(Error::disconnected("received Inspector.detached event"));
        }
        if method == "Inspector.targetCrashed" {
            self.crashed.store(true, Ordering::SeqCst);
            return Err(Error::TabCrashed);
        }
        if method == "Page.javascriptDialogOpening" {
            // A command may have opened the dialog, which then blocks its
            // response. To find out which one, round-trip a cheap command:
            // the target processes commands sequentially, so anything still
            // unanswered afterwards is stalled behind the dialog.
            let max_id = self.next_message_id();
            let enable_status = self
                .send_command(
                    "Inspector.enable",
                    json!({ "purpose": "detect if alert blocked any cmds" }),
                )
                .await;
            {
                let pending = self.pending.lock();
                for (&id, slot) in pending.iter() {
                    if id > max_id {
                        continue;
                    }
                    let mut slot = slot.lock();
                    if slot.state == ResponseState::Waiting {
                        slot.state = ResponseState::Blocked;
                    }
                }
            }
            if let Err(err) = enable_status {
                debug!("dialog-detection round trip failed: {}", err);
            }
        }
        Ok(())
    }

    /// Complete one pending slot and deliver the success notification.
    async fn process_command_response(
        self: &Arc<Self>,
        response: InspectorCommandResponse,
    ) -> Result<()> {
        let slot = self.pending.lock().get(&response.id).cloned();
        let Some(slot) = slot else {
            // A session may detach while its command is in flight; the
            // browser then answers with an error and no session id, so the
            // response lands here at the root with nobody waiting.
            if self.parent_client().is_none() && response.result.is_none() {
                if matches!(
                    message::parse_inspector_error(&response.error),
                    Error::NoSuchFrame(_)
                ) {
                    return Ok(());
                }
            }
            return Err(Error::unknown("unexpected command response"));
        };

        debug!(
            "DevTools WebSocket Response: {} (id={}) (session_id={}) {} {}",
            slot.lock().method,
            response.id,
            self.session_id,
            self.id,
            response
                .result
                .as_ref()
                .map(|result| result.to_string())
                .unwrap_or_else(|| response.error.clone())
        );

        self.pending.lock().remove(&response.id);

        let notification = {
            let mut locked = slot.lock();
            if locked.state != ResponseState::Ignored {
                locked.state = ResponseState::Received;
                locked.response = Some(response.clone());
            }
            response.result.map(|result| {
                Arc::new(CommandNotification {
                    method: locked.method.clone(),
                    result,
                    command_timeout: locked.command_timeout,
                })
            })
        };

        if let Some(notification) = notification {
            {
                let snapshot: VecDeque<_> = self.listeners.lock().iter().cloned().collect();
                *self.unnotified_cmd_response_listeners.lock() = snapshot;
                *self.unnotified_cmd_response.lock() = Some(notification);
            }
            let status = self.ensure_listeners_notified_of_command_response().await;
            *self.unnotified_cmd_response.lock() = None;
            status?;
        }
        Ok(())
    }

    async fn ensure_listeners_notified_of_connect(self: &Arc<Self>) -> Result<()> {
        loop {
            let listener = self.unnotified_connect_listeners.lock().pop_front();
            let Some(listener) = listener else {
                return Ok(());
            };
            listener.on_connected(self).await?;
        }
    }

    async fn ensure_listeners_notified_of_event(self: &Arc<Self>) -> Result<()> {
        loop {
            let listener = self.unnotified_event_listeners.lock().pop_front();
            let Some(listener) = listener else {
                return Ok(());
            };
            let event = self.unnotified_event.lock().clone();
            let Some(event) = event else {
                return Ok(());
            };
            if let Err(err) = listener.on_event(self, &event.method, &event.params).await {
                // The rest of the queue is for this message only; drop it.
                self.unnotified_event_listeners.lock().clear();
                return Err(err);
            }
        }
    }

    async fn ensure_listeners_notified_of_command_response(self: &Arc<Self>) -> Result<()> {
        loop {
            let listener = self.unnotified_cmd_response_listeners.lock().pop_front();
            let Some(listener) = listener else {
                return Ok(());
            };
            let notification = self.unnotified_cmd_response.lock().clone();
            let Some(notification) = notification else {
                return Ok(());
            };
            listener
                .on_command_success(
                    self,
                    &notification.method,
                    &notification.result,
                    notification.command_timeout,
                )
                .await?;
        }
    }
}
