//! Listener and collaborator interfaces
//!
//! Listeners are capability records registered on a session node; the pump
//! calls them in registration order. A listener may itself send commands
//! from inside a callback: the pump re-enters and keeps draining while the
//! outer delivery is suspended.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::client::DevToolsClient;
use crate::error::Result;

/// Receiver of connection, event and command-response notifications from a
/// session node.
///
/// Every method has a no-op default so implementors only write the hooks
/// they care about.
#[async_trait]
pub trait DevToolsEventListener: Send + Sync {
    /// Whether this listener wants [`on_connected`](Self::on_connected)
    /// calls. Such listeners must be registered while the client is
    /// disconnected.
    fn listens_to_connections(&self) -> bool {
        false
    }

    /// Called once per successful connection, in registration order,
    /// before any event for that connection. May send commands.
    async fn on_connected(&self, _client: &Arc<DevToolsClient>) -> Result<()> {
        Ok(())
    }

    /// Called for every event routed to the owning session node.
    async fn on_event(
        &self,
        _client: &Arc<DevToolsClient>,
        _method: &str,
        _params: &Value,
    ) -> Result<()> {
        Ok(())
    }

    /// Called for every successful command response on the owning node,
    /// with the originating command's timeout when the caller set one.
    async fn on_command_success(
        &self,
        _client: &Arc<DevToolsClient>,
        _method: &str,
        _result: &Value,
        _command_timeout: Option<Duration>,
    ) -> Result<()> {
        Ok(())
    }
}

/// The automation-level view that owns a session node.
///
/// Reached through a weak back-reference; the pump upgrades it for the
/// duration of a delivery so a listener triggering teardown cannot pull the
/// owner out from under the running callbacks.
pub trait WebViewOwner: Send + Sync {
    /// Service-worker sessions skip per-connection setup.
    fn is_service_worker(&self) -> bool {
        false
    }

    /// Text of the currently open JavaScript dialog, queried when a dialog
    /// has stalled an in-flight command.
    fn dialog_message(&self) -> Result<String>;
}
