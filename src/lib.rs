//! cdp-mux: Chrome DevTools Protocol client multiplexer
//!
//! One WebSocket connection to a browser, many logical CDP sessions on top
//! of it. The crate provides the session tree, synchronous
//! command/response correlation over the asynchronous duplex channel, and
//! a re-entrant message pump that keeps delivering events to listeners
//! while a caller waits for its own response.

pub mod client;
pub mod config;
pub mod error;
pub mod listener;
pub mod message;
pub mod mock;
pub mod timeout;
pub mod transport;


// Re-exports
pub use client::{DevToolsClient, FrontendCloser, BROWSERWIDE_CLIENT_ID};
pub use config::Config;
pub use error::{Error, Result};
pub use listener::{DevToolsEventListener, WebViewOwner};
pub use message::{
    InspectorCommandResponse, InspectorEvent, InspectorMessage, ParsedMessage,
};
pub use mock::MockTransport;
pub use timeout::Deadline;
pub use transport::{DevToolsTransport, NotificationHandler, Received, WebSocketTransport};

/// cdp-mux library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
