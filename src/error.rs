//! Unified error types for cdp-mux

use thiserror::Error;

/// Unified Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for cdp-mux
///
/// The variants mirror the WebDriver-facing status codes the pump and the
/// codec may produce. Display strings follow the conventional
/// "status: detail" shape so they can be surfaced verbatim.
#[derive(Error, Debug)]
pub enum Error {
    /// Transport lost, or an `Inspector.detached` event arrived
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// Outer deadline expired while waiting for a message
    #[error("timeout: {0}")]
    Timeout(String),

    /// `Inspector.targetCrashed` received, or a caller polled after a crash
    #[error("tab crashed")]
    TabCrashed,

    /// The session was explicitly marked detached
    #[error("target detached")]
    TargetDetached,

    /// A waiting command was stalled by a JavaScript dialog
    #[error("unexpected alert open{}", alert_suffix(.alert_text))]
    UnexpectedAlertOpen {
        /// Dialog text, when the owner's dialog manager could supply it
        alert_text: Option<String>,
    },

    /// Inspector error code -32601
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Inspector code -32001, or the frame-not-found message
    #[error("no such frame: {0}")]
    NoSuchFrame(String),

    /// Inspector context-not-found messages, or -32602 with a missing target
    #[error("no such window: {0}")]
    NoSuchWindow(String),

    /// Inspector code -32602, or one of the known bad-argument messages
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Serialization errors on the outbound path
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any unrecognized inspector error, bad parse, or precondition failure
    #[error("unknown error: {0}")]
    UnknownError(String),
}

fn alert_suffix(text: &Option<String>) -> String {
    match text {
        Some(text) => format!(": {{Alert text : {text}}}"),
        None => String::new(),
    }
}

impl Error {
    /// Create a new disconnected error
    pub fn disconnected<S: Into<String>>(msg: S) -> Self {
        Error::Disconnected(msg.into())
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    /// Create a new unknown-command error
    pub fn unknown_command<S: Into<String>>(msg: S) -> Self {
        Error::UnknownCommand(msg.into())
    }

    /// Create a new no-such-frame error
    pub fn no_such_frame<S: Into<String>>(msg: S) -> Self {
        Error::NoSuchFrame(msg.into())
    }

    /// Create a new no-such-window error
    pub fn no_such_window<S: Into<String>>(msg: S) -> Self {
        Error::NoSuchWindow(msg.into())
    }

    /// Create a new invalid-argument error
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Create a new unknown error
    pub fn unknown<S: Into<String>>(msg: S) -> Self {
        Error::UnknownError(msg.into())
    }
}
