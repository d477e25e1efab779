//! Error types for the relay

use thiserror::Error;

/// Result type alias using the relay's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the relay
#[derive(Debug, Error)]
pub enum Error {
    // ============ Validation Errors ============
    /// The request carried an empty or whitespace-only prompt
    #[error("Empty prompt provided.")]
    EmptyPrompt,

    // ============ Observer Errors ============
    /// An observer callback failed during fan-out
    #[error("Observer dispatch error: {0}")]
    ObserverDispatch(String),

    /// The consumer side of a bridge queue is gone
    #[error("Bridge queue closed")]
    QueueClosed,

    // ============ Background Task Errors ============
    /// The background task returned an error
    #[error("{0}")]
    TaskFailed(String),

    /// The background task panicked
    #[error("Background task panicked: {0}")]
    TaskPanicked(String),

    // ============ Transport Errors ============
    /// The client went away or the outbound stream refused a frame
    #[error("Transport error: {0}")]
    Transport(String),

    // ============ Configuration Errors ============
    /// Configuration is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration could not be parsed
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_yaml_ng::Error),

    // ============ Logging Errors ============
    /// Logging could not be initialised or reconfigured
    #[error("Logging error: {0}")]
    Logging(String),

    // ============ System Errors ============
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ============ Generic Errors ============
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new observer dispatch error
    pub fn observer_dispatch(msg: impl Into<String>) -> Self {
        Self::ObserverDispatch(msg.into())
    }

    /// Create a new transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error is reported to the client as an in-band frame.
    ///
    /// Observer failures are contained at the registry and transport
    /// failures have nobody left to report to.
    pub fn is_client_visible(&self) -> bool {
        !matches!(
            self,
            Self::ObserverDispatch(_) | Self::QueueClosed | Self::Transport(_)
        )
    }
}

/// Text carried by a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
