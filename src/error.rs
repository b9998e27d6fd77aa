use crate::config::ConfigError;
use thiserror::Error;

/// Categorizes errors for handler decision-making.
///
/// A lightweight, copyable view of [`Error`] passed to
/// [`MessageHandler::on_error`](crate::MessageHandler::on_error).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Handshake or dial failed (retryable)
    Dial,
    /// A frame failed to go out on the socket
    Write,
    /// The socket read failed (EOF, reset, deadline exceeded)
    Read,
    /// The caller's handler returned an error or panicked
    Handler,
    /// The reconnect budget was exhausted (terminal)
    ReconnectExhausted,
    /// The connection is closed
    Closed,
    /// Anything else (configuration, serialization, misuse)
    Other,
}

/// Errors that can occur in ws-stream-manager
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket handshake error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Dial failed before the handshake (DNS, TCP, proxy, TLS, timeout)
    #[error("Dial failed: {0}")]
    Dial(String),

    /// Frame could not be written
    #[error("Write failed: {0}")]
    Write(String),

    /// Socket read failed
    #[error("Read failed: {0}")]
    Read(String),

    /// Handler error (user-defined)
    #[error("Handler error: {0}")]
    Handler(String),

    /// Every reconnect attempt failed
    #[error("Reconnect failed after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    /// Operation on a closed connection
    #[error("Connection is closed")]
    Closed,

    /// `start()` called twice
    #[error("Connection already started")]
    AlreadyStarted,

    /// Outbound payload could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) | Error::Dial(_) => ErrorKind::Dial,
            Error::Write(_) => ErrorKind::Write,
            Error::Read(_) => ErrorKind::Read,
            Error::Handler(_) => ErrorKind::Handler,
            Error::ReconnectExhausted { .. } => ErrorKind::ReconnectExhausted,
            Error::Closed => ErrorKind::Closed,
            Error::AlreadyStarted | Error::Serialization(_) | Error::Config(_) => ErrorKind::Other,
        }
    }
}
