use crate::error::{Error, ErrorKind};
use crate::frame::OutboundFrame;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

/// Error type returned by handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Connection information passed to handler hooks
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Endpoint this connection is bound to
    pub url: String,
    /// Whether this is a reconnection (vs initial connection)
    pub is_reconnect: bool,
    /// Dial attempts the last reconnect sequence needed (0 for the initial connection)
    pub reconnect_attempts: u32,
    /// Incremented on every successful connect; identifies the live transport
    pub generation: u64,
}

/// Trait that users implement to consume a stream.
///
/// The manager owns the socket, liveness and reconnection. The handler only
/// sees data payloads, in the order they arrived on the socket, plus a few
/// lifecycle hooks.
///
/// # Example
///
/// ```ignore
/// use ws_stream_manager::{ConnectionInfo, HandlerError, MessageHandler, OutboundFrame};
///
/// struct DepthHandler;
///
/// impl MessageHandler for DepthHandler {
///     async fn handle(&self, payload: Vec<u8>) -> Result<(), HandlerError> {
///         let depth: serde_json::Value = serde_json::from_slice(&payload)?;
///         println!("{depth}");
///         Ok(())
///     }
///
///     async fn on_connect(&self, _info: &ConnectionInfo) -> Vec<OutboundFrame> {
///         vec![OutboundFrame::Text(r#"{"method":"SUBSCRIBE","params":["btcusdt@depth5"],"id":1}"#.into())]
///     }
/// }
/// ```
pub trait MessageHandler: Send + Sync + 'static {
    /// Called for every inbound text or binary frame.
    ///
    /// An error is reported through [`on_error`](Self::on_error) and the
    /// metrics; it never affects the connection.
    fn handle(&self, payload: Vec<u8>)
        -> impl Future<Output = Result<(), HandlerError>> + Send;

    /// Called after the initial connect and once after every successful reconnect.
    ///
    /// Returned frames are queued for sending (e.g. subscriptions, login).
    fn on_connect(&self, _info: &ConnectionInfo) -> impl Future<Output = Vec<OutboundFrame>> + Send {
        async { Vec::new() }
    }

    /// Called when the live transport is lost, before reconnection begins.
    fn on_disconnect(&self, _info: &ConnectionInfo) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Observability sink for non-fatal errors (handler, write, read, dial).
    fn on_error(&self, _kind: ErrorKind, _message: &str) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Adapter that turns a plain closure into a [`MessageHandler`].
///
/// Created with [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap a `Fn(&[u8]) -> Result<(), HandlerError>` closure as a handler.
pub fn handler_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(&[u8]) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    HandlerFn { f }
}

impl<F> MessageHandler for HandlerFn<F>
where
    F: Fn(&[u8]) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, payload: Vec<u8>) -> impl Future<Output = Result<(), HandlerError>> + Send {
        // Invoked on poll so the dispatcher's panic guard covers the closure.
        async move { (self.f)(&payload) }
    }
}

/// Work item for the dispatcher: a payload for `handle`, or an error for `on_error`.
#[derive(Debug)]
pub(crate) enum Dispatch {
    Payload(Vec<u8>),
    Error(Error),
}

/// Hands non-fatal errors to the dispatcher, which passes them to
/// [`MessageHandler::on_error`] in line with the payloads.
///
/// Never waits: a report that finds the dispatch channel full is logged and dropped.
#[derive(Debug, Clone)]
pub(crate) struct ErrorReporter {
    tx: mpsc::Sender<Dispatch>,
    label: String,
}

impl ErrorReporter {
    pub(crate) fn new(tx: mpsc::Sender<Dispatch>, label: String) -> Self {
        Self { tx, label }
    }

    pub(crate) fn report(&self, error: Error) {
        match self.tx.try_send(Dispatch::Error(error)) {
            Ok(()) => {}
            Err(TrySendError::Full(Dispatch::Error(error))) => {
                debug!("[{}] Dispatch queue full, error not reported: {}", self.label, error);
            }
            Err(_) => {}
        }
    }
}
