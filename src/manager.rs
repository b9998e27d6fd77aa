use crate::config::ConnectionConfig;
use crate::error::Error;
use crate::frame::{frame_queues, FrameReceivers, OutboundFrame};
use crate::handler::{ErrorReporter, MessageHandler};
use crate::heartbeat::HeartbeatScheduler;
use crate::metrics::Metrics;
use crate::reader::{Dispatcher, FrameReader, ReaderLinks};
use crate::reconnect::ReconnectSupervisor;
use crate::state::{ConnectionState, Lifecycle, TerminalReason};
use crate::transport::{Dial, WsDialer};
use crate::writer::{FrameWriter, WriterLinks};
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, error, info};

/// Buffer of the reader -> writer command channel and the writer -> reader failure channel
const CONTROL_CHANNEL_SIZE: usize = 4;

/// A single resilient streaming WebSocket connection.
///
/// Owns the socket and the four tasks around it: a writer that is the only
/// writer of the socket, a reader that dispatches payloads to the handler and
/// drives reconnection, a heartbeat scheduler and the handler dispatcher.
///
/// # Thread Safety
///
/// `StreamManager` is `Send + Sync`; every method takes `&self` and may be
/// called from multiple tasks concurrently. `start` and `close` are serialized
/// by an internal lifecycle lock.
///
/// # Example
///
/// ```ignore
/// use ws_stream_manager::{handler_fn, ConnectionConfig, StreamManager};
/// use std::time::Duration;
///
/// let config = ConnectionConfig::builder("wss://stream.binance.com:9443/ws/btcusdt@depth5@100ms")
///     .heartbeat_interval(Duration::from_secs(15))
///     .build()?;
///
/// let manager = StreamManager::new(config, handler_fn(|payload| {
///     println!("{}", String::from_utf8_lossy(payload));
///     Ok(())
/// }));
/// manager.start().await?;
/// manager.wait_closed().await?;
/// ```
pub struct StreamManager<H: MessageHandler> {
    config: Arc<ConnectionConfig>,
    handler: Arc<H>,
    metrics: Arc<Metrics>,
    lifecycle: Arc<Lifecycle>,
    /// Handed to the writer on start
    receivers: SyncMutex<Option<FrameReceivers>>,
    /// Serializes start/close; a tokio Mutex so it can be held across the dial.
    lifecycle_lock: Mutex<()>,
    tasks: SyncMutex<Vec<AbortHandle>>,
    label: String,
}

impl<H: MessageHandler> StreamManager<H> {
    /// Create a manager for a validated configuration. Nothing connects until [`start`](Self::start).
    pub fn new(config: ConnectionConfig, handler: H) -> Self {
        let (queues, receivers) = frame_queues(config.queue_capacity);
        let label = config.label();
        Self {
            config: Arc::new(config),
            handler: Arc::new(handler),
            metrics: Arc::new(Metrics::new()),
            lifecycle: Arc::new(Lifecycle::new(queues)),
            receivers: SyncMutex::new(Some(receivers)),
            lifecycle_lock: Mutex::new(()),
            tasks: SyncMutex::new(Vec::new()),
            label,
        }
    }

    /// Create a manager with default settings for `ws_url`, optionally through
    /// `proxy_url` (empty for a direct connection).
    pub fn from_url(ws_url: &str, proxy_url: &str, handler: H) -> Result<Self, Error> {
        let config = ConnectionConfig::builder(ws_url).proxy(proxy_url).build()?;
        Ok(Self::new(config, handler))
    }

    /// Dial the endpoint and start the connection tasks.
    ///
    /// Returns once the connection is `Connected` and the handler's connect
    /// frames are queued.
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` if the manager left `Disconnected`. A failed first dial
    /// is returned as is and leaves the manager `Closed`; it is not retried.
    pub async fn start(&self) -> Result<(), Error> {
        let _lifecycle_guard = self.lifecycle_lock.lock().await;

        if self.lifecycle.state.get() != ConnectionState::Disconnected {
            return Err(Error::AlreadyStarted);
        }
        let Some(receivers) = self.receivers.lock().take() else {
            return Err(Error::AlreadyStarted);
        };

        self.lifecycle.state.transition(ConnectionState::Connecting);
        info!("[{}] Connecting to {}", self.label, self.config.url);

        let dialer = WsDialer::new(self.config.clone());
        let transport = match dialer.dial().await {
            Ok(transport) => transport,
            Err(e) => {
                self.metrics.record_dial_failure();
                error!("[{}] Initial connect failed: {}", self.label, e);
                self.handler.on_error(e.kind(), &e.to_string()).await;
                self.lifecycle
                    .finish(TerminalReason::DialFailed(e.to_string()));
                receivers.close();
                self.lifecycle.state.transition(ConnectionState::Closed);
                return Err(e);
            }
        };

        let cancel = self.lifecycle.cancel.clone();
        let (writer_tx, writer_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);
        let (failure_tx, failure_rx) = mpsc::channel(CONTROL_CHANNEL_SIZE);
        let (dispatch_tx, dispatch_rx) = mpsc::channel(self.config.dispatch_capacity);

        let writer = FrameWriter::new(
            receivers,
            WriterLinks {
                commands: writer_rx,
                failures: failure_tx,
                errors: ErrorReporter::new(dispatch_tx.clone(), self.label.clone()),
            },
            self.config.write_failure_policy,
            self.metrics.clone(),
            cancel.clone(),
            self.label.clone(),
        );
        let heartbeat = HeartbeatScheduler::new(
            Some(self.config.heartbeat_interval),
            self.config.pong_keepalive_interval,
            self.lifecycle.queues.clone(),
            cancel.clone(),
            self.label.clone(),
        );
        let dispatcher = Dispatcher::new(
            self.handler.clone(),
            dispatch_rx,
            self.metrics.clone(),
            self.label.clone(),
        );
        let supervisor = ReconnectSupervisor::new(
            dialer,
            self.config.reconnect.clone(),
            ErrorReporter::new(dispatch_tx.clone(), self.label.clone()),
            self.metrics.clone(),
            cancel,
            self.label.clone(),
        );
        let mut reader = FrameReader::new(
            self.config.clone(),
            self.handler.clone(),
            self.lifecycle.clone(),
            self.metrics.clone(),
            supervisor,
            ReaderLinks {
                writer: writer_tx,
                failures: failure_rx,
                dispatch: dispatch_tx,
            },
        );

        let writer_task = tokio::spawn(writer.run());
        let heartbeat_task = tokio::spawn(heartbeat.run());
        let dispatch_task = tokio::spawn(dispatcher.run());

        let source = reader.attach(transport, 0).await;

        let lifecycle = self.lifecycle.clone();
        let metrics = self.metrics.clone();
        let label = self.label.clone();
        let mut tasks = vec![
            writer_task.abort_handle(),
            heartbeat_task.abort_handle(),
            dispatch_task.abort_handle(),
        ];

        let session = tokio::spawn(async move {
            reader.run(source).await;

            // Reader is gone: stop the siblings and wait for them
            lifecycle.queues.shut();
            lifecycle.cancel.cancel();
            for (name, task) in [
                ("writer", writer_task),
                ("heartbeat", heartbeat_task),
                ("dispatcher", dispatch_task),
            ] {
                if let Err(e) = task.await {
                    if e.is_panic() {
                        error!("[{}] {} task panicked: {:?}", label, name, e);
                    } else {
                        debug!("[{}] {} task ended: {:?}", label, name, e);
                    }
                }
            }

            metrics.record_disconnected();
            lifecycle.state.transition(ConnectionState::Closed);
            info!("[{}] Connection closed", label);
        });
        tasks.push(session.abort_handle());
        *self.tasks.lock() = tasks;

        Ok(())
    }

    /// Close the connection and wait until it is `Closed`.
    ///
    /// Idempotent: calling it again, or after the connection ended on its
    /// own, is a no-op.
    pub async fn close(&self) {
        {
            let _lifecycle_guard = self.lifecycle_lock.lock().await;
            match self.lifecycle.state.get() {
                ConnectionState::Closed => return,
                ConnectionState::Disconnected => {
                    // Never started: no tasks to wait for
                    self.lifecycle.finish(TerminalReason::CallerClosed);
                    if let Some(receivers) = self.receivers.lock().take() {
                        receivers.close();
                    }
                    self.lifecycle.state.transition(ConnectionState::Closed);
                    return;
                }
                _ => {
                    info!("[{}] Closing connection", self.label);
                    self.lifecycle.finish(TerminalReason::CallerClosed);
                }
            }
        }

        self.closed().await;
    }

    /// Wait until the connection is `Closed`.
    ///
    /// `Ok(())` when it was closed by the caller or the peer; the terminal
    /// error when reconnection was exhausted or a read failed with
    /// auto-reconnect disabled.
    pub async fn wait_closed(&self) -> Result<(), Error> {
        self.closed().await;
        self.terminal_reason()
            .map_or(Ok(()), TerminalReason::into_result)
    }

    async fn closed(&self) {
        let mut state = self.lifecycle.state.subscribe();
        // The sender lives in `self.lifecycle`, so this only ends at `Closed`
        let _ = state.wait_for(|s| s.is_closed()).await;
    }

    /// Queue a frame for the writer, waiting for queue capacity.
    ///
    /// Frames queued before `start` go out after the first connect. Frames
    /// queued during a reconnect go out on the new transport.
    pub async fn send(&self, frame: OutboundFrame) -> Result<(), Error> {
        self.lifecycle.queues.enqueue(frame).await
    }

    /// Queue a text data frame
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), Error> {
        self.send(OutboundFrame::Text(text.into())).await
    }

    /// Serialize `value` as JSON and queue it as a text frame
    pub async fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), Error> {
        let text = serde_json::to_string(value)?;
        self.send(OutboundFrame::Text(text)).await
    }

    /// Queue a ping frame
    pub async fn send_ping(&self, payload: impl Into<Vec<u8>>) -> Result<(), Error> {
        self.send(OutboundFrame::Ping(payload.into())).await
    }

    /// Queue a pong frame
    pub async fn send_pong(&self, payload: impl Into<Vec<u8>>) -> Result<(), Error> {
        self.send(OutboundFrame::Pong(payload.into())).await
    }

    /// Queue a close frame. The connection ends once the peer answers it.
    pub async fn send_close(&self, code: u16, reason: &str) -> Result<(), Error> {
        self.send(OutboundFrame::close(code, reason)).await
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state.get()
    }

    /// Subscribe to state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.lifecycle.state.subscribe()
    }

    /// Why the connection ended, once it has
    pub fn terminal_reason(&self) -> Option<TerminalReason> {
        self.lifecycle.terminal_reason()
    }

    /// Get the metrics for this connection
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Get a reference to the handler
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Get the configuration
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

impl<H: MessageHandler> Drop for StreamManager<H> {
    fn drop(&mut self) {
        // Abort all tasks to prevent orphans
        self.lifecycle.cancel.cancel();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use std::time::Duration;

    fn refused_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{}", addr)
    }

    #[tokio::test]
    async fn test_close_before_start() {
        let manager = StreamManager::from_url("ws://127.0.0.1:1", "", handler_fn(|_| Ok(()))).unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.close().await;
        manager.close().await;

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(manager.terminal_reason(), Some(TerminalReason::CallerClosed));
        assert!(manager.wait_closed().await.is_ok());
        assert!(matches!(manager.start().await, Err(Error::AlreadyStarted)));
        assert!(matches!(manager.send_text("late").await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_failed_first_dial_closes() {
        let config = ConnectionConfig::builder(refused_url())
            .handshake_timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let manager = StreamManager::new(config, handler_fn(|_| Ok(())));

        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, Error::Dial(_)));

        assert_eq!(manager.state(), ConnectionState::Closed);
        assert!(matches!(
            manager.terminal_reason(),
            Some(TerminalReason::DialFailed(_))
        ));
        assert!(matches!(manager.wait_closed().await, Err(Error::Dial(_))));
        assert_eq!(manager.metrics().dial_failures(), 1);

        // Closing a closed manager is a no-op
        manager.close().await;
        assert!(matches!(manager.start().await, Err(Error::AlreadyStarted)));
    }

    #[tokio::test]
    async fn test_from_url_rejects_bad_url() {
        let result = StreamManager::from_url("http://example.com", "", handler_fn(|_| Ok(())));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_send_json_serializes() {
        let manager = StreamManager::from_url("ws://127.0.0.1:1", "", handler_fn(|_| Ok(()))).unwrap();

        let request = serde_json::json!({"method": "SUBSCRIBE", "params": ["btcusdt@depth"], "id": 1});
        manager.send_json(&request).await.unwrap();

        let mut receivers = manager.receivers.lock().take().unwrap();
        let text = receivers.text.try_recv().unwrap();
        assert_eq!(serde_json::from_str::<serde_json::Value>(&text).unwrap(), request);
    }
}
