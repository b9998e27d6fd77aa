use crate::config::ConnectionConfig;
use crate::error::Error;
use crate::handler::{ConnectionInfo, Dispatch, MessageHandler};
use crate::liveness::Liveness;
use crate::metrics::Metrics;
use crate::reconnect::{ReconnectOutcome, ReconnectSupervisor};
use crate::state::{ConnectionState, Lifecycle, TerminalReason};
use crate::transport::{WsDialer, WsSink, WsSource, WsStream};
use crate::writer::{FailureSignal, WriterCommand};
use futures_util::{FutureExt, StreamExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

/// What an inbound frame means to the read loop
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Inbound {
    /// Text or binary payload for the handler
    Data(Vec<u8>),
    /// Peer ping; tungstenite queues the matching pong itself
    Ping(Vec<u8>),
    Pong,
    /// Peer close frame
    Close { code: Option<u16>, reason: String },
    /// Raw frames never surface from a read; nothing to do
    Ignored,
}

pub(crate) fn classify(message: Message) -> Inbound {
    match message {
        Message::Text(text) => Inbound::Data(text.into_bytes()),
        Message::Binary(data) => Inbound::Data(data),
        Message::Ping(data) => Inbound::Ping(data),
        Message::Pong(_) => Inbound::Pong,
        Message::Close(Some(frame)) => Inbound::Close {
            code: Some(u16::from(frame.code)),
            reason: frame.reason.into_owned(),
        },
        Message::Close(None) => Inbound::Close {
            code: None,
            reason: String::new(),
        },
        Message::Frame(_) => Inbound::Ignored,
    }
}

/// Runs the handler on payloads in the order the reader forwarded them, and
/// passes reported errors to `on_error` in line with them.
///
/// Decoupled from the socket by a bounded channel, so a slow handler cannot
/// hold up deadline renewal until the channel fills.
pub(crate) struct Dispatcher<H> {
    handler: Arc<H>,
    items: mpsc::Receiver<Dispatch>,
    metrics: Arc<Metrics>,
    label: String,
}

impl<H: MessageHandler> Dispatcher<H> {
    pub(crate) fn new(
        handler: Arc<H>,
        items: mpsc::Receiver<Dispatch>,
        metrics: Arc<Metrics>,
        label: String,
    ) -> Self {
        Self {
            handler,
            items,
            metrics,
            label,
        }
    }

    /// Runs until every sender is gone; queued items are still delivered.
    pub(crate) async fn run(mut self) {
        while let Some(item) = self.items.recv().await {
            match item {
                Dispatch::Payload(payload) => self.dispatch(payload).await,
                Dispatch::Error(error) => {
                    self.handler.on_error(error.kind(), &error.to_string()).await;
                }
            }
        }
        debug!("[{}] Dispatcher stopped", self.label);
    }

    async fn dispatch(&self, payload: Vec<u8>) {
        let error = match AssertUnwindSafe(self.handler.handle(payload))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => return,
            Ok(Err(e)) => {
                warn!("[{}] Handler error: {}", self.label, e);
                Error::Handler(e.to_string())
            }
            Err(panic_err) => {
                let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_err.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "Unknown panic".to_string()
                };
                error!("[{}] Handler panicked: {}. Message dropped", self.label, panic_msg);
                Error::Handler(format!("handler panicked: {}", panic_msg))
            }
        };

        self.metrics.record_handler_error();
        self.handler.on_error(error.kind(), &error.to_string()).await;
    }
}

/// Why the read loop left a transport
enum ReadExit {
    Cancelled,
    PeerClosed { code: Option<u16>, reason: String },
    Failed(String),
}

/// The single reader of the live transport, and the owner of its replacement.
///
/// Every inbound frame slides the read deadline, and so does the end of any
/// wait on a full dispatch channel. Data goes to the dispatcher, a peer close
/// ends the connection. A read failure, a
/// missed deadline or a write failure reported by the writer hands control to
/// the reconnect supervisor, and reading resumes on the new transport.
pub(crate) struct FrameReader<H> {
    config: Arc<ConnectionConfig>,
    handler: Arc<H>,
    lifecycle: Arc<Lifecycle>,
    metrics: Arc<Metrics>,
    supervisor: ReconnectSupervisor<WsDialer>,
    writer: mpsc::Sender<WriterCommand<WsSink>>,
    failures: mpsc::Receiver<FailureSignal>,
    dispatch: mpsc::Sender<Dispatch>,
    generation: u64,
    label: String,
}

/// Channels connecting the reader to its sibling tasks
pub(crate) struct ReaderLinks {
    pub(crate) writer: mpsc::Sender<WriterCommand<WsSink>>,
    pub(crate) failures: mpsc::Receiver<FailureSignal>,
    pub(crate) dispatch: mpsc::Sender<Dispatch>,
}

impl<H: MessageHandler> FrameReader<H> {
    pub(crate) fn new(
        config: Arc<ConnectionConfig>,
        handler: Arc<H>,
        lifecycle: Arc<Lifecycle>,
        metrics: Arc<Metrics>,
        supervisor: ReconnectSupervisor<WsDialer>,
        links: ReaderLinks,
    ) -> Self {
        let label = config.label();
        Self {
            config,
            handler,
            lifecycle,
            metrics,
            supervisor,
            writer: links.writer,
            failures: links.failures,
            dispatch: links.dispatch,
            generation: 0,
            label,
        }
    }

    /// Make `transport` the live one: hand its write half to the writer,
    /// mark the connection up and queue the handler's connect frames.
    pub(crate) async fn attach(&mut self, transport: WsStream, reconnect_attempts: u32) -> WsSource {
        self.generation += 1;
        let (sink, source) = transport.split();

        let command = WriterCommand::Attach {
            sink,
            generation: self.generation,
        };
        if self.writer.send(command).await.is_err() {
            debug!("[{}] Writer gone, transport not attached", self.label);
        }

        self.lifecycle.state.transition(ConnectionState::Connected);
        self.metrics.record_connected();

        let info = self.connection_info(reconnect_attempts);
        let frames = self.handler.on_connect(&info).await;
        if !frames.is_empty() {
            debug!("[{}] Queueing {} connect frame(s)", self.label, frames.len());
        }
        for frame in frames {
            if let Err(e) = self.lifecycle.queues.enqueue(frame).await {
                warn!("[{}] Failed to queue connect frame: {}", self.label, e);
                break;
            }
        }

        source
    }

    pub(crate) async fn run(mut self, mut source: WsSource) {
        let reason = loop {
            let cause = match self.read_until_exit(&mut source).await {
                ReadExit::Cancelled => break None,
                ReadExit::PeerClosed { code, reason } => {
                    info!(
                        "[{}] Peer closed the connection (code={:?}, reason={:?})",
                        self.label, code, reason
                    );
                    if !self.config.reconnect_on_peer_close {
                        break Some(TerminalReason::PeerClosed { code, reason });
                    }
                    format!("peer closed the connection (code={:?})", code)
                }
                ReadExit::Failed(cause) => cause,
            };

            self.metrics.record_disconnected();
            self.report(Error::Read(cause.clone())).await;

            if !self.config.auto_reconnect {
                error!("[{}] Connection lost: {}", self.label, cause);
                break Some(TerminalReason::ReadFailed(cause));
            }

            match self.recover(source, &cause).await {
                Ok(next) => source = next,
                Err(reason) => break reason,
            }
        };

        if let Some(reason) = reason {
            self.lifecycle.finish(reason);
        }
        debug!("[{}] Reader stopped", self.label);
    }

    async fn read_until_exit(&mut self, source: &mut WsSource) -> ReadExit {
        let mut liveness = Liveness::new(self.config.effective_read_deadline());
        let cancel = self.lifecycle.cancel.clone();

        loop {
            // Frames already buffered win over an expired deadline
            tokio::select! {
                biased;

                _ = cancel.cancelled() => return ReadExit::Cancelled,
                Some(signal) = self.failures.recv() => {
                    if signal.generation == self.generation {
                        return ReadExit::Failed(format!("write failed: {}", signal.error));
                    }
                    debug!(
                        "[{}] Ignoring write failure from generation {}",
                        self.label, signal.generation
                    );
                }
                message = source.next() => match message {
                    Some(Ok(message)) => {
                        liveness.extend();
                        match classify(message) {
                            Inbound::Data(payload) => {
                                self.metrics.record_message_received();
                                let forwarded = tokio::select! {
                                    _ = cancel.cancelled() => return ReadExit::Cancelled,
                                    result = self.dispatch.send(Dispatch::Payload(payload)) => result,
                                };
                                if forwarded.is_err() {
                                    return ReadExit::Cancelled;
                                }
                                // Time spent on handler backpressure is not peer silence
                                liveness.extend();
                            }
                            Inbound::Ping(_) => {
                                // tungstenite queues the pong and flushes it on the next read
                                self.metrics.record_pong_sent();
                                trace!("[{}] Received ping, pong queued", self.label);
                            }
                            Inbound::Pong => {
                                self.metrics.record_pong_received();
                                trace!("[{}] Received pong", self.label);
                            }
                            Inbound::Close { code, reason } => {
                                return ReadExit::PeerClosed { code, reason };
                            }
                            Inbound::Ignored => {}
                        }
                    }
                    Some(Err(e)) => {
                        warn!("[{}] WebSocket error: {}", self.label, e);
                        return ReadExit::Failed(e.to_string());
                    }
                    None => {
                        info!("[{}] WebSocket stream ended", self.label);
                        return ReadExit::Failed("stream ended".to_string());
                    }
                },
                _ = tokio::time::sleep_until(liveness.deadline()) => {
                    self.metrics.record_read_timeout();
                    warn!(
                        "[{}] No inbound traffic for {:?} (last frame {:?} ago)",
                        self.label,
                        liveness.window(),
                        liveness.since_last_inbound()
                    );
                    return ReadExit::Failed(format!(
                        "read deadline of {:?} exceeded",
                        liveness.window()
                    ));
                }
            }
        }
    }

    /// Tear down the stale transport and run one reconnect sequence.
    ///
    /// `Err` carries the terminal reason, or `None` when the close signal
    /// interrupted the sequence.
    async fn recover(
        &mut self,
        stale: WsSource,
        cause: &str,
    ) -> Result<WsSource, Option<TerminalReason>> {
        warn!("[{}] Connection lost ({}), reconnecting", self.label, cause);

        // Detach first: anything queued from here on waits for the new transport
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .writer
            .send(WriterCommand::Detach { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
        drop(stale);
        self.lifecycle.state.transition(ConnectionState::Connecting);

        self.handler
            .on_disconnect(&self.connection_info(0))
            .await;

        match self.supervisor.reconnect().await {
            ReconnectOutcome::Restored {
                transport,
                attempts,
            } => Ok(self.attach(transport, attempts).await),
            ReconnectOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                self.report(Error::ReconnectExhausted {
                    attempts,
                    last_error: last_error.clone(),
                })
                .await;
                Err(Some(TerminalReason::ReconnectExhausted {
                    attempts,
                    last_error,
                }))
            }
            ReconnectOutcome::AlreadyInProgress => {
                // The reader is the only caller, so the guard is never contended here
                error!("[{}] Reconnect guard unexpectedly held", self.label);
                Err(Some(TerminalReason::ReadFailed(cause.to_string())))
            }
            ReconnectOutcome::Cancelled => Err(None),
        }
    }

    async fn report(&self, error: Error) {
        self.handler.on_error(error.kind(), &error.to_string()).await;
    }

    fn connection_info(&self, reconnect_attempts: u32) -> ConnectionInfo {
        ConnectionInfo {
            url: self.config.url.clone(),
            is_reconnect: self.generation > 1,
            reconnect_attempts,
            generation: self.generation,
        }
    }
}
