use crate::error::Error;
use crate::frame::FrameQueues;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Lifecycle of a streaming connection.
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Closing -> Closed
///                      ^            |
///                      +------------+  (reconnect)
/// ```
///
/// Any state may move to `Closed`; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, not started
    Disconnected,
    /// Dialing (initial connect or reconnect)
    Connecting,
    /// Handshake completed, loops running
    Connected,
    /// Teardown in progress
    Closing,
    /// Terminal
    Closed,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    /// Check if the connection reached its terminal state.
    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting)
            | (Connecting, Connected)
            | (Connecting, Closing)
            | (Connected, Connecting)
            | (Connected, Closing) => true,
            _ => false,
        }
    }
}

/// Why a connection reached `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalReason {
    /// `close()` was called
    CallerClosed,
    /// The peer sent a close frame
    PeerClosed { code: Option<u16>, reason: String },
    /// The first dial failed
    DialFailed(String),
    /// A read failed and auto-reconnect is disabled
    ReadFailed(String),
    /// Every reconnect attempt failed
    ReconnectExhausted { attempts: u32, last_error: String },
}

impl TerminalReason {
    /// Map to the caller-visible result: orderly closes are `Ok`.
    pub fn into_result(self) -> Result<(), Error> {
        match self {
            TerminalReason::CallerClosed | TerminalReason::PeerClosed { .. } => Ok(()),
            TerminalReason::DialFailed(e) => Err(Error::Dial(e)),
            TerminalReason::ReadFailed(e) => Err(Error::Read(e)),
            TerminalReason::ReconnectExhausted {
                attempts,
                last_error,
            } => Err(Error::ReconnectExhausted {
                attempts,
                last_error,
            }),
        }
    }
}

/// Shared, watchable connection state that only accepts legal transitions.
#[derive(Debug, Clone)]
pub(crate) struct StateCell {
    tx: Arc<watch::Sender<ConnectionState>>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Apply `next` if legal. Returns whether the state changed.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                *current = next;
                true
            } else {
                false
            }
        })
    }
}

/// Everything the tasks of one connection share: its state, the close
/// signal, the outbound queues and the reason it ended.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    pub(crate) state: StateCell,
    pub(crate) cancel: CancellationToken,
    pub(crate) queues: FrameQueues,
    terminal: Mutex<Option<TerminalReason>>,
}

impl Lifecycle {
    pub(crate) fn new(queues: FrameQueues) -> Self {
        Self {
            state: StateCell::new(),
            cancel: CancellationToken::new(),
            queues,
            terminal: Mutex::new(None),
        }
    }

    /// Begin teardown. The first reason recorded wins; later calls only
    /// re-broadcast the (already fired) close signal.
    pub(crate) fn finish(&self, reason: TerminalReason) {
        {
            let mut terminal = self.terminal.lock();
            if terminal.is_none() {
                *terminal = Some(reason);
            }
        }
        self.state.transition(ConnectionState::Closing);
        self.queues.shut();
        self.cancel.cancel();
    }

    pub(crate) fn terminal_reason(&self) -> Option<TerminalReason> {
        self.terminal.lock().clone()
    }
}
