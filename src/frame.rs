use crate::error::Error;
use std::borrow::Cow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// A frame queued for the writer.
///
/// Frames of the same tag go out in the order they were enqueued. There is no
/// ordering between tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Data frame
    Text(String),
    /// Ping control frame with payload
    Ping(Vec<u8>),
    /// Pong control frame with payload
    Pong(Vec<u8>),
    /// Close frame; payload is the wire form (big-endian code followed by reason)
    Close(Vec<u8>),
}

impl OutboundFrame {
    /// Build a close frame payload from a status code and reason.
    ///
    /// A code that may not be sent (1005, 1006, 1015, reserved ranges) goes
    /// out as a bare close.
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        OutboundFrame::Close(payload)
    }

    /// Short tag used in logs
    pub fn tag(&self) -> &'static str {
        match self {
            OutboundFrame::Text(_) => "text",
            OutboundFrame::Ping(_) => "ping",
            OutboundFrame::Pong(_) => "pong",
            OutboundFrame::Close(_) => "close",
        }
    }

    pub(crate) fn into_message(self) -> Message {
        match self {
            OutboundFrame::Text(text) => Message::Text(text),
            OutboundFrame::Ping(data) => Message::Ping(data),
            OutboundFrame::Pong(data) => Message::Pong(data),
            OutboundFrame::Close(payload) => Message::Close(close_frame_from_payload(&payload)),
        }
    }
}

/// Whether a peer may receive `code` in a close frame (RFC 6455 section 7.4).
///
/// 1004 and 1016..=2999 are reserved; 1005, 1006 and 1015 only exist locally.
fn is_sendable_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

/// Decode a close payload. Anything shorter than a status code, or carrying
/// a code that may not go on the wire, is a bare close.
fn close_frame_from_payload(payload: &[u8]) -> Option<CloseFrame<'static>> {
    if payload.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    if !is_sendable_close_code(code) {
        return None;
    }
    Some(CloseFrame {
        code: CloseCode::from(code),
        reason: Cow::Owned(String::from_utf8_lossy(&payload[2..]).into_owned()),
    })
}

/// Why a non-blocking enqueue was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TryEnqueueError {
    /// Queue at capacity
    Full,
    /// Queues have been shut
    Closed,
}

/// Sending side of the four outbound queues.
#[derive(Debug, Clone)]
pub(crate) struct FrameQueues {
    text: mpsc::Sender<String>,
    ping: mpsc::Sender<Vec<u8>>,
    pong: mpsc::Sender<Vec<u8>>,
    close: mpsc::Sender<Vec<u8>>,
    shut: Arc<AtomicBool>,
}

/// Receiving side of the four outbound queues, owned by the writer.
#[derive(Debug)]
pub(crate) struct FrameReceivers {
    pub(crate) text: mpsc::Receiver<String>,
    pub(crate) ping: mpsc::Receiver<Vec<u8>>,
    pub(crate) pong: mpsc::Receiver<Vec<u8>>,
    pub(crate) close: mpsc::Receiver<Vec<u8>>,
}

/// Create the four bounded outbound queues
pub(crate) fn frame_queues(capacity: usize) -> (FrameQueues, FrameReceivers) {
    let (text_tx, text_rx) = mpsc::channel(capacity);
    let (ping_tx, ping_rx) = mpsc::channel(capacity);
    let (pong_tx, pong_rx) = mpsc::channel(capacity);
    let (close_tx, close_rx) = mpsc::channel(capacity);

    (
        FrameQueues {
            text: text_tx,
            ping: ping_tx,
            pong: pong_tx,
            close: close_tx,
            shut: Arc::new(AtomicBool::new(false)),
        },
        FrameReceivers {
            text: text_rx,
            ping: ping_rx,
            pong: pong_rx,
            close: close_rx,
        },
    )
}

impl FrameQueues {
    /// Enqueue a frame, waiting for capacity.
    pub(crate) async fn enqueue(&self, frame: OutboundFrame) -> Result<(), Error> {
        if self.is_shut() {
            return Err(Error::Closed);
        }
        let sent = match frame {
            OutboundFrame::Text(text) => self.text.send(text).await.is_ok(),
            OutboundFrame::Ping(data) => self.ping.send(data).await.is_ok(),
            OutboundFrame::Pong(data) => self.pong.send(data).await.is_ok(),
            OutboundFrame::Close(data) => self.close.send(data).await.is_ok(),
        };
        if sent {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    /// Enqueue without waiting. Used from loops that must never block.
    pub(crate) fn try_enqueue(&self, frame: OutboundFrame) -> Result<(), TryEnqueueError> {
        if self.is_shut() {
            return Err(TryEnqueueError::Closed);
        }
        match frame {
            OutboundFrame::Text(text) => self.text.try_send(text).map_err(map_try_send),
            OutboundFrame::Ping(data) => self.ping.try_send(data).map_err(map_try_send),
            OutboundFrame::Pong(data) => self.pong.try_send(data).map_err(map_try_send),
            OutboundFrame::Close(data) => self.close.try_send(data).map_err(map_try_send),
        }
    }

    /// Refuse all further frames. Returns `true` only for the first caller.
    pub(crate) fn shut(&self) -> bool {
        !self.shut.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_shut(&self) -> bool {
        self.shut.load(Ordering::Acquire)
    }
}

fn map_try_send<T>(err: mpsc::error::TrySendError<T>) -> TryEnqueueError {
    match err {
        mpsc::error::TrySendError::Full(_) => TryEnqueueError::Full,
        mpsc::error::TrySendError::Closed(_) => TryEnqueueError::Closed,
    }
}

impl FrameReceivers {
    /// Close every queue. Consumes the receivers so it can only happen once.
    pub(crate) fn close(mut self) {
        self.text.close();
        self.ping.close();
        self.pong.close();
        self.close.close();
    }
}
