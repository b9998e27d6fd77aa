//! # ws-stream-manager
//!
//! A resilient manager for a single streaming WebSocket connection, built for
//! market-data feeds that must stay up for days.
//!
//! ## Features
//!
//! - **Single-writer socket**: one task owns all writes, fed by four bounded
//!   queues (text, ping, pong, close)
//! - **Sliding read deadline**: any inbound frame extends it; silence is a failure
//! - **Heartbeats**: periodic pings, plus optional synthetic pong keep-alives
//! - **Linear-backoff reconnection**: retry `k` waits `interval * k`, up to 100 attempts
//! - **Ordered, isolated dispatch**: payloads reach the handler in socket order;
//!   handler errors and panics never touch the transport
//! - **Proxies**: SOCKS5 and HTTP CONNECT, with custom handshake headers
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use ws_stream_manager::{ConnectionConfig, ConnectionInfo, HandlerError, MessageHandler, OutboundFrame, StreamManager};
//! use std::time::Duration;
//!
//! struct Trades;
//!
//! impl MessageHandler for Trades {
//!     async fn handle(&self, payload: Vec<u8>) -> Result<(), HandlerError> {
//!         println!("{}", String::from_utf8_lossy(&payload));
//!         Ok(())
//!     }
//!
//!     async fn on_connect(&self, _info: &ConnectionInfo) -> Vec<OutboundFrame> {
//!         vec![OutboundFrame::Text(r#"{"method":"SUBSCRIBE","params":["btcusdt@trade"],"id":1}"#.into())]
//!     }
//! }
//!
//! let config = ConnectionConfig::builder("wss://stream.binance.com:9443/ws")
//!     .heartbeat_interval(Duration::from_secs(15))
//!     .build()?;
//!
//! let manager = StreamManager::new(config, Trades);
//! manager.start().await?;
//! manager.wait_closed().await?;
//! ```

mod config;
mod error;
mod frame;
mod handler;
mod heartbeat;
mod liveness;
mod manager;
mod metrics;
mod reader;
mod reconnect;
mod state;
mod transport;
mod writer;

pub use config::{ConfigError, ConnectionConfig, ConnectionConfigBuilder, ReconnectConfig, WriteFailurePolicy};
pub use error::{Error, ErrorKind};
pub use frame::OutboundFrame;
pub use handler::{handler_fn, ConnectionInfo, HandlerError, HandlerFn, MessageHandler};
pub use manager::StreamManager;
pub use metrics::{Metrics, MetricsSnapshot};
pub use state::{ConnectionState, TerminalReason};

// Re-export http types for handshake headers
pub use http::{HeaderName, HeaderValue};

/// Result type for ws-stream-manager operations
pub type Result<T> = std::result::Result<T, Error>;
