//! Example: streaming Binance partial book depth
//!
//! Subscribes to `<symbol>@depth<levels>@100ms` and prints the best bid/ask
//! of every update. Set `WS_PROXY` to route through a proxy.
//!
//! Run with: cargo run --example binance_depth -- btcusdt 5

use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn, Level};
use ws_stream_manager::{
    ConnectionConfig, ConnectionInfo, ErrorKind, HandlerError, MessageHandler, StreamManager,
};

const BASE_URL: &str = "wss://stream.binance.com:9443/ws";

/// Partial book depth payload; prices and sizes arrive as strings
#[derive(Debug, Deserialize)]
struct DepthUpdate {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

struct DepthHandler {
    symbol: String,
}

impl MessageHandler for DepthHandler {
    async fn handle(&self, payload: Vec<u8>) -> Result<(), HandlerError> {
        let depth: DepthUpdate = serde_json::from_slice(&payload)?;
        let best_bid = depth.bids.first().map(|[price, _]| price.as_str()).unwrap_or("-");
        let best_ask = depth.asks.first().map(|[price, _]| price.as_str()).unwrap_or("-");
        info!(
            "{} #{} bid {} / ask {}",
            self.symbol, depth.last_update_id, best_bid, best_ask
        );
        Ok(())
    }

    async fn on_disconnect(&self, info: &ConnectionInfo) {
        warn!("{} stream lost (generation {})", self.symbol, info.generation);
    }

    async fn on_error(&self, kind: ErrorKind, message: &str) {
        warn!("{:?}: {}", kind, message);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let mut args = std::env::args().skip(1);
    let symbol = args.next().unwrap_or_else(|| "btcusdt".to_string());
    let levels: u32 = args.next().and_then(|s| s.parse().ok()).unwrap_or(5);
    let url = format!("{}/{}@depth{}@100ms", BASE_URL, symbol, levels);

    let config = ConnectionConfig::builder(url)
        .proxy(std::env::var("WS_PROXY").unwrap_or_default())
        .heartbeat_interval(Duration::from_secs(15))
        .name(format!("binance-{}", symbol))
        .build()?;

    let manager = StreamManager::new(config, DepthHandler { symbol });
    manager.start().await?;

    tokio::select! {
        result = manager.wait_closed() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            manager.close().await;
        }
    }

    let snapshot = manager.metrics().snapshot();
    info!(
        "Received {} messages, {} reconnections",
        snapshot.messages_received_total, snapshot.reconnections_total
    );
    Ok(())
}
