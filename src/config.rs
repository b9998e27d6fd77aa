use http::{HeaderName, HeaderValue};
use std::time::Duration;
use url::Url;

/// Default base interval for linear reconnect backoff
const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);
/// Default reconnect attempt budget
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 100;
/// Read deadline used when no heartbeat is configured
const DEFAULT_READ_DEADLINE: Duration = Duration::from_secs(60);
/// Handshake timeout of the dialer
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound of each outbound frame queue
const DEFAULT_QUEUE_CAPACITY: usize = 32;
/// Bound of the reader -> handler dispatch channel
const DEFAULT_DISPATCH_CAPACITY: usize = 1024;

/// What the writer does when a frame fails to go out on the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteFailurePolicy {
    /// Treat the failure like a read failure and hand the connection to the
    /// reconnect supervisor.
    #[default]
    Reconnect,
    /// Log the failure and keep writing to the same socket.
    LogAndContinue,
}

/// Configuration for a single streaming connection.
///
/// Immutable once built. Use [`ConnectionConfig::builder`] to construct one.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint (`ws://` or `wss://`)
    pub url: String,
    /// Optional proxy (`socks5://`, `socks5h://`, `http://`, `https://` or bare `host:port`)
    pub proxy: Option<String>,
    /// Extra headers sent with the handshake request
    pub headers: Vec<(HeaderName, HeaderValue)>,
    /// Interval between outbound pings. `Duration::ZERO` disables the heartbeat.
    pub heartbeat_interval: Duration,
    /// Interval between synthetic pong keep-alives, for exchanges that expect them
    pub pong_keepalive_interval: Option<Duration>,
    /// Explicit read deadline; derived from the heartbeat when unset
    pub read_deadline: Option<Duration>,
    /// Timeout for TCP connect + proxy tunnel + WebSocket handshake
    pub handshake_timeout: Duration,
    /// Reconnect automatically when the socket fails
    pub auto_reconnect: bool,
    /// Backoff settings for reconnection
    pub reconnect: ReconnectConfig,
    /// How write failures are handled
    pub write_failure_policy: WriteFailurePolicy,
    /// Reconnect (instead of tearing down) when the peer sends a close frame
    pub reconnect_on_peer_close: bool,
    /// Log handshake responses at debug level
    pub dump_responses: bool,
    /// Capacity of each outbound frame queue
    pub queue_capacity: usize,
    /// Capacity of the channel between the read loop and the handler
    pub dispatch_capacity: usize,
    /// Label used in log lines; defaults to the URL host
    pub name: Option<String>,
}

impl ConnectionConfig {
    /// Create a new builder for the given endpoint
    pub fn builder(url: impl Into<String>) -> ConnectionConfigBuilder {
        ConnectionConfigBuilder {
            config: ConnectionConfig {
                url: url.into(),
                proxy: None,
                headers: Vec::new(),
                heartbeat_interval: Duration::ZERO,
                pong_keepalive_interval: None,
                read_deadline: None,
                handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
                auto_reconnect: true,
                reconnect: ReconnectConfig::default(),
                write_failure_policy: WriteFailurePolicy::default(),
                reconnect_on_peer_close: false,
                dump_responses: true,
                queue_capacity: DEFAULT_QUEUE_CAPACITY,
                dispatch_capacity: DEFAULT_DISPATCH_CAPACITY,
                name: None,
            },
            header_error: None,
        }
    }

    /// Whether outbound pings are generated at all
    pub fn heartbeat_enabled(&self) -> bool {
        !self.heartbeat_interval.is_zero()
    }

    /// Sliding read deadline: the explicit override, else twice the heartbeat
    /// interval, else one minute.
    pub fn effective_read_deadline(&self) -> Duration {
        match self.read_deadline {
            Some(deadline) => deadline,
            None if self.heartbeat_enabled() => self.heartbeat_interval * 2,
            None => DEFAULT_READ_DEADLINE,
        }
    }

    /// Label used as the `[..]` prefix of log lines
    pub fn label(&self) -> String {
        if let Some(ref name) = self.name {
            return name.clone();
        }
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| self.url.clone())
    }
}

/// Builder for [`ConnectionConfig`]
#[derive(Debug, Clone)]
pub struct ConnectionConfigBuilder {
    config: ConnectionConfig,
    header_error: Option<String>,
}

impl ConnectionConfigBuilder {
    /// Route the connection through a proxy. An empty string means no proxy.
    pub fn proxy(mut self, proxy: impl Into<String>) -> Self {
        let proxy = proxy.into();
        self.config.proxy = if proxy.trim().is_empty() { None } else { Some(proxy) };
        self
    }

    /// Add a handshake header. Invalid names or values surface from `build()`.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => self.config.headers.push((name, value)),
            _ => {
                self.header_error.get_or_insert_with(|| name.to_string());
            }
        }
        self
    }

    /// Set the heartbeat interval (`Duration::ZERO` disables it)
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    /// Emit synthetic pong frames on a fixed interval
    pub fn pong_keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.pong_keepalive_interval = Some(interval);
        self
    }

    /// Override the derived read deadline
    pub fn read_deadline(mut self, deadline: Duration) -> Self {
        self.config.read_deadline = Some(deadline);
        self
    }

    /// Set the handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Enable or disable automatic reconnection
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    /// Set reconnect configuration
    pub fn reconnect(mut self, config: ReconnectConfig) -> Self {
        self.config.reconnect = config;
        self
    }

    /// Set the write failure policy
    pub fn write_failure_policy(mut self, policy: WriteFailurePolicy) -> Self {
        self.config.write_failure_policy = policy;
        self
    }

    /// Reconnect instead of closing when the peer sends a close frame
    pub fn reconnect_on_peer_close(mut self, enabled: bool) -> Self {
        self.config.reconnect_on_peer_close = enabled;
        self
    }

    /// Enable or disable handshake response dumps
    pub fn dump_responses(mut self, enabled: bool) -> Self {
        self.config.dump_responses = enabled;
        self
    }

    /// Set the capacity of each outbound queue
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Set the capacity of the handler dispatch channel
    pub fn dispatch_capacity(mut self, capacity: usize) -> Self {
        self.config.dispatch_capacity = capacity;
        self
    }

    /// Set the log label
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    /// Build the configuration with validation.
    pub fn build(self) -> Result<ConnectionConfig, ConfigError> {
        let url = Url::parse(&self.config.url)
            .map_err(|e| ConfigError::InvalidUrl(format!("{}: {}", self.config.url, e)))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ConfigError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(ConfigError::InvalidUrl("missing host".to_string()));
        }

        if let Some(name) = self.header_error {
            return Err(ConfigError::InvalidHeader(name));
        }

        if self.config.reconnect.interval.is_zero() {
            return Err(ConfigError::InvalidReconnect(
                "interval must be > 0".to_string(),
            ));
        }
        if self.config.reconnect.max_attempts == 0 {
            return Err(ConfigError::InvalidReconnect(
                "max_attempts must be > 0".to_string(),
            ));
        }

        if let Some(deadline) = self.config.read_deadline {
            if self.config.heartbeat_enabled() && deadline <= self.config.heartbeat_interval {
                return Err(ConfigError::InvalidHeartbeat(
                    "read_deadline must be longer than heartbeat_interval".to_string(),
                ));
            }
        }
        if matches!(self.config.pong_keepalive_interval, Some(d) if d.is_zero()) {
            return Err(ConfigError::InvalidHeartbeat(
                "pong_keepalive_interval must be > 0".to_string(),
            ));
        }

        if self.config.queue_capacity == 0 || self.config.dispatch_capacity == 0 {
            return Err(ConfigError::InvalidCapacity(
                "queue and dispatch capacities must be > 0".to_string(),
            ));
        }

        Ok(self.config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Endpoint is not a usable WebSocket URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    /// Header name or value could not be encoded
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
    /// Invalid reconnect configuration
    #[error("Invalid reconnect configuration: {0}")]
    InvalidReconnect(String),
    /// Invalid heartbeat configuration
    #[error("Invalid heartbeat configuration: {0}")]
    InvalidHeartbeat(String),
    /// Invalid channel capacity
    #[error("Invalid capacity: {0}")]
    InvalidCapacity(String),
}

/// Linear backoff configuration for reconnection
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Base interval; retry `k` waits `interval * k`
    pub interval: Duration,
    /// Number of dial attempts before the connection is given up
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RECONNECT_INTERVAL,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectConfig {
    /// Delay after the failed attempt `attempt` (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.interval.saturating_mul(attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_delay_calculation() {
        let config = ReconnectConfig {
            interval: Duration::from_millis(100),
            max_attempts: 100,
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(300));
        assert_eq!(config.delay_for_attempt(100), Duration::from_secs(10));
    }

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::builder("wss://stream.binance.com:9443/ws")
            .build()
            .expect("valid config");

        assert!(config.auto_reconnect);
        assert!(!config.heartbeat_enabled());
        assert_eq!(config.reconnect.interval, Duration::from_secs(10));
        assert_eq!(config.reconnect.max_attempts, 100);
        assert_eq!(config.effective_read_deadline(), Duration::from_secs(60));
        assert_eq!(config.write_failure_policy, WriteFailurePolicy::Reconnect);
        assert_eq!(config.label(), "stream.binance.com");
    }

    #[test]
    fn test_read_deadline_follows_heartbeat() {
        let config = ConnectionConfig::builder("ws://127.0.0.1:9000")
            .heartbeat_interval(Duration::from_secs(5))
            .build()
            .expect("valid config");

        assert_eq!(config.effective_read_deadline(), Duration::from_secs(10));
    }

    #[test]
    fn test_empty_proxy_is_none() {
        let config = ConnectionConfig::builder("ws://127.0.0.1:9000")
            .proxy("")
            .name("feed")
            .build()
            .expect("valid config");

        assert!(config.proxy.is_none());
        assert_eq!(config.label(), "feed");
    }

    #[test]
    fn test_builder_rejects_bad_scheme() {
        let result = ConnectionConfig::builder("https://example.com").build();
        assert!(matches!(result, Err(ConfigError::InvalidUrl(_))));
    }

    #[test]
    fn test_builder_rejects_zero_attempts() {
        let result = ConnectionConfig::builder("ws://example.com")
            .reconnect(ReconnectConfig {
                interval: Duration::from_secs(1),
                max_attempts: 0,
            })
            .build();

        assert!(matches!(result, Err(ConfigError::InvalidReconnect(_))));
    }

    #[test]
    fn test_builder_rejects_deadline_shorter_than_heartbeat() {
        let result = ConnectionConfig::builder("ws://example.com")
            .heartbeat_interval(Duration::from_secs(5))
            .read_deadline(Duration::from_secs(5))
            .build();

        assert!(matches!(result, Err(ConfigError::InvalidHeartbeat(_))));
    }

    #[test]
    fn test_builder_rejects_invalid_header() {
        let result = ConnectionConfig::builder("ws://example.com")
            .header("bad header", "value")
            .build();

        assert!(matches!(result, Err(ConfigError::InvalidHeader(_))));
    }

    #[test]
    fn test_builder_collects_headers() {
        let config = ConnectionConfig::builder("ws://example.com")
            .header("X-MBX-APIKEY", "key")
            .build()
            .expect("valid config");

        assert_eq!(config.headers.len(), 1);
        assert_eq!(config.headers[0].0.as_str(), "x-mbx-apikey");
    }
}
