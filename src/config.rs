//! Configuration for the client and server halves of the FEP core.
//!
//! Both sides share the framer options and socket tuning; the client adds
//! endpoints, timers and the failure strategy, the server adds queue
//! capacities and routing policy. Configs are plain serde structs: load
//! them from a JSON file or build them in code and hand them to
//! `FiscClient::new` / `FiscServer::start`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::framing::FramerConfig;

/// One TCP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Shorthand constructor.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// `host:port` form for connect/bind calls.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Socket topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Two sockets: requests out one, responses in the other.
    Dual,
    /// One socket carries both directions.
    Unified,
}

/// What a single-sided channel failure means for the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStrategy {
    /// Tolerate one dead side; cancel in-flight work only when both die.
    FailWhenBothDown,
    /// Any dead side fails the client and cancels all in-flight work.
    FailWhenAnyDown,
    /// Renegotiate dual → unified after failure. Recognized so old config
    /// files parse, but rejected at validation: the switch protocol has
    /// no renegotiation handshake to implement it with.
    FallbackToSingle,
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Socket topology.
    pub mode: Mode,
    /// Primary endpoint of the send socket (dual mode).
    #[serde(default)]
    pub send: Option<Endpoint>,
    /// Backup endpoint of the send socket.
    #[serde(default)]
    pub send_backup: Option<Endpoint>,
    /// Primary endpoint of the receive socket (dual mode).
    #[serde(default)]
    pub receive: Option<Endpoint>,
    /// Backup endpoint of the receive socket.
    #[serde(default)]
    pub receive_backup: Option<Endpoint>,
    /// Endpoint of the single socket (unified mode).
    #[serde(default)]
    pub unified: Option<Endpoint>,
    /// Backup endpoint of the single socket.
    #[serde(default)]
    pub unified_backup: Option<Endpoint>,

    /// Institution id emitted in field 32 and used for server-side routing.
    pub institution_id: String,

    /// TCP connect timeout per endpoint attempt, in milliseconds.
    #[serde(default = "defaults::connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Default `send_and_receive` deadline, in milliseconds.
    #[serde(default = "defaults::read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Write-idle interval; the receive socket is dead after twice this.
    #[serde(default = "defaults::idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Heartbeat echo interval while signed on, in milliseconds.
    #[serde(default = "defaults::heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Heartbeat echo deadline, in milliseconds.
    #[serde(default = "defaults::heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Delay between reconnect attempts, in milliseconds.
    #[serde(default = "defaults::retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Reconnect attempts per side before giving up.
    #[serde(default = "defaults::max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Whether a dead side schedules reconnection at all.
    #[serde(default = "defaults::auto_reconnect")]
    pub auto_reconnect: bool,
    /// Failure strategy.
    #[serde(default = "defaults::failure_strategy")]
    pub failure_strategy: FailureStrategy,

    /// Length-prefix framing options.
    #[serde(default)]
    pub framer: FramerConfig,

    /// TCP_NODELAY on every socket.
    #[serde(default = "defaults::tcp_nodelay")]
    pub tcp_nodelay: bool,
    /// SO_KEEPALIVE on every socket.
    #[serde(default)]
    pub tcp_keepalive: bool,
    /// SO_RCVBUF hint, bytes.
    #[serde(default)]
    pub recv_buffer: Option<u32>,
    /// SO_SNDBUF hint, bytes.
    #[serde(default)]
    pub send_buffer: Option<u32>,
}

impl ClientConfig {
    /// A dual-channel config with everything else defaulted.
    pub fn dual(send: Endpoint, receive: Endpoint, institution_id: impl Into<String>) -> Self {
        Self {
            mode: Mode::Dual,
            send: Some(send),
            send_backup: None,
            receive: Some(receive),
            receive_backup: None,
            unified: None,
            unified_backup: None,
            institution_id: institution_id.into(),
            connect_timeout_ms: defaults::connect_timeout_ms(),
            read_timeout_ms: defaults::read_timeout_ms(),
            idle_timeout_ms: defaults::idle_timeout_ms(),
            heartbeat_interval_ms: defaults::heartbeat_interval_ms(),
            heartbeat_timeout_ms: defaults::heartbeat_timeout_ms(),
            retry_delay_ms: defaults::retry_delay_ms(),
            max_retry_attempts: defaults::max_retry_attempts(),
            auto_reconnect: defaults::auto_reconnect(),
            failure_strategy: defaults::failure_strategy(),
            framer: FramerConfig::default(),
            tcp_nodelay: defaults::tcp_nodelay(),
            tcp_keepalive: false,
            recv_buffer: None,
            send_buffer: None,
        }
    }

    /// A unified-mode config with everything else defaulted.
    pub fn unified(endpoint: Endpoint, institution_id: impl Into<String>) -> Self {
        let mut config = Self::dual(
            Endpoint::new("", 0),
            Endpoint::new("", 0),
            institution_id,
        );
        config.mode = Mode::Unified;
        config.send = None;
        config.receive = None;
        config.unified = Some(endpoint);
        config
    }

    /// Load and validate a config from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read client config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse client config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            Mode::Dual => {
                if self.send.is_none() || self.receive.is_none() {
                    anyhow::bail!("dual mode needs both send and receive endpoints");
                }
            }
            Mode::Unified => {
                if self.unified.is_none() {
                    anyhow::bail!("unified mode needs the unified endpoint");
                }
            }
        }
        if self.failure_strategy == FailureStrategy::FallbackToSingle {
            anyhow::bail!(
                "failure strategy FALLBACK_TO_SINGLE is not supported: \
                 the switch offers no dual-to-unified renegotiation"
            );
        }
        if !(1..=4).contains(&self.framer.length_width) {
            anyhow::bail!("framer length width must be 1..=4, got {}", self.framer.length_width);
        }
        if self.institution_id.is_empty() {
            anyhow::bail!("institution id must not be empty");
        }
        Ok(())
    }

    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Read timeout as a `Duration`.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Receive-socket staleness deadline: twice the idle interval.
    pub fn read_idle_deadline(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms * 2)
    }

    /// Heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat deadline as a `Duration`.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Reconnect delay as a `Duration`.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Socket topology.
    pub mode: Mode,
    /// Listener at which clients' requests arrive (dual mode).
    #[serde(default)]
    pub receive: Option<Endpoint>,
    /// Listener through which responses leave (dual mode).
    #[serde(default)]
    pub send: Option<Endpoint>,
    /// Single listener (unified mode).
    #[serde(default)]
    pub unified: Option<Endpoint>,

    /// Route responses by field 32. Off means every response may use any
    /// live send-side socket.
    #[serde(default = "defaults::routing_enabled")]
    pub routing_enabled: bool,
    /// Response code used when the validation callback rejects a request.
    #[serde(default = "defaults::validation_error_code")]
    pub validation_error_code: String,
    /// Artificial delay before each dispatched response, in milliseconds.
    #[serde(default)]
    pub response_delay_ms: u64,
    /// Bounded response queue capacity (drop-newest when full).
    #[serde(default = "defaults::response_queue_capacity")]
    pub response_queue_capacity: usize,
    /// Bounded inspection queue capacity (drop-oldest when full).
    #[serde(default = "defaults::inspection_queue_capacity")]
    pub inspection_queue_capacity: usize,

    /// Length-prefix framing options.
    #[serde(default)]
    pub framer: FramerConfig,
    /// TCP_NODELAY on accepted sockets.
    #[serde(default = "defaults::tcp_nodelay")]
    pub tcp_nodelay: bool,
}

impl ServerConfig {
    /// A dual-port config with everything else defaulted.
    pub fn dual(receive: Endpoint, send: Endpoint) -> Self {
        Self {
            mode: Mode::Dual,
            receive: Some(receive),
            send: Some(send),
            unified: None,
            routing_enabled: defaults::routing_enabled(),
            validation_error_code: defaults::validation_error_code(),
            response_delay_ms: 0,
            response_queue_capacity: defaults::response_queue_capacity(),
            inspection_queue_capacity: defaults::inspection_queue_capacity(),
            framer: FramerConfig::default(),
            tcp_nodelay: defaults::tcp_nodelay(),
        }
    }

    /// A unified-mode config with everything else defaulted.
    pub fn unified(endpoint: Endpoint) -> Self {
        let mut config = Self::dual(Endpoint::new("", 0), Endpoint::new("", 0));
        config.mode = Mode::Unified;
        config.receive = None;
        config.send = None;
        config.unified = Some(endpoint);
        config
    }

    /// Load and validate a config from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read server config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse server config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        match self.mode {
            Mode::Dual => {
                if self.receive.is_none() || self.send.is_none() {
                    anyhow::bail!("dual mode needs both receive and send listeners");
                }
            }
            Mode::Unified => {
                if self.unified.is_none() {
                    anyhow::bail!("unified mode needs the unified listener");
                }
            }
        }
        if !(1..=4).contains(&self.framer.length_width) {
            anyhow::bail!("framer length width must be 1..=4, got {}", self.framer.length_width);
        }
        if self.validation_error_code.len() != 2 {
            anyhow::bail!("validation error code must be two characters");
        }
        Ok(())
    }

    /// Response delay as a `Duration`, `None` when zero.
    pub fn response_delay(&self) -> Option<Duration> {
        (self.response_delay_ms > 0).then(|| Duration::from_millis(self.response_delay_ms))
    }
}

/// Serde default functions, sourced from `constants`.
mod defaults {
    use crate::config::FailureStrategy;
    use crate::constants;

    pub fn connect_timeout_ms() -> u64 {
        constants::DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
    }
    pub fn read_timeout_ms() -> u64 {
        constants::DEFAULT_READ_TIMEOUT.as_millis() as u64
    }
    pub fn idle_timeout_ms() -> u64 {
        constants::DEFAULT_IDLE_TIMEOUT.as_millis() as u64
    }
    pub fn heartbeat_interval_ms() -> u64 {
        constants::DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64
    }
    pub fn heartbeat_timeout_ms() -> u64 {
        constants::DEFAULT_HEARTBEAT_TIMEOUT.as_millis() as u64
    }
    pub fn retry_delay_ms() -> u64 {
        constants::DEFAULT_RETRY_DELAY.as_millis() as u64
    }
    pub fn max_retry_attempts() -> u32 {
        constants::DEFAULT_MAX_RETRY_ATTEMPTS
    }
    pub fn auto_reconnect() -> bool {
        true
    }
    pub fn failure_strategy() -> FailureStrategy {
        FailureStrategy::FailWhenBothDown
    }
    pub fn tcp_nodelay() -> bool {
        true
    }
    pub fn routing_enabled() -> bool {
        true
    }
    pub fn validation_error_code() -> String {
        constants::RESPONSE_VALIDATION_ERROR.to_string()
    }
    pub fn response_queue_capacity() -> usize {
        constants::DEFAULT_RESPONSE_QUEUE_CAPACITY
    }
    pub fn inspection_queue_capacity() -> usize {
        constants::DEFAULT_INSPECTION_QUEUE_CAPACITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_dual_requires_both_endpoints() {
        let mut config = ClientConfig::dual(
            Endpoint::new("127.0.0.1", 9001),
            Endpoint::new("127.0.0.1", 9002),
            "001",
        );
        assert!(config.validate().is_ok());
        config.receive = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fallback_to_single_rejected() {
        let mut config = ClientConfig::unified(Endpoint::new("127.0.0.1", 9001), "001");
        config.failure_strategy = FailureStrategy::FallbackToSingle;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("FALLBACK_TO_SINGLE"));
    }

    #[test]
    fn test_failure_strategy_wire_names() {
        let json = serde_json::to_string(&FailureStrategy::FailWhenBothDown).unwrap();
        assert_eq!(json, "\"FAIL_WHEN_BOTH_DOWN\"");
        let parsed: FailureStrategy = serde_json::from_str("\"FAIL_WHEN_ANY_DOWN\"").unwrap();
        assert_eq!(parsed, FailureStrategy::FailWhenAnyDown);
    }

    #[test]
    fn test_read_idle_is_double_idle() {
        let mut config = ClientConfig::unified(Endpoint::new("127.0.0.1", 9001), "001");
        config.idle_timeout_ms = 700;
        assert_eq!(config.read_idle_deadline(), Duration::from_millis(1400));
    }

    #[test]
    fn test_load_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "mode": "dual",
                "send": {{"host": "10.0.0.1", "port": 9001}},
                "receive": {{"host": "10.0.0.1", "port": 9002}},
                "send_backup": {{"host": "10.0.0.2", "port": 9001}},
                "institution_id": "001",
                "failure_strategy": "FAIL_WHEN_ANY_DOWN",
                "framer": {{
                    "length_width": 4,
                    "length_encoding": "ascii",
                    "length_inclusive": false,
                    "max_frame": 4096,
                    "min_frame": 12
                }}
            }}"#
        )
        .unwrap();

        let config = ClientConfig::load(file.path()).unwrap();
        assert_eq!(config.send.as_ref().unwrap().addr(), "10.0.0.1:9001");
        assert_eq!(config.failure_strategy, FailureStrategy::FailWhenAnyDown);
        assert_eq!(config.framer.length_width, 4);
        // Options absent from the file keep their defaults
        assert!(config.auto_reconnect);
        assert_eq!(config.max_retry_attempts, 10);
    }

    #[test]
    fn test_server_validation_code_length() {
        let mut config = ServerConfig::unified(Endpoint::new("127.0.0.1", 9001));
        assert!(config.validate().is_ok());
        config.validation_error_code = "300".into();
        assert!(config.validate().is_err());
    }
}
