//! Connection configuration.
//!
//! Configuration is consumed once at construction and never re-read. It can be built in code
//! (starting from [`ConnectionConfig::default`]) or loaded from TOML:
//!
//! ```toml
//! endpoints = ["rabbit-1:5672", "rabbit-2:5672"]
//! virtual_host = "/"
//! connection_name = "billing-worker"
//! requested_heartbeat = 30
//!
//! [recovery]
//! enabled = true
//! interval = 5000
//! ```

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, DurationSeconds, serde_as};
use warren_primitives::{Endpoint, FRAME_OVERHEAD, Tuning, constants::FRAME_MIN_SIZE};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_VIRTUAL_HOST: &str = "/";
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(60);
const DEFAULT_FRAME_MAX: u32 = 131_072;
const DEFAULT_CHANNEL_MAX: u16 = 2047;
const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RECOVERY_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_RECOVERY_MAX_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_RECOVERY_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("No endpoints configured")]
    NoEndpoints,
    #[error("Heartbeat interval {0:?} does not fit in 16-bit seconds")]
    HeartbeatTooLarge(Duration),
    #[error("Frame max {0} is below the protocol minimum {FRAME_MIN_SIZE}")]
    FrameMaxTooSmall(u32),
    #[error("Recovery backoff multiplier must be >= 1.0, got {0}")]
    InvalidBackoffMultiplier(f64),
}

/// Configuration for a single logical broker connection.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Broker endpoints, tried in order.
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<Endpoint>,

    /// Virtual host opened after negotiation.
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,

    /// Client-provided connection name, shown in broker management tools.
    #[serde(default)]
    pub connection_name: Option<String>,

    /// Requested heartbeat interval (seconds in TOML). Zero disables heartbeats.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "default_heartbeat")]
    pub requested_heartbeat: Duration,

    /// Requested maximum frame size. Zero means no limit.
    #[serde(default = "default_frame_max")]
    pub requested_frame_max: u32,

    /// Requested maximum channel number. Zero means no limit.
    #[serde(default = "default_channel_max")]
    pub requested_channel_max: u16,

    /// Timeout for a single synchronous channel RPC (milliseconds in TOML).
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout: Duration,

    /// Deadline for connecting and negotiating with one endpoint (milliseconds in TOML).
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: Duration,

    /// Deadline for closes the library starts on its own (milliseconds in TOML).
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,

    /// Automatic recovery settings.
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            virtual_host: default_virtual_host(),
            connection_name: None,
            requested_heartbeat: default_heartbeat(),
            requested_frame_max: default_frame_max(),
            requested_channel_max: default_channel_max(),
            rpc_timeout: default_rpc_timeout(),
            handshake_timeout: default_handshake_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            recovery: RecoveryConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Parse configuration from a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        if self.requested_heartbeat.as_secs() > u64::from(u16::MAX) {
            return Err(ConfigError::HeartbeatTooLarge(self.requested_heartbeat));
        }
        if self.requested_frame_max != 0 && self.requested_frame_max < FRAME_MIN_SIZE {
            return Err(ConfigError::FrameMaxTooSmall(self.requested_frame_max));
        }
        self.recovery.validate()
    }

    /// Tuning proposal sent during negotiation.
    pub fn requested_tuning(&self) -> Tuning {
        Tuning {
            channel_max: self.requested_channel_max,
            frame_max: self.requested_frame_max,
            heartbeat: u16::try_from(self.requested_heartbeat.as_secs()).unwrap_or(u16::MAX),
        }
    }

    pub fn with_endpoints(mut self, endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        self.endpoints = endpoints.into_iter().collect();
        self
    }

    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.requested_heartbeat = heartbeat;
        self
    }

    pub fn with_recovery(mut self, recovery: RecoveryConfig) -> Self {
        self.recovery = recovery;
        self
    }
}

/// Largest body payload that fits in one frame under `frame_max` (zero = unlimited).
pub(crate) fn max_body_chunk(frame_max: u32) -> Option<usize> {
    (frame_max > FRAME_OVERHEAD).then(|| (frame_max - FRAME_OVERHEAD) as usize)
}

/// Automatic recovery settings.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Whether to recover automatically from unexpected connection loss.
    #[serde(default = "default_recovery_enabled")]
    pub enabled: bool,

    /// Wait before the first reconnect attempt (milliseconds in TOML).
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_recovery_interval")]
    pub interval: Duration,

    /// Upper bound for the backoff between attempts (milliseconds in TOML).
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(default = "default_recovery_max_interval")]
    pub max_interval: Duration,

    /// Growth factor applied to the wait after each failed attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Connect attempts before giving up. Each attempt walks the whole endpoint list.
    #[serde(default = "default_recovery_attempts")]
    pub max_attempts: u32,

    /// Whether to replay recorded exchanges, queues, bindings and consumers.
    #[serde(default = "default_recovery_enabled")]
    pub topology: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: default_recovery_enabled(),
            interval: default_recovery_interval(),
            max_interval: default_recovery_max_interval(),
            backoff_multiplier: default_backoff_multiplier(),
            max_attempts: default_recovery_attempts(),
            topology: default_recovery_enabled(),
        }
    }
}

impl RecoveryConfig {
    /// Recovery switched off entirely.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.backoff_multiplier >= 1.0) {
            return Err(ConfigError::InvalidBackoffMultiplier(self.backoff_multiplier));
        }
        Ok(())
    }
}

fn default_endpoints() -> Vec<Endpoint> {
    vec![Endpoint::new(DEFAULT_HOST, Endpoint::DEFAULT_PORT)]
}

fn default_virtual_host() -> String {
    DEFAULT_VIRTUAL_HOST.to_string()
}

fn default_heartbeat() -> Duration {
    DEFAULT_HEARTBEAT
}

fn default_frame_max() -> u32 {
    DEFAULT_FRAME_MAX
}

fn default_channel_max() -> u16 {
    DEFAULT_CHANNEL_MAX
}

fn default_rpc_timeout() -> Duration {
    DEFAULT_RPC_TIMEOUT
}

fn default_handshake_timeout() -> Duration {
    DEFAULT_HANDSHAKE_TIMEOUT
}

fn default_shutdown_timeout() -> Duration {
    DEFAULT_SHUTDOWN_TIMEOUT
}

fn default_recovery_enabled() -> bool {
    true
}

fn default_recovery_interval() -> Duration {
    DEFAULT_RECOVERY_INTERVAL
}

fn default_recovery_max_interval() -> Duration {
    DEFAULT_RECOVERY_MAX_INTERVAL
}

fn default_backoff_multiplier() -> f64 {
    DEFAULT_BACKOFF_MULTIPLIER
}

fn default_recovery_attempts() -> u32 {
    DEFAULT_RECOVERY_ATTEMPTS
}
