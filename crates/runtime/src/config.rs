//! Runtime configuration.
//!
//! Everything is defaulted, so an empty JSON object is a valid config:
//!
//! ```json
//! {
//!   "gateway": { "host": "127.0.0.1", "port": 8022, "path": "/ws" },
//!   "connectTimeoutMs": 10000,
//!   "keepalive": { "intervalMs": 30000, "maxMissedProbes": 3 },
//!   "reconnect": { "baseDelayMs": 1000, "maxAttempts": 3 }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_protocol::{ConnectionConfig, OperationKind};

use crate::error::{Error, Result};

/// Top-level configuration for a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManagerConfig {
	pub gateway: GatewayConfig,
	/// Per address-family bound on TCP connect plus WebSocket upgrade.
	#[serde(rename = "connectTimeoutMs", with = "millis")]
	pub connect_timeout: Duration,
	/// Bound on waiting for the `connected` acknowledgement.
	#[serde(rename = "handshakeTimeoutMs", with = "millis")]
	pub handshake_timeout: Duration,
	/// How long `close_session` waits for the session task to finish teardown.
	#[serde(rename = "closeGraceMs", with = "millis")]
	pub close_grace: Duration,
	pub keepalive: KeepAliveConfig,
	pub reconnect: ReconnectPolicy,
	pub operation_timeouts: OperationTimeouts,
	/// Cap of the buffer holding output received before a sink attaches.
	pub pre_attach_buffer_bytes: usize,
	pub terminal: TerminalSize,
}

impl Default for ManagerConfig {
	fn default() -> Self {
		Self {
			gateway: GatewayConfig::default(),
			connect_timeout: Duration::from_secs(10),
			handshake_timeout: Duration::from_secs(10),
			close_grace: Duration::from_secs(2),
			keepalive: KeepAliveConfig::default(),
			reconnect: ReconnectPolicy::default(),
			operation_timeouts: OperationTimeouts::default(),
			pre_attach_buffer_bytes: DEFAULT_PRE_ATTACH_BUFFER_BYTES,
			terminal: TerminalSize::default(),
		}
	}
}

/// 5 MiB.
pub const DEFAULT_PRE_ATTACH_BUFFER_BYTES: usize = 5 * 1024 * 1024;

impl ManagerConfig {
	/// Loads and validates a JSON config file.
	pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let raw = std::fs::read_to_string(path)?;
		let config: Self = serde_json::from_str(&raw)?;
		config.validate()?;
		tracing::debug!(target: "tether.config", path = %path.display(), "loaded manager config");
		Ok(config)
	}

	/// Checks invariants serde cannot express.
	pub fn validate(&self) -> Result<()> {
		if self.gateway.host.trim().is_empty() {
			return Err(Error::InvalidConfig("gateway.host must not be empty".into()));
		}
		if self.gateway.port == 0 {
			return Err(Error::InvalidConfig("gateway.port must be non-zero".into()));
		}
		if !self.gateway.path.starts_with('/') {
			return Err(Error::InvalidConfig(format!("gateway.path must start with '/': {}", self.gateway.path)));
		}
		if self.connect_timeout.is_zero() || self.handshake_timeout.is_zero() {
			return Err(Error::InvalidConfig("connect and handshake timeouts must be non-zero".into()));
		}
		if self.keepalive.interval.is_zero() {
			return Err(Error::InvalidConfig("keepalive.intervalMs must be non-zero".into()));
		}
		if self.keepalive.max_missed_probes == Some(0) {
			return Err(Error::InvalidConfig("keepalive.maxMissedProbes must be at least 1 when set".into()));
		}
		Ok(())
	}
}

/// Where the gateway listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
	pub host: String,
	pub port: u16,
	/// WebSocket path, e.g. `/ws`.
	pub path: String,
	/// Use `wss://`.
	pub secure: bool,
	/// Try IPv6 before IPv4.
	pub prefer_ipv6: bool,
}

impl Default for GatewayConfig {
	fn default() -> Self {
		Self {
			host: "localhost".into(),
			port: 8022,
			path: "/ws".into(),
			secure: false,
			prefer_ipv6: false,
		}
	}
}

impl GatewayConfig {
	/// WebSocket URL used for the upgrade request.
	pub fn url(&self) -> String {
		let scheme = if self.secure { "wss" } else { "ws" };
		let host = if self.host.parse::<std::net::Ipv6Addr>().is_ok() {
			format!("[{}]", self.host)
		} else {
			self.host.clone()
		};
		format!("{scheme}://{host}:{}{}", self.port, self.path)
	}
}

/// Keepalive probing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KeepAliveConfig {
	/// Nominal liveness interval; probes go out every `interval / 2`.
	#[serde(rename = "intervalMs", with = "millis")]
	pub interval: Duration,
	/// Age after which an unanswered probe is dropped.
	#[serde(rename = "probeExpiryMs", with = "millis")]
	pub probe_expiry: Duration,
	/// Consecutive expired probes that count as a dead transport.
	/// `None` keeps expiry advisory.
	pub max_missed_probes: Option<u32>,
}

impl Default for KeepAliveConfig {
	fn default() -> Self {
		Self {
			interval: Duration::from_secs(30),
			probe_expiry: Duration::from_secs(10),
			max_missed_probes: None,
		}
	}
}

impl KeepAliveConfig {
	pub fn probe_period(&self) -> Duration {
		self.interval / 2
	}
}

/// Linear reconnection backoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectPolicy {
	#[serde(rename = "baseDelayMs", with = "millis")]
	pub base_delay: Duration,
	pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self {
			base_delay: Duration::from_secs(1),
			max_attempts: 3,
		}
	}
}

impl ReconnectPolicy {
	/// Delay before attempt `attempt` (1-indexed): `base_delay × attempt`.
	pub fn delay_for(&self, attempt: u32) -> Duration {
		self.base_delay.saturating_mul(attempt.max(1))
	}

	pub fn allows(&self, attempt: u32) -> bool {
		attempt <= self.max_attempts
	}
}

/// Per-kind operation deadlines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OperationTimeouts {
	#[serde(rename = "listMs", with = "millis")]
	pub list: Duration,
	#[serde(rename = "uploadMs", with = "millis")]
	pub upload: Duration,
	#[serde(rename = "downloadMs", with = "millis")]
	pub download: Duration,
	/// mkdir, delete, rename and chmod.
	#[serde(rename = "mutateMs", with = "millis")]
	pub mutate: Duration,
	#[serde(rename = "execMs", with = "millis")]
	pub exec: Duration,
	/// init, close and cancel.
	#[serde(rename = "controlMs", with = "millis")]
	pub control: Duration,
}

impl Default for OperationTimeouts {
	fn default() -> Self {
		Self {
			list: Duration::from_secs(30),
			upload: Duration::from_secs(60),
			download: Duration::from_secs(600),
			mutate: Duration::from_secs(30),
			exec: Duration::from_secs(30),
			control: Duration::from_secs(10),
		}
	}
}

impl OperationTimeouts {
	pub fn for_kind(&self, kind: OperationKind) -> Duration {
		match kind {
			OperationKind::List => self.list,
			OperationKind::Upload => self.upload,
			OperationKind::Download => self.download,
			OperationKind::Mkdir | OperationKind::Delete | OperationKind::Rename | OperationKind::Chmod => self.mutate,
			OperationKind::Exec => self.exec,
			OperationKind::Init | OperationKind::Close | OperationKind::Cancel => self.control,
		}
	}
}

/// Initial terminal geometry announced in the CONNECT frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalSize {
	pub cols: u16,
	pub rows: u16,
}

impl Default for TerminalSize {
	fn default() -> Self {
		Self { cols: 80, rows: 24 }
	}
}

/// Supplies connection targets by name.
pub trait ConfigProvider: Send + Sync {
	fn connection(&self, name: &str) -> Option<ConnectionConfig>;
}

/// In-memory [`ConfigProvider`], loadable from a JSON object of
/// `name -> ConnectionConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticConfigProvider {
	connections: HashMap<String, ConnectionConfig>,
}

impl StaticConfigProvider {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
		let raw = std::fs::read_to_string(path)?;
		Ok(serde_json::from_str(&raw)?)
	}

	pub fn insert(&mut self, name: impl Into<String>, config: ConnectionConfig) {
		self.connections.insert(name.into(), config);
	}

	pub fn names(&self) -> impl Iterator<Item = &str> {
		self.connections.keys().map(String::as_str)
	}
}

impl ConfigProvider for StaticConfigProvider {
	fn connection(&self, name: &str) -> Option<ConnectionConfig> {
		self.connections.get(name).cloned()
	}
}

/// Serde helpers for `Duration` as integer milliseconds.
mod millis {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(duration: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
	}

	pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		Ok(Duration::from_millis(u64::deserialize(deserializer)?))
	}
}
