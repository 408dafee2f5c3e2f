//! Error types for the tether runtime.

use std::time::Duration;

use tether_protocol::{FrameError, OperationKind};
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while managing gateway sessions.
#[derive(Debug, Error)]
pub enum Error {
	/// Malformed wire data.
	#[error("Frame error: {0}")]
	Frame(#[from] FrameError),

	/// No transport could be established, or it died before the handshake
	/// completed.
	#[error("Failed to connect to gateway: {0}")]
	Connect(String),

	/// No `connected` acknowledgement within the handshake timeout.
	#[error("Timed out after {0:?} waiting for the gateway to acknowledge the connection")]
	ConnectTimeout(Duration),

	/// The gateway rejected the credentials.
	#[error("Authentication failed: {0}")]
	Auth(String),

	/// An operation did not complete in time.
	#[error("{kind} operation {id} timed out after {after:?}")]
	Timeout { kind: OperationKind, id: u64, after: Duration },

	/// The transport went away.
	#[error("Transport closed{}", code.map(|c| format!(" (code {c})")).unwrap_or_default())]
	TransportClosed { code: Option<u16>, reason: String },

	/// The gateway reported a failed operation. The session stays alive.
	#[error("{kind} operation failed: {message}")]
	Operation { kind: OperationKind, message: String },

	/// Operation cancelled by the caller.
	#[error("{kind} operation {id} cancelled")]
	Cancelled { kind: OperationKind, id: u64 },

	#[error("Session not found: {0}")]
	SessionNotFound(String),

	#[error("Session {0} is closed")]
	SessionClosed(String),

	/// The session is reconnecting and cannot carry traffic right now.
	#[error("Session {0} is not connected")]
	NotConnected(String),

	#[error("Reconnection gave up after {attempts} attempts: {last_error}")]
	ReconnectExhausted { attempts: u32, last_error: String },

	/// Internal channel closed unexpectedly.
	#[error("Channel closed unexpectedly")]
	ChannelClosed,

	#[error("Invalid configuration: {0}")]
	InvalidConfig(String),

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("WebSocket error: {0}")]
	WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
	/// Returns true for connect and operation timeouts.
	pub fn is_timeout(&self) -> bool {
		matches!(self, Error::Timeout { .. } | Error::ConnectTimeout(_))
	}

	/// Returns true for failures the reconnection policy may retry.
	///
	/// Authentication failures are terminal.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			Error::Connect(_)
				| Error::ConnectTimeout(_)
				| Error::TransportClosed { .. }
				| Error::Io(_)
				| Error::WebSocket(_)
		)
	}

	/// Returns true for authentication rejections.
	pub fn is_auth(&self) -> bool {
		matches!(self, Error::Auth(_))
	}
}
