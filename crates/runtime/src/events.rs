//! Session events broadcast by the [`SessionManager`](crate::SessionManager).

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use crate::session::SessionState;

/// Something that happened to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
	pub session_id: Arc<str>,
	pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
	/// Handshake acknowledged, initially or after a reconnect.
	Connected,
	StatusChange { from: SessionState, to: SessionState },
	/// `terminal` errors are followed by the session closing.
	Error { message: String, terminal: bool },
	Latency(Duration),
}

impl SessionEvent {
	pub fn new(session_id: Arc<str>, kind: SessionEventKind) -> Self {
		Self { session_id, kind }
	}

	/// Event name as exposed to consumers.
	pub fn name(&self) -> &'static str {
		match self.kind {
			SessionEventKind::Connected => "connected",
			SessionEventKind::StatusChange { .. } => "status-change",
			SessionEventKind::Error { .. } => "error",
			SessionEventKind::Latency(_) => "latency",
		}
	}

	/// JSON body of the event.
	pub fn payload(&self) -> Value {
		let session_id = self.session_id.as_ref();
		match &self.kind {
			SessionEventKind::Connected => json!({ "sessionId": session_id }),
			SessionEventKind::StatusChange { from, to } => json!({
				"sessionId": session_id,
				"from": from.as_str(),
				"status": to.as_str(),
			}),
			SessionEventKind::Error { message, terminal } => json!({
				"sessionId": session_id,
				"message": message,
				"terminal": terminal,
			}),
			SessionEventKind::Latency(latency) => json!({
				"sessionId": session_id,
				"latency": u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
			}),
		}
	}

	pub fn is_terminal_error(&self) -> bool {
		matches!(self.kind, SessionEventKind::Error { terminal: true, .. })
	}
}
