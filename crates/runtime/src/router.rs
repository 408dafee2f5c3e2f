//! Inbound classification and dispatch.
//!
//! Every WebSocket message is turned into an [`Inbound`] exactly once, whether
//! it arrived as a binary frame or as a text envelope. Operation replies go
//! straight to the [`OperationCorrelator`]; everything else comes back to the
//! session task as a [`Signal`]. Nothing in here can fail the session: bad
//! input is logged and dropped.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tether_protocol::{Envelope, Frame, MessageType, OPERATION_ID_FIELD, Progress};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use crate::correlator::{OperationCorrelator, OperationReply};
use crate::error::Error;

/// Distinct unknown type names remembered per session. Past this, every
/// unknown type logs at debug.
const MAX_TRACKED_UNKNOWN: usize = 32;

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
	/// Handshake acknowledgement.
	Connected { info: Value },
	/// Session-level error reported by the gateway.
	Error { message: String },
	/// The gateway closed the remote shell.
	Closed { reason: String },
	/// Terminal output.
	Data(Bytes),
	Ping { request_id: Option<u64> },
	Pong { request_id: u64 },
	Latency { millis: u64 },
	OperationProgress { id: u64, progress: Progress },
	OperationSuccess { id: u64, header: Value, payload: Option<Bytes> },
	OperationError { id: u64, message: String },
	/// Well-formed but not something a client expects to receive.
	Unknown { kind: String },
	/// Could not be decoded.
	Malformed { reason: String },
}

/// Result of routing one message, for the session task to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
	Connected(Value),
	GatewayError(String),
	GatewayClosed(String),
	Data(Bytes),
	/// The gateway probed us; answer with a PONG.
	Ping(Option<u64>),
	Pong(u64),
	Latency(Duration),
	/// Second or later malformed message on this session.
	RepeatedMalformed { count: u64, reason: String },
}

/// Classifies a WebSocket data message.
pub fn classify(message: &Message) -> Inbound {
	match message {
		Message::Binary(bytes) => match tether_protocol::decode(bytes) {
			Ok(frame) => classify_frame(frame),
			Err(err) => Inbound::Malformed { reason: err.to_string() },
		},
		Message::Text(text) => match Envelope::parse(text) {
			Ok(envelope) => classify_envelope(envelope),
			Err(err) => Inbound::Malformed {
				reason: format!("invalid envelope: {err}"),
			},
		},
		other => Inbound::Unknown {
			kind: format!("websocket {}", control_name(other)),
		},
	}
}

fn control_name(message: &Message) -> &'static str {
	match message {
		Message::Ping(_) => "ping",
		Message::Pong(_) => "pong",
		Message::Close(_) => "close",
		_ => "frame",
	}
}

fn classify_frame(frame: Frame) -> Inbound {
	let Frame {
		message_type,
		header,
		payload,
		..
	} = frame;

	match message_type {
		MessageType::Data => Inbound::Data(payload.unwrap_or_else(|| text_field(&header).map(Bytes::from).unwrap_or_default())),
		MessageType::Unknown(code) => Inbound::Unknown {
			kind: format!("0x{code:02x}"),
		},
		other => classify_parts(other.name(), header, payload),
	}
}

fn classify_envelope(envelope: Envelope) -> Inbound {
	let Envelope { kind, data } = envelope;
	if kind == MessageType::Data.name() {
		return match &data {
			Value::String(text) => Inbound::Data(Bytes::from(text.clone().into_bytes())),
			other => Inbound::Data(text_field(other).map(Bytes::from).unwrap_or_default()),
		};
	}
	classify_parts(&kind, data, None)
}

/// Shared classification once the wire form is gone.
fn classify_parts(kind: &str, body: Value, payload: Option<Bytes>) -> Inbound {
	match MessageType::from_name(kind) {
		Some(MessageType::Connected) => Inbound::Connected { info: body },
		Some(MessageType::Error) => Inbound::Error {
			message: message_field(&body).unwrap_or_else(|| "gateway error".into()),
		},
		Some(MessageType::Closed) => Inbound::Closed {
			reason: message_field(&body).unwrap_or_default(),
		},
		Some(MessageType::Ping) => Inbound::Ping {
			request_id: body.get("requestId").and_then(Value::as_u64),
		},
		Some(MessageType::Pong) => match body.get("requestId").and_then(Value::as_u64) {
			Some(request_id) => Inbound::Pong { request_id },
			None => malformed(kind, "missing requestId"),
		},
		Some(MessageType::NetworkLatency) => match body.get("latency").and_then(Value::as_u64) {
			Some(millis) => Inbound::Latency { millis },
			None => malformed(kind, "missing latency"),
		},
		Some(MessageType::SftpProgress) => {
			let Some(id) = operation_id(&body) else {
				return malformed(kind, "missing operationId");
			};
			match serde_json::from_value::<Progress>(body) {
				Ok(progress) => Inbound::OperationProgress { id, progress },
				Err(err) => malformed(kind, &err.to_string()),
			}
		}
		Some(MessageType::SftpSuccess | MessageType::SshExec) => match operation_id(&body) {
			Some(id) => Inbound::OperationSuccess {
				id,
				header: body,
				payload: payload.filter(|p| !p.is_empty()),
			},
			None => malformed(kind, "missing operationId"),
		},
		Some(MessageType::SftpError) => match operation_id(&body) {
			Some(id) => Inbound::OperationError {
				id,
				message: message_field(&body).unwrap_or_else(|| "operation failed".into()),
			},
			None => malformed(kind, "missing operationId"),
		},
		_ => Inbound::Unknown { kind: kind.to_string() },
	}
}

fn malformed(kind: &str, reason: &str) -> Inbound {
	Inbound::Malformed {
		reason: format!("{kind}: {reason}"),
	}
}

fn operation_id(body: &Value) -> Option<u64> {
	body.get(OPERATION_ID_FIELD).and_then(Value::as_u64)
}

fn message_field(body: &Value) -> Option<String> {
	match body {
		Value::String(text) => Some(text.clone()),
		other => ["message", "error", "reason"]
			.iter()
			.find_map(|key| other.get(*key).and_then(Value::as_str))
			.map(str::to_owned),
	}
}

fn text_field(body: &Value) -> Option<String> {
	["data", "text"].iter().find_map(|key| body.get(*key).and_then(Value::as_str)).map(str::to_owned)
}

/// Per-session dispatcher.
#[derive(Debug)]
pub struct EventRouter {
	session_id: Arc<str>,
	correlator: OperationCorrelator,
	seen_unknown: HashSet<String>,
	malformed: u64,
}

impl EventRouter {
	pub fn new(session_id: Arc<str>, correlator: OperationCorrelator) -> Self {
		Self {
			session_id,
			correlator,
			seen_unknown: HashSet::new(),
			malformed: 0,
		}
	}

	pub fn correlator(&self) -> &OperationCorrelator {
		&self.correlator
	}

	/// Number of malformed messages seen so far.
	pub fn malformed_count(&self) -> u64 {
		self.malformed
	}

	/// Classifies and dispatches one message.
	pub fn route(&mut self, message: &Message) -> Option<Signal> {
		self.dispatch(classify(message))
	}

	/// Dispatches an already classified message.
	pub fn dispatch(&mut self, inbound: Inbound) -> Option<Signal> {
		match inbound {
			Inbound::Connected { info } => Some(Signal::Connected(info)),
			Inbound::Error { message } => Some(Signal::GatewayError(message)),
			Inbound::Closed { reason } => Some(Signal::GatewayClosed(reason)),
			Inbound::Data(bytes) => Some(Signal::Data(bytes)),
			Inbound::Ping { request_id } => Some(Signal::Ping(request_id)),
			Inbound::Pong { request_id } => Some(Signal::Pong(request_id)),
			Inbound::Latency { millis } => Some(Signal::Latency(Duration::from_millis(millis))),
			Inbound::OperationProgress { id, progress } => {
				trace!(target: "tether.router", session = %self.session_id, id, transferred = progress.transferred, "operation progress");
				self.correlator.progress(id, progress);
				None
			}
			Inbound::OperationSuccess { id, header, payload } => {
				self.correlator.resolve(id, OperationReply::new(header, payload));
				None
			}
			Inbound::OperationError { id, message } => {
				self.correlator.reject(id, |kind, _| Error::Operation { kind, message });
				None
			}
			Inbound::Unknown { kind } => {
				let first = self.seen_unknown.len() < MAX_TRACKED_UNKNOWN && self.seen_unknown.insert(kind.clone());
				if first {
					warn!(target: "tether.router", session = %self.session_id, %kind, "ignoring unknown message type");
				} else {
					debug!(target: "tether.router", session = %self.session_id, %kind, "ignoring unknown message type");
				}
				None
			}
			Inbound::Malformed { reason } => {
				self.malformed += 1;
				if self.malformed == 1 {
					warn!(target: "tether.router", session = %self.session_id, %reason, "dropping malformed message");
					None
				} else {
					debug!(target: "tether.router", session = %self.session_id, %reason, count = self.malformed, "dropping malformed message");
					Some(Signal::RepeatedMalformed {
						count: self.malformed,
						reason,
					})
				}
			}
		}
	}
}
