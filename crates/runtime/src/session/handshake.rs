use std::time::Duration;

use bytes::Bytes;
use serde_json::{Value, json};
use tether_protocol::{ConnectionConfig, MessageType};
use tracing::{debug, trace};

use crate::config::TerminalSize;
use crate::error::{Error, Result};
use crate::router::{self, Inbound};
use crate::transport::{CLOSE_NORMAL, Transport, TransportConnector, TransportEvent};

/// Outcome of a successful handshake.
#[derive(Debug, Default)]
pub(crate) struct Handshake {
	/// Body of the `connected` acknowledgement.
	pub info: Value,
	/// Terminal output that arrived before the acknowledgement.
	pub early_data: Vec<Bytes>,
}

/// Opens a transport and authenticates on it. The transport is closed again
/// when the handshake fails.
pub(crate) async fn establish(
	connector: &TransportConnector,
	config: &ConnectionConfig,
	terminal: TerminalSize,
	timeout: Duration,
	session_id: &str,
) -> Result<(Transport, Handshake)> {
	let mut transport = connector.connect().await?;
	match authenticate(&mut transport, config, terminal, timeout, session_id).await {
		Ok(handshake) => Ok((transport, handshake)),
		Err(err) => {
			abandon(&mut transport, session_id).await;
			Err(err)
		}
	}
}

/// Sends CONNECT and AUTHENTICATE and waits for `connected`.
///
/// `error` before the acknowledgement is an authentication failure; the
/// transport ending first is a connect failure.
pub(crate) async fn authenticate(
	transport: &mut Transport,
	config: &ConnectionConfig,
	terminal: TerminalSize,
	timeout: Duration,
	session_id: &str,
) -> Result<Handshake> {
	let connect = tether_protocol::encode(MessageType::Connect, &config.connect_header(terminal.cols, terminal.rows), None)?;
	let credentials = tether_protocol::encode(MessageType::Authenticate, &config.authenticate_header(), None)?;

	transport
		.send_frame(connect)
		.await
		.map_err(|e| Error::Connect(format!("failed to send connect: {e}")))?;
	transport
		.send_frame(credentials)
		.await
		.map_err(|e| Error::Connect(format!("failed to send credentials: {e}")))?;
	debug!(
		target: "tether.session",
		session = session_id,
		host = %config.host,
		auth = ?config.auth.auth_type(),
		"handshake sent"
	);

	match tokio::time::timeout(timeout, await_ack(transport, session_id)).await {
		Ok(result) => result,
		Err(_) => Err(Error::ConnectTimeout(timeout)),
	}
}

async fn await_ack(transport: &mut Transport, session_id: &str) -> Result<Handshake> {
	let mut early_data = Vec::new();

	loop {
		let message = match transport.recv().await {
			TransportEvent::Message(message) => message,
			TransportEvent::Closed(info) => {
				return Err(Error::Connect(format!("transport {info} before the gateway acknowledged")));
			}
		};

		match router::classify(&message) {
			Inbound::Connected { info } => return Ok(Handshake { info, early_data }),
			Inbound::Error { message } => return Err(Error::Auth(message)),
			Inbound::Closed { reason } => {
				return Err(Error::Connect(format!("gateway closed the session before acknowledging: {reason}")));
			}
			Inbound::Data(bytes) => early_data.push(bytes),
			Inbound::Ping { request_id } => {
				let pong = tether_protocol::encode(MessageType::Pong, &json!({ "requestId": request_id }), None)?;
				transport.send_frame(pong).await?;
			}
			other => trace!(target: "tether.session", session = session_id, message = ?other, "ignored during handshake"),
		}
	}
}

/// Best-effort close of a transport that will not be used.
pub(crate) async fn abandon(transport: &mut Transport, session_id: &str) {
	if let Err(err) = transport.close(CLOSE_NORMAL, "handshake failed").await {
		debug!(target: "tether.session", session = session_id, error = %err, "failed to close abandoned transport");
	}
}
