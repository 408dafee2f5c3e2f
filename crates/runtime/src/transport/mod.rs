//! WebSocket transport to the gateway.
//!
//! Binary messages carry codec frames, text messages carry control envelopes.
//! A [`Transport`] is exclusively owned by one session task; the
//! [`TransportConnector`] produces a fresh one for every connect attempt.

mod connector;

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tether_protocol::Envelope;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub use connector::{AddressFamily, DialPlan, TransportConnector};

use crate::error::Result;

/// Underlying WebSocket stream type.
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code sent on a client-initiated shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close codes that end a session cleanly, without reconnection.
pub const EXPECTED_CLOSE_CODES: &[u16] = &[1000, 1001];

/// Why a transport stopped delivering messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
	/// Close code from the peer, `None` when the stream died without one.
	pub code: Option<u16>,
	pub reason: String,
}

impl CloseInfo {
	pub fn new(code: Option<u16>, reason: impl Into<String>) -> Self {
		Self {
			code,
			reason: reason.into(),
		}
	}

	/// Clean shutdown by the peer. Anything else is a transport failure.
	pub fn is_expected(&self) -> bool {
		self.code.is_some_and(|code| EXPECTED_CLOSE_CODES.contains(&code))
	}
}

impl fmt::Display for CloseInfo {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.code {
			Some(code) if self.reason.is_empty() => write!(f, "closed with code {code}"),
			Some(code) => write!(f, "closed with code {code}: {}", self.reason),
			None => write!(f, "closed without close frame: {}", self.reason),
		}
	}
}

/// Something read off the transport.
#[derive(Debug)]
pub enum TransportEvent {
	/// A text or binary message.
	Message(Message),
	/// The transport is finished; no further events follow.
	Closed(CloseInfo),
}

/// One open connection to the gateway.
pub struct Transport {
	ws: WsStream,
	peer: SocketAddr,
	family: AddressFamily,
	closed: bool,
}

impl Transport {
	pub(crate) fn new(ws: WsStream, peer: SocketAddr, family: AddressFamily) -> Self {
		Self {
			ws,
			peer,
			family,
			closed: false,
		}
	}

	pub fn peer(&self) -> SocketAddr {
		self.peer
	}

	pub fn family(&self) -> AddressFamily {
		self.family
	}

	/// Whether the socket has seen a close in either direction.
	pub fn is_closed(&self) -> bool {
		self.closed
	}

	/// Sends an encoded frame as a binary message.
	pub async fn send_frame(&mut self, frame: Bytes) -> Result<()> {
		self.ws.send(Message::Binary(frame.to_vec())).await?;
		Ok(())
	}

	/// Sends a control envelope as a text message.
	pub async fn send_envelope(&mut self, envelope: &Envelope) -> Result<()> {
		self.ws.send(Message::Text(envelope.to_json()?)).await?;
		Ok(())
	}

	/// Waits for the next data message, skipping WebSocket control frames.
	pub async fn recv(&mut self) -> TransportEvent {
		if self.closed {
			return TransportEvent::Closed(CloseInfo::new(None, "transport already closed"));
		}

		loop {
			match self.ws.next().await {
				Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => return TransportEvent::Message(message),
				Some(Ok(Message::Close(frame))) => {
					self.closed = true;
					let info = match frame {
						Some(frame) => CloseInfo::new(Some(u16::from(frame.code)), frame.reason.into_owned()),
						None => CloseInfo::new(None, "close frame without status"),
					};
					return TransportEvent::Closed(info);
				}
				Some(Ok(_)) => continue,
				Some(Err(err)) => {
					self.closed = true;
					return TransportEvent::Closed(CloseInfo::new(None, err.to_string()));
				}
				None => {
					self.closed = true;
					return TransportEvent::Closed(CloseInfo::new(None, "stream ended"));
				}
			}
		}
	}

	/// Starts the closing handshake with `code`.
	pub async fn close(&mut self, code: u16, reason: &str) -> Result<()> {
		if self.closed {
			return Ok(());
		}
		self.closed = true;
		let frame = CloseFrame {
			code: CloseCode::from(code),
			reason: reason.to_owned().into(),
		};
		self.ws.close(Some(frame)).await?;
		Ok(())
	}
}

impl fmt::Debug for Transport {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Transport")
			.field("peer", &self.peer)
			.field("family", &self.family)
			.field("closed", &self.closed)
			.finish()
	}
}

#[cfg(test)]
mod tests;
