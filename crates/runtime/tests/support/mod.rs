//! In-process gateway for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tether_protocol::{ConnectionConfig, Envelope, Frame, MessageType};
use tether_runtime::{DataSink, GatewayConfig, ManagerConfig, ReconnectPolicy, SessionEvent};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, broadcast};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing_subscriber::EnvFilter;

pub type Ws = WebSocketStream<TcpStream>;

pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tether=debug")))
		.with_test_writer()
		.try_init();
}

/// WebSocket gateway running `handler` for every accepted connection.
pub struct Gateway {
	pub addr: SocketAddr,
	connections: Arc<AtomicUsize>,
}

impl Gateway {
	/// `handler` receives the zero-based connection index.
	pub async fn spawn<F, Fut>(handler: F) -> Self
	where
		F: Fn(usize, Ws) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		init_tracing();
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();
		let connections = Arc::new(AtomicUsize::new(0));
		let counter = Arc::clone(&connections);
		let handler = Arc::new(handler);

		tokio::spawn(async move {
			while let Ok((stream, _)) = listener.accept().await {
				let index = counter.fetch_add(1, Ordering::SeqCst);
				let handler = Arc::clone(&handler);
				tokio::spawn(async move {
					if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
						handler(index, ws).await;
					}
				});
			}
		});

		Self { addr, connections }
	}

	/// TCP connections accepted so far.
	pub fn connections(&self) -> usize {
		self.connections.load(Ordering::SeqCst)
	}

	/// Manager settings pointing at this gateway, with short timers.
	pub fn config(&self) -> ManagerConfig {
		ManagerConfig {
			gateway: GatewayConfig {
				host: "127.0.0.1".into(),
				port: self.addr.port(),
				..GatewayConfig::default()
			},
			connect_timeout: Duration::from_secs(1),
			handshake_timeout: Duration::from_secs(1),
			close_grace: Duration::from_secs(1),
			reconnect: ReconnectPolicy {
				base_delay: Duration::from_millis(10),
				max_attempts: 3,
			},
			..ManagerConfig::default()
		}
	}
}

pub fn credentials() -> ConnectionConfig {
	ConnectionConfig::password("10.20.0.7", 22, "deploy", "hunter2")
}

/// Next text or binary message, `None` once the peer closed.
pub async fn next_message(ws: &mut Ws) -> Option<Message> {
	loop {
		match ws.next().await? {
			Ok(message @ (Message::Text(_) | Message::Binary(_))) => return Some(message),
			Ok(Message::Close(_)) | Err(_) => return None,
			Ok(_) => continue,
		}
	}
}

/// Next binary frame, skipping envelopes and keepalive probes.
pub async fn next_frame(ws: &mut Ws) -> Option<Frame> {
	loop {
		if let Message::Binary(bytes) = next_message(ws).await? {
			let frame = tether_protocol::decode(&bytes).unwrap();
			if frame.message_type != MessageType::Ping {
				return Some(frame);
			}
		}
	}
}

/// Reads CONNECT and AUTHENTICATE.
pub async fn read_handshake(ws: &mut Ws) -> (Frame, Frame) {
	let connect = next_frame(ws).await.expect("connect frame");
	let authenticate = next_frame(ws).await.expect("authenticate frame");
	assert_eq!(connect.message_type, MessageType::Connect);
	assert_eq!(authenticate.message_type, MessageType::Authenticate);
	(connect, authenticate)
}

/// Reads the handshake and acknowledges it.
pub async fn acknowledge(ws: &mut Ws) {
	read_handshake(ws).await;
	send_envelope(ws, "connected", json!({ "sessionId": "remote-1" })).await;
}

pub async fn send_envelope(ws: &mut Ws, kind: &str, data: Value) {
	let text = Envelope::new(kind, data).unwrap().to_json().unwrap();
	let _ = ws.send(Message::Text(text)).await;
}

pub async fn send_frame(ws: &mut Ws, message_type: MessageType, header: Value, payload: Option<&[u8]>) {
	let frame = tether_protocol::encode(message_type, &header, payload).unwrap();
	let _ = ws.send(Message::Binary(frame.to_vec())).await;
}

/// Sends a close frame and waits for the peer to finish the close handshake.
pub async fn close_with(ws: &mut Ws, code: u16) {
	let _ = ws
		.send(Message::Close(Some(CloseFrame {
			code: CloseCode::from(code),
			reason: "test".into(),
		})))
		.await;
	drain(ws).await;
}

/// Reads until the peer goes away.
pub async fn drain(ws: &mut Ws) {
	while let Some(Ok(_)) = ws.next().await {}
}

/// Sink collecting everything written to it.
#[derive(Default)]
pub struct Collector {
	data: Mutex<Vec<u8>>,
	notify: Notify,
}

impl Collector {
	pub fn contents(&self) -> Vec<u8> {
		self.data.lock().clone()
	}

	/// Waits until at least `len` bytes arrived.
	pub async fn wait_for_len(&self, len: usize) -> Vec<u8> {
		tokio::time::timeout(Duration::from_secs(5), async {
			loop {
				let notified = self.notify.notified();
				if self.data.lock().len() >= len {
					return self.contents();
				}
				notified.await;
			}
		})
		.await
		.expect("sink did not receive enough data")
	}
}

impl DataSink for Collector {
	fn write(&self, data: &[u8]) {
		self.data.lock().extend_from_slice(data);
		self.notify.notify_waiters();
	}
}

/// Waits for an event matching `predicate`.
pub async fn next_event(events: &mut broadcast::Receiver<SessionEvent>, predicate: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
	tokio::time::timeout(Duration::from_secs(5), async {
		loop {
			match events.recv().await {
				Ok(event) if predicate(&event) => return event,
				Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
				Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
			}
		}
	})
	.await
	.expect("timed out waiting for event")
}

/// Polls `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
	tokio::time::timeout(Duration::from_secs(5), async {
		while !condition() {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("condition never became true");
}
