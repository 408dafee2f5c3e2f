use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tether_protocol::{Envelope, MessageType};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use super::*;
use crate::config::GatewayConfig;
use crate::error::Error;

fn connector(timeout: Duration) -> TransportConnector {
	TransportConnector::new(
		GatewayConfig {
			host: "127.0.0.1".into(),
			..GatewayConfig::default()
		},
		timeout,
	)
}

/// Address with nothing listening on it.
async fn refused_addr() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	drop(listener);
	addr
}

/// Accepts TCP connections and never answers the upgrade.
async fn silent_addr() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		let mut held = Vec::new();
		while let Ok((stream, _)) = listener.accept().await {
			held.push(stream);
		}
	});
	addr
}

/// WebSocket server that echoes every data message and closes with `close_code`
/// after the first one.
async fn echo_addr(close_code: u16) -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		while let Ok((stream, _)) = listener.accept().await {
			tokio::spawn(async move {
				let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
				if let Some(Ok(message)) = ws.next().await {
					let _ = ws.send(message).await;
					let _ = ws
						.send(Message::Close(Some(CloseFrame {
							code: CloseCode::from(close_code),
							reason: "bye".into(),
						})))
						.await;
				}
				while ws.next().await.is_some() {}
			});
		}
	});
	addr
}

#[test]
fn dial_plan_partitions_by_family() {
	let v4: SocketAddr = "10.0.0.1:22".parse().unwrap();
	let v6: SocketAddr = "[fe80::1]:22".parse().unwrap();
	let v4b: SocketAddr = "10.0.0.2:22".parse().unwrap();

	let plan = DialPlan::from_addrs([v6, v4, v4b], false);
	assert_eq!(plan.primary_family, AddressFamily::V4);
	assert_eq!(plan.primary, vec![v4, v4b]);
	assert_eq!(plan.secondary, vec![v6]);

	let plan = DialPlan::from_addrs([v4, v6], true);
	assert_eq!(plan.primary_family, AddressFamily::V6);
	assert_eq!(plan.primary, vec![v6]);
	assert_eq!(plan.secondary_family(), AddressFamily::V4);
}

#[test]
fn close_codes_classify() {
	assert!(CloseInfo::new(Some(1000), "").is_expected());
	assert!(CloseInfo::new(Some(1001), "going away").is_expected());
	assert!(!CloseInfo::new(Some(1011), "error").is_expected());
	assert!(!CloseInfo::new(None, "reset").is_expected());
}

#[tokio::test]
async fn falls_back_when_primary_is_refused() {
	let plan = DialPlan {
		primary_family: AddressFamily::V4,
		primary: vec![refused_addr().await],
		secondary: vec![echo_addr(1000).await],
	};

	let transport = connector(Duration::from_secs(2)).dial(&plan).await.unwrap();
	assert_eq!(transport.family(), AddressFamily::V6);
	assert_eq!(transport.peer(), plan.secondary[0]);
}

#[tokio::test]
async fn falls_back_when_primary_times_out() {
	let plan = DialPlan {
		primary_family: AddressFamily::V4,
		primary: vec![silent_addr().await],
		secondary: vec![echo_addr(1000).await],
	};

	let started = tokio::time::Instant::now();
	let transport = connector(Duration::from_millis(200)).dial(&plan).await.unwrap();
	assert!(started.elapsed() >= Duration::from_millis(200));
	assert_eq!(transport.peer(), plan.secondary[0]);
}

#[tokio::test]
async fn prefers_primary_when_it_works() {
	let plan = DialPlan {
		primary_family: AddressFamily::V4,
		primary: vec![echo_addr(1000).await],
		secondary: vec![refused_addr().await],
	};

	let transport = connector(Duration::from_secs(2)).dial(&plan).await.unwrap();
	assert_eq!(transport.family(), AddressFamily::V4);
}

#[tokio::test]
async fn aggregates_both_failures() {
	let plan = DialPlan {
		primary_family: AddressFamily::V4,
		primary: vec![refused_addr().await],
		secondary: vec![],
	};

	match connector(Duration::from_secs(1)).dial(&plan).await {
		Err(Error::Connect(message)) => {
			assert!(message.contains("ipv4:"), "{message}");
			assert!(message.contains("ipv6: no address"), "{message}");
		}
		other => panic!("expected Connect error, got {other:?}"),
	}
}

#[tokio::test]
async fn frames_and_envelopes_cross_the_socket() {
	let plan = DialPlan::from_addrs([echo_addr(1000).await], false);
	let mut transport = connector(Duration::from_secs(2)).dial(&plan).await.unwrap();

	let frame = tether_protocol::encode(MessageType::Ping, &json!({"requestId": 1}), None).unwrap();
	transport.send_frame(frame.clone()).await.unwrap();

	match transport.recv().await {
		TransportEvent::Message(Message::Binary(bytes)) => {
			let decoded = tether_protocol::decode(&bytes).unwrap();
			assert_eq!(decoded.message_type, MessageType::Ping);
			assert_eq!(decoded.header_u64("requestId"), Some(1));
		}
		other => panic!("expected binary echo, got {other:?}"),
	}

	match transport.recv().await {
		TransportEvent::Closed(info) => {
			assert_eq!(info.code, Some(1000));
			assert!(info.is_expected());
		}
		other => panic!("expected close, got {other:?}"),
	}
	assert!(transport.is_closed());
}

#[tokio::test]
async fn abnormal_close_is_unexpected() {
	let plan = DialPlan::from_addrs([echo_addr(1011).await], false);
	let mut transport = connector(Duration::from_secs(2)).dial(&plan).await.unwrap();

	transport.send_envelope(&Envelope::new("data", "hi").unwrap()).await.unwrap();
	assert!(matches!(transport.recv().await, TransportEvent::Message(Message::Text(_))));

	match transport.recv().await {
		TransportEvent::Closed(info) => {
			assert_eq!(info.code, Some(1011));
			assert_eq!(info.reason, "bye");
			assert!(!info.is_expected());
		}
		other => panic!("expected close, got {other:?}"),
	}
}

#[tokio::test]
async fn hung_resolver_is_bounded_by_connect_timeout() {
	let started = std::time::Instant::now();
	let lookup = std::future::pending::<std::io::Result<Vec<SocketAddr>>>();

	match connector(Duration::from_millis(100)).resolve(lookup).await {
		Err(Error::Connect(message)) => assert!(message.contains("timed out"), "{message}"),
		other => panic!("expected connect error, got {other:?}"),
	}
	assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn resolved_addresses_are_split_by_family() {
	let v4: SocketAddr = "127.0.0.1:8022".parse().unwrap();
	let v6: SocketAddr = "[::1]:8022".parse().unwrap();

	let plan = connector(Duration::from_secs(1)).resolve(async move { Ok(vec![v6, v4]) }).await.unwrap();
	assert_eq!(plan.primary, vec![v4]);
	assert_eq!(plan.secondary, vec![v6]);
}
