mod support;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;
use support::{Collector, Gateway, acknowledge, close_with, credentials, drain, eventually, next_event, next_frame, next_message, read_handshake, send_envelope, send_frame};
use tether_protocol::{Envelope, MessageType};
use tether_runtime::{DataSink, Error, SessionEventKind, SessionManager, SessionState, StaticConfigProvider};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn create_resolves_once_gateway_acknowledges() -> anyhow::Result<()> {
	let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
	let gateway = Gateway::spawn(move |_, mut ws| {
		let seen_tx = seen_tx.clone();
		async move {
			let (connect, authenticate) = read_handshake(&mut ws).await;
			let _ = seen_tx.send((connect, authenticate));
			tokio::time::sleep(Duration::from_millis(100)).await;
			send_envelope(&mut ws, "connected", json!({})).await;
			drain(&mut ws).await;
		}
	})
	.await;

	let manager = SessionManager::new(gateway.config())?;
	let id = tokio::time::timeout(Duration::from_millis(500), manager.create_session(credentials())).await??;

	assert_eq!(manager.session_ids(), vec![id.clone()]);
	assert_eq!(manager.snapshot(&id)?.state, SessionState::Connected);

	let (connect, authenticate) = seen_rx.recv().await.unwrap();
	assert_eq!(connect.header_str("host"), Some("10.20.0.7"));
	assert_eq!(connect.header_u64("port"), Some(22));
	assert_eq!(connect.header_str("username"), Some("deploy"));
	assert_eq!(connect.header_str("authType"), Some("password"));
	assert_eq!(connect.header_u64("cols"), Some(80));
	assert_eq!(authenticate.header_str("password"), Some("hunter2"));
	Ok(())
}

#[tokio::test]
async fn abnormal_close_before_ack_is_a_connect_error() -> anyhow::Result<()> {
	let gateway = Gateway::spawn(|_, mut ws| async move {
		read_handshake(&mut ws).await;
		close_with(&mut ws, 1011).await;
	})
	.await;

	let manager = SessionManager::new(gateway.config())?;
	let err = manager.create_session(credentials()).await.unwrap_err();
	assert!(matches!(err, Error::Connect(_)), "unexpected error: {err:?}");
	assert!(manager.is_empty());
	Ok(())
}

#[tokio::test]
async fn gateway_error_during_handshake_is_auth_failure() -> anyhow::Result<()> {
	let gateway = Gateway::spawn(|_, mut ws| async move {
		read_handshake(&mut ws).await;
		send_envelope(&mut ws, "error", json!({ "message": "Authentication failed" })).await;
		drain(&mut ws).await;
	})
	.await;

	let manager = SessionManager::new(gateway.config())?;
	let mut events = manager.subscribe();
	match manager.create_session(credentials()).await {
		Err(Error::Auth(message)) => assert_eq!(message, "Authentication failed"),
		other => panic!("expected auth failure, got {other:?}"),
	}
	assert!(manager.is_empty());

	let mut seen = Vec::new();
	while let Ok(event) = events.try_recv() {
		seen.push(event);
	}
	let states: Vec<_> = seen
		.iter()
		.filter_map(|event| match event.kind {
			SessionEventKind::StatusChange { to, .. } => Some(to),
			_ => None,
		})
		.collect();
	assert_eq!(states, vec![SessionState::Authenticating, SessionState::Closed], "events: {seen:?}");
	Ok(())
}

#[tokio::test]
async fn silent_gateway_times_out() -> anyhow::Result<()> {
	let gateway = Gateway::spawn(|_, mut ws| async move {
		read_handshake(&mut ws).await;
		drain(&mut ws).await;
	})
	.await;

	let mut config = gateway.config();
	config.handshake_timeout = Duration::from_millis(150);
	let manager = SessionManager::new(config)?;

	let err = manager.create_session(credentials()).await.unwrap_err();
	assert!(matches!(err, Error::ConnectTimeout(_)), "unexpected error: {err:?}");
	assert!(err.is_timeout());
	Ok(())
}

#[tokio::test]
async fn nothing_listening_is_a_connect_error() -> anyhow::Result<()> {
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
	let port = listener.local_addr()?.port();
	drop(listener);

	let mut config = tether_runtime::ManagerConfig::default();
	config.gateway.host = "127.0.0.1".into();
	config.gateway.port = port;
	let manager = SessionManager::new(config)?;

	match manager.create_session(credentials()).await {
		Err(Error::Connect(message)) => assert!(message.contains("ipv4"), "{message}"),
		other => panic!("expected connect failure, got {other:?}"),
	}
	Ok(())
}

#[tokio::test]
async fn concurrent_creates_get_distinct_ids() -> anyhow::Result<()> {
	let gateway = Gateway::spawn(|_, mut ws| async move {
		acknowledge(&mut ws).await;
		drain(&mut ws).await;
	})
	.await;
	let manager = SessionManager::new(gateway.config())?;

	let results = join_all((0..8).map(|_| manager.create_session(credentials()))).await;
	let ids: HashSet<String> = results.into_iter().collect::<Result<_, _>>()?;

	assert_eq!(ids.len(), 8);
	assert_eq!(manager.len(), 8);
	manager.shutdown().await;
	assert!(manager.is_empty());
	Ok(())
}

#[tokio::test]
async fn close_is_idempotent_and_notifies_gateway() -> anyhow::Result<()> {
	let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
	let gateway = Gateway::spawn(move |_, mut ws| {
		let seen_tx = seen_tx.clone();
		async move {
			acknowledge(&mut ws).await;
			while let Some(message) = next_message(&mut ws).await {
				let _ = seen_tx.send(message);
			}
			let _ = seen_tx.send(Message::Text("<closed>".into()));
		}
	})
	.await;

	let manager = SessionManager::new(gateway.config())?;
	let mut events = manager.subscribe();
	let id = manager.create_session(credentials()).await?;

	manager.close_session(&id).await?;
	manager.close_session(&id).await?;
	manager.close_session("never-existed").await?;

	assert!(manager.is_empty());
	assert!(matches!(manager.session(&id), Err(Error::SessionNotFound(_))));

	match seen_rx.recv().await.unwrap() {
		Message::Text(text) => assert_eq!(Envelope::parse(&text)?.kind, "disconnect"),
		other => panic!("expected disconnect envelope, got {other:?}"),
	}
	assert_eq!(seen_rx.recv().await.unwrap(), Message::Text("<closed>".into()));

	next_event(&mut events, |event| {
		matches!(
			event.kind,
			SessionEventKind::StatusChange {
				to: SessionState::Closed,
				..
			}
		)
	})
	.await;
	Ok(())
}

#[tokio::test]
async fn output_is_buffered_until_a_sink_attaches() -> anyhow::Result<()> {
	let gateway = Gateway::spawn(|_, mut ws| async move {
		acknowledge(&mut ws).await;
		send_frame(&mut ws, MessageType::Data, json!({}), Some(b"hello ")).await;
		send_envelope(&mut ws, "data", json!("world")).await;

		let input = next_frame(&mut ws).await.unwrap();
		assert_eq!(input.message_type, MessageType::Data);
		assert_eq!(input.payload.as_deref(), Some(&b"ls"[..]));
		send_frame(&mut ws, MessageType::Data, json!({}), Some(b"!")).await;
		drain(&mut ws).await;
	})
	.await;

	let manager = SessionManager::new(gateway.config())?;
	let id = manager.create_session(credentials()).await?;
	let handle = manager.session(&id)?;
	eventually(|| handle.snapshot().buffered_bytes == 11).await;

	let collector = Arc::new(Collector::default());
	let sink: Arc<dyn DataSink> = collector.clone();
	manager.attach_sink(&id, &sink)?;
	assert_eq!(collector.wait_for_len(11).await, b"hello world");

	manager.send_input(&id, &b"ls"[..])?;
	assert_eq!(collector.wait_for_len(12).await, b"hello world!");
	assert!(handle.snapshot().sink_attached);
	Ok(())
}

#[tokio::test]
async fn dropped_sink_falls_back_to_buffering() -> anyhow::Result<()> {
	let gateway = Gateway::spawn(|_, mut ws| async move {
		acknowledge(&mut ws).await;
		next_frame(&mut ws).await;
		send_frame(&mut ws, MessageType::Data, json!({}), Some(b"late")).await;
		drain(&mut ws).await;
	})
	.await;

	let manager = SessionManager::new(gateway.config())?;
	let id = manager.create_session(credentials()).await?;
	let handle = manager.session(&id)?;

	let sink: Arc<dyn DataSink> = Arc::new(Collector::default());
	handle.attach_sink(&sink)?;
	drop(sink);

	handle.send_input(&b"x"[..])?;
	eventually(|| handle.snapshot().buffered_bytes == 4).await;
	assert!(!handle.snapshot().sink_attached);
	Ok(())
}

#[tokio::test]
async fn resize_is_forwarded() -> anyhow::Result<()> {
	let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
	let gateway = Gateway::spawn(move |_, mut ws| {
		let seen_tx = seen_tx.clone();
		async move {
			acknowledge(&mut ws).await;
			if let Some(Message::Text(text)) = next_message(&mut ws).await {
				let _ = seen_tx.send(Envelope::parse(&text).unwrap());
			}
			drain(&mut ws).await;
		}
	})
	.await;

	let manager = SessionManager::new(gateway.config())?;
	let id = manager.create_session(credentials()).await?;
	manager.resize(&id, 132, 43)?;

	let envelope = seen_rx.recv().await.unwrap();
	assert_eq!(envelope, Envelope::resize(132, 43));
	Ok(())
}

#[tokio::test]
async fn keepalive_measures_latency_and_answers_pings() -> anyhow::Result<()> {
	let (pong_tx, mut pong_rx) = mpsc::unbounded_channel();
	let gateway = Gateway::spawn(move |_, mut ws| {
		let pong_tx = pong_tx.clone();
		async move {
			acknowledge(&mut ws).await;
			send_envelope(&mut ws, "ping", json!({ "requestId": 77 })).await;
			while let Some(Message::Binary(bytes)) = next_message(&mut ws).await {
				let frame = tether_protocol::decode(&bytes).unwrap();
				match frame.message_type {
					MessageType::Ping => {
						tokio::time::sleep(Duration::from_millis(5)).await;
						let request_id = frame.header_u64("requestId").unwrap();
						send_frame(&mut ws, MessageType::Pong, json!({ "requestId": request_id }), None).await;
					}
					MessageType::Pong => {
						let _ = pong_tx.send(frame.header_u64("requestId"));
					}
					_ => {}
				}
			}
		}
	})
	.await;

	let mut config = gateway.config();
	config.keepalive.interval = Duration::from_millis(100);
	let manager = SessionManager::new(config)?;
	let mut events = manager.subscribe();
	let id = manager.create_session(credentials()).await?;

	assert_eq!(pong_rx.recv().await.unwrap(), Some(77));

	let event = next_event(&mut events, |event| matches!(event.kind, SessionEventKind::Latency(_))).await;
	assert_eq!(event.session_id.as_ref(), id);
	assert_eq!(event.name(), "latency");
	eventually(|| manager.snapshot(&id).is_ok_and(|s| s.latency.is_some())).await;
	Ok(())
}

#[tokio::test]
async fn gateway_latency_reports_update_the_session() -> anyhow::Result<()> {
	let gateway = Gateway::spawn(|_, mut ws| async move {
		acknowledge(&mut ws).await;
		send_frame(&mut ws, MessageType::NetworkLatency, json!({ "latency": 42 }), None).await;
		drain(&mut ws).await;
	})
	.await;

	let manager = SessionManager::new(gateway.config())?;
	let id = manager.create_session(credentials()).await?;
	eventually(|| manager.snapshot(&id).is_ok_and(|s| s.latency == Some(Duration::from_millis(42)))).await;
	Ok(())
}

#[tokio::test]
async fn repeated_malformed_frames_surface_a_non_terminal_error() -> anyhow::Result<()> {
	let gateway = Gateway::spawn(|_, mut ws| async move {
		acknowledge(&mut ws).await;
		use futures_util::SinkExt;
		let _ = ws.send(Message::Binary(vec![0xde, 0xad])).await;
		let _ = ws.send(Message::Binary(vec![0xbe, 0xef])).await;
		drain(&mut ws).await;
	})
	.await;

	let manager = SessionManager::new(gateway.config())?;
	let mut events = manager.subscribe();
	let id = manager.create_session(credentials()).await?;

	let event = next_event(&mut events, |event| matches!(event.kind, SessionEventKind::Error { .. })).await;
	assert!(!event.is_terminal_error());
	assert_eq!(manager.snapshot(&id)?.state, SessionState::Connected);
	Ok(())
}

#[tokio::test]
async fn remote_closed_message_ends_the_session() -> anyhow::Result<()> {
	let gateway = Gateway::spawn(|_, mut ws| async move {
		acknowledge(&mut ws).await;
		send_envelope(&mut ws, "closed", json!({ "reason": "exit 0" })).await;
		drain(&mut ws).await;
	})
	.await;

	let manager = SessionManager::new(gateway.config())?;
	let id = manager.create_session(credentials()).await?;
	let handle = manager.session(&id)?;

	handle.wait_for(SessionState::is_closed).await?;
	eventually(|| manager.is_empty()).await;
	assert_eq!(gateway.connections(), 1);
	Ok(())
}

#[tokio::test]
async fn sessions_can_be_created_from_a_provider() -> anyhow::Result<()> {
	let gateway = Gateway::spawn(|_, mut ws| async move {
		acknowledge(&mut ws).await;
		drain(&mut ws).await;
	})
	.await;

	let mut provider = StaticConfigProvider::new();
	provider.insert("build-box", credentials());

	let manager = SessionManager::new(gateway.config())?;
	let id = manager.create_session_from(&provider, "build-box").await?;
	assert_eq!(manager.session(&id)?.config().username, "deploy");

	let err = manager.create_session_from(&provider, "missing").await.unwrap_err();
	assert!(matches!(err, Error::InvalidConfig(_)));
	Ok(())
}
