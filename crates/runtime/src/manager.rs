//! Session registry and public entry point.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use tether_protocol::ConnectionConfig;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigProvider, ManagerConfig};
use crate::error::{Error, Result};
use crate::events::{SessionEvent, SessionEventKind};
use crate::session::{DataSink, Session, SessionHandle, SessionSnapshot, SessionState};
use crate::sftp::SftpClient;
use crate::transport::TransportConnector;

/// Capacity of the event broadcast channel. Slow subscribers lag rather than
/// block sessions.
const EVENT_CAPACITY: usize = 256;

struct SessionEntry {
	handle: SessionHandle,
	task: JoinHandle<()>,
}

struct ManagerInner {
	config: Arc<ManagerConfig>,
	connector: TransportConnector,
	sessions: DashMap<Arc<str>, SessionEntry>,
	events: broadcast::Sender<SessionEvent>,
}

/// Creates, tracks and closes gateway sessions.
///
/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct SessionManager {
	inner: Arc<ManagerInner>,
}

impl SessionManager {
	pub fn new(config: ManagerConfig) -> Result<Self> {
		config.validate()?;
		let connector = TransportConnector::new(config.gateway.clone(), config.connect_timeout);
		let (events, _) = broadcast::channel(EVENT_CAPACITY);
		Ok(Self {
			inner: Arc::new(ManagerInner {
				config: Arc::new(config),
				connector,
				sessions: DashMap::new(),
				events,
			}),
		})
	}

	pub fn config(&self) -> &ManagerConfig {
		&self.inner.config
	}

	/// Session events from every session managed here.
	pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
		self.inner.events.subscribe()
	}

	/// Connects, authenticates and registers a new session.
	///
	/// Resolves once the gateway acknowledged the handshake. Nothing is
	/// registered when this fails.
	pub async fn create_session(&self, config: ConnectionConfig) -> Result<String> {
		let id: Arc<str> = Arc::from(Uuid::new_v4().to_string());
		info!(target: "tether.session", session = %id, host = %config.host, port = config.port, "creating session");

		let (session, handle) = match Session::open(
			Arc::clone(&id),
			Arc::new(config),
			Arc::clone(&self.inner.config),
			self.inner.connector.clone(),
			self.inner.events.clone(),
		)
		.await
		{
			Ok(opened) => opened,
			Err(err) => {
				warn!(target: "tether.session", session = %id, error = %err, "session creation failed");
				return Err(err);
			}
		};

		// The task must not deregister itself before it was registered.
		let (registered_tx, registered_rx) = oneshot::channel::<()>();
		let registry = Arc::downgrade(&self.inner);
		let task_id = Arc::clone(&id);
		let task = tokio::spawn(async move {
			let _ = registered_rx.await;
			session.run().await;
			if let Some(inner) = registry.upgrade() {
				if inner.sessions.remove(&task_id).is_some() {
					debug!(target: "tether.session", session = %task_id, "session deregistered after close");
				}
			}
		});

		self.inner.sessions.insert(Arc::clone(&id), SessionEntry { handle, task });
		let _ = registered_tx.send(());
		Ok(id.to_string())
	}

	/// Creates a session for a named connection from `provider`.
	pub async fn create_session_from(&self, provider: &dyn ConfigProvider, name: &str) -> Result<String> {
		let config = provider
			.connection(name)
			.ok_or_else(|| Error::InvalidConfig(format!("no connection named {name:?}")))?;
		self.create_session(config).await
	}

	/// Closes a session. Unknown or already closed ids are not an error.
	pub async fn close_session(&self, id: &str) -> Result<()> {
		let Some((id, entry)) = self.inner.sessions.remove(id) else {
			debug!(target: "tether.session", session = id, "close requested for unknown session");
			return Ok(());
		};
		info!(target: "tether.session", session = %id, "closing session");

		let grace = self.inner.config.close_grace;
		let finished = match entry.handle.request_close() {
			Some(done) => tokio::time::timeout(grace, done).await.is_ok(),
			None => true,
		};
		if !finished {
			warn!(target: "tether.session", session = %id, ?grace, "session did not finish closing in time, aborting its task");
			entry.task.abort();
			let from = entry.handle.state();
			if !from.is_closed() {
				let _ = self.inner.events.send(SessionEvent::new(
					Arc::clone(&id),
					SessionEventKind::StatusChange {
						from,
						to: SessionState::Closed,
					},
				));
			}
		}

		let rejected = entry.handle.correlator().reject_all(|_, _| Error::SessionClosed(id.to_string()));
		if rejected > 0 {
			debug!(target: "tether.session", session = %id, rejected, "rejected pending operations on close");
		}
		Ok(())
	}

	/// Closes every session.
	pub async fn shutdown(&self) {
		let ids = self.session_ids();
		info!(target: "tether.session", count = ids.len(), "shutting down all sessions");
		for result in join_all(ids.iter().map(|id| self.close_session(id))).await {
			if let Err(err) = result {
				warn!(target: "tether.session", error = %err, "failed to close session during shutdown");
			}
		}
	}

	pub fn session(&self, id: &str) -> Result<SessionHandle> {
		self.inner
			.sessions
			.get(id)
			.map(|entry| entry.handle.clone())
			.ok_or_else(|| Error::SessionNotFound(id.to_string()))
	}

	pub fn session_ids(&self) -> Vec<String> {
		self.inner.sessions.iter().map(|entry| entry.key().to_string()).collect()
	}

	pub fn snapshot(&self, id: &str) -> Result<SessionSnapshot> {
		Ok(self.session(id)?.snapshot())
	}

	pub fn len(&self) -> usize {
		self.inner.sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.sessions.is_empty()
	}

	/// Routes a session's output to `sink`, flushing anything buffered first.
	pub fn attach_sink(&self, id: &str, sink: &Arc<dyn DataSink>) -> Result<()> {
		self.session(id)?.attach_sink(sink)
	}

	pub fn detach_sink(&self, id: &str) -> Result<()> {
		self.session(id)?.detach_sink()
	}

	pub fn send_input(&self, id: &str, data: impl Into<bytes::Bytes>) -> Result<()> {
		self.session(id)?.send_input(data)
	}

	pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
		self.session(id)?.resize(cols, rows)
	}

	/// File-operation client for a session.
	pub fn sftp(&self, id: &str) -> Result<SftpClient> {
		Ok(self.session(id)?.sftp())
	}
}

impl std::fmt::Debug for SessionManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionManager")
			.field("gateway", &self.inner.config.gateway.url())
			.field("sessions", &self.inner.sessions.len())
			.finish()
	}
}
