//! Sessions: lifecycle state, the per-session task and the handle used to
//! drive it.
//!
//! ```text
//! Connecting -> Authenticating -> Connected -> Reconnecting -> Connected
//!                                     |             |
//!                                     +--> Closed <-+
//! ```
//!
//! Each session is owned by one task. Callers talk to it
//! through a [`SessionHandle`]: commands go over an mpsc channel, status comes
//! back on a watch channel.

mod buffer;
mod handshake;
mod task;

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tether_protocol::ConnectionConfig;
use tokio::sync::{mpsc, oneshot, watch};

pub use buffer::PreAttachBuffer;
pub(crate) use handshake::{Handshake, abandon, authenticate, establish};
pub(crate) use task::{Command, Session};

use crate::config::OperationTimeouts;
use crate::correlator::OperationCorrelator;
use crate::error::{Error, Result};
use crate::sftp::SftpClient;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
	Connecting,
	Authenticating,
	Connected,
	/// Waiting for or running reconnect attempt `attempt` (1-indexed).
	Reconnecting { attempt: u32 },
	Closed,
}

impl SessionState {
	pub fn as_str(self) -> &'static str {
		match self {
			SessionState::Connecting => "connecting",
			SessionState::Authenticating => "authenticating",
			SessionState::Connected => "connected",
			SessionState::Reconnecting { .. } => "reconnecting",
			SessionState::Closed => "closed",
		}
	}

	/// Whether `self -> next` is a legal transition.
	pub fn can_transition_to(self, next: SessionState) -> bool {
		use SessionState::*;
		matches!(
			(self, next),
			(Connecting, Authenticating)
				| (Connecting, Closed)
				| (Authenticating, Connected)
				| (Authenticating, Closed)
				| (Connected, Reconnecting { .. })
				| (Connected, Closed)
				| (Reconnecting { .. }, Reconnecting { .. })
				| (Reconnecting { .. }, Connected)
				| (Reconnecting { .. }, Closed)
		)
	}

	pub fn is_closed(self) -> bool {
		self == SessionState::Closed
	}
}

impl fmt::Display for SessionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SessionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
			other => f.write_str(other.as_str()),
		}
	}
}

/// Receives terminal output.
///
/// Sessions hold sinks weakly; dropping the last `Arc` detaches it and output
/// goes back to the pre-attach buffer.
pub trait DataSink: Send + Sync {
	fn write(&self, data: &[u8]);
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
	pub id: Arc<str>,
	pub state: SessionState,
	pub retry_count: u32,
	pub latency: Option<Duration>,
	pub last_activity: Instant,
	pub buffered_bytes: usize,
	pub sink_attached: bool,
	pub pending_operations: usize,
	pub peer: Option<SocketAddr>,
}

impl SessionSnapshot {
	pub(crate) fn new(id: Arc<str>) -> Self {
		Self {
			id,
			state: SessionState::Connecting,
			retry_count: 0,
			latency: None,
			last_activity: Instant::now(),
			buffered_bytes: 0,
			sink_attached: false,
			pending_operations: 0,
			peer: None,
		}
	}
}

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
	id: Arc<str>,
	config: Arc<ConnectionConfig>,
	commands: mpsc::UnboundedSender<Command>,
	status: watch::Receiver<SessionSnapshot>,
	correlator: OperationCorrelator,
	timeouts: OperationTimeouts,
}

impl SessionHandle {
	pub(crate) fn new(
		id: Arc<str>,
		config: Arc<ConnectionConfig>,
		commands: mpsc::UnboundedSender<Command>,
		status: watch::Receiver<SessionSnapshot>,
		correlator: OperationCorrelator,
		timeouts: OperationTimeouts,
	) -> Self {
		Self {
			id,
			config,
			commands,
			status,
			correlator,
			timeouts,
		}
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn config(&self) -> &ConnectionConfig {
		&self.config
	}

	pub fn state(&self) -> SessionState {
		self.status.borrow().state
	}

	pub fn snapshot(&self) -> SessionSnapshot {
		self.status.borrow().clone()
	}

	/// Waits until the session reaches a state matching `predicate`.
	pub async fn wait_for(&self, mut predicate: impl FnMut(SessionState) -> bool) -> Result<SessionSnapshot> {
		let mut status = self.status.clone();
		let snapshot = status
			.wait_for(|snapshot| predicate(snapshot.state))
			.await
			.map_err(|_| Error::SessionClosed(self.id.to_string()))?;
		Ok(snapshot.clone())
	}

	/// Sends terminal input. Input sent while reconnecting is dropped.
	pub fn send_input(&self, data: impl Into<Bytes>) -> Result<()> {
		self.command(Command::Input(data.into()))
	}

	pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
		self.command(Command::Resize { cols, rows })
	}

	/// Attaches `sink` and flushes buffered output into it.
	pub fn attach_sink(&self, sink: &Arc<dyn DataSink>) -> Result<()> {
		let weak: Weak<dyn DataSink> = Arc::downgrade(sink);
		self.command(Command::Attach(weak))
	}

	pub fn detach_sink(&self) -> Result<()> {
		self.command(Command::Detach)
	}

	/// Typed file-operation client bound to this session.
	pub fn sftp(&self) -> SftpClient {
		SftpClient::new(self.clone())
	}

	pub fn correlator(&self) -> &OperationCorrelator {
		&self.correlator
	}

	pub(crate) fn timeouts(&self) -> &OperationTimeouts {
		&self.timeouts
	}

	/// Hands an encoded operation frame to the session task.
	pub(crate) async fn send_frame(&self, frame: Bytes) -> Result<()> {
		let (ack, done) = oneshot::channel();
		self.command(Command::Frame { frame, ack })?;
		done.await.map_err(|_| Error::SessionClosed(self.id.to_string()))?
	}

	/// Asks the task to close. Resolves once teardown finished.
	pub(crate) fn request_close(&self) -> Option<oneshot::Receiver<()>> {
		let (ack, done) = oneshot::channel();
		self.commands.send(Command::Close { ack }).ok().map(|_| done)
	}

	fn command(&self, command: Command) -> Result<()> {
		self.commands.send(command).map_err(|_| Error::SessionClosed(self.id.to_string()))
	}
}

impl fmt::Debug for SessionHandle {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SessionHandle")
			.field("id", &self.id)
			.field("state", &self.state())
			.finish()
	}
}
