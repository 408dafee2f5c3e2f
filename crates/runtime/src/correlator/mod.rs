//! Request/response correlation for file operations.
//!
//! Every operation gets a per-session id from [`OperationCorrelator::next_operation_id`].
//! [`register`](OperationCorrelator::register) parks a oneshot completion under
//! that id and arms a timer that can only expire its own entry. The router
//! feeds replies back through [`resolve`](OperationCorrelator::resolve),
//! [`reject`](OperationCorrelator::reject) and
//! [`progress`](OperationCorrelator::progress).
//!
//! The caller awaits a [`PendingOperation`]. Dropping it before completion
//! removes the entry and stops the timer, so abandoned operations never leak.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tether_protocol::{OperationKind, Progress};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Successful reply to an operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationReply {
	pub header: Value,
	pub payload: Option<Bytes>,
}

impl OperationReply {
	pub fn new(header: Value, payload: Option<Bytes>) -> Self {
		Self { header, payload }
	}

	/// Deserializes the reply header into `T`.
	pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
		Ok(serde_json::from_value(self.header.clone())?)
	}
}

/// Sender half of a progress subscription.
pub type ProgressSender = mpsc::UnboundedSender<Progress>;

struct Entry {
	kind: OperationKind,
	completion: oneshot::Sender<Result<OperationReply>>,
	progress: Option<ProgressSender>,
	timer: AbortHandle,
}

struct Inner {
	session_id: Arc<str>,
	next_id: AtomicU64,
	pending: Mutex<HashMap<u64, Entry>>,
}

impl Inner {
	fn take(&self, id: u64) -> Option<Entry> {
		let entry = self.pending.lock().remove(&id)?;
		entry.timer.abort();
		Some(entry)
	}

	fn expire(&self, id: u64, after: Duration) {
		let Some(entry) = self.pending.lock().remove(&id) else {
			return;
		};
		warn!(target: "tether.ops", session = %self.session_id, id, kind = %entry.kind, ?after, "operation timed out");
		let _ = entry.completion.send(Err(Error::Timeout {
			kind: entry.kind,
			id,
			after,
		}));
	}
}

/// Pending-operation table of one session. Cheap to clone.
#[derive(Clone)]
pub struct OperationCorrelator {
	inner: Arc<Inner>,
}

impl OperationCorrelator {
	pub fn new(session_id: Arc<str>) -> Self {
		Self {
			inner: Arc::new(Inner {
				session_id,
				next_id: AtomicU64::new(1),
				pending: Mutex::new(HashMap::new()),
			}),
		}
	}

	pub fn session_id(&self) -> &str {
		&self.inner.session_id
	}

	/// Allocates the next operation id. Ids start at 1 and never repeat within
	/// a session.
	pub fn next_operation_id(&self) -> u64 {
		self.inner.next_id.fetch_add(1, Ordering::Relaxed)
	}

	/// Registers `id` and arms its timeout.
	///
	/// Must be called from within a tokio runtime.
	pub fn register(&self, id: u64, kind: OperationKind, timeout: Duration, progress: Option<ProgressSender>) -> PendingOperation {
		let (tx, rx) = oneshot::channel();
		let weak: Weak<Inner> = Arc::downgrade(&self.inner);

		let mut pending = self.inner.pending.lock();
		let timer = tokio::spawn(async move {
			tokio::time::sleep(timeout).await;
			if let Some(inner) = weak.upgrade() {
				inner.expire(id, timeout);
			}
		})
		.abort_handle();

		let entry = Entry {
			kind,
			completion: tx,
			progress,
			timer,
		};
		if let Some(previous) = pending.insert(id, entry) {
			previous.timer.abort();
			warn!(target: "tether.ops", session = %self.inner.session_id, id, "operation id registered twice");
		}
		drop(pending);

		debug!(target: "tether.ops", session = %self.inner.session_id, id, %kind, ?timeout, "operation registered");

		PendingOperation {
			id,
			kind,
			rx,
			guard: CancelGuard {
				id,
				inner: Arc::downgrade(&self.inner),
				completed: false,
			},
		}
	}

	/// Completes `id` successfully. Returns false for an unknown id.
	pub fn resolve(&self, id: u64, reply: OperationReply) -> bool {
		match self.inner.take(id) {
			Some(entry) => {
				debug!(target: "tether.ops", session = %self.inner.session_id, id, kind = %entry.kind, "operation resolved");
				let _ = entry.completion.send(Ok(reply));
				true
			}
			None => {
				self.unmatched(id, "success");
				false
			}
		}
	}

	/// Fails `id` with the error built from its kind. Returns false for an
	/// unknown id.
	pub fn reject(&self, id: u64, error: impl FnOnce(OperationKind, u64) -> Error) -> bool {
		match self.inner.take(id) {
			Some(entry) => {
				let error = error(entry.kind, id);
				debug!(target: "tether.ops", session = %self.inner.session_id, id, kind = %entry.kind, %error, "operation rejected");
				let _ = entry.completion.send(Err(error));
				true
			}
			None => {
				self.unmatched(id, "error");
				false
			}
		}
	}

	/// Forwards a progress update without completing the operation.
	pub fn progress(&self, id: u64, progress: Progress) -> bool {
		let pending = self.inner.pending.lock();
		match pending.get(&id) {
			Some(entry) => {
				if let Some(tx) = &entry.progress {
					let _ = tx.send(progress);
				}
				true
			}
			None => {
				drop(pending);
				self.unmatched(id, "progress");
				false
			}
		}
	}

	/// Fails every pending operation. Returns how many were failed.
	pub fn reject_all(&self, error: impl Fn(OperationKind, u64) -> Error) -> usize {
		let drained: Vec<(u64, Entry)> = self.inner.pending.lock().drain().collect();
		let count = drained.len();
		for (id, entry) in drained {
			entry.timer.abort();
			let _ = entry.completion.send(Err(error(entry.kind, id)));
		}
		if count > 0 {
			debug!(target: "tether.ops", session = %self.inner.session_id, count, "rejected all pending operations");
		}
		count
	}

	/// Kind of a pending operation.
	pub fn kind_of(&self, id: u64) -> Option<OperationKind> {
		self.inner.pending.lock().get(&id).map(|entry| entry.kind)
	}

	pub fn pending_count(&self) -> usize {
		self.inner.pending.lock().len()
	}

	fn unmatched(&self, id: u64, what: &str) {
		warn!(target: "tether.ops", session = %self.inner.session_id, id, what, "dropping reply for unknown operation");
	}
}

impl std::fmt::Debug for OperationCorrelator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("OperationCorrelator")
			.field("session_id", &self.inner.session_id)
			.field("pending", &self.pending_count())
			.finish()
	}
}

/// Removes the entry when the waiting future is dropped early.
struct CancelGuard {
	id: u64,
	inner: Weak<Inner>,
	completed: bool,
}

impl Drop for CancelGuard {
	fn drop(&mut self) {
		if self.completed {
			return;
		}
		let Some(inner) = self.inner.upgrade() else {
			return;
		};
		if inner.take(self.id).is_some() {
			debug!(target: "tether.ops", session = %inner.session_id, id = self.id, "removed abandoned operation");
		}
	}
}

/// Future resolving to an operation's reply.
pub struct PendingOperation {
	id: u64,
	kind: OperationKind,
	rx: oneshot::Receiver<Result<OperationReply>>,
	guard: CancelGuard,
}

impl PendingOperation {
	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn kind(&self) -> OperationKind {
		self.kind
	}
}

impl Future for PendingOperation {
	type Output = Result<OperationReply>;

	fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
		match Pin::new(&mut self.rx).poll(cx) {
			Poll::Ready(result) => {
				self.guard.completed = true;
				Poll::Ready(result.map_err(|_| Error::ChannelClosed).and_then(|r| r))
			}
			Poll::Pending => Poll::Pending,
		}
	}
}

impl std::fmt::Debug for PendingOperation {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PendingOperation").field("id", &self.id).field("kind", &self.kind).finish()
	}
}
