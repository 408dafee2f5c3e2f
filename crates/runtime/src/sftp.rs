//! Typed client for the file-operation sub-channel.
//!
//! Every call allocates an operation id, registers it with the session's
//! [`OperationCorrelator`](crate::correlator::OperationCorrelator) under its
//! kind's timeout, sends the request frame and awaits the matching reply.
//! Operations on one session run concurrently; replies may arrive in any
//! order.

use std::path::Path;

use bytes::Bytes;
use serde_json::{Value, json};
use tether_protocol::{ExecOutput, ListReply, MessageType, OPERATION_ID_FIELD, OperationKind, UploadChunkHeader};
use tracing::debug;

use crate::correlator::{OperationReply, PendingOperation, ProgressSender};
use crate::error::{Error, Result};
use crate::session::SessionHandle;

/// Upload chunk size.
pub const UPLOAD_CHUNK_SIZE: usize = 256 * 1024;

/// File operations bound to one session.
#[derive(Debug, Clone)]
pub struct SftpClient {
	session: SessionHandle,
}

impl SftpClient {
	pub fn new(session: SessionHandle) -> Self {
		Self { session }
	}

	pub fn session(&self) -> &SessionHandle {
		&self.session
	}

	/// Opens the remote file-transfer subsystem.
	pub async fn init(&self) -> Result<()> {
		self.call(OperationKind::Init, json!({}), None).await.map(drop)
	}

	pub async fn list(&self, path: &str) -> Result<ListReply> {
		let reply = self.call(OperationKind::List, json!({ "path": path }), None).await?;
		let mut listing: ListReply = reply.parse()?;
		if listing.path.is_empty() {
			listing.path = path.to_owned();
		}
		Ok(listing)
	}

	pub async fn mkdir(&self, path: &str) -> Result<()> {
		self.call(OperationKind::Mkdir, json!({ "path": path }), None).await.map(drop)
	}

	pub async fn delete(&self, path: &str) -> Result<()> {
		self.call(OperationKind::Delete, json!({ "path": path }), None).await.map(drop)
	}

	pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
		self.call(OperationKind::Rename, json!({ "oldPath": from, "newPath": to }), None)
			.await
			.map(drop)
	}

	/// Sets Unix permission bits, e.g. `0o644`.
	pub async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
		self.call(OperationKind::Chmod, json!({ "path": path, "mode": mode }), None).await.map(drop)
	}

	/// Runs a command on the remote host.
	pub async fn exec(&self, command: &str) -> Result<ExecOutput> {
		self.call(OperationKind::Exec, json!({ "command": command }), None).await?.parse()
	}

	/// Closes the file-transfer subsystem. The session stays open.
	pub async fn close(&self) -> Result<()> {
		self.call(OperationKind::Close, json!({}), None).await.map(drop)
	}

	/// Cancels an in-flight operation.
	///
	/// The local waiter fails with [`Error::Cancelled`] right away; the gateway
	/// is then told to stop and its acknowledgement awaited.
	pub async fn cancel(&self, operation_id: u64) -> Result<()> {
		self.session
			.correlator()
			.reject(operation_id, |kind, id| Error::Cancelled { kind, id });
		self.call(OperationKind::Cancel, json!({ "targetOperationId": operation_id }), None)
			.await
			.map(drop)
	}

	/// Uploads `data` to `path` and waits for the gateway to confirm.
	pub async fn upload(&self, path: &str, data: &[u8], progress: Option<ProgressSender>) -> Result<()> {
		self.start_upload(path, data, progress).await?.await.map(drop)
	}

	/// Uploads a local file.
	pub async fn upload_file(&self, local: impl AsRef<Path>, path: &str, progress: Option<ProgressSender>) -> Result<()> {
		let data = tokio::fs::read(local).await?;
		self.upload(path, &data, progress).await
	}

	/// Sends every chunk of an upload and returns the pending completion, whose
	/// [`id`](PendingOperation::id) can be passed to [`cancel`](Self::cancel).
	pub async fn start_upload(&self, path: &str, data: &[u8], progress: Option<ProgressSender>) -> Result<PendingOperation> {
		let correlator = self.session.correlator();
		let id = correlator.next_operation_id();
		let timeout = self.session.timeouts().for_kind(OperationKind::Upload);
		let pending = correlator.register(id, OperationKind::Upload, timeout, progress);

		let total = data.len() as u64;
		let mut chunks: Vec<&[u8]> = data.chunks(UPLOAD_CHUNK_SIZE).collect();
		if chunks.is_empty() {
			chunks.push(&[]);
		}
		let last = chunks.len() - 1;

		let mut offset = 0u64;
		for (index, chunk) in chunks.into_iter().enumerate() {
			let header = UploadChunkHeader {
				operation_id: id,
				path: path.to_owned(),
				offset,
				total,
				is_final: index == last,
			};
			let frame = tether_protocol::encode(MessageType::SftpUpload, &header, Some(chunk))?;
			self.session.send_frame(frame).await?;
			offset += chunk.len() as u64;
		}

		debug!(target: "tether.ops", session = self.session.id(), id, path, total, "upload sent");
		Ok(pending)
	}

	/// Downloads `path` into memory.
	pub async fn download(&self, path: &str, progress: Option<ProgressSender>) -> Result<Bytes> {
		let reply = self.start_download(path, progress).await?.await?;
		Ok(reply.payload.unwrap_or_default())
	}

	/// Downloads `path` into a local file. Returns the number of bytes written.
	pub async fn download_to(&self, path: &str, local: impl AsRef<Path>, progress: Option<ProgressSender>) -> Result<u64> {
		let data = self.download(path, progress).await?;
		tokio::fs::write(local, &data).await?;
		Ok(data.len() as u64)
	}

	/// Requests a download and returns the pending completion.
	pub async fn start_download(&self, path: &str, progress: Option<ProgressSender>) -> Result<PendingOperation> {
		self.start(OperationKind::Download, json!({ "path": path }), progress).await
	}

	async fn call(&self, kind: OperationKind, header: Value, progress: Option<ProgressSender>) -> Result<OperationReply> {
		self.start(kind, header, progress).await?.await
	}

	async fn start(&self, kind: OperationKind, mut header: Value, progress: Option<ProgressSender>) -> Result<PendingOperation> {
		let correlator = self.session.correlator();
		let id = correlator.next_operation_id();
		let timeout = self.session.timeouts().for_kind(kind);
		let pending = correlator.register(id, kind, timeout, progress);

		if let Value::Object(fields) = &mut header {
			fields.insert(OPERATION_ID_FIELD.into(), id.into());
		}
		let frame = tether_protocol::encode(kind.request_type(), &header, None)?;
		self.session.send_frame(frame).await?;

		debug!(target: "tether.ops", session = self.session.id(), id, %kind, "operation sent");
		Ok(pending)
	}
}
