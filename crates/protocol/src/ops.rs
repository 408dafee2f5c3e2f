//! File-operation payloads exchanged on the operation sub-channel.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::message::MessageType;

/// Kind of an asynchronous file operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
	Init,
	List,
	Upload,
	Download,
	Mkdir,
	Delete,
	Rename,
	Chmod,
	Exec,
	Close,
	Cancel,
}

impl OperationKind {
	/// Message type of the request frame for this kind.
	pub fn request_type(self) -> MessageType {
		match self {
			OperationKind::Init => MessageType::SftpInit,
			OperationKind::List => MessageType::SftpList,
			OperationKind::Upload => MessageType::SftpUpload,
			OperationKind::Download => MessageType::SftpDownload,
			OperationKind::Mkdir => MessageType::SftpMkdir,
			OperationKind::Delete => MessageType::SftpDelete,
			OperationKind::Rename => MessageType::SftpRename,
			OperationKind::Chmod => MessageType::SftpChmod,
			OperationKind::Exec => MessageType::SshExec,
			OperationKind::Close => MessageType::SftpClose,
			OperationKind::Cancel => MessageType::SftpCancel,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			OperationKind::Init => "init",
			OperationKind::List => "list",
			OperationKind::Upload => "upload",
			OperationKind::Download => "download",
			OperationKind::Mkdir => "mkdir",
			OperationKind::Delete => "delete",
			OperationKind::Rename => "rename",
			OperationKind::Chmod => "chmod",
			OperationKind::Exec => "exec",
			OperationKind::Close => "close",
			OperationKind::Cancel => "cancel",
		}
	}
}

impl fmt::Display for OperationKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// One remote directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
	pub name: String,
	#[serde(default)]
	pub path: String,
	#[serde(default)]
	pub size: u64,
	#[serde(default)]
	pub is_directory: bool,
	/// Modification time, seconds since the Unix epoch.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub modified: Option<u64>,
	/// Unix permission bits.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub permissions: Option<u32>,
}

/// Body of a successful `list` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListReply {
	#[serde(default)]
	pub path: String,
	#[serde(default)]
	pub entries: Vec<FileEntry>,
}

/// Transfer progress reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
	#[serde(default)]
	pub transferred: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub total: Option<u64>,
}

impl Progress {
	/// Completed fraction in `0.0..=1.0`, when the total is known.
	pub fn fraction(&self) -> Option<f64> {
		match self.total {
			Some(0) => Some(1.0),
			Some(total) => Some((self.transferred as f64 / total as f64).min(1.0)),
			None => None,
		}
	}
}

/// Result of a remote command run through `ssh_exec`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
	#[serde(default)]
	pub stdout: String,
	#[serde(default)]
	pub stderr: String,
	#[serde(default)]
	pub exit_code: Option<i32>,
}

/// Header of an upload chunk frame; the chunk itself is the frame payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkHeader {
	pub operation_id: u64,
	pub path: String,
	pub offset: u64,
	pub total: u64,
	#[serde(rename = "final")]
	pub is_final: bool,
}

/// Header field carrying the operation id on every operation frame.
pub const OPERATION_ID_FIELD: &str = "operationId";
