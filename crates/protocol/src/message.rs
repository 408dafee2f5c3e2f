//! Message-type byte carried in every frame prefix.

use std::fmt;

/// Frame message type.
///
/// Known codes map to named variants; anything else decodes to
/// [`MessageType::Unknown`] so that newer gateways can add types without
/// breaking older clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
	Ping,
	Pong,
	Connect,
	Authenticate,
	Connected,
	Error,
	Closed,
	Data,
	Resize,
	Disconnect,
	NetworkLatency,
	SftpInit,
	SftpList,
	SftpMkdir,
	SftpDelete,
	SftpRename,
	SftpChmod,
	SftpClose,
	SftpCancel,
	SftpUpload,
	SftpDownload,
	SftpProgress,
	SftpSuccess,
	SftpError,
	SshExec,
	/// Type byte not known to this version of the protocol.
	Unknown(u8),
}

impl MessageType {
	/// Wire code for this message type.
	pub fn code(self) -> u8 {
		match self {
			MessageType::Ping => 0x01,
			MessageType::Pong => 0x02,
			MessageType::Connect => 0x03,
			MessageType::Authenticate => 0x04,
			MessageType::Connected => 0x05,
			MessageType::Error => 0x06,
			MessageType::Closed => 0x07,
			MessageType::Data => 0x08,
			MessageType::Resize => 0x09,
			MessageType::Disconnect => 0x0a,
			MessageType::NetworkLatency => 0x10,
			MessageType::SftpInit => 0x20,
			MessageType::SftpList => 0x21,
			MessageType::SftpMkdir => 0x22,
			MessageType::SftpDelete => 0x23,
			MessageType::SftpRename => 0x24,
			MessageType::SftpChmod => 0x25,
			MessageType::SftpClose => 0x26,
			MessageType::SftpCancel => 0x27,
			MessageType::SftpUpload => 0x28,
			MessageType::SftpDownload => 0x29,
			MessageType::SftpProgress => 0x30,
			MessageType::SftpSuccess => 0x31,
			MessageType::SftpError => 0x32,
			MessageType::SshExec => 0x40,
			MessageType::Unknown(code) => code,
		}
	}

	/// Decodes a wire code. Never fails.
	pub fn from_code(code: u8) -> Self {
		match code {
			0x01 => MessageType::Ping,
			0x02 => MessageType::Pong,
			0x03 => MessageType::Connect,
			0x04 => MessageType::Authenticate,
			0x05 => MessageType::Connected,
			0x06 => MessageType::Error,
			0x07 => MessageType::Closed,
			0x08 => MessageType::Data,
			0x09 => MessageType::Resize,
			0x0a => MessageType::Disconnect,
			0x10 => MessageType::NetworkLatency,
			0x20 => MessageType::SftpInit,
			0x21 => MessageType::SftpList,
			0x22 => MessageType::SftpMkdir,
			0x23 => MessageType::SftpDelete,
			0x24 => MessageType::SftpRename,
			0x25 => MessageType::SftpChmod,
			0x26 => MessageType::SftpClose,
			0x27 => MessageType::SftpCancel,
			0x28 => MessageType::SftpUpload,
			0x29 => MessageType::SftpDownload,
			0x30 => MessageType::SftpProgress,
			0x31 => MessageType::SftpSuccess,
			0x32 => MessageType::SftpError,
			0x40 => MessageType::SshExec,
			other => MessageType::Unknown(other),
		}
	}

	/// Envelope-style name (`"sftp_list"`, `"network_latency"`, ...).
	pub fn name(self) -> &'static str {
		match self {
			MessageType::Ping => "ping",
			MessageType::Pong => "pong",
			MessageType::Connect => "connect",
			MessageType::Authenticate => "authenticate",
			MessageType::Connected => "connected",
			MessageType::Error => "error",
			MessageType::Closed => "closed",
			MessageType::Data => "data",
			MessageType::Resize => "resize",
			MessageType::Disconnect => "disconnect",
			MessageType::NetworkLatency => "network_latency",
			MessageType::SftpInit => "sftp_init",
			MessageType::SftpList => "sftp_list",
			MessageType::SftpMkdir => "sftp_mkdir",
			MessageType::SftpDelete => "sftp_delete",
			MessageType::SftpRename => "sftp_rename",
			MessageType::SftpChmod => "sftp_chmod",
			MessageType::SftpClose => "sftp_close",
			MessageType::SftpCancel => "sftp_cancel",
			MessageType::SftpUpload => "sftp_upload",
			MessageType::SftpDownload => "sftp_download",
			MessageType::SftpProgress => "sftp_progress",
			MessageType::SftpSuccess => "sftp_success",
			MessageType::SftpError => "sftp_error",
			MessageType::SshExec => "ssh_exec",
			MessageType::Unknown(_) => "unknown",
		}
	}

	/// Looks up a known type by its envelope name.
	pub fn from_name(name: &str) -> Option<Self> {
		ALL.iter().copied().find(|t| t.name() == name)
	}

	/// Whether this type belongs to the file-operation sub-channel.
	pub fn is_operation(self) -> bool {
		matches!(
			self,
			MessageType::SftpInit
				| MessageType::SftpList
				| MessageType::SftpMkdir
				| MessageType::SftpDelete
				| MessageType::SftpRename
				| MessageType::SftpChmod
				| MessageType::SftpClose
				| MessageType::SftpCancel
				| MessageType::SftpUpload
				| MessageType::SftpDownload
				| MessageType::SftpProgress
				| MessageType::SftpSuccess
				| MessageType::SftpError
				| MessageType::SshExec
		)
	}
}

impl From<u8> for MessageType {
	fn from(code: u8) -> Self {
		MessageType::from_code(code)
	}
}

impl From<MessageType> for u8 {
	fn from(ty: MessageType) -> Self {
		ty.code()
	}
}

impl fmt::Display for MessageType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			MessageType::Unknown(code) => write!(f, "unknown(0x{code:02x})"),
			other => f.write_str(other.name()),
		}
	}
}

const ALL: &[MessageType] = &[
	MessageType::Ping,
	MessageType::Pong,
	MessageType::Connect,
	MessageType::Authenticate,
	MessageType::Connected,
	MessageType::Error,
	MessageType::Closed,
	MessageType::Data,
	MessageType::Resize,
	MessageType::Disconnect,
	MessageType::NetworkLatency,
	MessageType::SftpInit,
	MessageType::SftpList,
	MessageType::SftpMkdir,
	MessageType::SftpDelete,
	MessageType::SftpRename,
	MessageType::SftpChmod,
	MessageType::SftpClose,
	MessageType::SftpCancel,
	MessageType::SftpUpload,
	MessageType::SftpDownload,
	MessageType::SftpProgress,
	MessageType::SftpSuccess,
	MessageType::SftpError,
	MessageType::SshExec,
];
