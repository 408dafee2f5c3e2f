//! Binary frame codec.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! ┌──────────┬─────────┬──────┬────────────┬──────────────────┬─────────────┐
//! │ magic 4B │ ver 1B  │ ty 1B│ hdr len 4B │ JSON header      │ raw payload │
//! └──────────┴─────────┴──────┴────────────┴──────────────────┴─────────────┘
//! ```
//!
//! The header is a UTF-8 JSON document so fields can be added without
//! disturbing payload alignment. Everything after the header is payload; a
//! frame without trailing bytes has no payload.

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::message::MessageType;

/// Frame magic, `"TTHR"`.
pub const FRAME_MAGIC: u32 = 0x5454_4852;

/// Protocol version written by [`encode`].
pub const PROTOCOL_VERSION: u8 = 1;

/// Versions accepted by [`decode`].
pub const SUPPORTED_VERSIONS: &[u8] = &[1];

/// Fixed prefix length: magic + version + type + header length.
pub const FRAME_PREFIX_LEN: usize = 10;

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum FrameError {
	#[error("frame too short: {len} bytes, need at least {FRAME_PREFIX_LEN}")]
	TooShort { len: usize },

	#[error("bad frame magic 0x{found:08x}")]
	BadMagic { found: u32 },

	#[error("unsupported protocol version {0}")]
	UnsupportedVersion(u8),

	#[error("header length {declared} exceeds {available} available bytes")]
	HeaderOverrun { declared: usize, available: usize },

	#[error("header too large to encode: {0} bytes")]
	HeaderTooLarge(usize),

	#[error("invalid frame header: {0}")]
	Header(#[from] serde_json::Error),
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
	pub version: u8,
	pub message_type: MessageType,
	pub header: Value,
	/// Raw payload, `None` when the frame ends right after the header.
	pub payload: Option<Bytes>,
}

impl Frame {
	/// Reads a string field from the header.
	pub fn header_str(&self, key: &str) -> Option<&str> {
		self.header.get(key).and_then(Value::as_str)
	}

	/// Reads an unsigned integer field from the header.
	pub fn header_u64(&self, key: &str) -> Option<u64> {
		self.header.get(key).and_then(Value::as_u64)
	}

	/// Payload bytes, empty when absent.
	pub fn payload_bytes(&self) -> Bytes {
		self.payload.clone().unwrap_or_default()
	}
}

/// Encodes a frame.
pub fn encode<H: Serialize + ?Sized>(message_type: MessageType, header: &H, payload: Option<&[u8]>) -> Result<Bytes, FrameError> {
	let header = serde_json::to_vec(header)?;
	let header_len = u32::try_from(header.len()).map_err(|_| FrameError::HeaderTooLarge(header.len()))?;
	let payload = payload.unwrap_or_default();

	let mut buf = BytesMut::with_capacity(FRAME_PREFIX_LEN + header.len() + payload.len());
	buf.put_u32(FRAME_MAGIC);
	buf.put_u8(PROTOCOL_VERSION);
	buf.put_u8(message_type.code());
	buf.put_u32(header_len);
	buf.put_slice(&header);
	buf.put_slice(payload);

	Ok(buf.freeze())
}

/// Decodes one complete frame.
pub fn decode(frame: &[u8]) -> Result<Frame, FrameError> {
	if frame.len() < FRAME_PREFIX_LEN {
		return Err(FrameError::TooShort { len: frame.len() });
	}

	let magic = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
	if magic != FRAME_MAGIC {
		return Err(FrameError::BadMagic { found: magic });
	}

	let version = frame[4];
	if !SUPPORTED_VERSIONS.contains(&version) {
		return Err(FrameError::UnsupportedVersion(version));
	}

	let message_type = MessageType::from_code(frame[5]);
	let declared = u32::from_be_bytes([frame[6], frame[7], frame[8], frame[9]]) as usize;
	let rest = &frame[FRAME_PREFIX_LEN..];
	if declared > rest.len() {
		return Err(FrameError::HeaderOverrun {
			declared,
			available: rest.len(),
		});
	}

	let (header_bytes, payload) = rest.split_at(declared);
	let header = if header_bytes.is_empty() {
		Value::Null
	} else {
		serde_json::from_slice(header_bytes)?
	};

	Ok(Frame {
		version,
		message_type,
		header,
		payload: (!payload.is_empty()).then(|| Bytes::copy_from_slice(payload)),
	})
}
