//! Wire types for the tether gateway protocol.
//!
//! This crate contains the data shapes exchanged with a shell/file-transfer
//! gateway:
//!
//! - **Frames**: binary messages with a fixed prefix, a JSON header and a raw
//!   payload ([`codec`])
//! - **Envelopes**: JSON text messages `{type, data}` used for terminal
//!   traffic and lifecycle notices ([`envelope`])
//! - **Connection config**: the remote target and its credentials ([`config`])
//! - **Operation payloads**: directory listings, progress, exec output ([`ops`])
//!
//! Types here carry no I/O. Session management lives in `tether-runtime`.

pub mod codec;
pub mod config;
pub mod envelope;
pub mod message;
pub mod ops;

pub use codec::{FRAME_MAGIC, FRAME_PREFIX_LEN, Frame, FrameError, PROTOCOL_VERSION, decode, encode};
pub use config::{AuthMethod, AuthType, AuthenticateHeader, ConnectHeader, ConnectionConfig};
pub use envelope::Envelope;
pub use message::MessageType;
pub use ops::{ExecOutput, FileEntry, ListReply, OPERATION_ID_FIELD, OperationKind, Progress, UploadChunkHeader};
