//! Tether runtime - gateway sessions, transport and operation correlation
//!
//! This crate keeps a logical session to a remote shell and file-transfer
//! gateway alive over an unreliable WebSocket:
//!
//! - **Transport**: dual-stack connect with sequential address-family fallback
//! - **Sessions**: handshake, lifecycle state machine and linear-backoff reconnect
//! - **Keepalive**: periodic probes and round-trip latency
//! - **Correlation**: operation ids matched to out-of-order replies, with
//!   per-operation timeouts
//! - **Routing**: inbound classification into lifecycle, data, keepalive and
//!   operation traffic
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐
//! │ SessionManager │  registry (DashMap), events (broadcast)
//! └───────┬────────┘
//!         │ one task per session
//! ┌───────▼────────┐
//! │    Session     │  commands (mpsc) in, snapshots (watch) out
//! │  ┌──────────┐  │
//! │  │ Router   │──┼──▶ OperationCorrelator ◀── SftpClient
//! │  └──────────┘  │
//! │  ┌──────────┐  │
//! │  │KeepAlive │  │
//! │  └──────────┘  │
//! │  ┌──────────┐  │
//! │  │Transport │  │  WebSocket: binary frames + JSON envelopes
//! │  └──────────┘  │
//! └────────────────┘
//! ```
//!
//! The runtime never installs a `tracing` subscriber; targets are
//! `tether.session`, `tether.transport`, `tether.router`, `tether.keepalive`,
//! `tether.ops` and `tether.config`.

pub mod config;
pub mod correlator;
pub mod error;
pub mod events;
pub mod keepalive;
pub mod manager;
pub mod router;
pub mod session;
pub mod sftp;
pub mod transport;

pub use config::{
	ConfigProvider, GatewayConfig, KeepAliveConfig, ManagerConfig, OperationTimeouts, ReconnectPolicy, StaticConfigProvider, TerminalSize,
};
pub use correlator::{OperationCorrelator, OperationReply, PendingOperation, ProgressSender};
pub use error::{Error, Result};
pub use events::{SessionEvent, SessionEventKind};
pub use keepalive::{KeepAliveMonitor, KeepAliveProbe};
pub use manager::SessionManager;
pub use router::{EventRouter, Inbound, Signal};
pub use session::{DataSink, PreAttachBuffer, SessionHandle, SessionSnapshot, SessionState};
pub use sftp::{SftpClient, UPLOAD_CHUNK_SIZE};
pub use tether_protocol::{AuthMethod, ConnectionConfig, ExecOutput, FileEntry, ListReply, OperationKind, Progress};
pub use transport::{AddressFamily, CloseInfo, Transport, TransportConnector};
