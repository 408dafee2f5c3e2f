//! Connection target description and the handshake headers derived from it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Remote host a session connects to through the gateway.
///
/// Immutable once a session has been created from it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
	pub host: String,
	#[serde(default = "default_ssh_port")]
	pub port: u16,
	pub username: String,
	pub auth: AuthMethod,
}

fn default_ssh_port() -> u16 {
	22
}

impl ConnectionConfig {
	/// Password-authenticated target.
	pub fn password(host: impl Into<String>, port: u16, username: impl Into<String>, password: impl Into<String>) -> Self {
		Self {
			host: host.into(),
			port,
			username: username.into(),
			auth: AuthMethod::Password { password: password.into() },
		}
	}

	/// Key-authenticated target.
	pub fn key(
		host: impl Into<String>,
		port: u16,
		username: impl Into<String>,
		private_key: impl Into<String>,
		passphrase: Option<String>,
	) -> Self {
		Self {
			host: host.into(),
			port,
			username: username.into(),
			auth: AuthMethod::Key {
				private_key: private_key.into(),
				passphrase,
			},
		}
	}

	/// Header of the CONNECT frame. Carries no secret material.
	pub fn connect_header(&self, cols: u16, rows: u16) -> ConnectHeader {
		ConnectHeader {
			host: self.host.clone(),
			port: self.port,
			username: self.username.clone(),
			auth_type: self.auth.auth_type(),
			cols,
			rows,
		}
	}

	/// Header of the AUTHENTICATE frame.
	pub fn authenticate_header(&self) -> AuthenticateHeader {
		match &self.auth {
			AuthMethod::Password { password } => AuthenticateHeader {
				auth_type: AuthType::Password,
				password: Some(password.clone()),
				private_key: None,
				passphrase: None,
			},
			AuthMethod::Key { private_key, passphrase } => AuthenticateHeader {
				auth_type: AuthType::Key,
				password: None,
				private_key: Some(private_key.clone()),
				passphrase: passphrase.clone(),
			},
		}
	}
}

impl fmt::Debug for ConnectionConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ConnectionConfig")
			.field("host", &self.host)
			.field("port", &self.port)
			.field("username", &self.username)
			.field("auth", &self.auth)
			.finish()
	}
}

/// Secret material used to authenticate against the remote host.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "authType", rename_all = "camelCase")]
pub enum AuthMethod {
	#[serde(rename_all = "camelCase")]
	Password { password: String },
	#[serde(rename_all = "camelCase")]
	Key {
		private_key: String,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		passphrase: Option<String>,
	},
}

impl AuthMethod {
	pub fn auth_type(&self) -> AuthType {
		match self {
			AuthMethod::Password { .. } => AuthType::Password,
			AuthMethod::Key { .. } => AuthType::Key,
		}
	}
}

impl fmt::Debug for AuthMethod {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			AuthMethod::Password { .. } => f.write_str("Password(<redacted>)"),
			AuthMethod::Key { passphrase, .. } => f
				.debug_struct("Key")
				.field("private_key", &"<redacted>")
				.field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
				.finish(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
	Password,
	Key,
}

/// CONNECT frame header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectHeader {
	pub host: String,
	pub port: u16,
	pub username: String,
	pub auth_type: AuthType,
	pub cols: u16,
	pub rows: u16,
}

/// AUTHENTICATE frame header.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateHeader {
	pub auth_type: AuthType,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub password: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub private_key: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub passphrase: Option<String>,
}

impl fmt::Debug for AuthenticateHeader {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("AuthenticateHeader").field("auth_type", &self.auth_type).finish_non_exhaustive()
	}
}
