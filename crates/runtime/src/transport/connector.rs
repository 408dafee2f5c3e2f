//! Dual-stack connection establishment.
//!
//! The gateway host is resolved once per connect; addresses are split by
//! family and the preferred family is dialled first. The other family is only
//! tried after the first one failed or ran out of time. This is sequential
//! fallback, not a race.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use super::Transport;
use crate::config::GatewayConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
	V4,
	V6,
}

impl AddressFamily {
	pub fn of(addr: &SocketAddr) -> Self {
		if addr.is_ipv4() { AddressFamily::V4 } else { AddressFamily::V6 }
	}

	pub fn other(self) -> Self {
		match self {
			AddressFamily::V4 => AddressFamily::V6,
			AddressFamily::V6 => AddressFamily::V4,
		}
	}
}

impl fmt::Display for AddressFamily {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			AddressFamily::V4 => "ipv4",
			AddressFamily::V6 => "ipv6",
		})
	}
}

/// Ordered addresses for one connect: primary family, then secondary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialPlan {
	pub primary_family: AddressFamily,
	pub primary: Vec<SocketAddr>,
	pub secondary: Vec<SocketAddr>,
}

impl DialPlan {
	/// Partitions resolved addresses by family, keeping resolver order within
	/// each family.
	pub fn from_addrs(addrs: impl IntoIterator<Item = SocketAddr>, prefer_ipv6: bool) -> Self {
		let primary_family = if prefer_ipv6 { AddressFamily::V6 } else { AddressFamily::V4 };
		let (primary, secondary): (Vec<SocketAddr>, Vec<SocketAddr>) = addrs.into_iter().partition(|addr| AddressFamily::of(addr) == primary_family);
		Self {
			primary_family,
			primary,
			secondary,
		}
	}

	pub fn secondary_family(&self) -> AddressFamily {
		self.primary_family.other()
	}
}

/// Opens transports to the configured gateway.
#[derive(Debug, Clone)]
pub struct TransportConnector {
	gateway: GatewayConfig,
	timeout: Duration,
}

impl TransportConnector {
	pub fn new(gateway: GatewayConfig, timeout: Duration) -> Self {
		Self { gateway, timeout }
	}

	pub fn gateway(&self) -> &GatewayConfig {
		&self.gateway
	}

	pub fn timeout(&self) -> Duration {
		self.timeout
	}

	/// Resolves the gateway and dials it with address-family fallback.
	pub async fn connect(&self) -> Result<Transport> {
		let host = self.gateway.host.as_str();
		let plan = self.resolve(tokio::net::lookup_host((host, self.gateway.port))).await?;
		debug!(
			target: "tether.transport",
			host,
			primary = ?plan.primary,
			secondary = ?plan.secondary,
			"resolved gateway"
		);
		self.dial(&plan).await
	}

	/// Bounds name resolution by the connect timeout.
	pub(crate) async fn resolve<I>(&self, lookup: impl Future<Output = std::io::Result<I>>) -> Result<DialPlan>
	where
		I: IntoIterator<Item = SocketAddr>,
	{
		let host = self.gateway.host.as_str();
		let addrs = match tokio::time::timeout(self.timeout, lookup).await {
			Ok(Ok(addrs)) => addrs,
			Ok(Err(e)) => return Err(Error::Connect(format!("failed to resolve {host}: {e}"))),
			Err(_) => return Err(Error::Connect(format!("resolving {host} timed out after {:?}", self.timeout))),
		};
		Ok(DialPlan::from_addrs(addrs, self.gateway.prefer_ipv6))
	}

	/// Dials a pre-resolved plan. Each family gets its own timeout budget.
	pub async fn dial(&self, plan: &DialPlan) -> Result<Transport> {
		let url = self.gateway.url();

		let primary_err = match self.attempt(plan.primary_family, &plan.primary, &url).await {
			Ok(transport) => return Ok(transport),
			Err(err) => err,
		};

		let secondary_family = plan.secondary_family();
		warn!(
			target: "tether.transport",
			family = %plan.primary_family,
			error = %primary_err,
			fallback = %secondary_family,
			"primary address family failed"
		);

		match self.attempt(secondary_family, &plan.secondary, &url).await {
			Ok(transport) => Ok(transport),
			Err(secondary_err) => Err(Error::Connect(format!(
				"{}: {primary_err}; {secondary_family}: {secondary_err}",
				plan.primary_family
			))),
		}
	}

	async fn attempt(&self, family: AddressFamily, addrs: &[SocketAddr], url: &str) -> std::result::Result<Transport, String> {
		if addrs.is_empty() {
			return Err("no address".to_string());
		}

		match tokio::time::timeout(self.timeout, open(family, addrs, url)).await {
			Ok(result) => result,
			Err(_) => Err(format!("timed out after {:?}", self.timeout)),
		}
	}
}

async fn open(family: AddressFamily, addrs: &[SocketAddr], url: &str) -> std::result::Result<Transport, String> {
	let mut failures = Vec::with_capacity(addrs.len());

	for addr in addrs {
		let stream = match TcpStream::connect(addr).await {
			Ok(stream) => stream,
			Err(e) => {
				failures.push(format!("{addr}: {e}"));
				continue;
			}
		};
		if let Err(e) = stream.set_nodelay(true) {
			debug!(target: "tether.transport", %addr, error = %e, "failed to set TCP_NODELAY");
		}

		match tokio_tungstenite::client_async_tls(url, stream).await {
			Ok((ws, _response)) => {
				debug!(target: "tether.transport", %addr, %family, "transport open");
				return Ok(Transport::new(ws, *addr, family));
			}
			Err(e) => failures.push(format!("{addr}: websocket upgrade failed: {e}")),
		}
	}

	Err(failures.join(", "))
}
