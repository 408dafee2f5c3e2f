//! Keepalive probing and latency measurement.
//!
//! The monitor is plain state driven by the session task: the task ticks it
//! every `interval / 2`, sends the probe it returns, and feeds matching PONGs
//! back. Probes that outlive the expiry window are dropped. Whether a run of
//! expired probes means the transport is dead is decided by
//! [`KeepAliveConfig::max_missed_probes`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tracing::{debug, trace};

use crate::config::KeepAliveConfig;

/// One outstanding probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveProbe {
	pub request_id: u64,
	pub sent_at: Instant,
	pub session_id: Arc<str>,
}

/// Header of a PING frame.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingHeader {
	pub request_id: u64,
	/// Wall-clock send time in ms since the Unix epoch.
	pub timestamp: u64,
}

/// What a tick produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tick {
	/// Probe to send now.
	pub probe: KeepAliveProbe,
	/// Probes garbage-collected on this tick.
	pub expired: usize,
	/// The configured missed-probe limit was reached.
	pub liveness_lost: bool,
}

/// Per-session keepalive state.
#[derive(Debug)]
pub struct KeepAliveMonitor {
	session_id: Arc<str>,
	config: KeepAliveConfig,
	next_request_id: u64,
	pending: HashMap<u64, KeepAliveProbe>,
	consecutive_missed: u32,
	latency: Option<Duration>,
}

impl KeepAliveMonitor {
	pub fn new(session_id: Arc<str>, config: KeepAliveConfig) -> Self {
		Self {
			session_id,
			config,
			next_request_id: 1,
			pending: HashMap::new(),
			consecutive_missed: 0,
			latency: None,
		}
	}

	/// Probe period, half the nominal interval.
	pub fn period(&self) -> Duration {
		self.config.probe_period()
	}

	/// Expires stale probes and records a new one.
	pub fn tick(&mut self, now: Instant) -> Tick {
		let expired = self.collect_expired(now);

		let request_id = self.next_request_id;
		self.next_request_id += 1;
		let probe = KeepAliveProbe {
			request_id,
			sent_at: now,
			session_id: Arc::clone(&self.session_id),
		};
		self.pending.insert(request_id, probe.clone());
		trace!(target: "tether.keepalive", session = %self.session_id, request_id, "probe sent");

		let liveness_lost = self.config.max_missed_probes.is_some_and(|limit| self.consecutive_missed >= limit);

		Tick {
			probe,
			expired,
			liveness_lost,
		}
	}

	/// Drops probes older than the expiry window. Returns how many went.
	pub fn collect_expired(&mut self, now: Instant) -> usize {
		let expiry = self.config.probe_expiry;
		let before = self.pending.len();
		self.pending.retain(|_, probe| now.saturating_duration_since(probe.sent_at) < expiry);
		let expired = before - self.pending.len();

		if expired > 0 {
			self.consecutive_missed = self.consecutive_missed.saturating_add(expired as u32);
			debug!(
				target: "tether.keepalive",
				session = %self.session_id,
				expired,
				consecutive = self.consecutive_missed,
				"keepalive probes expired unanswered"
			);
		}
		expired
	}

	/// Matches a PONG. Returns the measured round trip for a known probe.
	pub fn on_pong(&mut self, request_id: u64, now: Instant) -> Option<Duration> {
		let probe = self.pending.remove(&request_id)?;
		let rtt = now.saturating_duration_since(probe.sent_at);
		self.consecutive_missed = 0;
		self.latency = Some(rtt);
		trace!(target: "tether.keepalive", session = %self.session_id, request_id, rtt_ms = rtt.as_millis() as u64, "probe answered");
		Some(rtt)
	}

	/// Records a gateway-measured latency.
	pub fn on_latency_report(&mut self, latency: Duration) {
		self.consecutive_missed = 0;
		self.latency = Some(latency);
	}

	/// Forgets outstanding probes, e.g. after the transport was replaced.
	pub fn reset(&mut self) {
		self.pending.clear();
		self.consecutive_missed = 0;
	}

	pub fn latency(&self) -> Option<Duration> {
		self.latency
	}

	pub fn outstanding(&self) -> usize {
		self.pending.len()
	}

	pub fn consecutive_missed(&self) -> u32 {
		self.consecutive_missed
	}
}

impl PingHeader {
	pub fn for_probe(probe: &KeepAliveProbe) -> Self {
		Self {
			request_id: probe.request_id,
			timestamp: unix_millis(),
		}
	}
}

fn unix_millis() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn monitor(max_missed: Option<u32>) -> KeepAliveMonitor {
		KeepAliveMonitor::new(
			Arc::from("s-1"),
			KeepAliveConfig {
				interval: Duration::from_secs(30),
				probe_expiry: Duration::from_secs(10),
				max_missed_probes: max_missed,
			},
		)
	}

	#[test]
	fn period_is_half_the_interval() {
		assert_eq!(monitor(None).period(), Duration::from_secs(15));
	}

	#[test]
	fn request_ids_increase() {
		let mut m = monitor(None);
		let now = Instant::now();
		let a = m.tick(now).probe.request_id;
		let b = m.tick(now).probe.request_id;
		assert!(b > a);
		assert_eq!(m.outstanding(), 2);
	}

	#[test]
	fn pong_measures_round_trip() {
		let mut m = monitor(None);
		let start = Instant::now();
		let probe = m.tick(start).probe;

		let rtt = m.on_pong(probe.request_id, start + Duration::from_millis(42)).unwrap();
		assert_eq!(rtt, Duration::from_millis(42));
		assert_eq!(m.latency(), Some(Duration::from_millis(42)));
		assert_eq!(m.outstanding(), 0);
	}

	#[test]
	fn unknown_pong_is_ignored() {
		let mut m = monitor(None);
		assert_eq!(m.on_pong(99, Instant::now()), None);
		assert_eq!(m.latency(), None);
	}

	#[test]
	fn stale_probes_are_collected() {
		let mut m = monitor(None);
		let start = Instant::now();
		m.tick(start);
		m.tick(start + Duration::from_secs(5));

		assert_eq!(m.collect_expired(start + Duration::from_secs(11)), 1);
		assert_eq!(m.outstanding(), 1);
		assert_eq!(m.consecutive_missed(), 1);
	}

	#[test]
	fn expiry_is_advisory_without_a_limit() {
		let mut m = monitor(None);
		let mut now = Instant::now();
		for _ in 0..10 {
			let tick = m.tick(now);
			assert!(!tick.liveness_lost);
			now += Duration::from_secs(15);
		}
		assert!(m.consecutive_missed() >= 8);
	}

	#[test]
	fn missed_probe_limit_reports_liveness_loss() {
		let mut m = monitor(Some(2));
		let start = Instant::now();
		assert!(!m.tick(start).liveness_lost);
		assert!(!m.tick(start + Duration::from_secs(15)).liveness_lost);
		let tick = m.tick(start + Duration::from_secs(30));
		assert_eq!(tick.expired, 1);
		assert!(tick.liveness_lost);
	}

	#[test]
	fn answer_resets_missed_count() {
		let mut m = monitor(Some(2));
		let start = Instant::now();
		m.tick(start);
		let second = m.tick(start + Duration::from_secs(15)).probe;
		m.collect_expired(start + Duration::from_secs(20));
		assert_eq!(m.consecutive_missed(), 1);

		m.on_pong(second.request_id, start + Duration::from_secs(21));
		assert_eq!(m.consecutive_missed(), 0);
	}

	#[derive(Clone, Default)]
	struct Captured(Arc<parking_lot::Mutex<Vec<u8>>>);

	impl std::io::Write for Captured {
		fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
			self.0.lock().extend_from_slice(buf);
			Ok(buf.len())
		}

		fn flush(&mut self) -> std::io::Result<()> {
			Ok(())
		}
	}

	#[test]
	fn expiry_is_logged_under_the_keepalive_target() {
		let captured = Captured::default();
		let writer = captured.clone();
		let subscriber = tracing_subscriber::fmt()
			.with_env_filter(tracing_subscriber::EnvFilter::new("tether.keepalive=debug"))
			.with_writer(move || writer.clone())
			.with_ansi(false)
			.finish();

		tracing::subscriber::with_default(subscriber, || {
			let mut m = monitor(None);
			let start = Instant::now();
			m.tick(start);
			m.collect_expired(start + Duration::from_secs(11));
		});

		let output = String::from_utf8_lossy(&captured.0.lock()).into_owned();
		assert!(output.contains("tether.keepalive"), "{output}");
		assert!(output.contains("keepalive probes expired unanswered"), "{output}");
	}
}
