//! The task that owns one session.
//!
//! The task is the only place that touches the session's transport. It
//! multiplexes three inputs: commands from [`SessionHandle`]s, inbound
//! messages, and the keepalive ticker. While the transport is down it runs
//! the reconnect loop instead, still listening for commands so a close
//! cancels the backoff.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::json;
use tether_protocol::{ConnectionConfig, Envelope, MessageType};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::{DataSink, Handshake, PreAttachBuffer, SessionHandle, SessionSnapshot, SessionState, abandon, authenticate, establish};
use crate::config::{ManagerConfig, TerminalSize};
use crate::correlator::OperationCorrelator;
use crate::error::{Error, Result};
use crate::events::{SessionEvent, SessionEventKind};
use crate::keepalive::{KeepAliveMonitor, PingHeader};
use crate::router::{EventRouter, Signal};
use crate::transport::{CLOSE_NORMAL, Transport, TransportConnector, TransportEvent};

/// Requests from handles to the session task.
pub(crate) enum Command {
	Input(Bytes),
	Resize { cols: u16, rows: u16 },
	/// Pre-encoded operation frame.
	Frame { frame: Bytes, ack: oneshot::Sender<Result<()>> },
	Attach(Weak<dyn DataSink>),
	Detach,
	Close { ack: oneshot::Sender<()> },
}

enum Flow {
	Continue,
	Stop,
}

/// State owned by the session task.
pub(crate) struct Session {
	id: Arc<str>,
	config: Arc<ConnectionConfig>,
	settings: Arc<ManagerConfig>,
	connector: TransportConnector,
	state: SessionState,
	transport: Option<Transport>,
	retry_count: u32,
	last_activity: Instant,
	buffer: PreAttachBuffer,
	sink: Option<Weak<dyn DataSink>>,
	terminal: TerminalSize,
	keepalive: KeepAliveMonitor,
	router: EventRouter,
	commands: mpsc::UnboundedReceiver<Command>,
	status: watch::Sender<SessionSnapshot>,
	events: broadcast::Sender<SessionEvent>,
}

impl Session {
	/// Connects and authenticates a new session.
	///
	/// Returns the session ready to [`run`](Self::run) and a handle to it. On
	/// failure the transport is closed, subscribers see the session move to
	/// `Closed` and nothing outlives the call.
	pub(crate) async fn open(
		id: Arc<str>,
		config: Arc<ConnectionConfig>,
		settings: Arc<ManagerConfig>,
		connector: TransportConnector,
		events: broadcast::Sender<SessionEvent>,
	) -> Result<(Session, SessionHandle)> {
		let correlator = OperationCorrelator::new(Arc::clone(&id));
		let (command_tx, command_rx) = mpsc::unbounded_channel();
		let (status_tx, status_rx) = watch::channel(SessionSnapshot::new(Arc::clone(&id)));

		let mut session = Session {
			keepalive: KeepAliveMonitor::new(Arc::clone(&id), settings.keepalive.clone()),
			router: EventRouter::new(Arc::clone(&id), correlator.clone()),
			buffer: PreAttachBuffer::new(settings.pre_attach_buffer_bytes),
			terminal: settings.terminal,
			id: Arc::clone(&id),
			config: Arc::clone(&config),
			settings: Arc::clone(&settings),
			connector,
			state: SessionState::Connecting,
			transport: None,
			retry_count: 0,
			last_activity: Instant::now(),
			sink: None,
			commands: command_rx,
			status: status_tx,
			events,
		};

		let mut transport = match session.connector.connect().await {
			Ok(transport) => transport,
			Err(err) => {
				session.transition(SessionState::Closed);
				return Err(err);
			}
		};
		session.transition(SessionState::Authenticating);

		let handshake = match authenticate(&mut transport, &config, session.terminal, settings.handshake_timeout, &id).await {
			Ok(handshake) => handshake,
			Err(err) => {
				abandon(&mut transport, &id).await;
				session.transition(SessionState::Closed);
				return Err(err);
			}
		};
		session.install(transport, handshake);

		let handle = SessionHandle::new(id, config, command_tx, status_rx, correlator, settings.operation_timeouts.clone());
		Ok((session, handle))
	}

	/// Drives the session until it is closed.
	pub(crate) async fn run(mut self) {
		let period = self.keepalive.period();
		let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			let flow = match self.transport.as_mut() {
				Some(transport) => {
					tokio::select! {
						command = self.commands.recv() => self.on_command(command).await,
						event = transport.recv() => self.on_transport_event(event).await,
						_ = ticker.tick() => self.on_keepalive_tick().await,
					}
				}
				None => self.reconnect().await,
			};
			if let Flow::Stop = flow {
				break;
			}
		}

		debug!(target: "tether.session", session = %self.id, "session task finished");
	}

	async fn on_command(&mut self, command: Option<Command>) -> Flow {
		let Some(command) = command else {
			self.close_gracefully("all handles dropped").await;
			return Flow::Stop;
		};

		match command {
			Command::Input(data) => match tether_protocol::encode(MessageType::Data, &json!({}), Some(&data[..])) {
				Ok(frame) => self.send(frame).await,
				Err(err) => warn!(target: "tether.session", session = %self.id, error = %err, "failed to encode input"),
			},
			Command::Resize { cols, rows } => {
				self.terminal = TerminalSize { cols, rows };
				if let Some(transport) = self.transport.as_mut() {
					if let Err(err) = transport.send_envelope(&Envelope::resize(cols, rows)).await {
						debug!(target: "tether.session", session = %self.id, error = %err, "failed to send resize");
					}
				}
			}
			Command::Frame { frame, ack } => {
				let result = match self.transport.as_mut() {
					Some(transport) => transport.send_frame(frame).await,
					None => Err(Error::NotConnected(self.id.to_string())),
				};
				let _ = ack.send(result);
			}
			Command::Attach(sink) => self.attach(sink),
			Command::Detach => self.detach(),
			Command::Close { ack } => {
				self.close_gracefully("client closed").await;
				let _ = ack.send(());
				return Flow::Stop;
			}
		}
		Flow::Continue
	}

	/// Commands arriving while the transport is down.
	async fn on_offline_command(&mut self, command: Option<Command>) -> Flow {
		match command {
			None => {
				self.teardown();
				Flow::Stop
			}
			Some(Command::Close { ack }) => {
				self.teardown();
				let _ = ack.send(());
				Flow::Stop
			}
			Some(Command::Input(data)) => {
				debug!(target: "tether.session", session = %self.id, bytes = data.len(), "dropping input while reconnecting");
				Flow::Continue
			}
			Some(Command::Resize { cols, rows }) => {
				self.terminal = TerminalSize { cols, rows };
				Flow::Continue
			}
			Some(Command::Frame { ack, .. }) => {
				let _ = ack.send(Err(Error::NotConnected(self.id.to_string())));
				Flow::Continue
			}
			Some(Command::Attach(sink)) => {
				self.attach(sink);
				Flow::Continue
			}
			Some(Command::Detach) => {
				self.detach();
				Flow::Continue
			}
		}
	}

	async fn on_transport_event(&mut self, event: TransportEvent) -> Flow {
		let message = match event {
			TransportEvent::Message(message) => message,
			TransportEvent::Closed(info) if info.is_expected() => {
				info!(target: "tether.session", session = %self.id, %info, "gateway closed the connection");
				self.transport = None;
				self.teardown();
				return Flow::Stop;
			}
			TransportEvent::Closed(info) => {
				self.on_transport_lost(info.code, info.to_string());
				return Flow::Continue;
			}
		};

		self.last_activity = Instant::now();
		let Some(signal) = self.router.route(&message) else {
			return Flow::Continue;
		};

		match signal {
			Signal::Data(bytes) => self.deliver(bytes),
			Signal::Ping(request_id) => match tether_protocol::encode(MessageType::Pong, &json!({ "requestId": request_id }), None) {
				Ok(frame) => self.send(frame).await,
				Err(err) => warn!(target: "tether.session", session = %self.id, error = %err, "failed to encode pong"),
			},
			Signal::Pong(request_id) => {
				if let Some(rtt) = self.keepalive.on_pong(request_id, Instant::now()) {
					self.report_latency(rtt);
				}
			}
			Signal::Latency(latency) => {
				self.keepalive.on_latency_report(latency);
				self.report_latency(latency);
			}
			Signal::GatewayError(message) => {
				warn!(target: "tether.session", session = %self.id, %message, "gateway reported an error");
				self.emit(SessionEventKind::Error { message, terminal: false });
			}
			Signal::GatewayClosed(reason) => {
				info!(target: "tether.session", session = %self.id, %reason, "remote shell closed");
				self.close_gracefully("remote closed").await;
				return Flow::Stop;
			}
			Signal::Connected(_) => {
				debug!(target: "tether.session", session = %self.id, "ignoring duplicate connected acknowledgement");
			}
			Signal::RepeatedMalformed { count, reason } => {
				self.emit(SessionEventKind::Error {
					message: format!("received {count} malformed messages, latest: {reason}"),
					terminal: false,
				});
			}
		}
		Flow::Continue
	}

	async fn on_keepalive_tick(&mut self) -> Flow {
		let Some(transport) = self.transport.as_mut() else {
			return Flow::Continue;
		};

		let tick = self.keepalive.tick(Instant::now());
		if tick.liveness_lost {
			self.on_transport_lost(None, format!("{} keepalive probes unanswered", self.keepalive.consecutive_missed()));
			return Flow::Continue;
		}

		match tether_protocol::encode(MessageType::Ping, &PingHeader::for_probe(&tick.probe), None) {
			Ok(frame) => {
				if let Err(err) = transport.send_frame(frame).await {
					debug!(target: "tether.keepalive", session = %self.id, error = %err, "failed to send probe");
				}
			}
			Err(err) => warn!(target: "tether.keepalive", session = %self.id, error = %err, "failed to encode probe"),
		}
		Flow::Continue
	}

	/// Drops the dead transport and fails in-flight operations. The run loop
	/// picks up reconnection from here.
	fn on_transport_lost(&mut self, code: Option<u16>, reason: String) {
		warn!(target: "tether.session", session = %self.id, ?code, %reason, "transport lost");
		self.transport = None;
		self.keepalive.reset();
		self.router.correlator().reject_all(|_, _| Error::TransportClosed {
			code,
			reason: reason.clone(),
		});
		self.publish();
	}

	/// Linear backoff reconnect. Runs until connected, closed or exhausted.
	async fn reconnect(&mut self) -> Flow {
		let policy = self.settings.reconnect.clone();
		let connector = self.connector.clone();
		let config = Arc::clone(&self.config);
		let id = Arc::clone(&self.id);
		let mut last_error = String::from("transport lost");

		loop {
			let attempt = self.retry_count + 1;
			if !policy.allows(attempt) {
				let error = Error::ReconnectExhausted {
					attempts: self.retry_count,
					last_error,
				};
				self.fail(error.to_string()).await;
				return Flow::Stop;
			}

			self.retry_count = attempt;
			self.transition(SessionState::Reconnecting { attempt });

			let delay = policy.delay_for(attempt);
			info!(target: "tether.session", session = %self.id, attempt, ?delay, "reconnecting");
			if let Flow::Stop = self.idle_for(delay).await {
				return Flow::Stop;
			}

			let attempt_future = establish(&connector, &config, self.terminal, self.settings.handshake_timeout, &id);
			tokio::pin!(attempt_future);
			let outcome = loop {
				tokio::select! {
					result = &mut attempt_future => break result,
					command = self.commands.recv() => {
						if let Flow::Stop = self.on_offline_command(command).await {
							return Flow::Stop;
						}
					}
				}
			};

			match outcome {
				Ok((transport, handshake)) => {
					info!(target: "tether.session", session = %self.id, attempt, peer = %transport.peer(), "reconnected");
					self.retry_count = 0;
					self.install(transport, handshake);
					return Flow::Continue;
				}
				Err(err) if err.is_auth() => {
					self.fail(format!("reconnect rejected: {err}")).await;
					return Flow::Stop;
				}
				Err(err) => {
					warn!(target: "tether.session", session = %self.id, attempt, error = %err, "reconnect attempt failed");
					last_error = err.to_string();
				}
			}
		}
	}

	/// Sleeps for `delay` while still serving commands.
	async fn idle_for(&mut self, delay: Duration) -> Flow {
		let sleep = tokio::time::sleep(delay);
		tokio::pin!(sleep);
		loop {
			tokio::select! {
				_ = &mut sleep => return Flow::Continue,
				command = self.commands.recv() => {
					if let Flow::Stop = self.on_offline_command(command).await {
						return Flow::Stop;
					}
				}
			}
		}
	}

	/// Puts a freshly authenticated transport into service.
	fn install(&mut self, transport: Transport, handshake: Handshake) {
		debug!(target: "tether.session", session = %self.id, info = %handshake.info, "gateway acknowledged");
		self.transport = Some(transport);
		self.last_activity = Instant::now();
		self.keepalive.reset();
		for chunk in handshake.early_data {
			self.deliver(chunk);
		}
		if self.transition(SessionState::Connected) {
			self.emit(SessionEventKind::Connected);
		}
	}

	/// Client-side close: disconnect notice, close frame, teardown.
	async fn close_gracefully(&mut self, reason: &str) {
		if let Some(mut transport) = self.transport.take() {
			if let Err(err) = transport.send_envelope(&Envelope::disconnect(reason)).await {
				debug!(target: "tether.session", session = %self.id, error = %err, "failed to send disconnect");
			}
			if let Err(err) = transport.close(CLOSE_NORMAL, reason).await {
				debug!(target: "tether.session", session = %self.id, error = %err, "failed to close transport");
			}
		}
		self.teardown();
	}

	/// Terminal failure: exactly one terminal error event, then closed.
	async fn fail(&mut self, message: String) {
		warn!(target: "tether.session", session = %self.id, %message, "session failed");
		if let Some(mut transport) = self.transport.take() {
			abandon(&mut transport, &self.id).await;
		}
		self.emit(SessionEventKind::Error { message, terminal: true });
		self.teardown();
	}

	fn teardown(&mut self) {
		let id = Arc::clone(&self.id);
		self.router.correlator().reject_all(|_, _| Error::SessionClosed(id.to_string()));
		self.keepalive.reset();
		self.sink = None;
		self.buffer.clear();
		self.transition(SessionState::Closed);
	}

	async fn send(&mut self, frame: Bytes) {
		let Some(transport) = self.transport.as_mut() else {
			return;
		};
		if let Err(err) = transport.send_frame(frame).await {
			debug!(target: "tether.session", session = %self.id, error = %err, "send failed");
		}
	}

	fn deliver(&mut self, data: Bytes) {
		match self.sink.as_ref().and_then(Weak::upgrade) {
			Some(sink) => sink.write(&data),
			None => {
				if self.sink.take().is_some() {
					debug!(target: "tether.session", session = %self.id, "sink dropped, buffering output");
				}
				self.buffer.push(data);
				self.publish();
			}
		}
	}

	fn attach(&mut self, sink: Weak<dyn DataSink>) {
		let Some(strong) = sink.upgrade() else {
			debug!(target: "tether.session", session = %self.id, "sink dropped before attach");
			return;
		};
		let buffered = self.buffer.len();
		for chunk in self.buffer.drain() {
			strong.write(&chunk);
		}
		self.sink = Some(sink);
		debug!(target: "tether.session", session = %self.id, flushed = buffered, "sink attached");
		self.publish();
	}

	fn detach(&mut self) {
		if self.sink.take().is_some() {
			debug!(target: "tether.session", session = %self.id, "sink detached");
			self.publish();
		}
	}

	fn report_latency(&mut self, latency: Duration) {
		self.publish();
		self.emit(SessionEventKind::Latency(latency));
	}

	/// Applies a state change, rejecting illegal ones.
	fn transition(&mut self, to: SessionState) -> bool {
		let from = self.state;
		if !from.can_transition_to(to) {
			warn!(target: "tether.session", session = %self.id, %from, %to, "rejected invalid state transition");
			return false;
		}
		self.state = to;
		info!(target: "tether.session", session = %self.id, %from, %to, "session state changed");
		self.publish();
		self.emit(SessionEventKind::StatusChange { from, to });
		true
	}

	fn publish(&self) {
		self.status.send_replace(SessionSnapshot {
			id: Arc::clone(&self.id),
			state: self.state,
			retry_count: self.retry_count,
			latency: self.keepalive.latency(),
			last_activity: self.last_activity,
			buffered_bytes: self.buffer.len(),
			sink_attached: self.sink.as_ref().is_some_and(|sink| sink.strong_count() > 0),
			pending_operations: self.router.correlator().pending_count(),
			peer: self.transport.as_ref().map(Transport::peer),
		});
	}

	fn emit(&self, kind: SessionEventKind) {
		let _ = self.events.send(SessionEvent::new(Arc::clone(&self.id), kind));
	}
}
