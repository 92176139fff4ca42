#![forbid(unsafe_code)]

//! Reconnecting WebSocket connection manager.
//!
//! One manager owns one logical channel subscription. The owner drives it
//! through [`ConnectionManager::open`] and [`ConnectionManager::send`] and
//! observes [`Status`] and the last error through watch channels; inbound text
//! frames arrive on the mpsc receiver returned from [`ConnectionManager::spawn`].
//!
//! Unexpected closes schedule a reconnect with exponential backoff and jitter.
//! Clean closes, forbidden and invalid-room do not reconnect. Teardown
//! (`open(None)` or dropping the manager) synchronously stops further
//! scheduling: the epoch counter is bumped before the command is queued, so a
//! backoff timer that fires in between is discarded.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use palaver_protocol::close;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::reconnect::ReconnectPolicy;

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection lifecycle as observed by the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
	/// No target URL.
	Idle,
	Connecting,
	Online,
	/// Closed without a pending reconnect (clean close or terminal code).
	Closed,
	/// Dropped unexpectedly; a reconnect is scheduled.
	Error,
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
	/// Client heartbeat period while online; `None` disables the heartbeat.
	pub heartbeat_interval: Option<Duration>,

	/// Text frame sent as the heartbeat.
	pub heartbeat_payload: String,

	pub policy: ReconnectPolicy,
}

impl Default for ManagerConfig {
	fn default() -> Self {
		Self {
			heartbeat_interval: None,
			heartbeat_payload: r#"{"type":"ping"}"#.to_string(),
			policy: ReconnectPolicy::default(),
		}
	}
}

enum Command {
	Open { url: Option<String>, epoch: u64 },
	Send(String),
}

pub struct ConnectionManager {
	cmd_tx: mpsc::UnboundedSender<Command>,
	status_tx: Arc<watch::Sender<Status>>,
	status_rx: watch::Receiver<Status>,
	error_rx: watch::Receiver<Option<String>>,
	epoch: Arc<AtomicU64>,
}

impl ConnectionManager {
	/// Spawn the driver task. Inbound text frames arrive on the returned
	/// receiver; dropping the manager tears the connection down.
	pub fn spawn(cfg: ManagerConfig) -> (Self, mpsc::UnboundedReceiver<String>) {
		let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
		let (event_tx, event_rx) = mpsc::unbounded_channel();
		let (status_tx, status_rx) = watch::channel(Status::Idle);
		let status_tx = Arc::new(status_tx);
		let (error_tx, error_rx) = watch::channel(None);
		let epoch = Arc::new(AtomicU64::new(0));

		let driver = Driver {
			cfg,
			cmd_rx,
			event_tx,
			status_tx: Arc::clone(&status_tx),
			error_tx,
			epoch: Arc::clone(&epoch),
		};
		tokio::spawn(driver.run());

		(
			Self {
				cmd_tx,
				status_tx,
				status_rx,
				error_rx,
				epoch,
			},
			event_rx,
		)
	}

	/// Point the manager at a target. A no-op when already connecting or
	/// online to the same URL; a different URL tears the old connection down
	/// first. `None` closes any existing connection and forces [`Status::Idle`].
	pub fn open(&self, url: Option<&str>) {
		let cmd_epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
		if url.is_none() {
			// teardown bookkeeping happens before the command is queued
			self.status_tx.send_replace(Status::Idle);
		}
		let _ = self.cmd_tx.send(Command::Open {
			url: url.map(str::to_string),
			epoch: cmd_epoch,
		});
	}

	/// Queue a text frame. Returns false without throwing when not online.
	/// Nothing is buffered for replay; resend policy is the caller's.
	pub fn send(&self, payload: &str) -> bool {
		if *self.status_rx.borrow() != Status::Online {
			return false;
		}
		self.cmd_tx.send(Command::Send(payload.to_string())).is_ok()
	}

	pub fn status(&self) -> Status {
		*self.status_rx.borrow()
	}

	pub fn status_stream(&self) -> watch::Receiver<Status> {
		self.status_rx.clone()
	}

	/// Last connection error, sticky until the next successful connect.
	pub fn last_error(&self) -> Option<String> {
		self.error_rx.borrow().clone()
	}
}

struct Driver {
	cfg: ManagerConfig,
	cmd_rx: mpsc::UnboundedReceiver<Command>,
	event_tx: mpsc::UnboundedSender<String>,
	status_tx: Arc<watch::Sender<Status>>,
	error_tx: watch::Sender<Option<String>>,
	epoch: Arc<AtomicU64>,
}

impl Driver {
	async fn run(self) {
		let Driver {
			cfg,
			mut cmd_rx,
			event_tx,
			status_tx,
			error_tx,
			epoch,
		} = self;

		let mut ws: Option<WsStream> = None;
		let mut target: Option<String> = None;
		let mut session_epoch = 0u64;
		let mut attempt = 0u32;
		let mut reconnect_deadline: Option<Instant> = None;
		let mut connected_at: Option<Instant> = None;

		let mut heartbeat = tokio::time::interval(cfg.heartbeat_interval.unwrap_or(Duration::from_secs(3600)));
		heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				cmd = cmd_rx.recv() => {
					let Some(cmd) = cmd else {
						// owner dropped the manager
						break;
					};
					match cmd {
						Command::Open { url, epoch: cmd_epoch } => {
							session_epoch = cmd_epoch;
							reconnect_deadline = None;
							match url {
								Some(next) => {
									if ws.is_some() && target.as_deref() == Some(next.as_str()) {
										debug!(url = %next, "open: already connected to this target");
										continue;
									}
									if let Some(mut old) = ws.take() {
										let _ = old.close(None).await;
									}
									attempt = 0;
									connected_at = None;
									status_tx.send_replace(Status::Connecting);
									match connect(&next).await {
										Ok(stream) => {
											info!(url = %next, "connected");
											ws = Some(stream);
											connected_at = Some(Instant::now());
											status_tx.send_replace(Status::Online);
											error_tx.send_replace(None);
											heartbeat.reset();
										}
										Err(err) => {
											warn!(url = %next, error = %err, "connect failed");
											error_tx.send_replace(Some(err));
											reconnect_deadline =
												Some(schedule_retry(&cfg.policy, &mut attempt, None, &status_tx));
										}
									}
									target = Some(next);
								}
								None => {
									if let Some(mut old) = ws.take() {
										let _ = old.close(None).await;
									}
									target = None;
									attempt = 0;
									connected_at = None;
									status_tx.send_replace(Status::Idle);
								}
							}
						}
						Command::Send(payload) => {
							if let Some(stream) = ws.as_mut()
								&& let Err(err) = stream.send(Message::Text(payload.into())).await
							{
								warn!(error = %err, "send failed");
								error_tx.send_replace(Some(err.to_string()));
								ws = None;
								reconnect_deadline = Some(schedule_retry(
									&cfg.policy,
									&mut attempt,
									connected_at.take().map(|t| t.elapsed()),
									&status_tx,
								));
							}
						}
					}
				}

				frame = next_frame(&mut ws), if ws.is_some() => {
					match frame {
						Some(Ok(Message::Text(text))) => {
							let _ = event_tx.send(text.to_string());
						}
						Some(Ok(Message::Close(close_frame))) => {
							let code = close_frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(close::NORMAL);
							ws = None;
							if close::should_reconnect(code) {
								debug!(code, "server closed; will reconnect");
								reconnect_deadline = Some(schedule_retry(
									&cfg.policy,
									&mut attempt,
									connected_at.take().map(|t| t.elapsed()),
									&status_tx,
								));
							} else {
								info!(code, "server closed; not reconnecting");
								if code == close::FORBIDDEN || code == close::INVALID_ROOM {
									let reason = close_frame
										.map(|f| f.reason.to_string())
										.filter(|r| !r.is_empty())
										.unwrap_or_else(|| format!("closed with code {code}"));
									error_tx.send_replace(Some(reason));
								}
								connected_at = None;
								status_tx.send_replace(Status::Closed);
							}
						}
						Some(Ok(_)) => {}
						Some(Err(err)) => {
							warn!(error = %err, "websocket error");
							error_tx.send_replace(Some(err.to_string()));
							ws = None;
							reconnect_deadline = Some(schedule_retry(
								&cfg.policy,
								&mut attempt,
								connected_at.take().map(|t| t.elapsed()),
								&status_tx,
							));
						}
						None => {
							debug!("websocket stream ended");
							ws = None;
							reconnect_deadline = Some(schedule_retry(
								&cfg.policy,
								&mut attempt,
								connected_at.take().map(|t| t.elapsed()),
								&status_tx,
							));
						}
					}
				}

				_ = heartbeat.tick(), if ws.is_some() && cfg.heartbeat_interval.is_some() => {
					if let Some(stream) = ws.as_mut()
						&& let Err(err) = stream.send(Message::Text(cfg.heartbeat_payload.clone().into())).await
					{
						// the read side observes the drop and schedules
						debug!(error = %err, "heartbeat send failed");
					}
				}

				_ = sleep_until_opt(reconnect_deadline), if reconnect_deadline.is_some() => {
					reconnect_deadline = None;
					if epoch.load(Ordering::SeqCst) != session_epoch {
						debug!("stale reconnect timer discarded");
						continue;
					}
					let Some(url) = target.clone() else {
						continue;
					};
					status_tx.send_replace(Status::Connecting);
					match connect(&url).await {
						Ok(stream) => {
							info!(url = %url, attempt, "reconnected");
							ws = Some(stream);
							connected_at = Some(Instant::now());
							status_tx.send_replace(Status::Online);
							error_tx.send_replace(None);
							heartbeat.reset();
						}
						Err(err) => {
							warn!(url = %url, attempt, error = %err, "reconnect failed");
							error_tx.send_replace(Some(err));
							reconnect_deadline = Some(schedule_retry(&cfg.policy, &mut attempt, None, &status_tx));
						}
					}
				}
			}
		}

		if let Some(mut stream) = ws.take() {
			let _ = stream.close(None).await;
		}
	}
}

async fn connect(url: &str) -> Result<WsStream, String> {
	match tokio_tungstenite::connect_async(url).await {
		Ok((stream, _)) => Ok(stream),
		Err(err) => Err(err.to_string()),
	}
}

async fn next_frame(ws: &mut Option<WsStream>) -> Option<Result<Message, tokio_tungstenite::tungstenite::Error>> {
	match ws.as_mut() {
		Some(stream) => stream.next().await,
		None => std::future::pending().await,
	}
}

async fn sleep_until_opt(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}

fn schedule_retry(
	policy: &ReconnectPolicy,
	attempt: &mut u32,
	held_for: Option<Duration>,
	status_tx: &watch::Sender<Status>,
) -> Instant {
	*attempt = policy.next_attempt(*attempt, held_for);
	let (deadline, ms) = policy.schedule(*attempt);
	debug!(attempt = *attempt, delay_ms = ms, "scheduling reconnect");
	status_tx.send_replace(Status::Error);
	deadline
}
