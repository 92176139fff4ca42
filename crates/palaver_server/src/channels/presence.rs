#![forbid(unsafe_code)]

//! Presence channel: `/ws/presence`.
//!
//! Requires a session token (user or guest). Every roster change fans a fresh
//! snapshot out to all subscribers; guest connections get the guest count
//! only. A clean close drops the entry immediately, an abrupt one leaves it
//! through the grace period so a quick reconnect does not flicker the roster.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use palaver_protocol::presence::{PresenceServerEvent, PresenceSnapshot};
use palaver_protocol::{Heartbeat, close};
use palaver_util::time::unix_now_secs;
use tokio::time::{Duration, Instant};
use tracing::{debug, info};

use crate::channels::{TokenQuery, send_close, send_json};
use crate::hub::HubItem;
use crate::state::{AppState, PresenceTopic};

pub async fn presence_ws(
	Query(query): Query<TokenQuery>,
	State(state): State<AppState>,
	ws: WebSocketUpgrade,
) -> Response {
	ws.on_upgrade(move |socket| run_presence(socket, state, query.token))
}

async fn run_presence(mut socket: WebSocket, state: AppState, token: Option<String>) {
	let claims = match token.as_deref().map(|t| state.verify_session(t)) {
		Some(Ok(claims)) => claims,
		Some(Err(err)) => {
			debug!(error = %err, "presence: rejected session token");
			send_close(&mut socket, close::UNAUTHORIZED, "invalid session").await;
			return;
		}
		None => {
			send_close(&mut socket, close::UNAUTHORIZED, "session required").await;
			return;
		}
	};
	let subject = match claims.subject() {
		Ok(subject) => subject,
		Err(err) => {
			debug!(error = %err, "presence: malformed token subject");
			send_close(&mut socket, close::UNAUTHORIZED, "invalid session").await;
			return;
		}
	};

	let limits = &state.cfg.limits;
	if !state
		.limiter
		.check(&subject.key(), "connect_presence", limits.connect_limit, limits.connect_window_secs)
		.await
		.is_allowed()
	{
		send_close(&mut socket, close::TOO_MANY_REQUESTS, "slow down").await;
		return;
	}

	// subscribe before announcing so this connection sees its own join
	let mut rx = state.presence_hub.subscribe(PresenceTopic).await;
	state.presence.connect(&subject, claims.pic.clone()).await;
	state.publish_presence().await;

	info!(subject = %subject, "presence: connected");
	metrics::counter!("palaver_presence_connects_total").increment(1);

	let is_guest = subject.is_guest();
	let idle = Duration::from_secs(state.cfg.presence.idle_timeout_secs);
	let touch_interval = Duration::from_secs(state.cfg.presence.touch_interval_secs);
	let heartbeat_period = Duration::from_secs(state.cfg.presence.heartbeat_secs);
	let mut heartbeat = tokio::time::interval_at(Instant::now() + heartbeat_period, heartbeat_period);
	let mut deadline = Instant::now() + idle;
	let mut last_touch = Instant::now();

	let mut graceful = false;
	let close_code = loop {
		tokio::select! {
			frame = socket.recv() => match frame {
				None | Some(Err(_)) => break None,
				Some(Ok(Message::Close(frame))) => {
					graceful = frame.map(|f| close::is_clean(f.code)).unwrap_or(true);
					break None;
				}
				Some(Ok(Message::Text(text))) => {
					deadline = Instant::now() + idle;
					if serde_json::from_str::<Heartbeat>(text.as_str()).is_ok()
						&& last_touch.elapsed() >= touch_interval
					{
						state.presence.touch(&subject, unix_now_secs()).await;
						last_touch = Instant::now();
					}
				}
				Some(Ok(_)) => deadline = Instant::now() + idle,
			},
			item = rx.recv() => match item {
				Some(HubItem::Event(snapshot)) => {
					let tailored = if is_guest {
						PresenceSnapshot {
							online: None,
							guests: snapshot.guests,
						}
					} else {
						snapshot
					};
					if !send_json(&mut socket, &PresenceServerEvent::Snapshot(tailored)).await {
						break None;
					}
				}
				// a skipped snapshot is superseded by the next one
				Some(HubItem::Lagged { .. }) => {}
				None => break None,
			},
			_ = heartbeat.tick() => {
				if !send_json(&mut socket, &PresenceServerEvent::Heartbeat(Heartbeat::Ping)).await {
					break None;
				}
			}
			_ = tokio::time::sleep_until(deadline) => {
				graceful = true;
				break Some(close::PRESENCE_IDLE);
			}
		}
	};

	drop(rx);
	state.presence.disconnect(&subject, graceful).await;
	state.publish_presence().await;
	state.presence_hub.prune_topic(&PresenceTopic).await;

	if let Some(code) = close_code {
		send_close(&mut socket, code, "idle").await;
	}
	info!(subject = %subject, graceful, "presence: disconnected");
}
