#![forbid(unsafe_code)]

//! Direct-inbox channel: `/ws/inbox`.
//!
//! Authenticated users only. The first frame is always an authoritative
//! unread snapshot rebuilt from persisted state, so a reconnect converges
//! even if the previous session missed events.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use palaver_protocol::close;
use palaver_protocol::inbox::{InboxClientEvent, InboxServerEvent};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::channels::{TokenQuery, send_close, send_json};
use crate::hub::HubItem;
use crate::state::AppState;

pub async fn inbox_ws(
	Query(query): Query<TokenQuery>,
	State(state): State<AppState>,
	ws: WebSocketUpgrade,
) -> Response {
	ws.on_upgrade(move |socket| run_inbox(socket, state, query.token))
}

async fn run_inbox(mut socket: WebSocket, state: AppState, token: Option<String>) {
	let claims = match token.as_deref().map(|t| state.verify_session(t)) {
		Some(Ok(claims)) => claims,
		Some(Err(err)) => {
			debug!(error = %err, "inbox: rejected session token");
			send_close(&mut socket, close::UNAUTHORIZED, "invalid session").await;
			return;
		}
		None => {
			send_close(&mut socket, close::UNAUTHORIZED, "session required").await;
			return;
		}
	};
	let user = match claims.subject() {
		Ok(subject) => match subject.user_name() {
			Some(user) => user.clone(),
			// guests have no dialogs
			None => {
				send_close(&mut socket, close::FORBIDDEN, "guests have no inbox").await;
				return;
			}
		},
		Err(err) => {
			debug!(error = %err, "inbox: malformed token subject");
			send_close(&mut socket, close::UNAUTHORIZED, "invalid session").await;
			return;
		}
	};

	let limits = &state.cfg.limits;
	if !state
		.limiter
		.check(
			&format!("user:{user}"),
			"connect_inbox",
			limits.connect_limit,
			limits.connect_window_secs,
		)
		.await
		.is_allowed()
	{
		send_close(&mut socket, close::TOO_MANY_REQUESTS, "slow down").await;
		return;
	}

	let mut rx = state.inbox.hub().subscribe(user.clone()).await;

	let initial = match state.inbox.unread_state(&user).await {
		Ok(state) => state,
		Err(err) => {
			warn!(error = ?err, user = %user, "inbox: failed to load unread state");
			send_close(&mut socket, close::INTERNAL_ERROR, "").await;
			return;
		}
	};
	if !send_json(&mut socket, &InboxServerEvent::DirectUnreadState { state: initial }).await {
		return;
	}

	info!(user = %user, "inbox: connected");
	metrics::counter!("palaver_inbox_connects_total").increment(1);

	let idle = Duration::from_secs(state.cfg.channels.inbox_idle_timeout_secs);
	let mut deadline = Instant::now() + idle;

	let close_code = loop {
		tokio::select! {
			frame = socket.recv() => match frame {
				None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break None,
				Some(Ok(Message::Text(text))) => {
					deadline = Instant::now() + idle;
					match serde_json::from_str::<InboxClientEvent>(text.as_str()) {
						Ok(InboxClientEvent::Ping) => {}
						Ok(InboxClientEvent::SetActiveRoom { slug }) => {
							state.inbox.set_active_room(&user, slug).await;
						}
						Ok(InboxClientEvent::MarkRead { slug }) => match state.inbox.mark_read(&user, &slug).await {
							Ok(ack) => {
								if !send_json(&mut socket, &ack).await {
									break None;
								}
							}
							Err(err) => {
								warn!(error = ?err, user = %user, "inbox: mark_read failed");
								break Some(close::INTERNAL_ERROR);
							}
						},
						Err(_) => debug!(user = %user, "inbox: dropped unrecognized frame"),
					}
				}
				Some(Ok(_)) => deadline = Instant::now() + idle,
			},
			item = rx.recv() => match item {
				Some(HubItem::Event(event)) => {
					if !send_json(&mut socket, &event).await {
						break None;
					}
				}
				Some(HubItem::Lagged { dropped }) => {
					// push a fresh authoritative snapshot to resync
					debug!(dropped, user = %user, "inbox: subscriber lagged");
					match state.inbox.unread_state(&user).await {
						Ok(fresh) => {
							if !send_json(&mut socket, &InboxServerEvent::DirectUnreadState { state: fresh }).await {
								break None;
							}
						}
						Err(err) => {
							warn!(error = ?err, user = %user, "inbox: failed to rebuild unread state");
							break Some(close::INTERNAL_ERROR);
						}
					}
				}
				None => break None,
			},
			_ = tokio::time::sleep_until(deadline) => break Some(close::INBOX_IDLE),
		}
	};

	drop(rx);
	state.inbox.forget(&user).await;

	if let Some(code) = close_code {
		send_close(&mut socket, code, "").await;
	}
	info!(user = %user, "inbox: disconnected");
}
