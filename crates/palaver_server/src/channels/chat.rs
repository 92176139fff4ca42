#![forbid(unsafe_code)]

//! Chat room channel: `/ws/chat/{slug}`.
//!
//! Anonymous connections may read the public room; sending always requires an
//! authenticated user with write capability. Rejections before the loop close
//! with a channel close code; rejections of individual sends are in-band
//! error events.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::response::Response;
use palaver_domain::{Access, RoomKind, RoomSlug, UserName, evaluate_access};
use palaver_protocol::chat::{ChatSend, ChatServerEvent};
use palaver_protocol::{ErrorCode, ErrorEvent, Heartbeat, close};
use palaver_util::time::unix_now_ms;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::auth::AuthClaims;
use crate::channels::{TokenQuery, send_close, send_json};
use crate::hub::HubItem;
use crate::ratelimit::RateDecision;
use crate::state::AppState;
use crate::store::StoredRoom;

pub async fn chat_ws(
	Path(slug): Path<String>,
	Query(query): Query<TokenQuery>,
	State(state): State<AppState>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	ws: WebSocketUpgrade,
) -> Response {
	ws.on_upgrade(move |socket| run_chat(socket, state, slug, query.token, addr))
}

async fn run_chat(mut socket: WebSocket, state: AppState, raw_slug: String, token: Option<String>, addr: SocketAddr) {
	let claims = match token.as_deref() {
		Some(token) => match state.verify_session(token) {
			Ok(claims) => Some(claims),
			Err(err) => {
				debug!(error = %err, "chat: rejected session token");
				send_close(&mut socket, close::UNAUTHORIZED, "invalid session").await;
				return;
			}
		},
		None => None,
	};
	let subject = match claims.as_ref().map(AuthClaims::subject).transpose() {
		Ok(subject) => subject,
		Err(err) => {
			debug!(error = %err, "chat: malformed token subject");
			send_close(&mut socket, close::UNAUTHORIZED, "invalid session").await;
			return;
		}
	};

	let Ok(slug) = RoomSlug::new(raw_slug.as_str()) else {
		send_close(&mut socket, close::INVALID_ROOM, "invalid room slug").await;
		return;
	};

	// the public room exists from first access onward
	if slug.is_public()
		&& let Err(err) = state.store.ensure_public_room(unix_now_ms() as i64).await
	{
		warn!(error = ?err, "chat: failed to ensure public room");
		send_close(&mut socket, close::INTERNAL_ERROR, "").await;
		return;
	}

	let room = match state.store.room_by_slug(&slug).await {
		Ok(Some(room)) => room,
		Ok(None) => {
			send_close(&mut socket, close::INVALID_ROOM, "unknown room").await;
			return;
		}
		Err(err) => {
			warn!(error = ?err, room = %slug, "chat: room lookup failed");
			send_close(&mut socket, close::INTERNAL_ERROR, "").await;
			return;
		}
	};

	let viewer = subject.as_ref().and_then(|s| s.user_name()).cloned();
	let role = match viewer.as_ref() {
		Some(viewer) => match state.store.role_of(&slug, viewer).await {
			Ok(role) => role,
			Err(err) => {
				warn!(error = ?err, room = %slug, "chat: role lookup failed");
				send_close(&mut socket, close::INTERNAL_ERROR, "").await;
				return;
			}
		},
		None => None,
	};

	let access = evaluate_access(room.kind, viewer.as_ref(), role, room.pair_key.as_ref());
	if !access.can_read {
		send_close(&mut socket, close::FORBIDDEN, "access denied").await;
		return;
	}

	let subject_key = subject
		.as_ref()
		.map(|s| s.key())
		.unwrap_or_else(|| format!("ip:{}", addr.ip()));
	let limits = &state.cfg.limits;
	if !state
		.limiter
		.check(&subject_key, "connect_chat", limits.connect_limit, limits.connect_window_secs)
		.await
		.is_allowed()
	{
		send_close(&mut socket, close::TOO_MANY_REQUESTS, "slow down").await;
		return;
	}

	info!(room = %slug, subject = %subject_key, "chat: connected");
	metrics::counter!("palaver_chat_connects_total").increment(1);

	let mut rx = state.chat_hub.subscribe(slug.clone()).await;
	let idle = Duration::from_secs(state.cfg.channels.chat_idle_timeout_secs);
	let mut deadline = Instant::now() + idle;

	let close_code = loop {
		tokio::select! {
			frame = socket.recv() => match frame {
				None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break None,
				Some(Ok(Message::Text(text))) => {
					deadline = Instant::now() + idle;
					if let Err(err) = handle_chat_frame(
						&mut socket,
						&state,
						&room,
						access,
						viewer.as_ref(),
						claims.as_ref(),
						&subject_key,
						text.as_str(),
					)
					.await
					{
						warn!(error = ?err, room = %slug, "chat: failed to handle frame");
						break Some(close::INTERNAL_ERROR);
					}
				}
				// any inbound frame counts as activity
				Some(Ok(_)) => deadline = Instant::now() + idle,
			},
			item = rx.recv() => match item {
				Some(HubItem::Event(broadcast)) => {
					// delivery counts as activity, so read-only subscribers
					// in a busy room are not idle-closed
					deadline = Instant::now() + idle;
					if !send_json(&mut socket, &ChatServerEvent::Message(broadcast)).await {
						break None;
					}
				}
				Some(HubItem::Lagged { dropped }) => {
					debug!(dropped, room = %slug, "chat: subscriber lagged; messages skipped");
				}
				None => break None,
			},
			_ = tokio::time::sleep_until(deadline) => break Some(close::CHAT_IDLE),
		}
	};

	drop(rx);
	state.chat_hub.prune_topic(&slug).await;

	if let Some(code) = close_code {
		send_close(&mut socket, code, "").await;
	}
	info!(room = %slug, subject = %subject_key, "chat: disconnected");
}

#[allow(clippy::too_many_arguments)]
async fn handle_chat_frame(
	socket: &mut WebSocket,
	state: &AppState,
	room: &StoredRoom,
	access: Access,
	viewer: Option<&UserName>,
	claims: Option<&AuthClaims>,
	subject_key: &str,
	text: &str,
) -> anyhow::Result<()> {
	let event: ChatSend = match serde_json::from_str(text) {
		Ok(event) => event,
		Err(_) => {
			if serde_json::from_str::<Heartbeat>(text).is_err() {
				debug!(room = %room.slug, "chat: dropped unrecognized frame");
			}
			return Ok(());
		}
	};

	let message = event.message.trim();
	if message.is_empty() {
		return Ok(());
	}

	let (true, Some(viewer)) = (access.can_write, viewer) else {
		send_json(socket, &ChatServerEvent::Error(ErrorEvent::new(ErrorCode::Forbidden))).await;
		return Ok(());
	};

	if message.chars().count() > state.cfg.server.message_max_len {
		send_json(socket, &ChatServerEvent::Error(ErrorEvent::new(ErrorCode::MessageTooLong))).await;
		return Ok(());
	}

	let limits = &state.cfg.limits;
	if let RateDecision::Limited { retry_after_secs } = state
		.limiter
		.check(subject_key, "chat_send", limits.chat_send_limit, limits.chat_send_window_secs)
		.await
	{
		send_json(socket, &ChatServerEvent::Error(ErrorEvent::rate_limited(retry_after_secs))).await;
		return Ok(());
	}

	let profile_pic = claims.and_then(|c| c.pic.as_deref());
	let stored = state
		.store
		.append_message(&room.slug, viewer.as_str(), message, profile_pic, unix_now_ms() as i64)
		.await?;
	metrics::counter!("palaver_chat_messages_total").increment(1);

	state.chat_hub.publish(&room.slug, stored.to_broadcast()).await;

	if room.kind == RoomKind::Direct {
		state.inbox.on_direct_message(room, &stored).await?;
	}

	Ok(())
}
