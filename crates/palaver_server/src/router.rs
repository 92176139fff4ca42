#![forbid(unsafe_code)]

//! HTTP surface: channel upgrades, the request-path collaborators and health
//! probes. Reads fail open to degraded behavior where the endpoint tolerates
//! it; anything touching authorization fails closed.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use palaver_domain::{DirectPairKey, MessageId, RoomSlug, UserName, evaluate_access};
use palaver_protocol::history::{MessagePage, Pagination};
use palaver_protocol::inbox::{InboxItem, sort_dialogs};
use palaver_protocol::rest::{DialogList, DialogStartRequest, DialogStartResponse, GuestSession, RoomDetail};
use palaver_util::time::{unix_now_ms, unix_now_secs};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::auth::{AuthClaims, mint_hmac_token};
use crate::channels;
use crate::media;
use crate::state::AppState;
use crate::store::StoredRoom;

pub fn build_router(state: AppState) -> axum::Router {
	axum::Router::new()
		.route("/ws/chat/{slug}", get(channels::chat::chat_ws))
		.route("/ws/presence", get(channels::presence::presence_ws))
		.route("/ws/inbox", get(channels::inbox::inbox_ws))
		.route("/api/rooms/{slug}", get(room_detail))
		.route("/api/rooms/{slug}/messages", get(room_messages))
		.route("/api/direct/start", post(direct_start))
		.route("/api/direct/dialogs", get(direct_dialogs))
		.route("/api/guest-session", post(guest_session))
		.route("/api/media/{*path}", get(media_fetch))
		.route("/api/health/live", get(health_live))
		.route("/api/health/ready", get(health_ready))
		.with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
	BadRequest(String),
	Unauthorized,
	Forbidden,
	NotFound,
	Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
	fn from(err: anyhow::Error) -> Self {
		ApiError::Internal(err)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let (status, message) = match self {
			ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
			ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "authentication required".to_string()),
			ApiError::Forbidden => (StatusCode::FORBIDDEN, "forbidden".to_string()),
			ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
			ApiError::Internal(err) => {
				warn!(error = ?err, "api: internal error");
				(StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
			}
		};
		(status, Json(json!({ "error": message }))).into_response()
	}
}

fn bearer_claims(state: &AppState, headers: &HeaderMap) -> Result<Option<AuthClaims>, ApiError> {
	let Some(value) = headers.get(header::AUTHORIZATION) else {
		return Ok(None);
	};
	let value = value.to_str().map_err(|_| ApiError::Unauthorized)?;
	let token = value.strip_prefix("Bearer ").ok_or(ApiError::Unauthorized)?;
	let claims = state.verify_session(token).map_err(|err| {
		debug!(error = %err, "api: rejected bearer token");
		ApiError::Unauthorized
	})?;
	Ok(Some(claims))
}

fn require_user(state: &AppState, headers: &HeaderMap) -> Result<(AuthClaims, UserName), ApiError> {
	let claims = bearer_claims(state, headers)?.ok_or(ApiError::Unauthorized)?;
	let subject = claims.subject().map_err(|_| ApiError::Unauthorized)?;
	let user = subject.user_name().cloned().ok_or(ApiError::Forbidden)?;
	Ok((claims, user))
}

/// Resolve a room and check read capability for the request's viewer.
async fn readable_room(state: &AppState, headers: &HeaderMap, raw_slug: &str) -> Result<StoredRoom, ApiError> {
	let slug = RoomSlug::new(raw_slug).map_err(|err| ApiError::BadRequest(format!("invalid room slug: {err}")))?;

	if slug.is_public() {
		state.store.ensure_public_room(unix_now_ms() as i64).await?;
	}
	let room = state.store.room_by_slug(&slug).await?.ok_or(ApiError::NotFound)?;

	let claims = bearer_claims(state, headers)?;
	let viewer = claims
		.as_ref()
		.map(AuthClaims::subject)
		.transpose()
		.map_err(|_| ApiError::Unauthorized)?
		.and_then(|subject| subject.user_name().cloned());
	let role = match viewer.as_ref() {
		Some(viewer) => state.store.role_of(&slug, viewer).await?,
		None => None,
	};

	let access = evaluate_access(room.kind, viewer.as_ref(), role, room.pair_key.as_ref());
	if !access.can_read {
		return Err(match viewer {
			Some(_) => ApiError::Forbidden,
			None => ApiError::Unauthorized,
		});
	}
	Ok(room)
}

async fn room_detail(
	Path(slug): Path<String>,
	State(state): State<AppState>,
	headers: HeaderMap,
) -> Result<Json<RoomDetail>, ApiError> {
	let room = readable_room(&state, &headers, &slug).await?;
	Ok(Json(RoomDetail {
		slug: room.slug,
		name: room.name,
		kind: room.kind,
	}))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
	limit: Option<u32>,
	before: Option<i64>,
}

async fn room_messages(
	Path(slug): Path<String>,
	Query(query): Query<HistoryQuery>,
	State(state): State<AppState>,
	headers: HeaderMap,
) -> Result<Json<MessagePage>, ApiError> {
	let room = readable_room(&state, &headers, &slug).await?;

	let limit = query.limit.unwrap_or(state.cfg.server.history_page_size);
	if limit == 0 || limit > state.cfg.server.history_max_page_size {
		return Err(ApiError::BadRequest(format!(
			"limit must be between 1 and {}",
			state.cfg.server.history_max_page_size
		)));
	}
	if let Some(before) = query.before
		&& before <= 0
	{
		return Err(ApiError::BadRequest("before must be a positive message id".to_string()));
	}

	// reads fail open: a store error degrades to an empty page
	let (messages, has_more) = match state.store.page_messages(&room.slug, limit, query.before).await {
		Ok(page) => page,
		Err(err) => {
			warn!(error = ?err, "history: read degraded to empty page");
			(Vec::new(), false)
		}
	};
	let next_before = if has_more {
		messages.first().map(|m| MessageId(m.id))
	} else {
		None
	};

	Ok(Json(MessagePage {
		messages: messages.iter().map(|m| m.to_wire()).collect(),
		pagination: Pagination {
			limit,
			has_more,
			next_before,
		},
	}))
}

async fn direct_start(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(request): Json<DialogStartRequest>,
) -> Result<Json<DialogStartResponse>, ApiError> {
	let (_, user) = require_user(&state, &headers)?;
	let peer =
		UserName::new(request.username.as_str()).map_err(|err| ApiError::BadRequest(format!("invalid username: {err}")))?;
	let pair = DirectPairKey::new(&user, &peer)
		.map_err(|_| ApiError::BadRequest("cannot start a dialog with yourself".to_string()))?;

	let room = state.store.find_or_create_direct(&pair, unix_now_ms() as i64).await?;
	Ok(Json(DialogStartResponse {
		slug: room.slug,
		peer: peer.into_string(),
	}))
}

async fn direct_dialogs(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> Result<Json<DialogList>, ApiError> {
	let (_, user) = require_user(&state, &headers)?;

	let mut dialogs = Vec::new();
	for room in state.store.direct_rooms_of(&user).await? {
		let Some(peer) = room.pair_key.as_ref().and_then(|pair| pair.peer_of(&user)) else {
			continue;
		};

		// dialogs without messages sort last
		let (last_message, last_author, timestamp) = match state.store.last_message(&room.slug).await? {
			Some(message) => (
				message.content.clone(),
				message.username.clone(),
				message.created_at().to_rfc3339(),
			),
			None => (String::new(), String::new(), String::new()),
		};

		dialogs.push(InboxItem {
			slug: room.slug,
			peer: peer.into_string(),
			last_message,
			last_author,
			timestamp,
		});
	}
	sort_dialogs(&mut dialogs);

	Ok(Json(DialogList { dialogs }))
}

async fn guest_session(State(state): State<AppState>) -> Result<Json<GuestSession>, ApiError> {
	let key = palaver_domain::GuestKey::mint();
	let expires_at = unix_now_secs() + state.cfg.server.guest_session_ttl_secs;
	let claims = AuthClaims::guest(&key, expires_at);
	let secret = state.session_secret().map_err(ApiError::Internal)?;
	let token = mint_hmac_token(&claims, secret)?;

	metrics::counter!("palaver_guest_sessions_total").increment(1);
	Ok(Json(GuestSession { token, expires_at }))
}

#[derive(Debug, Deserialize)]
struct MediaQuery {
	exp: u64,
	sig: String,
}

/// Verified references are delegated to the fronting web server via
/// `X-Accel-Redirect`; the file bytes never pass through this process.
async fn media_fetch(
	Path(path): Path<String>,
	Query(query): Query<MediaQuery>,
	State(state): State<AppState>,
) -> Result<Response, ApiError> {
	let Some(secret) = state.cfg.media_secret() else {
		warn!("media: no signing secret configured; refusing");
		return Err(ApiError::Forbidden);
	};
	let Some(normalized) = media::normalize_media_path(&path) else {
		return Err(ApiError::Forbidden);
	};

	if !media::verify_media(&normalized, query.exp, &query.sig, secret.expose(), unix_now_secs()) {
		metrics::counter!("palaver_media_rejected_total").increment(1);
		return Err(ApiError::Forbidden);
	}

	let response = Response::builder()
		.status(StatusCode::OK)
		.header("X-Accel-Redirect", format!("/protected-media/{normalized}"))
		.body(axum::body::Body::empty())
		.map_err(|err| ApiError::Internal(err.into()))?;
	Ok(response)
}

async fn health_live() -> &'static str {
	"ok"
}

async fn health_ready(State(state): State<AppState>) -> Response {
	if state.health.is_ready() && state.store.health_ping().await.is_ok() {
		(StatusCode::OK, "ready").into_response()
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, "not-ready").into_response()
	}
}
