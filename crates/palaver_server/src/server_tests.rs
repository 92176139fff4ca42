#![forbid(unsafe_code)]

//! End-to-end exercises over real sockets: WebSocket channels through
//! tokio-tungstenite and the request path over plain HTTP/1.1.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use palaver_domain::{DirectPairKey, UserName};
use palaver_util::secret::SecretString;
use palaver_util::time::unix_now_secs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{AuthClaims, mint_hmac_token};
use crate::config::ServerConfig;
use crate::router;
use crate::state::AppState;
use crate::store::ChatStore;

const SECRET: &str = "test-secret";

async fn spawn_server() -> (SocketAddr, AppState, tempfile::TempDir) {
	spawn_server_with(|_| {}).await
}

async fn spawn_server_with(tweak: impl FnOnce(&mut ServerConfig)) -> (SocketAddr, AppState, tempfile::TempDir) {
	let dir = tempfile::tempdir().expect("tempdir");
	let url = format!("sqlite://{}?mode=rwc", dir.path().join("server.db").display());
	let store = ChatStore::connect(&url).await.expect("connect store");
	store.ensure_public_room(0).await.expect("public room");

	let mut cfg = ServerConfig::default();
	cfg.server.session_hmac_secret = Some(SecretString::new(SECRET));
	cfg.limits.connect_limit = 1_000;
	cfg.limits.chat_send_limit = 1_000;
	tweak(&mut cfg);

	let state = AppState::new(cfg, store);
	state.health.mark_ready();

	let app = router::build_router(state.clone());
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("local addr");
	tokio::spawn(async move {
		let _ = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await;
	});

	(addr, state, dir)
}

fn user_token(name: &str) -> String {
	let user = UserName::new(name).expect("valid user");
	let claims = AuthClaims::user(&user, unix_now_secs() + 3_600, None);
	mint_hmac_token(&claims, SECRET).expect("mint token")
}

type WsClient = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

async fn ws_connect(addr: SocketAddr, path_and_query: &str) -> WsClient {
	let url = format!("ws://{addr}{path_and_query}");
	let (stream, _) = tokio_tungstenite::connect_async(url).await.expect("ws connect");
	stream
}

/// Next text frame as JSON, skipping transport pings.
async fn recv_json(ws: &mut WsClient) -> serde_json::Value {
	loop {
		let frame = timeout(Duration::from_secs(2), ws.next())
			.await
			.expect("frame within timeout")
			.expect("stream open")
			.expect("frame ok");
		match frame {
			Message::Text(text) => return serde_json::from_str(text.as_str()).expect("valid json"),
			Message::Close(frame) => panic!("unexpected close: {frame:?}"),
			_ => continue,
		}
	}
}

/// Wait for the close frame, skipping any queued frames before it.
async fn recv_close_code(ws: &mut WsClient) -> Option<u16> {
	loop {
		let frame = timeout(Duration::from_secs(2), ws.next())
			.await
			.expect("frame within timeout")?
			.ok()?;
		if let Message::Close(frame) = frame {
			return frame.map(|f| u16::from(f.code));
		}
	}
}

async fn send_text(ws: &mut WsClient, payload: &str) {
	ws.send(Message::Text(payload.to_string().into())).await.expect("send");
}

/// Minimal HTTP/1.1 request helper; returns the full response text.
async fn http_request(addr: SocketAddr, method: &str, path: &str, auth: Option<&str>, body: Option<&str>) -> String {
	let mut stream = TcpStream::connect(addr).await.expect("tcp connect");

	let mut request = format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n");
	if let Some(token) = auth {
		request.push_str(&format!("Authorization: Bearer {token}\r\n"));
	}
	match body {
		Some(body) => {
			request.push_str(&format!(
				"Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
				body.len()
			));
		}
		None => request.push_str("\r\n"),
	}

	stream.write_all(request.as_bytes()).await.expect("write request");
	let mut response = String::new();
	stream.read_to_string(&mut response).await.expect("read response");
	response
}

fn status_of(response: &str) -> u16 {
	response
		.split_whitespace()
		.nth(1)
		.and_then(|s| s.parse().ok())
		.expect("status line")
}

fn body_of(response: &str) -> serde_json::Value {
	let body = response.split("\r\n\r\n").nth(1).expect("body");
	serde_json::from_str(body).expect("json body")
}

#[tokio::test]
async fn chat_send_broadcasts_to_all_room_subscribers() {
	let (addr, _state, _dir) = spawn_server().await;
	let alice = user_token("alice");
	let bob = user_token("bob");

	let mut alice_ws = ws_connect(addr, &format!("/ws/chat/public?token={alice}")).await;
	let mut bob_ws = ws_connect(addr, &format!("/ws/chat/public?token={bob}")).await;

	send_text(&mut alice_ws, r#"{"message":"hello room"}"#).await;

	for ws in [&mut alice_ws, &mut bob_ws] {
		let frame = recv_json(ws).await;
		assert_eq!(frame["message"], "hello room");
		assert_eq!(frame["username"], "alice");
		assert_eq!(frame["room"], "public");
	}
}

#[tokio::test]
async fn anonymous_public_connection_reads_but_cannot_send() {
	let (addr, _state, _dir) = spawn_server().await;
	let alice = user_token("alice");

	let mut anon_ws = ws_connect(addr, "/ws/chat/public").await;
	let mut alice_ws = ws_connect(addr, &format!("/ws/chat/public?token={alice}")).await;

	send_text(&mut anon_ws, r#"{"message":"let me in"}"#).await;
	let frame = recv_json(&mut anon_ws).await;
	assert_eq!(frame["error"], "forbidden");

	send_text(&mut alice_ws, r#"{"message":"hi"}"#).await;
	let frame = recv_json(&mut anon_ws).await;
	assert_eq!(frame["message"], "hi");
}

#[tokio::test]
async fn oversized_message_is_rejected_in_band() {
	let (addr, _state, _dir) = spawn_server().await;
	let alice = user_token("alice");
	let mut ws = ws_connect(addr, &format!("/ws/chat/public?token={alice}")).await;

	let oversized = "x".repeat(1_001);
	send_text(&mut ws, &serde_json::json!({ "message": oversized }).to_string()).await;

	let frame = recv_json(&mut ws).await;
	assert_eq!(frame["error"], "message_too_long");
}

#[tokio::test]
async fn busy_room_delivery_keeps_a_silent_reader_open() {
	let (addr, _state, _dir) = spawn_server_with(|cfg| cfg.channels.chat_idle_timeout_secs = 1).await;
	let alice = user_token("alice");

	let mut reader = ws_connect(addr, "/ws/chat/public").await;
	let mut sender = ws_connect(addr, &format!("/ws/chat/public?token={alice}")).await;

	// traffic for well past the idle window while the reader stays silent
	for i in 0..5 {
		tokio::time::sleep(Duration::from_millis(300)).await;
		send_text(&mut sender, &serde_json::json!({ "message": format!("tick {i}") }).to_string()).await;
		let frame = recv_json(&mut reader).await;
		assert_eq!(frame["message"], format!("tick {i}"));
	}

	// once delivery stops the idle close still fires
	drop(sender);
	assert_eq!(recv_close_code(&mut reader).await, Some(4001));
}

#[tokio::test]
async fn unknown_room_closes_with_invalid_room_code() {
	let (addr, _state, _dir) = spawn_server().await;
	let alice = user_token("alice");

	let mut ws = ws_connect(addr, &format!("/ws/chat/no-such-room?token={alice}")).await;
	assert_eq!(recv_close_code(&mut ws).await, Some(4404));

	let mut ws = ws_connect(addr, &format!("/ws/chat/x?token={alice}")).await;
	assert_eq!(recv_close_code(&mut ws).await, Some(4404));
}

#[tokio::test]
async fn bad_session_token_closes_unauthorized() {
	let (addr, _state, _dir) = spawn_server().await;

	let mut ws = ws_connect(addr, "/ws/chat/public?token=v1.bogus.bogus").await;
	assert_eq!(recv_close_code(&mut ws).await, Some(4401));

	let mut ws = ws_connect(addr, "/ws/presence").await;
	assert_eq!(recv_close_code(&mut ws).await, Some(4401));
}

#[tokio::test]
async fn presence_roster_lists_users_and_counts_guests() {
	let (addr, _state, _dir) = spawn_server().await;
	let alice = user_token("alice");

	let mut alice_ws = ws_connect(addr, &format!("/ws/presence?token={alice}")).await;
	let snapshot = recv_json(&mut alice_ws).await;
	let online = snapshot["online"].as_array().expect("online roster");
	assert!(online.iter().any(|u| u["username"] == "alice"));

	// guest bootstrap over the request path, then a guest presence connection
	let response = http_request(addr, "POST", "/api/guest-session", None, Some("{}")).await;
	assert_eq!(status_of(&response), 200);
	let guest_token = body_of(&response)["token"].as_str().expect("token").to_string();

	let mut guest_ws = ws_connect(addr, &format!("/ws/presence?token={guest_token}")).await;
	let snapshot = recv_json(&mut guest_ws).await;
	assert!(snapshot.get("online").is_none(), "guests must not see the roster");
	assert_eq!(snapshot["guests"], 1);

	// the authenticated view sees the guest arrive
	let snapshot = recv_json(&mut alice_ws).await;
	assert_eq!(snapshot["guests"], 1);
}

#[tokio::test]
async fn inbox_snapshot_then_mark_read_converges() {
	let (addr, state, _dir) = spawn_server().await;
	let alice = UserName::new("alice").unwrap();
	let bob = UserName::new("bob").unwrap();
	let pair = DirectPairKey::new(&alice, &bob).unwrap();
	let room = state.store.find_or_create_direct(&pair, 0).await.unwrap();
	state
		.store
		.append_message(&room.slug, "bob", "you there?", None, 1_000)
		.await
		.unwrap();

	let token = user_token("alice");
	let mut ws = ws_connect(addr, &format!("/ws/inbox?token={token}")).await;

	let initial = recv_json(&mut ws).await;
	assert_eq!(initial["type"], "direct_unread_state");
	assert_eq!(initial["total"], 1);
	assert_eq!(initial["unread"][room.slug.as_str()], 1);

	send_text(
		&mut ws,
		&serde_json::json!({"type": "mark_read", "slug": room.slug.as_str()}).to_string(),
	)
	.await;

	loop {
		let frame = recv_json(&mut ws).await;
		if frame["type"] == "direct_mark_read_ack" {
			assert_eq!(frame["slug"], room.slug.as_str());
			assert_eq!(frame["total"], 0);
			break;
		}
	}
}

#[tokio::test]
async fn guests_are_refused_an_inbox() {
	let (addr, _state, _dir) = spawn_server().await;

	let response = http_request(addr, "POST", "/api/guest-session", None, Some("{}")).await;
	let guest_token = body_of(&response)["token"].as_str().expect("token").to_string();

	let mut ws = ws_connect(addr, &format!("/ws/inbox?token={guest_token}")).await;
	assert_eq!(recv_close_code(&mut ws).await, Some(4403));
}

#[tokio::test]
async fn history_pages_and_validates_over_http() {
	let (addr, state, _dir) = spawn_server().await;
	let slug = palaver_domain::RoomSlug::public();
	for i in 0..3 {
		state
			.store
			.append_message(&slug, "alice", &format!("m{i}"), None, i)
			.await
			.unwrap();
	}

	let response = http_request(addr, "GET", "/api/rooms/public/messages?limit=2", None, None).await;
	assert_eq!(status_of(&response), 200);
	let page = body_of(&response);
	assert_eq!(page["pagination"]["hasMore"], true);
	assert_eq!(page["messages"].as_array().unwrap().len(), 2);
	assert_eq!(page["messages"][0]["content"], "m1");
	assert_eq!(page["messages"][1]["content"], "m2");

	let next_before = page["pagination"]["nextBefore"].as_i64().unwrap();
	let response = http_request(
		addr,
		"GET",
		&format!("/api/rooms/public/messages?limit=2&before={next_before}"),
		None,
		None,
	)
	.await;
	let page = body_of(&response);
	assert_eq!(page["pagination"]["hasMore"], false);
	assert_eq!(page["messages"][0]["content"], "m0");

	for bad in ["limit=0", "limit=9999", "before=-1"] {
		let response = http_request(addr, "GET", &format!("/api/rooms/public/messages?{bad}"), None, None).await;
		assert_eq!(status_of(&response), 400, "query {bad} should be rejected");
	}
}

#[tokio::test]
async fn direct_start_and_dialog_listing_over_http() {
	let (addr, _state, _dir) = spawn_server().await;
	let alice = user_token("alice");

	let response = http_request(
		addr,
		"POST",
		"/api/direct/start",
		Some(&alice),
		Some(r#"{"username":"bob"}"#),
	)
	.await;
	assert_eq!(status_of(&response), 200);
	let started = body_of(&response);
	assert_eq!(started["slug"], "dm-alice-bob");
	assert_eq!(started["peer"], "bob");

	// idempotent
	let response = http_request(
		addr,
		"POST",
		"/api/direct/start",
		Some(&alice),
		Some(r#"{"username":"bob"}"#),
	)
	.await;
	assert_eq!(body_of(&response)["slug"], "dm-alice-bob");

	let response = http_request(addr, "GET", "/api/direct/dialogs", Some(&alice), None).await;
	assert_eq!(status_of(&response), 200);
	let dialogs = body_of(&response)["dialogs"].as_array().unwrap().clone();
	assert_eq!(dialogs.len(), 1);
	assert_eq!(dialogs[0]["peer"], "bob");

	// unauthenticated listing is refused
	let response = http_request(addr, "GET", "/api/direct/dialogs", None, None).await;
	assert_eq!(status_of(&response), 401);
}

#[tokio::test]
async fn direct_room_refuses_outsiders() {
	let (addr, state, _dir) = spawn_server().await;
	let alice = UserName::new("alice").unwrap();
	let bob = UserName::new("bob").unwrap();
	let pair = DirectPairKey::new(&alice, &bob).unwrap();
	state.store.find_or_create_direct(&pair, 0).await.unwrap();

	let mallory = user_token("mallory");
	let mut ws = ws_connect(addr, &format!("/ws/chat/dm-alice-bob?token={mallory}")).await;
	assert_eq!(recv_close_code(&mut ws).await, Some(4403));
}

#[tokio::test]
async fn signed_media_verifies_and_expires() {
	let (addr, _state, _dir) = spawn_server().await;

	let now = unix_now_secs();
	let path = crate::media::signed_media_path("avatars/alice.jpg", 300, SECRET, now);
	let response = http_request(addr, "GET", &path, None, None).await;
	assert_eq!(status_of(&response), 200);
	assert!(response.contains("x-accel-redirect: /protected-media/avatars/alice.jpg"));

	let expired = crate::media::signed_media_path("avatars/alice.jpg", 0, SECRET, now - 10);
	let response = http_request(addr, "GET", &expired, None, None).await;
	assert_eq!(status_of(&response), 403);

	let sig = crate::media::media_signature("avatars/alice.jpg", now + 300, SECRET);
	let traversal = format!("/api/media/../secrets.txt?exp={}&sig={sig}", now + 300);
	let response = http_request(addr, "GET", &traversal, None, None).await;
	assert_ne!(status_of(&response), 200);
}

#[tokio::test]
async fn health_endpoints_report_readiness() {
	let (addr, _state, _dir) = spawn_server().await;

	let response = http_request(addr, "GET", "/api/health/live", None, None).await;
	assert_eq!(status_of(&response), 200);

	let response = http_request(addr, "GET", "/api/health/ready", None, None).await;
	assert_eq!(status_of(&response), 200);
}
