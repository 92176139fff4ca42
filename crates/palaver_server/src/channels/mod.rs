#![forbid(unsafe_code)]

//! WebSocket channel endpoints. Each connection is one task owning the
//! socket, a hub subscription and its idle deadline inside a single
//! `tokio::select!` loop.

pub mod chat;
pub mod inbox;
pub mod presence;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use serde::Deserialize;
use tracing::warn;

/// Session token supplied as a query parameter on channel upgrades.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenQuery {
	pub token: Option<String>,
}

pub(crate) async fn send_close(socket: &mut WebSocket, code: u16, reason: &'static str) {
	let frame = CloseFrame {
		code,
		reason: Utf8Bytes::from_static(reason),
	};
	let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Serialize and send one frame; returns false once the socket is gone.
pub(crate) async fn send_json<T: serde::Serialize>(socket: &mut WebSocket, value: &T) -> bool {
	match serde_json::to_string(value) {
		Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
		Err(err) => {
			warn!(error = %err, "channel: failed to serialize outbound frame");
			true
		}
	}
}
