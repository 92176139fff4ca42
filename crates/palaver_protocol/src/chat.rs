#![forbid(unsafe_code)]

//! Chat room channel events.

use palaver_domain::RoomSlug;
use serde::{Deserialize, Serialize};

use crate::ErrorEvent;

/// Client -> server message submission: `{"message": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSend {
	pub message: String,
}

/// A validated message fanned out to every subscriber of the room, the
/// sender's own connection included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatBroadcast {
	pub message: String,
	pub username: String,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub profile_pic: Option<String>,

	pub room: RoomSlug,
}

/// Server -> client chat frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatServerEvent {
	Error(ErrorEvent),
	Message(ChatBroadcast),
}
