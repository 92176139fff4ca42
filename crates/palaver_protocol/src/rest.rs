#![forbid(unsafe_code)]

//! Request-path collaborator payloads: room detail, dialog bootstrap and
//! guest sessions.

use palaver_domain::{RoomKind, RoomSlug};
use serde::{Deserialize, Serialize};

use crate::inbox::InboxItem;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomDetail {
	pub slug: RoomSlug,
	pub name: String,
	pub kind: RoomKind,
}

/// Guest bootstrap response: a signed session token for the presence channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestSession {
	pub token: String,
	pub expires_at: u64,
}

/// Idempotent create-or-fetch of a direct dialog, keyed by the deterministic
/// pair key of the two participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogStartRequest {
	pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogStartResponse {
	pub slug: RoomSlug,
	pub peer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogList {
	pub dialogs: Vec<InboxItem>,
}
