#![forbid(unsafe_code)]

//! History pagination payloads served over the request path.
//!
//! The cursor is the smallest message id currently loaded; a page returns up
//! to `limit` messages with `id < before`, ordered ascending.

use chrono::{DateTime, Utc};
use palaver_domain::MessageId;
use serde::{Deserialize, Serialize};

/// One persisted message as serialized on the request path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
	pub id: MessageId,
	pub username: String,
	pub content: String,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub profile_pic: Option<String>,

	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
	pub limit: u32,
	pub has_more: bool,

	/// Smallest id in the returned page, or null when no earlier messages
	/// exist. Feed back as the `before` cursor for the next page.
	pub next_before: Option<MessageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePage {
	pub messages: Vec<WireMessage>,
	pub pagination: Pagination,
}
