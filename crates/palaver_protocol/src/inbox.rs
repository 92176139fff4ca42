#![forbid(unsafe_code)]

//! Direct-inbox channel events.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use palaver_domain::RoomSlug;
use serde::{Deserialize, Serialize};

use crate::ErrorCode;

/// Client -> server inbox events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboxClientEvent {
	Ping,

	/// Mark a room as currently being viewed; `None` clears the active room.
	/// New messages into the active room do not increment unread.
	SetActiveRoom { slug: Option<RoomSlug> },

	/// Explicitly clear the unread count of one dialog.
	MarkRead { slug: RoomSlug },
}

/// Full unread snapshot for one user.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnreadState {
	/// Number of dialogs with at least one unread message.
	pub total: u64,

	/// Per-dialog unread counts; dialogs at zero are omitted.
	pub unread: BTreeMap<RoomSlug, u64>,
}

impl UnreadState {
	pub fn from_counts(counts: BTreeMap<RoomSlug, u64>) -> Self {
		let unread: BTreeMap<RoomSlug, u64> = counts.into_iter().filter(|(_, n)| *n > 0).collect();
		Self {
			total: unread.len() as u64,
			unread,
		}
	}
}

/// One dialog preview in the inbox list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxItem {
	pub slug: RoomSlug,

	/// The other participant of the dialog.
	pub peer: String,

	pub last_message: String,
	pub last_author: String,

	/// RFC 3339 timestamp of the last activity. Kept as a string on the wire;
	/// entries that fail to parse sort last.
	pub timestamp: String,
}

/// Server -> client inbox events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboxServerEvent {
	/// Full snapshot, sent on connect and after reconciliation.
	DirectUnreadState {
		#[serde(flatten)]
		state: UnreadState,
	},

	/// A dialog's preview changed because a new message arrived.
	DirectInboxItem {
		#[serde(flatten)]
		item: InboxItem,
	},

	/// Acknowledges a durable `mark_read`; the carried snapshot is
	/// authoritative and overrides any optimistic local clear.
	DirectMarkReadAck {
		slug: RoomSlug,
		#[serde(flatten)]
		state: UnreadState,
	},

	Error {
		error: ErrorCode,
	},
}

/// Order dialog previews by most-recent-activity descending; previews with an
/// unparseable timestamp sort last. The sort is stable so equal timestamps
/// keep their relative order.
pub fn sort_dialogs(items: &mut [InboxItem]) {
	items.sort_by_key(|item| {
		let parsed = item
			.timestamp
			.parse::<DateTime<Utc>>()
			.map(|ts| ts.timestamp_millis())
			.unwrap_or(i64::MIN);
		std::cmp::Reverse(parsed)
	});
}
