#![forbid(unsafe_code)]

//! Chronological message buffer fed from history pages.
//!
//! Pages arrive ascending within themselves but are fetched newest-first, so
//! each fetched page is prepended. Merging deduplicates by (id, createdAt) so
//! an overlapping refetch after a reconnect never duplicates rows.

use std::collections::HashSet;

use palaver_domain::MessageId;
use palaver_protocol::history::{MessagePage, WireMessage};

#[derive(Debug, Clone, Default)]
pub struct HistoryBuffer {
	messages: Vec<WireMessage>,
}

impl HistoryBuffer {
	pub fn new() -> Self {
		Self::default()
	}

	/// Messages in chronological (ascending id) order.
	pub fn messages(&self) -> &[WireMessage] {
		&self.messages
	}

	pub fn len(&self) -> usize {
		self.messages.len()
	}

	pub fn is_empty(&self) -> bool {
		self.messages.is_empty()
	}

	/// The `before` cursor for the next page fetch.
	pub fn oldest_id(&self) -> Option<MessageId> {
		self.messages.first().map(|m| m.id)
	}

	/// Prepend an older page, keeping chronological order. Returns how many
	/// messages were actually new.
	pub fn prepend_page(&mut self, page: &MessagePage) -> usize {
		let known: HashSet<(i64, i64)> = self.messages.iter().map(dedup_key).collect();

		let mut merged: Vec<WireMessage> = page
			.messages
			.iter()
			.filter(|m| !known.contains(&dedup_key(m)))
			.cloned()
			.collect();
		let added = merged.len();

		merged.append(&mut self.messages);
		self.messages = merged;
		added
	}

	/// Append a newly observed message (e.g. reconciled from a refetch after
	/// reconnect). Dropped if already present.
	pub fn push_newest(&mut self, message: WireMessage) -> bool {
		let key = dedup_key(&message);
		if self.messages.iter().any(|m| dedup_key(m) == key) {
			return false;
		}
		self.messages.push(message);
		true
	}
}

fn dedup_key(m: &WireMessage) -> (i64, i64) {
	(m.id.0, m.created_at.timestamp_millis())
}
