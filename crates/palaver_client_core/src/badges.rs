#![forbid(unsafe_code)]

//! Local unread-badge state for the direct inbox.
//!
//! A `mark_read` clears the local badge immediately for responsiveness. Until
//! the ack lands, server snapshots may still carry the stale count, so a slug
//! with a pending clear is masked out of incoming snapshots. The ack snapshot
//! is authoritative and replaces local state wholesale.

use std::collections::BTreeSet;

use palaver_domain::RoomSlug;
use palaver_protocol::inbox::UnreadState;

#[derive(Debug, Clone, Default)]
pub struct InboxBadges {
	state: UnreadState,
	pending_clears: BTreeSet<RoomSlug>,
}

impl InboxBadges {
	pub fn new() -> Self {
		Self::default()
	}

	/// Dialogs with at least one unread message.
	pub fn total(&self) -> u64 {
		self.state.total
	}

	pub fn count(&self, slug: &RoomSlug) -> u64 {
		self.state.unread.get(slug).copied().unwrap_or(0)
	}

	pub fn state(&self) -> &UnreadState {
		&self.state
	}

	/// Apply a `direct_unread_state` snapshot. Slugs with a pending local
	/// clear keep showing zero until the ack reconciles them.
	pub fn apply_state(&mut self, incoming: UnreadState) {
		let mut counts = incoming.unread;
		for slug in &self.pending_clears {
			counts.remove(slug);
		}
		self.state = UnreadState::from_counts(counts);
	}

	/// Clear one dialog locally, to be called when `mark_read` is sent.
	pub fn optimistic_mark_read(&mut self, slug: &RoomSlug) {
		self.pending_clears.insert(slug.clone());
		let mut counts = std::mem::take(&mut self.state).unread;
		counts.remove(slug);
		self.state = UnreadState::from_counts(counts);
	}

	/// Apply a `direct_mark_read_ack`. The carried snapshot wins over the
	/// optimistic clear, even if they diverge.
	pub fn apply_ack(&mut self, slug: &RoomSlug, authoritative: UnreadState) {
		self.pending_clears.remove(slug);

		let mut counts = authoritative.unread;
		for pending in &self.pending_clears {
			counts.remove(pending);
		}
		self.state = UnreadState::from_counts(counts);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::BTreeMap;

	fn slug(s: &str) -> RoomSlug {
		RoomSlug::new(s).expect("valid slug")
	}

	fn snapshot(counts: &[(&str, u64)]) -> UnreadState {
		let map: BTreeMap<RoomSlug, u64> = counts.iter().map(|(s, n)| (slug(s), *n)).collect();
		UnreadState::from_counts(map)
	}

	#[test]
	fn snapshot_replaces_local_counts() {
		let mut badges = InboxBadges::new();
		badges.apply_state(snapshot(&[("dm-alice-bob", 2), ("dm-alice-carol", 1)]));
		assert_eq!(badges.total(), 2);
		assert_eq!(badges.count(&slug("dm-alice-bob")), 2);
	}

	#[test]
	fn optimistic_clear_zeroes_immediately() {
		let mut badges = InboxBadges::new();
		badges.apply_state(snapshot(&[("dm-alice-bob", 3)]));

		badges.optimistic_mark_read(&slug("dm-alice-bob"));
		assert_eq!(badges.count(&slug("dm-alice-bob")), 0);
		assert_eq!(badges.total(), 0);
	}

	#[test]
	fn stale_snapshot_does_not_resurrect_a_pending_clear() {
		let mut badges = InboxBadges::new();
		badges.apply_state(snapshot(&[("dm-alice-bob", 3)]));
		badges.optimistic_mark_read(&slug("dm-alice-bob"));

		// a broadcast racing the mark_read still carries the old count
		badges.apply_state(snapshot(&[("dm-alice-bob", 3), ("dm-alice-carol", 1)]));
		assert_eq!(badges.count(&slug("dm-alice-bob")), 0);
		assert_eq!(badges.count(&slug("dm-alice-carol")), 1);
	}

	#[test]
	fn ack_snapshot_is_authoritative_even_when_diverging() {
		let mut badges = InboxBadges::new();
		badges.apply_state(snapshot(&[("dm-alice-bob", 3)]));
		badges.optimistic_mark_read(&slug("dm-alice-bob"));

		// a message arrived between the mark_read and its durable apply
		badges.apply_ack(&slug("dm-alice-bob"), snapshot(&[("dm-alice-bob", 1)]));
		assert_eq!(badges.count(&slug("dm-alice-bob")), 1);
		assert_eq!(badges.total(), 1);

		// later snapshots are applied normally again
		badges.apply_state(snapshot(&[("dm-alice-bob", 2)]));
		assert_eq!(badges.count(&slug("dm-alice-bob")), 2);
	}

	#[test]
	fn ack_for_one_slug_keeps_other_pending_clears_masked() {
		let mut badges = InboxBadges::new();
		badges.apply_state(snapshot(&[("dm-alice-bob", 1), ("dm-alice-carol", 2)]));
		badges.optimistic_mark_read(&slug("dm-alice-bob"));
		badges.optimistic_mark_read(&slug("dm-alice-carol"));

		badges.apply_ack(&slug("dm-alice-bob"), snapshot(&[("dm-alice-carol", 2)]));
		assert_eq!(badges.count(&slug("dm-alice-carol")), 0);
		assert_eq!(badges.total(), 0);
	}
}
