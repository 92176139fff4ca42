#![forbid(unsafe_code)]

//! Aggregated presence roster.
//!
//! A subject is online while it has at least one live presence connection and
//! a heartbeat inside the TTL. A short grace period keeps an entry listed
//! across an abrupt drop so a quick reconnect does not flicker the roster.
//! Guests are counted once per session key no matter how many tabs they have
//! open.

use std::collections::HashMap;
use std::sync::Arc;

use palaver_domain::Subject;
use palaver_protocol::presence::{OnlineUser, PresenceSnapshot};
use palaver_util::time::unix_now_secs;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct PresenceConfig {
	pub ttl_secs: u64,
	pub grace_secs: u64,
}

#[derive(Debug)]
struct PresenceEntry {
	subject: Subject,
	profile_image: Option<String>,
	connection_count: u32,
	last_seen: u64,

	/// Set when the last connection drops abruptly; the entry stays listed
	/// until this deadline passes.
	grace_until: Option<u64>,
}

#[derive(Clone)]
pub struct PresenceTracker {
	entries: Arc<Mutex<HashMap<String, PresenceEntry>>>,
	cfg: PresenceConfig,
}

impl PresenceTracker {
	pub fn new(cfg: PresenceConfig) -> Self {
		Self {
			entries: Arc::new(Mutex::new(HashMap::new())),
			cfg,
		}
	}

	pub async fn connect(&self, subject: &Subject, profile_image: Option<String>) {
		self.connect_at(subject, profile_image, unix_now_secs()).await;
	}

	pub async fn connect_at(&self, subject: &Subject, profile_image: Option<String>, now: u64) {
		let mut entries = self.entries.lock().await;
		let entry = entries.entry(subject.key()).or_insert_with(|| PresenceEntry {
			subject: subject.clone(),
			profile_image: None,
			connection_count: 0,
			last_seen: now,
			grace_until: None,
		});

		entry.connection_count = entry.connection_count.saturating_add(1);
		entry.last_seen = now;
		entry.grace_until = None;
		if profile_image.is_some() {
			entry.profile_image = profile_image;
		}
	}

	/// Drop one connection. A graceful close removes the entry as soon as the
	/// count reaches zero; an abrupt drop keeps it listed for the grace
	/// period.
	pub async fn disconnect(&self, subject: &Subject, graceful: bool) {
		self.disconnect_at(subject, graceful, unix_now_secs()).await;
	}

	pub async fn disconnect_at(&self, subject: &Subject, graceful: bool, now: u64) {
		let mut entries = self.entries.lock().await;
		let key = subject.key();
		let Some(entry) = entries.get_mut(&key) else {
			return;
		};

		entry.connection_count = entry.connection_count.saturating_sub(1);
		if entry.connection_count > 0 {
			return;
		}

		if graceful {
			entries.remove(&key);
		} else {
			entry.grace_until = Some(now + self.cfg.grace_secs);
		}
	}

	pub async fn touch(&self, subject: &Subject, now: u64) {
		let mut entries = self.entries.lock().await;
		if let Some(entry) = entries.get_mut(&subject.key()) {
			entry.last_seen = now;
		}
	}

	/// Build the aggregated snapshot, pruning entries past their TTL or grace
	/// deadline.
	pub async fn snapshot(&self) -> PresenceSnapshot {
		self.snapshot_at(unix_now_secs()).await
	}

	pub async fn snapshot_at(&self, now: u64) -> PresenceSnapshot {
		let mut entries = self.entries.lock().await;
		entries.retain(|_, entry| {
			if let Some(grace_until) = entry.grace_until
				&& grace_until <= now
			{
				return false;
			}
			now.saturating_sub(entry.last_seen) < self.cfg.ttl_secs
		});

		let mut online = Vec::new();
		let mut guests: u64 = 0;
		for entry in entries.values() {
			match &entry.subject {
				Subject::User(name) => online.push(OnlineUser {
					username: name.as_str().to_string(),
					profile_image: entry.profile_image.clone(),
				}),
				Subject::Guest(_) => guests += 1,
			}
		}
		online.sort_by(|a, b| a.username.cmp(&b.username));

		PresenceSnapshot {
			online: Some(online),
			guests: Some(guests),
		}
	}
}

#[cfg(test)]
mod tests {
	use palaver_domain::{GuestKey, UserName};

	use super::*;

	fn cfg() -> PresenceConfig {
		PresenceConfig {
			ttl_secs: 90,
			grace_secs: 5,
		}
	}

	fn user(name: &str) -> Subject {
		Subject::User(UserName::new(name).unwrap())
	}

	#[tokio::test]
	async fn connected_user_is_listed_until_graceful_close() {
		let tracker = PresenceTracker::new(cfg());
		let alice = user("alice");

		tracker.connect_at(&alice, Some("alice.jpg".into()), 100).await;
		let snap = tracker.snapshot_at(100).await;
		let online = snap.online.unwrap();
		assert_eq!(online.len(), 1);
		assert_eq!(online[0].username, "alice");
		assert_eq!(online[0].profile_image.as_deref(), Some("alice.jpg"));

		tracker.disconnect_at(&alice, true, 101).await;
		assert!(tracker.snapshot_at(101).await.online.unwrap().is_empty());
	}

	#[tokio::test]
	async fn abrupt_drop_keeps_entry_through_grace_period() {
		let tracker = PresenceTracker::new(cfg());
		let alice = user("alice");

		tracker.connect_at(&alice, None, 100).await;
		tracker.disconnect_at(&alice, false, 100).await;

		assert_eq!(tracker.snapshot_at(104).await.online.unwrap().len(), 1);
		assert!(tracker.snapshot_at(105).await.online.unwrap().is_empty());
	}

	#[tokio::test]
	async fn reconnect_during_grace_clears_the_deadline() {
		let tracker = PresenceTracker::new(cfg());
		let alice = user("alice");

		tracker.connect_at(&alice, None, 100).await;
		tracker.disconnect_at(&alice, false, 100).await;
		tracker.connect_at(&alice, None, 103).await;

		// well past the old grace deadline but still connected
		assert_eq!(tracker.snapshot_at(110).await.online.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn stale_heartbeat_drops_entry_after_ttl() {
		let tracker = PresenceTracker::new(cfg());
		let alice = user("alice");

		tracker.connect_at(&alice, None, 100).await;
		assert_eq!(tracker.snapshot_at(189).await.online.unwrap().len(), 1);
		assert!(tracker.snapshot_at(190).await.online.unwrap().is_empty());

		tracker.connect_at(&alice, None, 200).await;
		tracker.touch(&alice, 260).await;
		assert_eq!(tracker.snapshot_at(340).await.online.unwrap().len(), 1);
	}

	#[tokio::test]
	async fn guest_with_many_tabs_counts_once() {
		let tracker = PresenceTracker::new(cfg());
		let guest = Subject::Guest(GuestKey::mint());

		tracker.connect_at(&guest, None, 100).await;
		tracker.connect_at(&guest, None, 100).await;

		let snap = tracker.snapshot_at(100).await;
		assert_eq!(snap.guests, Some(1));
		assert!(snap.online.unwrap().is_empty());

		// one tab closes; the session is still connected
		tracker.disconnect_at(&guest, true, 101).await;
		assert_eq!(tracker.snapshot_at(101).await.guests, Some(1));

		tracker.disconnect_at(&guest, true, 102).await;
		assert_eq!(tracker.snapshot_at(102).await.guests, Some(0));
	}

	#[tokio::test]
	async fn connect_without_image_keeps_previous_image() {
		let tracker = PresenceTracker::new(cfg());
		let alice = user("alice");

		tracker.connect_at(&alice, Some("alice.jpg".into()), 100).await;
		tracker.connect_at(&alice, None, 101).await;

		let snap = tracker.snapshot_at(101).await;
		assert_eq!(snap.online.unwrap()[0].profile_image.as_deref(), Some("alice.jpg"));
	}
}
