#![forbid(unsafe_code)]

//! Direct-inbox coordination: per-user unread state, active-room suppression
//! and dialog preview fan-out.
//!
//! Unread counts are always recomputed from the store, so a reconnecting
//! client receives an authoritative snapshot instead of whatever its last
//! session believed.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context as _;
use palaver_domain::{RoomSlug, UserName};
use palaver_protocol::ErrorCode;
use palaver_protocol::inbox::{InboxItem, InboxServerEvent, UnreadState};
use tokio::sync::Mutex;
use tracing::debug;

use crate::hub::FanoutHub;
use crate::store::{ChatStore, StoredMessage, StoredRoom};

#[derive(Clone)]
pub struct InboxCoordinator {
	store: ChatStore,
	hub: FanoutHub<UserName, InboxServerEvent>,
	active_rooms: Arc<Mutex<HashMap<UserName, RoomSlug>>>,
}

impl InboxCoordinator {
	pub fn new(store: ChatStore, hub: FanoutHub<UserName, InboxServerEvent>) -> Self {
		Self {
			store,
			hub,
			active_rooms: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	pub fn hub(&self) -> &FanoutHub<UserName, InboxServerEvent> {
		&self.hub
	}

	/// Authoritative unread snapshot straight from the store.
	pub async fn unread_state(&self, user: &UserName) -> anyhow::Result<UnreadState> {
		let counts = self.store.unread_counts(user).await.context("load unread counts")?;
		Ok(UnreadState::from_counts(counts))
	}

	/// Record which dialog the user is viewing. Setting the same slug again is
	/// a no-op; messages arriving into the active dialog are read immediately
	/// instead of incrementing unread.
	pub async fn set_active_room(&self, user: &UserName, slug: Option<RoomSlug>) {
		let mut active = self.active_rooms.lock().await;
		match slug {
			Some(slug) => {
				if active.get(user) != Some(&slug) {
					debug!(user = %user, room = %slug, "inbox: active room set");
					active.insert(user.clone(), slug);
				}
			}
			None => {
				if active.remove(user).is_some() {
					debug!(user = %user, "inbox: active room cleared");
				}
			}
		}
	}

	pub async fn active_room(&self, user: &UserName) -> Option<RoomSlug> {
		self.active_rooms.lock().await.get(user).cloned()
	}

	/// Clear per-user state once the last inbox connection is gone.
	pub async fn forget(&self, user: &UserName) {
		if self.hub.subscriber_count(user).await == 0 {
			self.active_rooms.lock().await.remove(user);
		}
	}

	/// Durably mark a dialog read and return the ack event for the caller.
	/// Other open inbox connections of the same user get a fresh snapshot via
	/// the hub.
	pub async fn mark_read(&self, user: &UserName, slug: &RoomSlug) -> anyhow::Result<InboxServerEvent> {
		let owns_dialog = self
			.store
			.room_by_slug(slug)
			.await?
			.and_then(|room| room.pair_key)
			.is_some_and(|pair| pair.contains(user));
		if !owns_dialog {
			return Ok(InboxServerEvent::Error {
				error: ErrorCode::Forbidden,
			});
		}

		self.store.mark_read(slug, user).await.context("persist read mark")?;
		let state = self.unread_state(user).await?;

		self.hub
			.publish(user, InboxServerEvent::DirectUnreadState { state: state.clone() })
			.await;

		Ok(InboxServerEvent::DirectMarkReadAck {
			slug: slug.clone(),
			state,
		})
	}

	/// Route a freshly persisted direct message to both participants' inbox
	/// streams. The recipient viewing the dialog has it marked read instead of
	/// counted.
	pub async fn on_direct_message(&self, room: &StoredRoom, message: &StoredMessage) -> anyhow::Result<()> {
		let Some(pair) = room.pair_key.as_ref() else {
			return Ok(());
		};

		let (first, second) = pair.participants();
		for name in [first, second] {
			let Ok(participant) = UserName::new(name) else {
				continue;
			};
			let Some(peer) = pair.peer_of(&participant) else {
				continue;
			};

			let item = InboxItem {
				slug: room.slug.clone(),
				peer: peer.as_str().to_string(),
				last_message: message.content.clone(),
				last_author: message.username.clone(),
				timestamp: message.created_at().to_rfc3339(),
			};
			self.hub.publish(&participant, InboxServerEvent::DirectInboxItem { item }).await;

			if participant.as_str() == message.username {
				continue;
			}

			if self.active_room(&participant).await.as_ref() == Some(&room.slug) {
				self.store
					.mark_read(&room.slug, &participant)
					.await
					.context("auto-read active dialog")?;
			}

			let state = self.unread_state(&participant).await?;
			self.hub
				.publish(&participant, InboxServerEvent::DirectUnreadState { state })
				.await;
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use palaver_domain::DirectPairKey;
	use tokio::time::timeout;

	use super::*;
	use crate::hub::{FanoutConfig, FanoutHub, HubItem};

	async fn temp_coordinator() -> (InboxCoordinator, ChatStore, tempfile::TempDir) {
		let dir = tempfile::tempdir().expect("tempdir");
		let url = format!("sqlite://{}?mode=rwc", dir.path().join("inbox.db").display());
		let store = ChatStore::connect(&url).await.expect("connect");
		let hub = FanoutHub::new(FanoutConfig::default());
		(InboxCoordinator::new(store.clone(), hub), store, dir)
	}

	fn user(name: &str) -> UserName {
		UserName::new(name).unwrap()
	}

	async fn recv_event(
		rx: &mut tokio::sync::mpsc::Receiver<HubItem<InboxServerEvent>>,
	) -> InboxServerEvent {
		match timeout(Duration::from_millis(250), rx.recv())
			.await
			.expect("expected item")
			.expect("channel open")
		{
			HubItem::Event(ev) => ev,
			other => panic!("expected event, got: {other:?}"),
		}
	}

	#[tokio::test]
	async fn direct_message_updates_recipient_unread_and_preview() {
		let (coordinator, store, _dir) = temp_coordinator().await;
		let alice = user("alice");
		let bob = user("bob");
		let pair = DirectPairKey::new(&alice, &bob).unwrap();
		let room = store.find_or_create_direct(&pair, 0).await.unwrap();

		let mut alice_rx = coordinator.hub().subscribe(alice.clone()).await;

		let message = store.append_message(&room.slug, "bob", "hi", None, 1_000).await.unwrap();
		coordinator.on_direct_message(&room, &message).await.unwrap();

		let preview = recv_event(&mut alice_rx).await;
		match preview {
			InboxServerEvent::DirectInboxItem { item } => {
				assert_eq!(item.slug, room.slug);
				assert_eq!(item.peer, "bob");
				assert_eq!(item.last_message, "hi");
				assert_eq!(item.last_author, "bob");
			}
			other => panic!("expected preview, got: {other:?}"),
		}

		let state = recv_event(&mut alice_rx).await;
		match state {
			InboxServerEvent::DirectUnreadState { state } => {
				assert_eq!(state.total, 1);
				assert_eq!(state.unread.get(&room.slug), Some(&1));
			}
			other => panic!("expected unread state, got: {other:?}"),
		}
	}

	#[tokio::test]
	async fn own_messages_do_not_produce_unread_state() {
		let (coordinator, store, _dir) = temp_coordinator().await;
		let alice = user("alice");
		let bob = user("bob");
		let pair = DirectPairKey::new(&alice, &bob).unwrap();
		let room = store.find_or_create_direct(&pair, 0).await.unwrap();

		let mut bob_rx = coordinator.hub().subscribe(bob.clone()).await;

		let message = store.append_message(&room.slug, "bob", "hi", None, 1_000).await.unwrap();
		coordinator.on_direct_message(&room, &message).await.unwrap();

		// the author still gets the preview refresh
		let preview = recv_event(&mut bob_rx).await;
		assert!(matches!(preview, InboxServerEvent::DirectInboxItem { .. }));

		let extra = timeout(Duration::from_millis(50), bob_rx.recv()).await;
		assert!(extra.is_err(), "author should not receive an unread state for own message");
	}

	#[tokio::test]
	async fn active_dialog_suppresses_unread_increment() {
		let (coordinator, store, _dir) = temp_coordinator().await;
		let alice = user("alice");
		let bob = user("bob");
		let pair = DirectPairKey::new(&alice, &bob).unwrap();
		let room = store.find_or_create_direct(&pair, 0).await.unwrap();

		coordinator.set_active_room(&alice, Some(room.slug.clone())).await;

		let message = store.append_message(&room.slug, "bob", "hi", None, 1_000).await.unwrap();
		coordinator.on_direct_message(&room, &message).await.unwrap();

		let state = coordinator.unread_state(&alice).await.unwrap();
		assert_eq!(state.total, 0);

		coordinator.set_active_room(&alice, None).await;
		let message = store.append_message(&room.slug, "bob", "again", None, 2_000).await.unwrap();
		coordinator.on_direct_message(&room, &message).await.unwrap();

		let state = coordinator.unread_state(&alice).await.unwrap();
		assert_eq!(state.unread.get(&room.slug), Some(&1));
	}

	#[tokio::test]
	async fn mark_read_acks_with_authoritative_snapshot() {
		let (coordinator, store, _dir) = temp_coordinator().await;
		let alice = user("alice");
		let bob = user("bob");
		let pair = DirectPairKey::new(&alice, &bob).unwrap();
		let room = store.find_or_create_direct(&pair, 0).await.unwrap();

		store.append_message(&room.slug, "bob", "one", None, 1_000).await.unwrap();
		store.append_message(&room.slug, "bob", "two", None, 2_000).await.unwrap();

		let ack = coordinator.mark_read(&alice, &room.slug).await.unwrap();
		match ack {
			InboxServerEvent::DirectMarkReadAck { slug, state } => {
				assert_eq!(slug, room.slug);
				assert_eq!(state.total, 0);
			}
			other => panic!("expected ack, got: {other:?}"),
		}
	}

	#[tokio::test]
	async fn mark_read_of_foreign_dialog_is_forbidden() {
		let (coordinator, store, _dir) = temp_coordinator().await;
		let alice = user("alice");
		let bob = user("bob");
		let mallory = user("mallory");
		let pair = DirectPairKey::new(&alice, &bob).unwrap();
		let room = store.find_or_create_direct(&pair, 0).await.unwrap();

		let result = coordinator.mark_read(&mallory, &room.slug).await.unwrap();
		assert!(matches!(
			result,
			InboxServerEvent::Error {
				error: ErrorCode::Forbidden
			}
		));
	}

	#[tokio::test]
	async fn set_active_room_is_idempotent() {
		let (coordinator, _store, _dir) = temp_coordinator().await;
		let alice = user("alice");
		let slug = RoomSlug::new("dm-alice-bob").unwrap();

		coordinator.set_active_room(&alice, Some(slug.clone())).await;
		coordinator.set_active_room(&alice, Some(slug.clone())).await;
		assert_eq!(coordinator.active_room(&alice).await, Some(slug));

		coordinator.set_active_room(&alice, None).await;
		coordinator.set_active_room(&alice, None).await;
		assert_eq!(coordinator.active_room(&alice).await, None);
	}
}
