#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::anyhow;
use palaver_domain::RoomSlug;
use palaver_protocol::chat::ChatBroadcast;
use palaver_protocol::presence::PresenceSnapshot;

use crate::auth::{AuthClaims, verify_hmac_token};
use crate::config::ServerConfig;
use crate::hub::{FanoutConfig, FanoutHub};
use crate::inbox::InboxCoordinator;
use crate::presence::{PresenceConfig, PresenceTracker};
use crate::ratelimit::RateLimiter;
use crate::store::ChatStore;

/// The presence roster is one shared topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PresenceTopic;

#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

#[derive(Clone)]
pub struct AppState {
	pub cfg: Arc<ServerConfig>,
	pub store: ChatStore,
	pub limiter: RateLimiter,
	pub chat_hub: FanoutHub<RoomSlug, ChatBroadcast>,
	pub presence_hub: FanoutHub<PresenceTopic, PresenceSnapshot>,
	pub presence: PresenceTracker,
	pub inbox: InboxCoordinator,
	pub health: HealthState,
}

impl AppState {
	pub fn new(cfg: ServerConfig, store: ChatStore) -> Self {
		let fanout = FanoutConfig {
			subscriber_queue_capacity: cfg.channels.subscriber_queue_capacity,
		};
		let presence = PresenceTracker::new(PresenceConfig {
			ttl_secs: cfg.presence.ttl_secs,
			grace_secs: cfg.presence.grace_secs,
		});
		let inbox = InboxCoordinator::new(store.clone(), FanoutHub::new(fanout.clone()));

		Self {
			cfg: Arc::new(cfg),
			limiter: RateLimiter::new(store.clone()),
			chat_hub: FanoutHub::new(fanout.clone()),
			presence_hub: FanoutHub::new(fanout),
			presence,
			inbox,
			health: HealthState::new(),
			store,
		}
	}

	pub fn session_secret(&self) -> anyhow::Result<&str> {
		self.cfg
			.server
			.session_hmac_secret
			.as_ref()
			.map(|s| s.expose())
			.ok_or_else(|| anyhow!("no session_hmac_secret configured"))
	}

	pub fn verify_session(&self, token: &str) -> anyhow::Result<AuthClaims> {
		verify_hmac_token(token, self.session_secret()?)
	}

	/// Rebuild the roster snapshot and fan it out to every presence
	/// subscriber.
	pub async fn publish_presence(&self) {
		let snapshot = self.presence.snapshot().await;
		self.presence_hub.publish(&PresenceTopic, snapshot).await;
	}
}
