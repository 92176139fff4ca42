#![forbid(unsafe_code)]

//! Persistent fixed-window rate limiting keyed by subject and action.
//!
//! Decisions fail closed: when the store cannot confirm a count, the request
//! is limited rather than allowed.

use palaver_util::time::unix_now_secs;
use tracing::warn;

use crate::store::ChatStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
	Allowed,
	Limited { retry_after_secs: u64 },
}

impl RateDecision {
	pub fn is_allowed(self) -> bool {
		matches!(self, RateDecision::Allowed)
	}
}

#[derive(Clone)]
pub struct RateLimiter {
	store: ChatStore,
}

impl RateLimiter {
	pub fn new(store: ChatStore) -> Self {
		Self { store }
	}

	/// Count this attempt against `subject`/`action` for the window containing
	/// now. Attempts past the limit still count; a persistent offender keeps
	/// seeing full windows.
	pub async fn check(&self, subject: &str, action: &str, limit: u32, window_secs: u64) -> RateDecision {
		self.check_at(subject, action, limit, window_secs, unix_now_secs()).await
	}

	async fn check_at(&self, subject: &str, action: &str, limit: u32, window_secs: u64, now: u64) -> RateDecision {
		if window_secs == 0 || limit == 0 {
			return RateDecision::Allowed;
		}

		let window_start = now - now % window_secs;
		let retry_after_secs = window_start + window_secs - now;

		match self.store.rate_increment(subject, action, window_start as i64).await {
			Ok(count) if count <= i64::from(limit) => RateDecision::Allowed,
			Ok(count) => {
				metrics::counter!("palaver_rate_limited_total", "action" => action.to_string()).increment(1);
				tracing::debug!(subject, action, count, limit, "rate limit exceeded");
				RateDecision::Limited { retry_after_secs }
			}
			Err(err) => {
				warn!(subject, action, error = %err, "rate limit store error; failing closed");
				RateDecision::Limited {
					retry_after_secs: window_secs,
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn temp_limiter() -> (RateLimiter, tempfile::TempDir) {
		let dir = tempfile::tempdir().expect("tempdir");
		let url = format!("sqlite://{}?mode=rwc", dir.path().join("rate.db").display());
		let store = ChatStore::connect(&url).await.expect("connect");
		(RateLimiter::new(store), dir)
	}

	#[tokio::test]
	async fn first_n_attempts_pass_then_limited() {
		let (limiter, _dir) = temp_limiter().await;

		for _ in 0..3 {
			assert!(limiter.check_at("user:alice", "chat_send", 3, 10, 100).await.is_allowed());
		}

		let decision = limiter.check_at("user:alice", "chat_send", 3, 10, 105).await;
		assert_eq!(decision, RateDecision::Limited { retry_after_secs: 5 });
	}

	#[tokio::test]
	async fn window_rollover_resets_the_count() {
		let (limiter, _dir) = temp_limiter().await;

		for _ in 0..3 {
			assert!(limiter.check_at("user:alice", "chat_send", 3, 10, 100).await.is_allowed());
		}
		assert!(!limiter.check_at("user:alice", "chat_send", 3, 10, 109).await.is_allowed());

		// next window
		assert!(limiter.check_at("user:alice", "chat_send", 3, 10, 110).await.is_allowed());
	}

	#[tokio::test]
	async fn subjects_and_actions_are_independent() {
		let (limiter, _dir) = temp_limiter().await;

		assert!(limiter.check_at("user:alice", "chat_send", 1, 10, 100).await.is_allowed());
		assert!(!limiter.check_at("user:alice", "chat_send", 1, 10, 101).await.is_allowed());

		assert!(limiter.check_at("user:bob", "chat_send", 1, 10, 102).await.is_allowed());
		assert!(limiter.check_at("user:alice", "connect", 1, 10, 103).await.is_allowed());
	}

	#[tokio::test]
	async fn zero_limit_disables_enforcement() {
		let (limiter, _dir) = temp_limiter().await;
		assert!(limiter.check_at("user:alice", "chat_send", 0, 10, 100).await.is_allowed());
	}
}
