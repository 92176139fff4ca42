#![forbid(unsafe_code)]

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// A connection that held this long resets the attempt counter.
pub const RECONNECT_RESET_AFTER: Duration = Duration::from_secs(60 * 5);

/// Exponential backoff with jitter for reconnect scheduling.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
	pub base_ms: u64,
	pub max_ms: u64,
	pub reset_after: Duration,
}

impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self {
			base_ms: 500,
			max_ms: 30_000,
			reset_after: RECONNECT_RESET_AFTER,
		}
	}
}

impl ReconnectPolicy {
	/// Delay before the given 1-based attempt, with +-10% jitter. The exponent
	/// is capped so the delay saturates at `max_ms`.
	pub fn delay_ms(&self, attempt: u32) -> u64 {
		let pow = 2u64.saturating_pow(attempt.saturating_sub(1).min(6));
		let delay_ms = self.base_ms.saturating_mul(pow).min(self.max_ms);
		let jitter_window = (delay_ms / 10).max(1);
		let jitter_offset = rand::rng().random_range(0..=(jitter_window * 2));
		delay_ms.saturating_sub(jitter_window).saturating_add(jitter_offset)
	}

	pub fn schedule(&self, attempt: u32) -> (Instant, u64) {
		let ms = self.delay_ms(attempt);
		(Instant::now() + Duration::from_millis(ms), ms)
	}

	/// Next attempt number given how long the previous connection held.
	pub fn next_attempt(&self, previous: u32, held_for: Option<Duration>) -> u32 {
		match held_for {
			Some(held) if held > self.reset_after => 1,
			_ => previous.saturating_add(1).max(1),
		}
	}
}
