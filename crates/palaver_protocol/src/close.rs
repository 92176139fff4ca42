#![forbid(unsafe_code)]

//! Server-initiated WebSocket close codes and their retry classification.

/// Clean shutdown requested by either side.
pub const NORMAL: u16 = 1000;

/// Endpoint going away (page navigation, server shutdown).
pub const GOING_AWAY: u16 = 1001;

/// Unexpected server-side failure while handling the connection.
pub const INTERNAL_ERROR: u16 = 1011;

/// Presence channel idle timeout.
pub const PRESENCE_IDLE: u16 = 4000;

/// Chat room channel idle timeout.
pub const CHAT_IDLE: u16 = 4001;

/// Direct-inbox channel idle timeout.
pub const INBOX_IDLE: u16 = 4002;

/// Missing or invalid session token on a channel that requires one.
pub const UNAUTHORIZED: u16 = 4401;

/// Access Control Evaluator denied read capability.
pub const FORBIDDEN: u16 = 4403;

/// Room slug is malformed or the room does not exist.
pub const INVALID_ROOM: u16 = 4404;

/// Connection-attempt rate limit exceeded.
pub const TOO_MANY_REQUESTS: u16 = 4429;

/// True for the two intentional close codes that must not trigger a reconnect.
pub fn is_clean(code: u16) -> bool {
	code == NORMAL || code == GOING_AWAY
}

/// Whether a client should schedule a reconnect after this close code.
///
/// Idle timeouts, rate limiting and transport-level codes are all
/// expected-retry. Forbidden and invalid-room surface to the user instead of
/// retrying indefinitely; clean closes are intentional.
pub fn should_reconnect(code: u16) -> bool {
	!is_clean(code) && code != FORBIDDEN && code != INVALID_ROOM
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn idle_and_rate_limit_codes_retry() {
		for code in [PRESENCE_IDLE, CHAT_IDLE, INBOX_IDLE, TOO_MANY_REQUESTS, UNAUTHORIZED, 1006] {
			assert!(should_reconnect(code), "code {code} should retry");
		}
	}

	#[test]
	fn terminal_codes_do_not_retry() {
		for code in [NORMAL, GOING_AWAY, FORBIDDEN, INVALID_ROOM] {
			assert!(!should_reconnect(code), "code {code} should not retry");
		}
	}
}
