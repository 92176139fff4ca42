#![forbid(unsafe_code)]

//! JSON wire protocol for the chat, presence and direct-inbox channels, plus
//! the request-path payloads the channels bootstrap from.

use core::fmt;

use serde::{Deserialize, Serialize};

pub mod chat;
pub mod close;
pub mod history;
pub mod inbox;
pub mod presence;
pub mod rest;

/// Error categories surfaced to the sender as in-band events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
	Forbidden,
	MessageTooLong,
	RateLimited,
}

impl ErrorCode {
	pub const fn as_str(self) -> &'static str {
		match self {
			ErrorCode::Forbidden => "forbidden",
			ErrorCode::MessageTooLong => "message_too_long",
			ErrorCode::RateLimited => "rate_limited",
		}
	}
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// In-band error event: `{"error": "...", "retry_after": <secs>?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
	pub error: ErrorCode,

	/// Hint in whole seconds, present for `rate_limited` only.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub retry_after: Option<u64>,
}

impl ErrorEvent {
	pub fn new(error: ErrorCode) -> Self {
		Self {
			error,
			retry_after: None,
		}
	}

	pub fn rate_limited(retry_after: u64) -> Self {
		Self {
			error: ErrorCode::RateLimited,
			retry_after: Some(retry_after),
		}
	}
}

/// Heartbeat frame used in both directions: `{"type":"ping"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Heartbeat {
	Ping,
}
