#![forbid(unsafe_code)]

pub mod endpoint {
	use std::fmt;
	use std::net::SocketAddr;

	/// Parsed `ws://host:port` or `wss://host:port` base endpoint.
	///
	/// The port may be omitted; the scheme default (80/443) applies.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct WsEndpoint {
		pub secure: bool,
		pub host: String,
		pub port: u16,
	}

	impl WsEndpoint {
		/// Parse a base WebSocket endpoint. Paths, queries and fragments are
		/// rejected; those belong to the per-channel URL builders.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected ws://host:port)".to_string());
			}

			let (secure, rest) = if let Some(rest) = s.strip_prefix("wss://") {
				(true, rest)
			} else if let Some(rest) = s.strip_prefix("ws://") {
				(false, rest)
			} else {
				return Err(format!("invalid endpoint (expected ws://host:port or wss://host:port): {s}"));
			};

			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!(
					"invalid endpoint (expected host:port without path/query/fragment): {s}"
				));
			}

			let (host, port) = split_hostport(rest, if secure { 443 } else { 80 })
				.map_err(|e| format!("{e}: {s}"))?;

			Ok(Self { secure, host, port })
		}

		/// Returns `host:port` (IPv6 hosts stay bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		fn scheme(&self) -> &'static str {
			if self.secure { "wss" } else { "ws" }
		}

		/// Chat room channel URL for `slug`, with the session token when present.
		pub fn chat_url(&self, slug: &str, token: Option<&str>) -> String {
			self.channel_url(&format!("/ws/chat/{slug}"), token)
		}

		/// Presence channel URL. `token` may be a user or guest session token.
		pub fn presence_url(&self, token: Option<&str>) -> String {
			self.channel_url("/ws/presence", token)
		}

		/// Direct-inbox channel URL; always requires a token.
		pub fn inbox_url(&self, token: &str) -> String {
			self.channel_url("/ws/inbox", Some(token))
		}

		fn channel_url(&self, path: &str, token: Option<&str>) -> String {
			match token {
				Some(token) => format!("{}://{}{path}?token={token}", self.scheme(), self.hostport()),
				None => format!("{}://{}{path}", self.scheme(), self.hostport()),
			}
		}
	}

	impl fmt::Display for WsEndpoint {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			write!(f, "{}://{}", self.scheme(), self.hostport())
		}
	}

	fn split_hostport(rest: &str, default_port: u16) -> Result<(String, u16), String> {
		let rest = rest.trim();
		if rest.is_empty() {
			return Err("invalid endpoint host".to_string());
		}

		// Bracketed IPv6 first so the colons inside don't look like a port.
		if let Some(after) = rest.strip_prefix('[') {
			let Some((inner, tail)) = after.split_once(']') else {
				return Err("invalid endpoint host (unterminated IPv6 bracket)".to_string());
			};
			let host = format!("[{inner}]");
			return match tail.strip_prefix(':') {
				Some(port_str) => Ok((host, parse_port(port_str)?)),
				None if tail.is_empty() => Ok((host, default_port)),
				None => Err("invalid endpoint (junk after IPv6 bracket)".to_string()),
			};
		}

		match rest.rsplit_once(':') {
			Some((host, _)) if host.contains(':') => {
				Err("invalid endpoint host (IPv6 must be bracketed like wss://[::1]:8080)".to_string())
			}
			Some((host, port_str)) if !host.is_empty() => Ok((host.to_string(), parse_port(port_str)?)),
			Some(_) => Err("invalid endpoint host".to_string()),
			None => Ok((rest.to_string(), default_port)),
		}
	}

	fn parse_port(s: &str) -> Result<u16, String> {
		let port: u16 = s
			.trim()
			.parse()
			.map_err(|_| "invalid endpoint port (expected 1..=65535)".to_string())?;
		if port == 0 {
			return Err("invalid endpoint port (expected 1..=65535)".to_string());
		}
		Ok(port)
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn parses_plain_and_secure() {
			let e = WsEndpoint::parse("ws://127.0.0.1:8080").unwrap();
			assert!(!e.secure);
			assert_eq!(e.hostport(), "127.0.0.1:8080");

			let e = WsEndpoint::parse("wss://chat.example.com:443").unwrap();
			assert!(e.secure);
			assert_eq!(e.host, "chat.example.com");
		}

		#[test]
		fn applies_scheme_default_ports() {
			assert_eq!(WsEndpoint::parse("ws://example.com").unwrap().port, 80);
			assert_eq!(WsEndpoint::parse("wss://example.com").unwrap().port, 443);
		}

		#[test]
		fn parses_bracketed_ipv6_and_rejects_bare() {
			let e = WsEndpoint::parse("ws://[::1]:9000").unwrap();
			assert_eq!(e.host, "[::1]");
			assert_eq!(e.port, 9000);
			assert!(e.to_socket_addr_if_ip_literal().is_ok());

			assert!(WsEndpoint::parse("ws://::1:9000").is_err());
		}

		#[test]
		fn rejects_paths_and_http_schemes() {
			assert!(WsEndpoint::parse("ws://h:1/chat").is_err());
			assert!(WsEndpoint::parse("ws://h:1?x=y").is_err());
			assert!(WsEndpoint::parse("http://h:1").is_err());
			assert!(WsEndpoint::parse("").is_err());
		}

		#[test]
		fn rejects_port_zero() {
			assert!(WsEndpoint::parse("ws://h:0").is_err());
		}

		#[test]
		fn builds_channel_urls() {
			let e = WsEndpoint::parse("ws://127.0.0.1:8080").unwrap();
			assert_eq!(e.chat_url("public", None), "ws://127.0.0.1:8080/ws/chat/public");
			assert_eq!(e.chat_url("public", Some("t0k")), "ws://127.0.0.1:8080/ws/chat/public?token=t0k");
			assert_eq!(e.presence_url(None), "ws://127.0.0.1:8080/ws/presence");
			assert_eq!(e.inbox_url("t0k"), "ws://127.0.0.1:8080/ws/inbox?token=t0k");
		}

		#[test]
		fn socket_addr_rejects_dns() {
			let e = WsEndpoint::parse("ws://chat.example.com:80").unwrap();
			assert!(e.to_socket_addr_if_ip_literal().is_err());
		}
	}
}

pub mod secret {
	use core::fmt;

	/// A string that never leaks through `Debug`/`Display`.
	#[derive(Clone, Default, PartialEq, Eq)]
	pub struct SecretString(String);

	impl SecretString {
		pub fn new(s: impl Into<String>) -> Self {
			Self(s.into())
		}

		/// Access the inner secret string.
		pub fn expose(&self) -> &str {
			&self.0
		}

		pub fn is_empty(&self) -> bool {
			self.0.is_empty()
		}
	}

	impl fmt::Debug for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("SecretString(<redacted>)")
		}
	}

	impl fmt::Display for SecretString {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			f.write_str("<redacted>")
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn debug_and_display_redact() {
			let s = SecretString::new("hunter2");
			assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
			assert_eq!(format!("{s}"), "<redacted>");
			assert_eq!(s.expose(), "hunter2");
		}
	}
}

pub mod time {
	use std::time::{SystemTime, UNIX_EPOCH};

	/// Current unix time in whole seconds.
	pub fn unix_now_secs() -> u64 {
		SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
	}

	/// Current unix time in milliseconds.
	pub fn unix_now_ms() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_millis() as i64
	}
}
