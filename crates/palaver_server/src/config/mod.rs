#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use palaver_util::secret::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.palaver/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".palaver").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub limits: RateLimitSettings,
	pub presence: PresenceSettings,
	pub channels: ChannelSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HMAC secret for signed session tokens.
	pub session_hmac_secret: Option<SecretString>,
	/// HMAC secret for signed media references; falls back to the session
	/// secret when unset.
	pub media_signing_secret: Option<SecretString>,
	/// Signed media reference lifetime.
	pub media_url_ttl_secs: u64,
	/// Guest session token lifetime.
	pub guest_session_ttl_secs: u64,
	/// Maximum accepted chat message length (characters).
	pub message_max_len: usize,
	/// Default history page size.
	pub history_page_size: u32,
	/// Hard cap on requested history page size.
	pub history_max_page_size: u32,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			metrics_bind: None,
			session_hmac_secret: None,
			media_signing_secret: None,
			media_url_ttl_secs: 300,
			guest_session_ttl_secs: 86_400,
			message_max_len: 1_000,
			history_page_size: 50,
			history_max_page_size: 200,
		}
	}
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
	/// Chat sends allowed per subject per window.
	pub chat_send_limit: u32,
	pub chat_send_window_secs: u64,
	/// Connection attempts allowed per subject per channel per window.
	pub connect_limit: u32,
	pub connect_window_secs: u64,
}

impl Default for RateLimitSettings {
	fn default() -> Self {
		Self {
			chat_send_limit: 20,
			chat_send_window_secs: 10,
			connect_limit: 10,
			connect_window_secs: 60,
		}
	}
}

#[derive(Debug, Clone)]
pub struct PresenceSettings {
	/// Entries with no heartbeat inside the TTL drop from the roster.
	pub ttl_secs: u64,
	/// Grace period that keeps an entry listed across a quick reconnect.
	pub grace_secs: u64,
	/// Server heartbeat interval on the presence channel.
	pub heartbeat_secs: u64,
	/// Minimum spacing between persisted last-seen refreshes per subject.
	pub touch_interval_secs: u64,
	/// Presence connections idle past this are closed.
	pub idle_timeout_secs: u64,
}

impl Default for PresenceSettings {
	fn default() -> Self {
		Self {
			ttl_secs: 90,
			grace_secs: 5,
			heartbeat_secs: 20,
			touch_interval_secs: 30,
			idle_timeout_secs: 90,
		}
	}
}

#[derive(Debug, Clone)]
pub struct ChannelSettings {
	/// Chat connections idle past this are closed.
	pub chat_idle_timeout_secs: u64,
	/// Inbox connections idle past this are closed.
	pub inbox_idle_timeout_secs: u64,
	/// Per-subscriber fan-out queue depth.
	pub subscriber_queue_capacity: usize,
}

impl Default for ChannelSettings {
	fn default() -> Self {
		Self {
			chat_idle_timeout_secs: 600,
			inbox_idle_timeout_secs: 600,
			subscriber_queue_capacity: 256,
		}
	}
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// Database URL (sqlite: or postgres:).
	pub database_url: String,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: "sqlite://palaver.db?mode=rwc".to_string(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	limits: FileRateLimitSettings,

	#[serde(default)]
	presence: FilePresenceSettings,

	#[serde(default)]
	channels: FileChannelSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	session_hmac_secret: Option<String>,
	media_signing_secret: Option<String>,
	media_url_ttl_secs: Option<u64>,
	guest_session_ttl_secs: Option<u64>,
	message_max_len: Option<usize>,
	history_page_size: Option<u32>,
	history_max_page_size: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRateLimitSettings {
	chat_send_limit: Option<u32>,
	chat_send_window_secs: Option<u64>,
	connect_limit: Option<u32>,
	connect_window_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePresenceSettings {
	ttl_secs: Option<u64>,
	grace_secs: Option<u64>,
	heartbeat_secs: Option<u64>,
	touch_interval_secs: Option<u64>,
	idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileChannelSettings {
	chat_idle_timeout_secs: Option<u64>,
	inbox_idle_timeout_secs: Option<u64>,
	subscriber_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerConfig::default();

		Self {
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				session_hmac_secret: file
					.server
					.session_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				media_signing_secret: file
					.server
					.media_signing_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				media_url_ttl_secs: file.server.media_url_ttl_secs.unwrap_or(defaults.server.media_url_ttl_secs),
				guest_session_ttl_secs: file
					.server
					.guest_session_ttl_secs
					.unwrap_or(defaults.server.guest_session_ttl_secs),
				message_max_len: file.server.message_max_len.unwrap_or(defaults.server.message_max_len),
				history_page_size: file.server.history_page_size.unwrap_or(defaults.server.history_page_size),
				history_max_page_size: file
					.server
					.history_max_page_size
					.unwrap_or(defaults.server.history_max_page_size),
			},
			limits: RateLimitSettings {
				chat_send_limit: file.limits.chat_send_limit.unwrap_or(defaults.limits.chat_send_limit),
				chat_send_window_secs: file
					.limits
					.chat_send_window_secs
					.unwrap_or(defaults.limits.chat_send_window_secs),
				connect_limit: file.limits.connect_limit.unwrap_or(defaults.limits.connect_limit),
				connect_window_secs: file.limits.connect_window_secs.unwrap_or(defaults.limits.connect_window_secs),
			},
			presence: PresenceSettings {
				ttl_secs: file.presence.ttl_secs.unwrap_or(defaults.presence.ttl_secs),
				grace_secs: file.presence.grace_secs.unwrap_or(defaults.presence.grace_secs),
				heartbeat_secs: file.presence.heartbeat_secs.unwrap_or(defaults.presence.heartbeat_secs),
				touch_interval_secs: file
					.presence
					.touch_interval_secs
					.unwrap_or(defaults.presence.touch_interval_secs),
				idle_timeout_secs: file.presence.idle_timeout_secs.unwrap_or(defaults.presence.idle_timeout_secs),
			},
			channels: ChannelSettings {
				chat_idle_timeout_secs: file
					.channels
					.chat_idle_timeout_secs
					.unwrap_or(defaults.channels.chat_idle_timeout_secs),
				inbox_idle_timeout_secs: file
					.channels
					.inbox_idle_timeout_secs
					.unwrap_or(defaults.channels.inbox_idle_timeout_secs),
				subscriber_queue_capacity: file
					.channels
					.subscriber_queue_capacity
					.filter(|c| *c > 0)
					.unwrap_or(defaults.channels.subscriber_queue_capacity),
			},
			persistence: PersistenceSettings {
				database_url: file
					.persistence
					.database_url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.persistence.database_url),
			},
		}
	}

	/// The media signing secret, falling back to the session secret.
	pub fn media_secret(&self) -> Option<&SecretString> {
		self.server
			.media_signing_secret
			.as_ref()
			.or(self.server.session_hmac_secret.as_ref())
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("PALAVER_SESSION_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.session_hmac_secret = Some(SecretString::new(v));
			info!("server auth: session_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PALAVER_MEDIA_SIGNING_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.media_signing_secret = Some(SecretString::new(v));
			info!("server config: media_signing_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PALAVER_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PALAVER_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = v;
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PALAVER_MESSAGE_MAX_LEN")
		&& let Ok(len) = v.trim().parse::<usize>()
	{
		cfg.server.message_max_len = len;
		info!(len, "server config: message_max_len overridden by env");
	}

	if let Ok(v) = std::env::var("PALAVER_CHAT_SEND_LIMIT")
		&& let Ok(limit) = v.trim().parse::<u32>()
	{
		cfg.limits.chat_send_limit = limit;
		info!(limit, "server config: chat_send_limit overridden by env");
	}

	if let Ok(v) = std::env::var("PALAVER_CHAT_SEND_WINDOW_SECS")
		&& let Ok(window) = v.trim().parse::<u64>()
	{
		cfg.limits.chat_send_window_secs = window;
		info!(window, "server config: chat_send_window_secs overridden by env");
	}

	if let Ok(v) = std::env::var("PALAVER_CONNECT_LIMIT")
		&& let Ok(limit) = v.trim().parse::<u32>()
	{
		cfg.limits.connect_limit = limit;
		info!(limit, "server config: connect_limit overridden by env");
	}

	if let Ok(v) = std::env::var("PALAVER_PRESENCE_TTL_SECS")
		&& let Ok(ttl) = v.trim().parse::<u64>()
	{
		cfg.presence.ttl_secs = ttl;
		info!(ttl, "server config: presence ttl_secs overridden by env");
	}

	if let Ok(v) = std::env::var("PALAVER_GUEST_SESSION_TTL_SECS")
		&& let Ok(ttl) = v.trim().parse::<u64>()
	{
		cfg.server.guest_session_ttl_secs = ttl;
		info!(ttl, "server config: guest_session_ttl_secs overridden by env");
	}

	if cfg.server.session_hmac_secret.is_none() {
		warn!("server auth: no session_hmac_secret configured; minted tokens will not survive restarts");
	}

	if cfg.presence.grace_secs >= cfg.presence.ttl_secs {
		warn!(
			grace = cfg.presence.grace_secs,
			ttl = cfg.presence.ttl_secs,
			"presence config: grace_secs >= ttl_secs; clamping grace to ttl"
		);
		cfg.presence.grace_secs = cfg.presence.ttl_secs;
	}
}
