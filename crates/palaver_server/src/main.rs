#![forbid(unsafe_code)]

mod auth;
mod channels;
mod config;
mod hub;
mod inbox;
mod media;
mod presence;
mod ratelimit;
mod router;
mod state;
mod store;

#[cfg(test)]
mod server_tests;

use std::net::SocketAddr;

use palaver_util::endpoint::WsEndpoint;
use palaver_util::secret::SecretString;
use palaver_util::time::unix_now_ms;
use rand::RngCore;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::state::AppState;
use crate::store::ChatStore;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: palaver_server [--bind ws://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: ws://127.0.0.1:8200)\n\
\t         Format: ws://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "ws://127.0.0.1:8200".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = WsEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,palaver_server=debug".to_string());

	tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false))
		.init();
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn ephemeral_secret() -> SecretString {
	let mut bytes = [0u8; 32];
	rand::rng().fill_bytes(&mut bytes);
	let mut hex = String::with_capacity(64);
	for b in bytes {
		hex.push(char::from_digit(u32::from(b >> 4), 16).unwrap_or('0'));
		hex.push(char::from_digit(u32::from(b & 0x0f), 16).unwrap_or('0'));
	}
	SecretString::new(hex)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let mut server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if server_cfg.server.session_hmac_secret.is_none() {
		server_cfg.server.session_hmac_secret = Some(ephemeral_secret());
		warn!("no session_hmac_secret configured; using an ephemeral secret for this run");
	}

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let store = ChatStore::connect(&server_cfg.persistence.database_url).await?;
	store.ensure_public_room(unix_now_ms() as i64).await?;
	info!("store connected and migrated");

	let state = AppState::new(server_cfg, store);
	state.health.mark_ready();

	let app = router::build_router(state);
	let listener = tokio::net::TcpListener::bind(bind_addr).await?;
	info!(bind = %bind_addr, "palaver_server: listening");

	axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

	Ok(())
}
