#![forbid(unsafe_code)]

//! Signed session tokens: `v1.<payload-b64url>.<sig-b64url>` with an
//! HMAC-SHA256 signature over the encoded payload.

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use palaver_domain::{GuestKey, Subject, UserName};
use palaver_util::time::unix_now_secs;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,

	#[serde(default, skip_serializing_if = "is_false")]
	pub guest: bool,

	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pic: Option<String>,
}

fn is_false(v: &bool) -> bool {
	!*v
}

impl AuthClaims {
	pub fn user(name: &UserName, exp: u64, pic: Option<String>) -> Self {
		Self {
			sub: name.as_str().to_string(),
			exp,
			guest: false,
			pic,
		}
	}

	pub fn guest(key: &GuestKey, exp: u64) -> Self {
		Self {
			sub: key.to_string(),
			exp,
			guest: true,
			pic: None,
		}
	}

	pub fn subject(&self) -> anyhow::Result<Subject> {
		if self.guest {
			Ok(Subject::Guest(self.sub.parse::<GuestKey>().context("parse guest key")?))
		} else {
			Ok(Subject::User(self.sub.parse::<UserName>().context("parse username")?))
		}
	}
}

pub fn mint_hmac_token(claims: &AuthClaims, secret: &str) -> anyhow::Result<String> {
	let payload = serde_json::to_vec(claims).context("encode token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let sig_b64 = URL_SAFE_NO_PAD.encode(sig);
	Ok(format!("v1.{payload_b64}.{sig_b64}"))
}

pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	verify_hmac_token_at(token, secret, unix_now_secs())
}

fn verify_hmac_token_at(token: &str, secret: &str, now: u64) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	if claims.exp <= now {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}
