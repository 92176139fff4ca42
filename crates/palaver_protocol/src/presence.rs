#![forbid(unsafe_code)]

//! Presence channel events.
//!
//! Clients send [`crate::Heartbeat`] pings; the server answers every roster
//! change (and its own heartbeat interval) with an aggregated snapshot.

use serde::{Deserialize, Serialize};

use crate::Heartbeat;

/// One authenticated user with a fresh heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
	pub username: String,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub profile_image: Option<String>,
}

/// Aggregated roster snapshot.
///
/// Guest connections receive only the `guests` count; authenticated
/// connections receive both fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PresenceSnapshot {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub online: Option<Vec<OnlineUser>>,

	#[serde(skip_serializing_if = "Option::is_none")]
	pub guests: Option<u64>,
}

/// Server -> client presence frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PresenceServerEvent {
	Heartbeat(Heartbeat),
	Snapshot(PresenceSnapshot),
}

/// Reconcile the viewer's own profile metadata into a snapshot.
///
/// The server's view of "self" may lag a just-completed profile update, so a
/// client overlays its local metadata over its own roster entry.
pub fn reconcile_self(snapshot: &mut PresenceSnapshot, username: &str, profile_image: Option<&str>) {
	let Some(online) = snapshot.online.as_mut() else {
		return;
	};
	for entry in online.iter_mut() {
		if entry.username == username
			&& let Some(image) = profile_image
		{
			entry.profile_image = Some(image.to_string());
		}
	}
}
