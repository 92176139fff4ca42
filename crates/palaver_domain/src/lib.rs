#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Slug of the shared public room, created on first access.
pub const PUBLIC_ROOM_SLUG: &str = "public";

/// Display name of the shared public room.
pub const PUBLIC_ROOM_NAME: &str = "Public Chat";

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid character: {0}")]
	InvalidChar(char),
	#[error("invalid length: {0}")]
	InvalidLength(usize),
	#[error("unknown value: {0}")]
	Unknown(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

fn is_slug_char(c: char) -> bool {
	c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Room kinds. Direct rooms carry a [`DirectPairKey`] binding exactly two
/// participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
	Public,
	Private,
	Direct,
}

impl RoomKind {
	/// Stable string identifier.
	pub const fn as_str(self) -> &'static str {
		match self {
			RoomKind::Public => "public",
			RoomKind::Private => "private",
			RoomKind::Direct => "direct",
		}
	}
}

impl fmt::Display for RoomKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for RoomKind {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"" => Err(ParseIdError::Empty),
			"public" => Ok(RoomKind::Public),
			"private" => Ok(RoomKind::Private),
			"direct" => Ok(RoomKind::Direct),
			other => Err(ParseIdError::Unknown(other.to_string())),
		}
	}
}

/// Validated room slug: `[A-Za-z0-9_-]`, 3..=80 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomSlug(String);

impl RoomSlug {
	pub const MIN_LEN: usize = 3;
	pub const MAX_LEN: usize = 80;

	pub fn new(slug: impl Into<String>) -> Result<Self, ParseIdError> {
		let slug = slug.into();
		if slug.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if slug.len() < Self::MIN_LEN || slug.len() > Self::MAX_LEN {
			return Err(ParseIdError::InvalidLength(slug.len()));
		}
		if let Some(bad) = slug.chars().find(|c| !is_slug_char(*c)) {
			return Err(ParseIdError::InvalidChar(bad));
		}
		Ok(Self(slug))
	}

	/// The shared public room slug.
	pub fn public() -> Self {
		Self(PUBLIC_ROOM_SLUG.to_string())
	}

	pub fn is_public(&self) -> bool {
		self.0 == PUBLIC_ROOM_SLUG
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomSlug {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomSlug {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomSlug::new(s.trim().to_string())
	}
}

/// Authenticated account name: `[A-Za-z0-9_-]`, 1..=32 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserName(String);

impl UserName {
	pub const MAX_LEN: usize = 32;

	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name = name.into();
		if name.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if name.len() > Self::MAX_LEN {
			return Err(ParseIdError::InvalidLength(name.len()));
		}
		if let Some(bad) = name.chars().find(|c| !is_slug_char(*c)) {
			return Err(ParseIdError::InvalidChar(bad));
		}
		Ok(Self(name))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserName {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserName::new(s.trim().to_string())
	}
}

/// Anonymous session key minted by the guest bootstrap step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuestKey(pub uuid::Uuid);

impl GuestKey {
	/// Mint a fresh guest session key.
	pub fn mint() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for GuestKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for GuestKey {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat("expected a uuid guest key".into()))
	}
}

/// A connecting identity: an authenticated user or an anonymous guest session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
	User(UserName),
	Guest(GuestKey),
}

impl Subject {
	pub fn user_name(&self) -> Option<&UserName> {
		match self {
			Subject::User(name) => Some(name),
			Subject::Guest(_) => None,
		}
	}

	pub fn is_guest(&self) -> bool {
		matches!(self, Subject::Guest(_))
	}

	/// Stable key for rate-limit buckets and presence entries.
	pub fn key(&self) -> String {
		match self {
			Subject::User(name) => format!("user:{name}"),
			Subject::Guest(key) => format!("guest:{key}"),
		}
	}
}

impl fmt::Display for Subject {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.key())
	}
}

/// Deterministic key binding a direct room to exactly two participants.
///
/// The two names are ordered lexicographically so the key is the same no
/// matter which side initiates the dialog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirectPairKey {
	encoded: String,
}

impl DirectPairKey {
	/// Build the pair key for two distinct participants.
	pub fn new(a: &UserName, b: &UserName) -> Result<Self, ParseIdError> {
		if a == b {
			return Err(ParseIdError::InvalidFormat(
				"direct dialog requires two distinct participants".into(),
			));
		}
		let (first, second) = if a <= b { (a, b) } else { (b, a) };
		Ok(Self {
			encoded: format!("{first}:{second}"),
		})
	}

	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		let (first, second) = s
			.split_once(':')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected first:second".into()))?;
		let first = UserName::new(first)?;
		let second = UserName::new(second)?;
		DirectPairKey::new(&first, &second)
	}

	pub fn as_str(&self) -> &str {
		&self.encoded
	}

	/// Both participants in canonical order.
	pub fn participants(&self) -> (&str, &str) {
		self.split()
	}

	fn split(&self) -> (&str, &str) {
		// Construction guarantees exactly one separator.
		self.encoded.split_once(':').unwrap_or((self.encoded.as_str(), ""))
	}

	/// Whether `user` is one of the two paired participants.
	pub fn contains(&self, user: &UserName) -> bool {
		let (first, second) = self.split();
		user.as_str() == first || user.as_str() == second
	}

	/// The other participant, if `user` is a member of the pair.
	pub fn peer_of(&self, user: &UserName) -> Option<UserName> {
		let (first, second) = self.split();
		if user.as_str() == first {
			UserName::new(second).ok()
		} else if user.as_str() == second {
			UserName::new(first).ok()
		} else {
			None
		}
	}

	/// Deterministic room slug for this dialog: `dm-{first}-{second}`.
	pub fn room_slug(&self) -> RoomSlug {
		// names are 1..=32 slug characters each, so the combined slug always
		// fits the 3..=80 window
		let (first, second) = self.split();
		RoomSlug::new(format!("dm-{first}-{second}")).expect("pair components are slug-safe")
	}
}

impl fmt::Display for DirectPairKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.encoded)
	}
}

impl FromStr for DirectPairKey {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		DirectPairKey::parse(s)
	}
}

/// Stored per-room role for a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
	Owner,
	Admin,
	Member,
	Viewer,
	Blocked,
}

impl ChatRole {
	pub const fn as_str(self) -> &'static str {
		match self {
			ChatRole::Owner => "owner",
			ChatRole::Admin => "admin",
			ChatRole::Member => "member",
			ChatRole::Viewer => "viewer",
			ChatRole::Blocked => "blocked",
		}
	}
}

impl fmt::Display for ChatRole {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for ChatRole {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim() {
			"" => Err(ParseIdError::Empty),
			"owner" => Ok(ChatRole::Owner),
			"admin" => Ok(ChatRole::Admin),
			"member" => Ok(ChatRole::Member),
			"viewer" => Ok(ChatRole::Viewer),
			"blocked" => Ok(ChatRole::Blocked),
			other => Err(ParseIdError::Unknown(other.to_string())),
		}
	}
}

/// Server-assigned message identifier, monotonic within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Derived capability for one (room, viewer) pairing. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Access {
	pub can_read: bool,
	pub can_write: bool,
}

impl Access {
	pub const DENIED: Access = Access {
		can_read: false,
		can_write: false,
	};

	pub const READ_ONLY: Access = Access {
		can_read: true,
		can_write: false,
	};

	pub const READ_WRITE: Access = Access {
		can_read: true,
		can_write: true,
	};
}

/// Access Control Evaluator: pure decision table over room kind, viewer and
/// stored role.
///
/// For direct rooms the viewer must be one of the two participants encoded in
/// the pair key; a stray role row alone never grants access.
pub fn evaluate_access(
	kind: RoomKind,
	viewer: Option<&UserName>,
	role: Option<ChatRole>,
	pair_key: Option<&DirectPairKey>,
) -> Access {
	if role == Some(ChatRole::Blocked) {
		return Access::DENIED;
	}

	match kind {
		RoomKind::Public => match viewer {
			// Anyone may read the public room; only authenticated users write.
			Some(_) => Access::READ_WRITE,
			None => Access::READ_ONLY,
		},
		RoomKind::Private => {
			if viewer.is_none() {
				return Access::DENIED;
			}
			match role {
				Some(ChatRole::Owner) | Some(ChatRole::Admin) | Some(ChatRole::Member) => Access::READ_WRITE,
				Some(ChatRole::Viewer) => Access::READ_ONLY,
				Some(ChatRole::Blocked) | None => Access::DENIED,
			}
		}
		RoomKind::Direct => {
			let Some(viewer) = viewer else {
				return Access::DENIED;
			};
			let Some(pair) = pair_key else {
				return Access::DENIED;
			};
			if pair.contains(viewer) { Access::READ_WRITE } else { Access::DENIED }
		}
	}
}


#[cfg(test)]
mod props {
	use proptest::prelude::*;

	use super::*;

	fn name_strategy() -> impl Strategy<Value = String> {
		"[A-Za-z0-9_-]{1,32}"
	}

	proptest! {
		#[test]
		fn valid_slugs_roundtrip(s in "[A-Za-z0-9_-]{3,80}") {
			let slug = RoomSlug::new(s.clone()).unwrap();
			prop_assert_eq!(slug.as_str(), s);
		}

		#[test]
		fn slug_rejects_foreign_characters(s in "[A-Za-z0-9_-]{0,10}[^A-Za-z0-9_-][A-Za-z0-9_-]{0,10}") {
			prop_assert!(RoomSlug::new(s).is_err());
		}

		#[test]
		fn pair_key_is_symmetric_and_binds_exactly_both(a in name_strategy(), b in name_strategy()) {
			let ua = UserName::new(a).unwrap();
			let ub = UserName::new(b).unwrap();
			prop_assume!(ua != ub);

			let k1 = DirectPairKey::new(&ua, &ub).unwrap();
			let k2 = DirectPairKey::new(&ub, &ua).unwrap();
			prop_assert_eq!(&k1, &k2);

			prop_assert!(k1.contains(&ua));
			prop_assert!(k1.contains(&ub));
			prop_assert_eq!(k1.peer_of(&ua), Some(ub.clone()));
			prop_assert_eq!(k1.peer_of(&ub), Some(ua));
			prop_assert_eq!(DirectPairKey::parse(k1.as_str()).unwrap(), k1);
		}

		#[test]
		fn pair_room_slug_is_always_a_valid_slug(a in name_strategy(), b in name_strategy()) {
			let ua = UserName::new(a).unwrap();
			let ub = UserName::new(b).unwrap();
			prop_assume!(ua != ub);

			let slug = DirectPairKey::new(&ua, &ub).unwrap().room_slug();
			prop_assert!(slug.as_str().starts_with("dm-"));
			prop_assert!(RoomSlug::new(slug.as_str()).is_ok());
		}
	}
}
