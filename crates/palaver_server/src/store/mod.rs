#![forbid(unsafe_code)]

//! Durable chat state over sqlx. The backend is picked from the database URL
//! scheme; every query is written per backend because the placeholder syntax
//! differs.

use std::collections::BTreeMap;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use palaver_domain::{
	ChatRole, DirectPairKey, MessageId, PUBLIC_ROOM_NAME, PUBLIC_ROOM_SLUG, RoomKind, RoomSlug, UserName,
};
use palaver_protocol::chat::ChatBroadcast;
use palaver_protocol::history::WireMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRoom {
	pub slug: RoomSlug,
	pub name: String,
	pub kind: RoomKind,
	pub pair_key: Option<DirectPairKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
	pub id: i64,
	pub room: RoomSlug,
	pub username: String,
	pub content: String,
	pub profile_pic: Option<String>,
	pub created_at_ms: i64,
}

impl StoredMessage {
	pub fn created_at(&self) -> DateTime<Utc> {
		DateTime::from_timestamp_millis(self.created_at_ms).unwrap_or_default()
	}

	pub fn to_wire(&self) -> WireMessage {
		WireMessage {
			id: MessageId(self.id),
			username: self.username.clone(),
			content: self.content.clone(),
			profile_pic: self.profile_pic.clone(),
			created_at: self.created_at(),
		}
	}

	pub fn to_broadcast(&self) -> ChatBroadcast {
		ChatBroadcast {
			message: self.content.clone(),
			username: self.username.clone(),
			profile_pic: self.profile_pic.clone(),
			room: self.room.clone(),
		}
	}
}

type RoomRow = (String, String, String, Option<String>);
type MessageRow = (i64, String, String, String, Option<String>, i64);

fn room_from_row((slug, name, kind, pair_key): RoomRow) -> anyhow::Result<StoredRoom> {
	Ok(StoredRoom {
		slug: RoomSlug::new(slug)?,
		name,
		kind: kind.parse()?,
		pair_key: pair_key.map(|k| DirectPairKey::parse(&k)).transpose()?,
	})
}

fn message_from_row((id, room, username, content, profile_pic, created_at_ms): MessageRow) -> anyhow::Result<StoredMessage> {
	Ok(StoredMessage {
		id,
		room: RoomSlug::new(room)?,
		username,
		content,
		profile_pic,
		created_at_ms,
	})
}

#[derive(Clone)]
pub struct ChatStore {
	backend: StoreBackend,
}

#[derive(Clone)]
enum StoreBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl ChatStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: StoreBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: StoreBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	pub async fn health_ping(&self) -> anyhow::Result<()> {
		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query("SELECT 1").execute(pool).await.context("ping (sqlite)")?;
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query("SELECT 1").execute(pool).await.context("ping (postgres)")?;
			}
		}
		Ok(())
	}

	/// The public room exists from first access onward; creation is idempotent.
	pub async fn ensure_public_room(&self, now_ms: i64) -> anyhow::Result<()> {
		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO rooms (slug, name, kind, pair_key, created_at_ms) VALUES (?, ?, 'public', NULL, ?) \
					ON CONFLICT(slug) DO NOTHING",
				)
				.bind(PUBLIC_ROOM_SLUG)
				.bind(PUBLIC_ROOM_NAME)
				.bind(now_ms)
				.execute(pool)
				.await
				.context("ensure public room (sqlite)")?;
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO rooms (slug, name, kind, pair_key, created_at_ms) VALUES ($1, $2, 'public', NULL, $3) \
					ON CONFLICT (slug) DO NOTHING",
				)
				.bind(PUBLIC_ROOM_SLUG)
				.bind(PUBLIC_ROOM_NAME)
				.bind(now_ms)
				.execute(pool)
				.await
				.context("ensure public room (postgres)")?;
			}
		}
		Ok(())
	}

	pub async fn room_by_slug(&self, slug: &RoomSlug) -> anyhow::Result<Option<StoredRoom>> {
		let row: Option<RoomRow> = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT slug, name, kind, pair_key FROM rooms WHERE slug = ?")
					.bind(slug.as_str())
					.fetch_optional(pool)
					.await
					.context("select room (sqlite)")?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as("SELECT slug, name, kind, pair_key FROM rooms WHERE slug = $1")
					.bind(slug.as_str())
					.fetch_optional(pool)
					.await
					.context("select room (postgres)")?
			}
		};
		row.map(room_from_row).transpose()
	}

	/// Create-or-fetch of a direct dialog. Both participants get a member role
	/// row so dialog listing can join on roles.
	pub async fn find_or_create_direct(&self, pair: &DirectPairKey, now_ms: i64) -> anyhow::Result<StoredRoom> {
		let slug = pair.room_slug();
		let (first, second) = pair.participants();
		let name = format!("{first} & {second}");

		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				sqlx::query(
					"INSERT INTO rooms (slug, name, kind, pair_key, created_at_ms) VALUES (?, ?, 'direct', ?, ?) \
					ON CONFLICT(slug) DO NOTHING",
				)
				.bind(slug.as_str())
				.bind(&name)
				.bind(pair.as_str())
				.bind(now_ms)
				.execute(&mut *tx)
				.await
				.context("insert direct room (sqlite)")?;

				for participant in [first, second] {
					sqlx::query(
						"INSERT INTO room_roles (room_slug, username, role) VALUES (?, ?, 'member') \
						ON CONFLICT(room_slug, username) DO NOTHING",
					)
					.bind(slug.as_str())
					.bind(participant)
					.execute(&mut *tx)
					.await
					.context("insert direct role (sqlite)")?;
				}
				tx.commit().await.context("commit sqlite tx")?;
			}
			StoreBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				sqlx::query(
					"INSERT INTO rooms (slug, name, kind, pair_key, created_at_ms) VALUES ($1, $2, 'direct', $3, $4) \
					ON CONFLICT (slug) DO NOTHING",
				)
				.bind(slug.as_str())
				.bind(&name)
				.bind(pair.as_str())
				.bind(now_ms)
				.execute(&mut *tx)
				.await
				.context("insert direct room (postgres)")?;

				for participant in [first, second] {
					sqlx::query(
						"INSERT INTO room_roles (room_slug, username, role) VALUES ($1, $2, 'member') \
						ON CONFLICT (room_slug, username) DO NOTHING",
					)
					.bind(slug.as_str())
					.bind(participant)
					.execute(&mut *tx)
					.await
					.context("insert direct role (postgres)")?;
				}
				tx.commit().await.context("commit postgres tx")?;
			}
		}

		self.room_by_slug(&slug)
			.await?
			.ok_or_else(|| anyhow!("direct room {slug} missing after upsert"))
	}

	pub async fn role_of(&self, slug: &RoomSlug, user: &UserName) -> anyhow::Result<Option<ChatRole>> {
		let row: Option<(String,)> = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT role FROM room_roles WHERE room_slug = ? AND username = ?")
					.bind(slug.as_str())
					.bind(user.as_str())
					.fetch_optional(pool)
					.await
					.context("select role (sqlite)")?
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query_as("SELECT role FROM room_roles WHERE room_slug = $1 AND username = $2")
					.bind(slug.as_str())
					.bind(user.as_str())
					.fetch_optional(pool)
					.await
					.context("select role (postgres)")?
			}
		};
		row.map(|(role,)| role.parse().map_err(Into::into)).transpose()
	}

	pub async fn upsert_role(&self, slug: &RoomSlug, user: &UserName, role: ChatRole) -> anyhow::Result<()> {
		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO room_roles (room_slug, username, role) VALUES (?, ?, ?) \
					ON CONFLICT(room_slug, username) DO UPDATE SET role = excluded.role",
				)
				.bind(slug.as_str())
				.bind(user.as_str())
				.bind(role.as_str())
				.execute(pool)
				.await
				.context("upsert role (sqlite)")?;
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO room_roles (room_slug, username, role) VALUES ($1, $2, $3) \
					ON CONFLICT (room_slug, username) DO UPDATE SET role = EXCLUDED.role",
				)
				.bind(slug.as_str())
				.bind(user.as_str())
				.bind(role.as_str())
				.execute(pool)
				.await
				.context("upsert role (postgres)")?;
			}
		}
		Ok(())
	}

	pub async fn create_room(&self, slug: &RoomSlug, name: &str, kind: RoomKind, now_ms: i64) -> anyhow::Result<()> {
		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO rooms (slug, name, kind, pair_key, created_at_ms) VALUES (?, ?, ?, NULL, ?) \
					ON CONFLICT(slug) DO NOTHING",
				)
				.bind(slug.as_str())
				.bind(name)
				.bind(kind.as_str())
				.bind(now_ms)
				.execute(pool)
				.await
				.context("insert room (sqlite)")?;
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO rooms (slug, name, kind, pair_key, created_at_ms) VALUES ($1, $2, $3, NULL, $4) \
					ON CONFLICT (slug) DO NOTHING",
				)
				.bind(slug.as_str())
				.bind(name)
				.bind(kind.as_str())
				.bind(now_ms)
				.execute(pool)
				.await
				.context("insert room (postgres)")?;
			}
		}
		Ok(())
	}

	pub async fn append_message(
		&self,
		slug: &RoomSlug,
		username: &str,
		content: &str,
		profile_pic: Option<&str>,
		now_ms: i64,
	) -> anyhow::Result<StoredMessage> {
		let id = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				let result = sqlx::query(
					"INSERT INTO messages (room_slug, username, content, profile_pic, created_at_ms) VALUES (?, ?, ?, ?, ?)",
				)
				.bind(slug.as_str())
				.bind(username)
				.bind(content)
				.bind(profile_pic)
				.bind(now_ms)
				.execute(pool)
				.await
				.context("insert message (sqlite)")?;
				result.last_insert_rowid()
			}
			StoreBackend::Postgres(pool) => {
				let (id,): (i64,) = sqlx::query_as(
					"INSERT INTO messages (room_slug, username, content, profile_pic, created_at_ms) \
					VALUES ($1, $2, $3, $4, $5) RETURNING id",
				)
				.bind(slug.as_str())
				.bind(username)
				.bind(content)
				.bind(profile_pic)
				.bind(now_ms)
				.fetch_one(pool)
				.await
				.context("insert message (postgres)")?;
				id
			}
		};

		Ok(StoredMessage {
			id,
			room: slug.clone(),
			username: username.to_string(),
			content: content.to_string(),
			profile_pic: profile_pic.map(str::to_string),
			created_at_ms: now_ms,
		})
	}

	/// One history page: up to `limit` messages with `id < before`, returned in
	/// ascending id order. The second value reports whether earlier messages
	/// remain. Fetches `limit + 1` rows to answer that without a count query.
	pub async fn page_messages(
		&self,
		slug: &RoomSlug,
		limit: u32,
		before: Option<i64>,
	) -> anyhow::Result<(Vec<StoredMessage>, bool)> {
		let before = before.unwrap_or(i64::MAX);
		let fetch = i64::from(limit) + 1;

		let mut rows: Vec<MessageRow> = match &self.backend {
			StoreBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, room_slug, username, content, profile_pic, created_at_ms FROM messages \
				WHERE room_slug = ? AND id < ? ORDER BY id DESC LIMIT ?",
			)
			.bind(slug.as_str())
			.bind(before)
			.bind(fetch)
			.fetch_all(pool)
			.await
			.context("select history page (sqlite)")?,
			StoreBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id, room_slug, username, content, profile_pic, created_at_ms FROM messages \
				WHERE room_slug = $1 AND id < $2 ORDER BY id DESC LIMIT $3",
			)
			.bind(slug.as_str())
			.bind(before)
			.bind(fetch)
			.fetch_all(pool)
			.await
			.context("select history page (postgres)")?,
		};

		let has_more = rows.len() > limit as usize;
		rows.truncate(limit as usize);
		rows.reverse();
		let messages = rows.into_iter().map(message_from_row).collect::<anyhow::Result<Vec<_>>>()?;
		Ok((messages, has_more))
	}

	pub async fn last_message(&self, slug: &RoomSlug) -> anyhow::Result<Option<StoredMessage>> {
		let row: Option<MessageRow> = match &self.backend {
			StoreBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, room_slug, username, content, profile_pic, created_at_ms FROM messages \
				WHERE room_slug = ? ORDER BY id DESC LIMIT 1",
			)
			.bind(slug.as_str())
			.fetch_optional(pool)
			.await
			.context("select last message (sqlite)")?,
			StoreBackend::Postgres(pool) => sqlx::query_as(
				"SELECT id, room_slug, username, content, profile_pic, created_at_ms FROM messages \
				WHERE room_slug = $1 ORDER BY id DESC LIMIT 1",
			)
			.bind(slug.as_str())
			.fetch_optional(pool)
			.await
			.context("select last message (postgres)")?,
		};
		row.map(message_from_row).transpose()
	}

	/// All direct dialogs the user participates in. Role rows only select
	/// candidates; membership is decided by the pair key.
	pub async fn direct_rooms_of(&self, user: &UserName) -> anyhow::Result<Vec<StoredRoom>> {
		let rows: Vec<RoomRow> = match &self.backend {
			StoreBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT r.slug, r.name, r.kind, r.pair_key FROM rooms r \
				JOIN room_roles ro ON ro.room_slug = r.slug \
				WHERE ro.username = ? AND r.kind = 'direct' ORDER BY r.slug",
			)
			.bind(user.as_str())
			.fetch_all(pool)
			.await
			.context("select direct rooms (sqlite)")?,
			StoreBackend::Postgres(pool) => sqlx::query_as(
				"SELECT r.slug, r.name, r.kind, r.pair_key FROM rooms r \
				JOIN room_roles ro ON ro.room_slug = r.slug \
				WHERE ro.username = $1 AND r.kind = 'direct' ORDER BY r.slug",
			)
			.bind(user.as_str())
			.fetch_all(pool)
			.await
			.context("select direct rooms (postgres)")?,
		};

		let mut rooms = Vec::with_capacity(rows.len());
		for row in rows {
			let room = room_from_row(row)?;
			if room.pair_key.as_ref().is_some_and(|pair| pair.contains(user)) {
				rooms.push(room);
			}
		}
		Ok(rooms)
	}

	/// Messages in `slug` past the user's read mark, excluding their own.
	pub async fn unread_count(&self, slug: &RoomSlug, user: &UserName) -> anyhow::Result<u64> {
		let (count,): (i64,) = match &self.backend {
			StoreBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT COUNT(*) FROM messages \
				WHERE room_slug = ? AND username != ? AND id > COALESCE(\
					(SELECT last_read_id FROM read_marks WHERE room_slug = ? AND username = ?), 0)",
			)
			.bind(slug.as_str())
			.bind(user.as_str())
			.bind(slug.as_str())
			.bind(user.as_str())
			.fetch_one(pool)
			.await
			.context("count unread (sqlite)")?,
			StoreBackend::Postgres(pool) => sqlx::query_as(
				"SELECT COUNT(*) FROM messages \
				WHERE room_slug = $1 AND username != $2 AND id > COALESCE(\
					(SELECT last_read_id FROM read_marks WHERE room_slug = $1 AND username = $2), 0)",
			)
			.bind(slug.as_str())
			.bind(user.as_str())
			.fetch_one(pool)
			.await
			.context("count unread (postgres)")?,
		};
		Ok(count.max(0) as u64)
	}

	pub async fn unread_counts(&self, user: &UserName) -> anyhow::Result<BTreeMap<RoomSlug, u64>> {
		let mut counts = BTreeMap::new();
		for room in self.direct_rooms_of(user).await? {
			let count = self.unread_count(&room.slug, user).await?;
			counts.insert(room.slug, count);
		}
		Ok(counts)
	}

	/// Durably advance the user's read mark to the newest message in the room.
	pub async fn mark_read(&self, slug: &RoomSlug, user: &UserName) -> anyhow::Result<()> {
		match &self.backend {
			StoreBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO read_marks (room_slug, username, last_read_id) \
					VALUES (?, ?, (SELECT COALESCE(MAX(id), 0) FROM messages WHERE room_slug = ?)) \
					ON CONFLICT(room_slug, username) DO UPDATE SET last_read_id = excluded.last_read_id",
				)
				.bind(slug.as_str())
				.bind(user.as_str())
				.bind(slug.as_str())
				.execute(pool)
				.await
				.context("upsert read mark (sqlite)")?;
			}
			StoreBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO read_marks (room_slug, username, last_read_id) \
					VALUES ($1, $2, (SELECT COALESCE(MAX(id), 0) FROM messages WHERE room_slug = $1)) \
					ON CONFLICT (room_slug, username) DO UPDATE SET last_read_id = EXCLUDED.last_read_id",
				)
				.bind(slug.as_str())
				.bind(user.as_str())
				.execute(pool)
				.await
				.context("upsert read mark (postgres)")?;
			}
		}
		Ok(())
	}

	/// Increment the fixed-window counter and return the new count. Windows
	/// older than the current one are trimmed opportunistically.
	pub async fn rate_increment(&self, subject: &str, action: &str, window_start: i64) -> anyhow::Result<i64> {
		let count = match &self.backend {
			StoreBackend::Sqlite(pool) => {
				let (count,): (i64,) = sqlx::query_as(
					"INSERT INTO rate_buckets (subject, action, window_start, count) VALUES (?, ?, ?, 1) \
					ON CONFLICT(subject, action, window_start) DO UPDATE SET count = count + 1 \
					RETURNING count",
				)
				.bind(subject)
				.bind(action)
				.bind(window_start)
				.fetch_one(pool)
				.await
				.context("increment rate bucket (sqlite)")?;

				sqlx::query("DELETE FROM rate_buckets WHERE subject = ? AND action = ? AND window_start < ?")
					.bind(subject)
					.bind(action)
					.bind(window_start)
					.execute(pool)
					.await
					.context("trim rate buckets (sqlite)")?;
				count
			}
			StoreBackend::Postgres(pool) => {
				let (count,): (i64,) = sqlx::query_as(
					"INSERT INTO rate_buckets (subject, action, window_start, count) VALUES ($1, $2, $3, 1) \
					ON CONFLICT (subject, action, window_start) DO UPDATE SET count = rate_buckets.count + 1 \
					RETURNING count",
				)
				.bind(subject)
				.bind(action)
				.bind(window_start)
				.fetch_one(pool)
				.await
				.context("increment rate bucket (postgres)")?;

				sqlx::query("DELETE FROM rate_buckets WHERE subject = $1 AND action = $2 AND window_start < $3")
					.bind(subject)
					.bind(action)
					.bind(window_start)
					.execute(pool)
					.await
					.context("trim rate buckets (postgres)")?;
				count
			}
		};
		Ok(count)
	}
}
