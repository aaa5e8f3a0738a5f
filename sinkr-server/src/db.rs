//! SQLite persistence layer.
//!
//! Holds the durable half of the system: apps (read for authorization),
//! peers, channels, subscriptions, stored channel messages, and the
//! coordinator's shard load table. Uses WAL mode for concurrent reads
//! during writes; uniqueness invariants are enforced by the schema.
//!
//! The whole handle lives behind a mutex (see [`crate::server::SharedState`]),
//! so a closure running against `&Db` observes a consistent snapshot.

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Result as SqlResult, params};
use serde_json::Value;

use crate::protocol::ChannelAuthMode;

/// Kind of a live peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    Source,
    Sink,
}

impl PeerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerKind::Source => "source",
            PeerKind::Sink => "sink",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "source" => PeerKind::Source,
            _ => PeerKind::Sink,
        }
    }
}

/// Tenant record. Created and mutated by the external tenant registry;
/// the core only reads it.
#[derive(Debug, Clone)]
pub struct AppRow {
    pub id: String,
    pub name: String,
    pub secret_key: String,
    pub enabled: bool,
}

/// One live client connection. A row exists iff the socket is live on
/// some shard; boot-time reaping removes leftovers from a crash.
#[derive(Debug, Clone)]
pub struct PeerRow {
    pub id: String,
    pub app_id: String,
    pub kind: PeerKind,
    pub user_id: Option<String>,
    pub user_info: Option<Value>,
}

impl PeerRow {
    /// The identity other channel members see: the authenticated user id
    /// when set, else the peer id.
    pub fn member_id(&self) -> &str {
        self.user_id.as_deref().unwrap_or(&self.id)
    }
}

/// Named pub/sub target scoped to one app.
#[derive(Debug, Clone)]
pub struct ChannelRow {
    pub id: String,
    pub app_id: String,
    pub name: String,
    pub auth: ChannelAuthMode,
    pub store: bool,
}

/// Persisted channel payload, replayable by id.
#[derive(Debug, Clone)]
pub struct StoredMessageRow {
    pub id: String,
    pub channel_id: String,
    pub created_at: DateTime<Utc>,
    pub data: Value,
}

/// Outcome of a subscription insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionInsert {
    Inserted,
    /// The `(app, peer, channel)` row already existed; treated as success
    /// without re-emitting join events.
    Duplicate,
}

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing and `--db`-less runs).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS apps (
                id         TEXT PRIMARY KEY,
                name       TEXT NOT NULL DEFAULT '',
                secret_key TEXT NOT NULL UNIQUE,
                enabled    INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS peers (
                id        TEXT PRIMARY KEY,
                app_id    TEXT NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
                kind      TEXT NOT NULL,
                user_id   TEXT,
                user_info TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_peers_app ON peers(app_id);
            CREATE INDEX IF NOT EXISTS idx_peers_user ON peers(app_id, user_id);

            CREATE TABLE IF NOT EXISTS channels (
                id     TEXT PRIMARY KEY,
                app_id TEXT NOT NULL REFERENCES apps(id) ON DELETE CASCADE,
                name   TEXT NOT NULL,
                auth   TEXT NOT NULL,
                store  INTEGER NOT NULL DEFAULT 0,
                UNIQUE(app_id, name)
            );

            CREATE TABLE IF NOT EXISTS subscriptions (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                app_id     TEXT NOT NULL,
                peer_id    TEXT NOT NULL REFERENCES peers(id) ON DELETE CASCADE,
                channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                UNIQUE(app_id, peer_id, channel_id)
            );

            CREATE INDEX IF NOT EXISTS idx_subs_channel ON subscriptions(channel_id);

            CREATE TABLE IF NOT EXISTS stored_messages (
                id         TEXT PRIMARY KEY,
                app_id     TEXT NOT NULL,
                channel_id TEXT NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL,
                data       TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_stored_channel
                ON stored_messages(channel_id, created_at);

            CREATE TABLE IF NOT EXISTS shards (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                connection_count INTEGER NOT NULL DEFAULT 0
            );
            ",
        )?;
        Ok(())
    }

    // ── Apps ───────────────────────────────────────────────────────────

    /// Insert or update an app row. In production the tenant registry
    /// writes these; the server itself only seeds them from config.
    pub fn upsert_app(&self, id: &str, name: &str, secret_key: &str, enabled: bool) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO apps (id, name, secret_key, enabled) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                name=excluded.name,
                secret_key=excluded.secret_key,
                enabled=excluded.enabled",
            params![id, name, secret_key, enabled as i32],
        )?;
        Ok(())
    }

    pub fn get_app(&self, id: &str) -> SqlResult<Option<AppRow>> {
        self.conn
            .query_row(
                "SELECT id, name, secret_key, enabled FROM apps WHERE id = ?1",
                params![id],
                |row| {
                    Ok(AppRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        secret_key: row.get(2)?,
                        enabled: row.get::<_, i32>(3)? != 0,
                    })
                },
            )
            .optional()
    }

    // ── Peers ──────────────────────────────────────────────────────────

    pub fn insert_peer(&self, id: &str, app_id: &str, kind: PeerKind) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO peers (id, app_id, kind) VALUES (?1, ?2, ?3)",
            params![id, app_id, kind.as_str()],
        )?;
        Ok(())
    }

    /// Delete a peer row, cascading its subscriptions. Returns whether a
    /// row was deleted (false makes the close path idempotent).
    pub fn delete_peer(&self, id: &str) -> SqlResult<bool> {
        let n = self.conn.execute("DELETE FROM peers WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    pub fn get_peer(&self, app_id: &str, peer_id: &str) -> SqlResult<Option<PeerRow>> {
        self.conn
            .query_row(
                "SELECT id, app_id, kind, user_id, user_info FROM peers
                 WHERE app_id = ?1 AND id = ?2",
                params![app_id, peer_id],
                map_peer_row,
            )
            .optional()
    }

    /// Set the authenticated user id and user info on a peer. Returns
    /// whether the peer existed.
    pub fn authenticate_peer(
        &self,
        app_id: &str,
        peer_id: &str,
        user_id: &str,
        user_info: Option<&Value>,
    ) -> SqlResult<bool> {
        let info = user_info.map(|v| v.to_string());
        let n = self.conn.execute(
            "UPDATE peers SET user_id = ?3, user_info = ?4 WHERE app_id = ?1 AND id = ?2",
            params![app_id, peer_id, user_id, info],
        )?;
        Ok(n > 0)
    }

    /// Resolve a subscriber/recipient id: exact peer id match wins, then
    /// any peer whose authenticated user id matches.
    pub fn resolve_peers(&self, app_id: &str, target: &str) -> SqlResult<Vec<PeerRow>> {
        if let Some(peer) = self.get_peer(app_id, target)? {
            return Ok(vec![peer]);
        }
        let mut stmt = self.conn.prepare(
            "SELECT id, app_id, kind, user_id, user_info FROM peers
             WHERE app_id = ?1 AND user_id = ?2",
        )?;
        let rows = stmt.query_map(params![app_id, target], map_peer_row)?;
        rows.collect()
    }

    /// Boot-time reap: a crashed process cannot leave ghost peers behind.
    /// Cascades to subscriptions.
    pub fn clear_peers(&self) -> SqlResult<usize> {
        self.conn.execute("DELETE FROM peers", [])
    }

    // ── Channels ───────────────────────────────────────────────────────

    /// Upsert by `(app_id, name)`: an existing channel gets its auth mode
    /// and store flag updated and keeps its id.
    pub fn upsert_channel(
        &self,
        app_id: &str,
        name: &str,
        auth: ChannelAuthMode,
        store: bool,
    ) -> SqlResult<ChannelRow> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM channels WHERE app_id = ?1 AND name = ?2",
                params![app_id, name],
                |row| row.get(0),
            )
            .optional()?;
        let id = match existing {
            Some(id) => {
                self.conn.execute(
                    "UPDATE channels SET auth = ?2, store = ?3 WHERE id = ?1",
                    params![id, auth.as_str(), store as i32],
                )?;
                id
            }
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                self.conn.execute(
                    "INSERT INTO channels (id, app_id, name, auth, store) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, app_id, name, auth.as_str(), store as i32],
                )?;
                id
            }
        };
        Ok(ChannelRow { id, app_id: app_id.to_string(), name: name.to_string(), auth, store })
    }

    pub fn get_channel(&self, app_id: &str, channel_id: &str) -> SqlResult<Option<ChannelRow>> {
        self.conn
            .query_row(
                "SELECT id, app_id, name, auth, store FROM channels
                 WHERE app_id = ?1 AND id = ?2",
                params![app_id, channel_id],
                map_channel_row,
            )
            .optional()
    }

    /// Cascade-deletes subscriptions and stored messages. Returns whether
    /// the channel existed.
    pub fn delete_channel(&self, app_id: &str, channel_id: &str) -> SqlResult<bool> {
        let n = self.conn.execute(
            "DELETE FROM channels WHERE app_id = ?1 AND id = ?2",
            params![app_id, channel_id],
        )?;
        Ok(n > 0)
    }

    /// Channels of an app with their current subscriber counts, for the
    /// read-only API.
    pub fn list_channels(&self, app_id: &str) -> SqlResult<Vec<(ChannelRow, usize)>> {
        let mut stmt = self.conn.prepare(
            "SELECT c.id, c.app_id, c.name, c.auth, c.store,
                    (SELECT COUNT(*) FROM subscriptions s WHERE s.channel_id = c.id)
             FROM channels c WHERE c.app_id = ?1 ORDER BY c.name ASC",
        )?;
        let rows = stmt.query_map(params![app_id], |row| {
            let channel = map_channel_row(row)?;
            let subscribers: i64 = row.get(5)?;
            Ok((channel, subscribers as usize))
        })?;
        rows.collect()
    }

    // ── Subscriptions ──────────────────────────────────────────────────

    pub fn insert_subscription(
        &self,
        app_id: &str,
        peer_id: &str,
        channel_id: &str,
    ) -> SqlResult<SubscriptionInsert> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO subscriptions (app_id, peer_id, channel_id)
             VALUES (?1, ?2, ?3)",
            params![app_id, peer_id, channel_id],
        )?;
        Ok(if n > 0 { SubscriptionInsert::Inserted } else { SubscriptionInsert::Duplicate })
    }

    /// Returns whether a row was deleted.
    pub fn delete_subscription(&self, app_id: &str, peer_id: &str, channel_id: &str) -> SqlResult<bool> {
        let n = self.conn.execute(
            "DELETE FROM subscriptions WHERE app_id = ?1 AND peer_id = ?2 AND channel_id = ?3",
            params![app_id, peer_id, channel_id],
        )?;
        Ok(n > 0)
    }

    pub fn is_subscribed(&self, peer_id: &str, channel_id: &str) -> SqlResult<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM subscriptions WHERE peer_id = ?1 AND channel_id = ?2",
            params![peer_id, channel_id],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Current members of a channel, optionally excluding one peer.
    pub fn channel_members(&self, channel_id: &str, exclude_peer: Option<&str>) -> SqlResult<Vec<PeerRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.id, p.app_id, p.kind, p.user_id, p.user_info
             FROM subscriptions s JOIN peers p ON p.id = s.peer_id
             WHERE s.channel_id = ?1 AND (?2 IS NULL OR p.id != ?2)",
        )?;
        let rows = stmt.query_map(params![channel_id, exclude_peer], map_peer_row)?;
        rows.collect()
    }

    /// Peer ids subscribed to a channel. The send path snapshots this set
    /// once and pushes without re-reading.
    pub fn subscriber_ids(&self, channel_id: &str) -> SqlResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT peer_id FROM subscriptions WHERE channel_id = ?1")?;
        let rows = stmt.query_map(params![channel_id], |row| row.get(0))?;
        rows.collect()
    }

    /// Channel ids a peer is subscribed to (for disconnect reaping).
    pub fn peer_channel_ids(&self, peer_id: &str) -> SqlResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT channel_id FROM subscriptions WHERE peer_id = ?1")?;
        let rows = stmt.query_map(params![peer_id], |row| row.get(0))?;
        rows.collect()
    }

    // ── Stored messages ────────────────────────────────────────────────

    /// Persist a channel message under its source-assigned id. A repeat
    /// of the same id keeps the first row (replay dedup is id-based).
    pub fn insert_stored_message(
        &self,
        id: &str,
        app_id: &str,
        channel_id: &str,
        created_at: DateTime<Utc>,
        data: &Value,
    ) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO stored_messages (id, app_id, channel_id, created_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO NOTHING",
            params![
                id,
                app_id,
                channel_id,
                created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
                data.to_string()
            ],
        )?;
        Ok(())
    }

    /// `(id, createdAt)` refs for every stored message of a channel,
    /// ascending — the listing a joining sink receives.
    pub fn stored_message_refs(&self, channel_id: &str) -> SqlResult<Vec<(String, DateTime<Utc>)>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, created_at FROM stored_messages
             WHERE channel_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![channel_id], |row| {
            Ok((row.get::<_, String>(0)?, parse_created_at(&row.get::<_, String>(1)?)))
        })?;
        rows.collect()
    }

    /// Fetch stored messages by id set, ascending by `createdAt`. An
    /// empty set fetches the whole channel.
    pub fn stored_messages_by_ids(
        &self,
        channel_id: &str,
        ids: &[String],
    ) -> SqlResult<Vec<StoredMessageRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, channel_id, created_at, data FROM stored_messages
             WHERE channel_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![channel_id], map_stored_row)?;
        let mut out = Vec::new();
        for row in rows {
            let row = row?;
            if ids.is_empty() || ids.iter().any(|id| *id == row.id) {
                out.push(row);
            }
        }
        Ok(out)
    }

    /// Delete stored messages. `None` or an empty set deletes everything
    /// in the channel; otherwise exactly the named ids.
    pub fn delete_stored_messages(
        &self,
        channel_id: &str,
        ids: Option<&[String]>,
    ) -> SqlResult<usize> {
        match ids {
            Some(ids) if !ids.is_empty() => {
                let mut deleted = 0;
                for id in ids {
                    deleted += self.conn.execute(
                        "DELETE FROM stored_messages WHERE channel_id = ?1 AND id = ?2",
                        params![channel_id, id],
                    )?;
                }
                Ok(deleted)
            }
            _ => self
                .conn
                .execute("DELETE FROM stored_messages WHERE channel_id = ?1", params![channel_id]),
        }
    }

    // ── Shard load table ───────────────────────────────────────────────

    /// Allocate a new shard id with a zero connection count.
    pub fn allocate_shard(&self) -> SqlResult<i64> {
        self.conn
            .execute("INSERT INTO shards (connection_count) VALUES (0)", [])?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn update_shard_load(&self, shard_id: i64, count: usize) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE shards SET connection_count = ?2 WHERE id = ?1",
            params![shard_id, count as i64],
        )?;
        Ok(())
    }

    /// Boot-time reset: connection counts from a previous process are
    /// meaningless once every socket is gone.
    pub fn reset_shard_loads(&self) -> SqlResult<()> {
        self.conn.execute("UPDATE shards SET connection_count = 0", [])?;
        Ok(())
    }

    pub fn shard_loads(&self) -> SqlResult<Vec<(i64, usize)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, connection_count FROM shards ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? as usize))
        })?;
        rows.collect()
    }
}

fn parse_created_at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

fn map_peer_row(row: &rusqlite::Row) -> SqlResult<PeerRow> {
    let info: Option<String> = row.get(4)?;
    Ok(PeerRow {
        id: row.get(0)?,
        app_id: row.get(1)?,
        kind: PeerKind::parse(&row.get::<_, String>(2)?),
        user_id: row.get(3)?,
        user_info: info.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

fn map_channel_row(row: &rusqlite::Row) -> SqlResult<ChannelRow> {
    let auth: String = row.get(3)?;
    Ok(ChannelRow {
        id: row.get(0)?,
        app_id: row.get(1)?,
        name: row.get(2)?,
        auth: ChannelAuthMode::parse(&auth).unwrap_or(ChannelAuthMode::Public),
        store: row.get::<_, i32>(4)? != 0,
    })
}

fn map_stored_row(row: &rusqlite::Row) -> SqlResult<StoredMessageRow> {
    let data: String = row.get(3)?;
    Ok(StoredMessageRow {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        created_at: parse_created_at(&row.get::<_, String>(2)?),
        data: serde_json::from_str(&data).unwrap_or(Value::Null),
    })
}
