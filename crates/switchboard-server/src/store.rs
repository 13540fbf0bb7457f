use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use switchboard_hub::{MessageStore, SocialGraph};
use switchboard_protocol::{GroupId, GroupMessageRecord, PrivateMessageRecord, UserId, now_ms};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    username      TEXT NOT NULL UNIQUE,
    is_public     INTEGER NOT NULL DEFAULT 0,
    created_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS sessions (
    token         TEXT PRIMARY KEY NOT NULL,
    user_id       INTEGER NOT NULL REFERENCES users(id),
    expires_at_ms INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS follows (
    follower_id INTEGER NOT NULL REFERENCES users(id),
    followee_id INTEGER NOT NULL REFERENCES users(id),
    status      TEXT NOT NULL CHECK (status IN ('pending', 'accepted')),
    PRIMARY KEY (follower_id, followee_id)
);
CREATE TABLE IF NOT EXISTS group_members (
    group_id INTEGER NOT NULL,
    user_id  INTEGER NOT NULL REFERENCES users(id),
    PRIMARY KEY (group_id, user_id)
);
CREATE TABLE IF NOT EXISTS messages (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id     INTEGER NOT NULL REFERENCES users(id),
    recipient_id  INTEGER NOT NULL REFERENCES users(id),
    content       TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    read_at_ms    INTEGER
);
CREATE INDEX IF NOT EXISTS idx_messages_unread ON messages(recipient_id, read_at_ms);
CREATE TABLE IF NOT EXISTS group_messages (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id      INTEGER NOT NULL,
    sender_id     INTEGER NOT NULL REFERENCES users(id),
    content       TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL
);
";

/// SQLite-backed social graph, message store and session table.
///
/// Every query runs on a blocking thread behind one `std::sync::Mutex` so
/// synchronous SQLite I/O never stalls the runtime.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`. `:memory:` opens a private
    /// in-memory database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory().context("failed to open in-memory database")?
        } else {
            if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            Connection::open(path).with_context(|| format!("failed to open database {path}"))?
        };

        // WAL mode for better concurrent read performance
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        conn.execute_batch(SCHEMA)
            .context("failed to create schema")?;

        let users: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap_or(0);
        tracing::info!(path, users, "opened database");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| anyhow!("database lock poisoned: {e}"))?;
            f(&conn).map_err(anyhow::Error::from)
        })
        .await
        .context("database task failed")?
    }

    /// Resolve a session token to its user and expiry.
    pub async fn session_principal(&self, token: &str) -> Result<Option<(UserId, u64)>> {
        let token = token.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT user_id, expires_at_ms FROM sessions WHERE token = ?1",
                [&token],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? as u64)),
            )
            .optional()
        })
        .await
    }

    pub async fn create_user(&self, username: &str, is_public: bool) -> Result<UserId> {
        let username = username.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO users (username, is_public, created_at_ms) VALUES (?1, ?2, ?3)",
                params![username, is_public, now_ms() as i64],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Issue a session token valid for `ttl`.
    pub async fn create_session(&self, user_id: UserId, ttl: Duration) -> Result<String> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        let expires_at_ms = now_ms().saturating_add(ttl.as_millis() as u64) as i64;
        let stored = token.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sessions (token, user_id, expires_at_ms) VALUES (?1, ?2, ?3)",
                params![stored, user_id, expires_at_ms],
            )
        })
        .await?;
        Ok(token)
    }

    /// Record a follow; `accepted = false` leaves it pending.
    pub async fn follow(&self, follower: UserId, followee: UserId, accepted: bool) -> Result<()> {
        let status = if accepted { "accepted" } else { "pending" };
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO follows (follower_id, followee_id, status) VALUES (?1, ?2, ?3)
                 ON CONFLICT (follower_id, followee_id) DO UPDATE SET status = excluded.status",
                params![follower, followee, status],
            )
        })
        .await?;
        Ok(())
    }

    pub async fn join_group(&self, group_id: GroupId, user_id: UserId) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO group_members (group_id, user_id) VALUES (?1, ?2)",
                params![group_id, user_id],
            )
        })
        .await?;
        Ok(())
    }
}

fn private_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrivateMessageRecord> {
    Ok(PrivateMessageRecord {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        recipient_id: row.get(2)?,
        content: row.get(3)?,
        created_at_ms: row.get::<_, i64>(4)? as u64,
        read_at_ms: row.get::<_, Option<i64>>(5)?.map(|ms| ms as u64),
    })
}

#[async_trait]
impl SocialGraph for SqliteStore {
    async fn can_send_private(&self, sender: UserId, recipient: UserId) -> Result<bool> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?2 AND is_public = 1)
                     OR EXISTS(SELECT 1 FROM follows WHERE status = 'accepted'
                         AND ((follower_id = ?1 AND followee_id = ?2)
                           OR (follower_id = ?2 AND followee_id = ?1)))",
                params![sender, recipient],
                |row| row.get(0),
            )
        })
        .await
    }

    async fn is_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM group_members WHERE group_id = ?1 AND user_id = ?2)",
                params![group_id, user_id],
                |row| row.get(0),
            )
        })
        .await
    }

    async fn list_groups_for_user(&self, user_id: UserId) -> Result<Vec<GroupId>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT group_id FROM group_members WHERE user_id = ?1 ORDER BY group_id",
            )?;
            let rows = stmt.query_map([user_id], |row| row.get(0))?;
            rows.collect()
        })
        .await
    }

    async fn contacts_of(&self, user_id: UserId) -> Result<Vec<UserId>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT followee_id FROM follows WHERE follower_id = ?1 AND status = 'accepted'
                 UNION
                 SELECT follower_id FROM follows WHERE followee_id = ?1 AND status = 'accepted'
                 ORDER BY 1",
            )?;
            let rows = stmt.query_map([user_id], |row| row.get(0))?;
            rows.collect()
        })
        .await
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn persist_private_message(
        &self,
        sender: UserId,
        recipient: UserId,
        content: &str,
    ) -> Result<PrivateMessageRecord> {
        let content = content.to_string();
        self.with_conn(move |conn| {
            let created_at_ms = now_ms();
            conn.execute(
                "INSERT INTO messages (sender_id, recipient_id, content, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![sender, recipient, content, created_at_ms as i64],
            )?;
            Ok(PrivateMessageRecord {
                id: conn.last_insert_rowid(),
                sender_id: sender,
                recipient_id: recipient,
                content,
                created_at_ms,
                read_at_ms: None,
            })
        })
        .await
    }

    async fn persist_group_message(
        &self,
        group_id: GroupId,
        sender: UserId,
        content: &str,
    ) -> Result<GroupMessageRecord> {
        let content = content.to_string();
        self.with_conn(move |conn| {
            let created_at_ms = now_ms();
            conn.execute(
                "INSERT INTO group_messages (group_id, sender_id, content, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![group_id, sender, content, created_at_ms as i64],
            )?;
            Ok(GroupMessageRecord {
                id: conn.last_insert_rowid(),
                group_id,
                sender_id: sender,
                content,
                created_at_ms,
            })
        })
        .await
    }

    async fn mark_read(&self, recipient: UserId, sender: UserId) -> Result<usize> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE messages SET read_at_ms = ?3
                 WHERE recipient_id = ?1 AND sender_id = ?2 AND read_at_ms IS NULL",
                params![recipient, sender, now_ms() as i64],
            )
        })
        .await
    }

    async fn unread_backlog_for(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> Result<Vec<PrivateMessageRecord>> {
        let mut records = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, sender_id, recipient_id, content, created_at_ms, read_at_ms
                     FROM messages
                     WHERE recipient_id = ?1 AND read_at_ms IS NULL
                     ORDER BY id DESC
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![user_id, limit as i64], private_record)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        // Newest N were selected; replay them oldest first.
        records.reverse();
        Ok(records)
    }
}
