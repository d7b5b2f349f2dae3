//! SQLite store — sessions, messages, settings, and memory with FTS5.
//!
//! One database file, WAL journal mode. Memory search uses an FTS5 virtual
//! table when the SQLite build supports it and falls back to `LIKE`
//! matching otherwise.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info, warn};

use krait_core::error::StoreError;
use krait_core::message::{MessageContent, Role};

use crate::slim::SlimPolicy;
use crate::{MemoryRecord, MessageRecord, SessionRecord, Store};

/// Durable store backed by a single SQLite database.
pub struct SqliteStore {
    pool: SqlitePool,
    slim: SlimPolicy,
    fts5: bool,
}

impl SqliteStore {
    /// Open (creating if missing) a store at `path`.
    ///
    /// Pass `"sqlite::memory:"` for an ephemeral database in tests.
    pub async fn new(path: &str, slim: SlimPolicy) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("failed to open SQLite: {e}")))?;

        let mut store = Self {
            pool,
            slim,
            fts5: false,
        };
        store.migrate().await?;
        info!(path, "SQLite store initialized");
        Ok(store)
    }

    async fn migrate(&mut self) -> Result<(), StoreError> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                title       TEXT,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                archived    INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id  INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                role        TEXT NOT NULL,
                content     TEXT NOT NULL,
                created_at  TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id)",
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS memories (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                text        TEXT NOT NULL,
                created_at  TEXT NOT NULL
            )
            "#,
        ];
        for statement in ddl {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::MigrationFailed(e.to_string()))?;
        }

        // FTS5 is optional in SQLite builds; degrade to LIKE search.
        let fts = sqlx::query(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
                text,
                content='memories',
                content_rowid='id'
            )
            "#,
        )
        .execute(&self.pool)
        .await;
        match fts {
            Ok(_) => {
                self.fts5 = true;
                for trigger in [
                    r#"
                    CREATE TRIGGER IF NOT EXISTS memories_ai AFTER INSERT ON memories BEGIN
                        INSERT INTO memories_fts(rowid, text) VALUES (new.id, new.text);
                    END
                    "#,
                    r#"
                    CREATE TRIGGER IF NOT EXISTS memories_ad AFTER DELETE ON memories BEGIN
                        INSERT INTO memories_fts(memories_fts, rowid, text)
                        VALUES ('delete', old.id, old.text);
                    END
                    "#,
                ] {
                    sqlx::query(trigger)
                        .execute(&self.pool)
                        .await
                        .map_err(|e| StoreError::MigrationFailed(format!("fts trigger: {e}")))?;
                }
            }
            Err(e) => {
                warn!("FTS5 unavailable, memory search falls back to LIKE: {e}");
                self.fts5 = false;
            }
        }

        debug!("SQLite migrations complete");
        Ok(())
    }

    fn row_to_session(row: &SqliteRow) -> Result<SessionRecord, StoreError> {
        Ok(SessionRecord {
            id: get(row, "id")?,
            title: get(row, "title")?,
            created_at: parse_ts(&get::<String>(row, "created_at")?),
            updated_at: parse_ts(&get::<String>(row, "updated_at")?),
            archived: get::<i64>(row, "archived")? != 0,
        })
    }

    fn row_to_message(row: &SqliteRow) -> Result<MessageRecord, StoreError> {
        let role_str: String = get(row, "role")?;
        let role = Role::from_str(&role_str).map_err(StoreError::QueryFailed)?;
        let content_json: String = get(row, "content")?;
        let content: MessageContent = serde_json::from_str(&content_json)
            .map_err(|e| StoreError::QueryFailed(format!("content column: {e}")))?;
        Ok(MessageRecord {
            id: get(row, "id")?,
            session_id: get(row, "session_id")?,
            role,
            content,
            created_at: parse_ts(&get::<String>(row, "created_at")?),
        })
    }

    fn row_to_memory(row: &SqliteRow) -> Result<MemoryRecord, StoreError> {
        Ok(MemoryRecord {
            id: get(row, "id")?,
            text: get(row, "text")?,
            created_at: parse_ts(&get::<String>(row, "created_at")?),
        })
    }

    /// Build a safe FTS5 query: quote each token, prefix-match.
    fn sanitize_fts_query(text: &str) -> String {
        text.split_whitespace()
            .filter_map(|w| {
                let clean: String = w
                    .chars()
                    .filter(|c| c.is_alphanumeric() || *c == '_')
                    .collect();
                if clean.is_empty() {
                    None
                } else {
                    Some(format!("\"{clean}\"*"))
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn touch_session(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET updated_at = ?1 WHERE id = ?2")
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }
}

fn get<'r, T: sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>>(
    row: &'r SqliteRow,
    column: &str,
) -> Result<T, StoreError> {
    row.try_get(column)
        .map_err(|e| StoreError::QueryFailed(format!("{column} column: {e}")))
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_session(&self) -> Result<i64, StoreError> {
        let ts = now();
        let result = sqlx::query(
            "INSERT INTO sessions (title, created_at, updated_at) VALUES (NULL, ?1, ?2)",
        )
        .bind(&ts)
        .bind(&ts)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(result.last_insert_rowid())
    }

    async fn get_session(&self, id: i64) -> Result<Option<SessionRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(e.to_string()))?;
        row.as_ref().map(Self::row_to_session).transpose()
    }

    async fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY updated_at DESC LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(e.to_string()))?;
        rows.iter().map(Self::row_to_session).collect()
    }

    async fn archive_session(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET archived = 1, updated_at = ?1 WHERE id = ?2")
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn delete_sessions(&self, ids: &[i64]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = (1..=ids.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!("DELETE FROM sessions WHERE id IN ({placeholders})");
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn update_session_title(&self, id: i64, title: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET title = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(title)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn add_message(
        &self,
        session_id: i64,
        role: Role,
        content: &MessageContent,
    ) -> Result<i64, StoreError> {
        let slimmed = self.slim.slim(role, content);
        let content_json =
            serde_json::to_string(&slimmed).map_err(|e| StoreError::Storage(e.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO messages (session_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(session_id)
        .bind(role.as_str())
        .bind(&content_json)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        self.touch_session(session_id).await?;
        Ok(result.last_insert_rowid())
    }

    async fn messages(
        &self,
        session_id: i64,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let rows = match limit {
            // Latest N, returned oldest-first.
            Some(n) => {
                sqlx::query(
                    r#"
                    SELECT * FROM (
                        SELECT * FROM messages WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2
                    ) sub ORDER BY id ASC
                    "#,
                )
                .bind(session_id)
                .bind(n as i64)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM messages WHERE session_id = ?1 ORDER BY id ASC")
                    .bind(session_id)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| StoreError::QueryFailed(e.to_string()))?;
        rows.iter().map(Self::row_to_message).collect()
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(e.to_string()))?;
        row.map(|r| get(&r, "value")).transpose()
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn memory_add(&self, text: &str) -> Result<i64, StoreError> {
        let result = sqlx::query("INSERT INTO memories (text, created_at) VALUES (?1, ?2)")
            .bind(text)
            .bind(now())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(result.last_insert_rowid())
    }

    async fn memory_search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, StoreError> {
        if self.fts5 {
            let fts_query = Self::sanitize_fts_query(query);
            if !fts_query.is_empty() {
                let rows = sqlx::query(
                    r#"
                    SELECT m.id, m.text, m.created_at
                    FROM memories_fts f
                    JOIN memories m ON m.id = f.rowid
                    WHERE memories_fts MATCH ?1
                    ORDER BY rank
                    LIMIT ?2
                    "#,
                )
                .bind(&fts_query)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await;
                match rows {
                    Ok(rows) if !rows.is_empty() => {
                        return rows.iter().map(Self::row_to_memory).collect();
                    }
                    Ok(_) => {}
                    Err(e) => debug!("FTS5 search failed, falling back to LIKE: {e}"),
                }
            }
        }
        let rows = sqlx::query(
            "SELECT id, text, created_at FROM memories WHERE text LIKE ?1 ORDER BY id DESC LIMIT ?2",
        )
        .bind(format!("%{query}%"))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(e.to_string()))?;
        rows.iter().map(Self::row_to_memory).collect()
    }

    async fn memory_list(&self, limit: usize) -> Result<Vec<MemoryRecord>, StoreError> {
        let rows = sqlx::query("SELECT id, text, created_at FROM memories ORDER BY id DESC LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(e.to_string()))?;
        rows.iter().map(Self::row_to_memory).collect()
    }

    async fn memory_delete(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM memories WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    fn slim_policy(&self) -> &SlimPolicy {
        &self.slim
    }
}
