//! Session, message, and memory storage for Krait.
//!
//! The orchestrator only depends on the [`Store`] trait; `SqliteStore` is
//! the durable implementation and `MemoryStore` backs tests. Every message
//! write goes through the slimming transform first — large artifacts are
//! never persisted verbatim.

pub mod mem;
pub mod slim;
pub mod sqlite;

pub use mem::MemoryStore;
pub use slim::SlimPolicy;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use krait_core::error::StoreError;
use krait_core::message::{MessageContent, Role};

/// One conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived: bool,
}

/// One persisted message, content already slimmed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: i64,
    pub session_id: i64,
    pub role: Role,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
}

/// One long-term memory entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: i64,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// The storage collaborator: session CRUD, message append/list, settings,
/// and long-term memory with full-text search.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Sessions ---

    async fn create_session(&self) -> Result<i64, StoreError>;

    async fn get_session(&self, id: i64) -> Result<Option<SessionRecord>, StoreError>;

    /// Recent sessions, newest first, archived included.
    async fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>, StoreError>;

    async fn archive_session(&self, id: i64) -> Result<(), StoreError>;

    async fn delete_sessions(&self, ids: &[i64]) -> Result<u64, StoreError>;

    async fn update_session_title(&self, id: i64, title: &str) -> Result<(), StoreError>;

    // --- Messages ---

    /// Append a message; the content is slimmed before it is written.
    async fn add_message(
        &self,
        session_id: i64,
        role: Role,
        content: &MessageContent,
    ) -> Result<i64, StoreError>;

    /// Messages for a session, oldest first. `limit` selects the latest N
    /// (still returned in chronological order).
    async fn messages(
        &self,
        session_id: i64,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRecord>, StoreError>;

    // --- Settings ---

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;

    // --- Long-term memory ---

    async fn memory_add(&self, text: &str) -> Result<i64, StoreError>;

    async fn memory_search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, StoreError>;

    async fn memory_list(&self, limit: usize) -> Result<Vec<MemoryRecord>, StoreError>;

    async fn memory_delete(&self, id: i64) -> Result<bool, StoreError>;

    /// The slimming policy applied by `add_message`.
    fn slim_policy(&self) -> &SlimPolicy;
}
