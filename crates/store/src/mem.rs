//! In-memory store. Primarily for tests and ephemeral runs.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

use krait_core::error::StoreError;
use krait_core::message::{MessageContent, Role};

use crate::slim::SlimPolicy;
use crate::{MemoryRecord, MessageRecord, SessionRecord, Store};

#[derive(Default)]
struct Inner {
    sessions: Vec<SessionRecord>,
    messages: Vec<MessageRecord>,
    settings: HashMap<String, String>,
    memories: Vec<MemoryRecord>,
    next_session_id: i64,
    next_message_id: i64,
    next_memory_id: i64,
}

/// Store that keeps everything in process memory.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    slim: SlimPolicy,
}

impl MemoryStore {
    pub fn new(slim: SlimPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            slim,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Storage("store lock poisoned".into()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(SlimPolicy::default())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_session(&self) -> Result<i64, StoreError> {
        let mut inner = self.lock()?;
        inner.next_session_id += 1;
        let id = inner.next_session_id;
        let now = Utc::now();
        inner.sessions.push(SessionRecord {
            id,
            title: None,
            created_at: now,
            updated_at: now,
            archived: false,
        });
        Ok(id)
    }

    async fn get_session(&self, id: i64) -> Result<Option<SessionRecord>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.sessions.iter().find(|s| s.id == id).cloned())
    }

    async fn list_sessions(&self, limit: usize) -> Result<Vec<SessionRecord>, StoreError> {
        let inner = self.lock()?;
        let mut sessions = inner.sessions.clone();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn archive_session(&self, id: i64) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if let Some(session) = inner.sessions.iter_mut().find(|s| s.id == id) {
            session.archived = true;
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn delete_sessions(&self, ids: &[i64]) -> Result<u64, StoreError> {
        let mut inner = self.lock()?;
        let before = inner.sessions.len();
        inner.sessions.retain(|s| !ids.contains(&s.id));
        inner.messages.retain(|m| !ids.contains(&m.session_id));
        Ok((before - inner.sessions.len()) as u64)
    }

    async fn update_session_title(&self, id: i64, title: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if let Some(session) = inner.sessions.iter_mut().find(|s| s.id == id) {
            session.title = Some(title.to_string());
            session.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn add_message(
        &self,
        session_id: i64,
        role: Role,
        content: &MessageContent,
    ) -> Result<i64, StoreError> {
        let slimmed = self.slim.slim(role, content);
        let mut inner = self.lock()?;
        inner.next_message_id += 1;
        let id = inner.next_message_id;
        let now = Utc::now();
        inner.messages.push(MessageRecord {
            id,
            session_id,
            role,
            content: slimmed,
            created_at: now,
        });
        if let Some(session) = inner.sessions.iter_mut().find(|s| s.id == session_id) {
            session.updated_at = now;
        }
        Ok(id)
    }

    async fn messages(
        &self,
        session_id: i64,
        limit: Option<usize>,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let inner = self.lock()?;
        let mut messages: Vec<MessageRecord> = inner
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        if let Some(n) = limit {
            if messages.len() > n {
                messages = messages.split_off(messages.len() - n);
            }
        }
        Ok(messages)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.settings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn memory_add(&self, text: &str) -> Result<i64, StoreError> {
        let mut inner = self.lock()?;
        inner.next_memory_id += 1;
        let id = inner.next_memory_id;
        inner.memories.push(MemoryRecord {
            id,
            text: text.to_string(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn memory_search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, StoreError> {
        let inner = self.lock()?;
        let needle = query.to_lowercase();
        Ok(inner
            .memories
            .iter()
            .rev()
            .filter(|m| m.text.to_lowercase().contains(&needle))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn memory_list(&self, limit: usize) -> Result<Vec<MemoryRecord>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.memories.iter().rev().take(limit).cloned().collect())
    }

    async fn memory_delete(&self, id: i64) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let before = inner.memories.len();
        inner.memories.retain(|m| m.id != id);
        Ok(inner.memories.len() < before)
    }

    fn slim_policy(&self) -> &SlimPolicy {
        &self.slim
    }
}
