//! 内存存储
//!
//! 进程退出即丢失，适合测试和一次性任务。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::SessionStore;
use crate::translation::error::{TranslationError, TranslationResult};
use crate::translation::storage::model::{
    cleanup_cutoff, CacheEntry, CacheKey, Session, StoreStatistics,
};

#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> TranslationResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TranslationError::StorageError("内存存储已关闭".to_string()));
        }
        Ok(())
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_session(&self, session: &Session) -> TranslationResult<()> {
        self.ensure_open()?;
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.session_id) {
            return Err(TranslationError::StorageError(format!(
                "会话已存在: {}",
                session.session_id
            )));
        }
        sessions.insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> TranslationResult<Option<Session>> {
        self.ensure_open()?;
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn update_session(&self, session: &Session) -> TranslationResult<()> {
        self.ensure_open()?;
        let mut sessions = self.sessions.write().await;
        let stored = sessions.get_mut(&session.session_id).ok_or_else(|| {
            TranslationError::StorageError(format!("会话不存在: {}", session.session_id))
        })?;

        let mut updated = session.clone();
        updated.merge_monotonic(stored);
        updated.updated_at = Utc::now();
        *stored = updated;
        Ok(())
    }

    async fn list_sessions(&self, limit: usize, offset: usize) -> TranslationResult<Vec<Session>> {
        self.ensure_open()?;
        let sessions = self.sessions.read().await;
        let mut all: Vec<Session> = sessions.values().cloned().collect();
        all.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    async fn delete_session(&self, session_id: &str) -> TranslationResult<bool> {
        self.ensure_open()?;
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }

    async fn cache_translation(&self, entry: &CacheEntry) -> TranslationResult<()> {
        self.ensure_open()?;
        self.cache
            .write()
            .await
            .insert(entry.key.digest(), entry.clone());
        Ok(())
    }

    async fn get_cached_translation(&self, key: &CacheKey) -> TranslationResult<Option<CacheEntry>> {
        self.ensure_open()?;
        let mut cache = self.cache.write().await;
        match cache.get_mut(&key.digest()) {
            Some(entry) => {
                entry.touch();
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.clone()))
            }
            None => {
                self.cache_misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn cleanup_old_cache(&self, older_than: Duration) -> TranslationResult<u64> {
        self.ensure_open()?;
        let cutoff = cleanup_cutoff(older_than);
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.last_accessed_at >= cutoff);
        Ok((before - cache.len()) as u64)
    }

    async fn get_statistics(&self) -> TranslationResult<StoreStatistics> {
        self.ensure_open()?;
        let sessions = self.sessions.read().await;
        Ok(StoreStatistics::from_sessions(
            sessions.values(),
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        ))
    }

    async fn ping(&self) -> TranslationResult<()> {
        self.ensure_open()
    }

    async fn close(&self) -> TranslationResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translation::storage::model::{SessionMeta, SessionStatus};

    fn session(title: &str) -> Session {
        Session::new(&SessionMeta {
            book_title: title.to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_session_crud() {
        let store = MemoryStore::new();
        let s = session("Book");
        store.create_session(&s).await.unwrap();
        assert!(store.create_session(&s).await.is_err());

        let mut update = s.clone();
        update.status = SessionStatus::Translating;
        update.items_completed = 2;
        store.update_session(&update).await.unwrap();

        let loaded = store.get_session(&s.session_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Translating);
        assert_eq!(loaded.items_completed, 2);

        assert!(store.delete_session(&s.session_id).await.unwrap());
        assert!(store.get_session(&s.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_keeps_counters_monotonic() {
        let store = MemoryStore::new();
        let mut s = session("Book");
        s.items_completed = 4;
        store.create_session(&s).await.unwrap();

        let mut stale = s.clone();
        stale.items_completed = 1;
        store.update_session(&stale).await.unwrap();
        let loaded = store.get_session(&s.session_id).await.unwrap().unwrap();
        assert_eq!(loaded.items_completed, 4);
    }

    #[tokio::test]
    async fn test_cache_upsert_and_access_count() {
        let store = MemoryStore::new();
        let key = CacheKey::new("Hello", "en", "es", "dictionary", "default");
        store.cache_translation(&CacheEntry::new(key.clone(), "Hola")).await.unwrap();
        store.cache_translation(&CacheEntry::new(key.clone(), "¡Hola!")).await.unwrap();

        let first = store.get_cached_translation(&key).await.unwrap().unwrap();
        let second = store.get_cached_translation(&key).await.unwrap().unwrap();
        assert_eq!(first.target_text, "¡Hola!");
        assert_eq!(second.access_count, 2);
        assert_eq!(store.cache_len().await, 1);
    }

    #[tokio::test]
    async fn test_cleanup_and_close() {
        let store = MemoryStore::new();
        let key = CacheKey::new("a", "en", "es", "p", "m");
        let mut entry = CacheEntry::new(key, "b");
        entry.last_accessed_at = Utc::now() - chrono::Duration::hours(2);
        store.cache_translation(&entry).await.unwrap();

        assert_eq!(store.cleanup_old_cache(Duration::from_secs(3600)).await.unwrap(), 1);
        store.close().await.unwrap();
        assert!(store.ping().await.is_err());
    }
}
