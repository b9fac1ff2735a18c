//! 嵌入式文件存储（redb）
//!
//! 两张表：`sessions`（会话 id → JSON）与 `translation_cache`（五元组摘要 → JSON）。
//! redb 是同步 API，所有操作都放到阻塞线程池执行。

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};

use super::SessionStore;
use crate::translation::error::{TranslationError, TranslationResult};
use crate::translation::storage::model::{
    cleanup_cutoff, CacheEntry, CacheKey, Session, StoreStatistics,
};

const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");
const TRANSLATION_CACHE: TableDefinition<&str, &[u8]> = TableDefinition::new("translation_cache");

pub struct FileStore {
    db: Arc<Database>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl FileStore {
    /// 打开或创建数据库文件，并确保两张表存在
    pub fn open(path: &str) -> TranslationResult<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        {
            txn.open_table(SESSIONS)?;
            txn.open_table(TRANSLATION_CACHE)?;
        }
        txn.commit()?;

        tracing::debug!("redb 会话存储已打开: {}", path);
        Ok(Self {
            db: Arc::new(db),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> TranslationResult<T>
    where
        F: FnOnce(&Database) -> TranslationResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| TranslationError::StorageError(format!("存储任务异常终止: {}", e)))?
    }
}

fn decode_session(bytes: &[u8]) -> TranslationResult<Session> {
    serde_json::from_slice(bytes)
        .map_err(|e| TranslationError::StorageError(format!("会话记录损坏: {}", e)))
}

fn decode_entry(bytes: &[u8]) -> TranslationResult<CacheEntry> {
    serde_json::from_slice(bytes)
        .map_err(|e| TranslationError::StorageError(format!("缓存记录损坏: {}", e)))
}

fn all_sessions(db: &Database) -> TranslationResult<Vec<Session>> {
    let txn = db.begin_read()?;
    let table = txn.open_table(SESSIONS)?;
    let mut sessions = Vec::new();
    for row in table.iter()? {
        let (_, value) = row?;
        sessions.push(decode_session(value.value())?);
    }
    Ok(sessions)
}

#[async_trait]
impl SessionStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn create_session(&self, session: &Session) -> TranslationResult<()> {
        let session = session.clone();
        self.blocking(move |db| {
            let bytes = serde_json::to_vec(&session)?;
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(SESSIONS)?;
                if table.get(session.session_id.as_str())?.is_some() {
                    return Err(TranslationError::StorageError(format!(
                        "会话已存在: {}",
                        session.session_id
                    )));
                }
                table.insert(session.session_id.as_str(), bytes.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_session(&self, session_id: &str) -> TranslationResult<Option<Session>> {
        let session_id = session_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(SESSIONS)?;
            let bytes = table.get(session_id.as_str())?.map(|guard| guard.value().to_vec());
            bytes.as_deref().map(decode_session).transpose()
        })
        .await
    }

    async fn update_session(&self, session: &Session) -> TranslationResult<()> {
        let session = session.clone();
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(SESSIONS)?;
                let stored = table
                    .get(session.session_id.as_str())?
                    .map(|guard| guard.value().to_vec())
                    .ok_or_else(|| {
                        TranslationError::StorageError(format!("会话不存在: {}", session.session_id))
                    })?;
                let stored = decode_session(&stored)?;

                let mut updated = session;
                updated.merge_monotonic(&stored);
                updated.updated_at = Utc::now();
                let bytes = serde_json::to_vec(&updated)?;
                table.insert(updated.session_id.as_str(), bytes.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn list_sessions(&self, limit: usize, offset: usize) -> TranslationResult<Vec<Session>> {
        self.blocking(move |db| {
            let mut sessions = all_sessions(db)?;
            sessions.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| a.session_id.cmp(&b.session_id))
            });
            Ok(sessions.into_iter().skip(offset).take(limit).collect())
        })
        .await
    }

    async fn delete_session(&self, session_id: &str) -> TranslationResult<bool> {
        let session_id = session_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            let removed = {
                let mut table = txn.open_table(SESSIONS)?;
                let removed = table.remove(session_id.as_str())?.is_some();
                removed
            };
            txn.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn cache_translation(&self, entry: &CacheEntry) -> TranslationResult<()> {
        let entry = entry.clone();
        self.blocking(move |db| {
            let digest = entry.key.digest();
            let bytes = serde_json::to_vec(&entry)?;
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(TRANSLATION_CACHE)?;
                table.insert(digest.as_str(), bytes.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_cached_translation(&self, key: &CacheKey) -> TranslationResult<Option<CacheEntry>> {
        let digest = key.digest();
        let found = self
            .blocking(move |db| {
                let txn = db.begin_write()?;
                let entry = {
                    let mut table = txn.open_table(TRANSLATION_CACHE)?;
                    let bytes = table.get(digest.as_str())?.map(|guard| guard.value().to_vec());
                    match bytes {
                        Some(bytes) => {
                            let mut entry = decode_entry(&bytes)?;
                            entry.touch();
                            let updated = serde_json::to_vec(&entry)?;
                            table.insert(digest.as_str(), updated.as_slice())?;
                            Some(entry)
                        }
                        None => None,
                    }
                };
                txn.commit()?;
                Ok(entry)
            })
            .await?;

        let counter = if found.is_some() {
            &self.cache_hits
        } else {
            &self.cache_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(found)
    }

    async fn cleanup_old_cache(&self, older_than: Duration) -> TranslationResult<u64> {
        let cutoff = cleanup_cutoff(older_than);
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            let removed = {
                let mut table = txn.open_table(TRANSLATION_CACHE)?;
                let mut stale = Vec::new();
                for row in table.iter()? {
                    let (key, value) = row?;
                    let entry = decode_entry(value.value())?;
                    if entry.last_accessed_at < cutoff {
                        stale.push(key.value().to_string());
                    }
                }
                for key in &stale {
                    table.remove(key.as_str())?;
                }
                stale.len() as u64
            };
            txn.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn get_statistics(&self) -> TranslationResult<StoreStatistics> {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        self.blocking(move |db| {
            let sessions = all_sessions(db)?;
            Ok(StoreStatistics::from_sessions(&sessions, hits, misses))
        })
        .await
    }

    async fn ping(&self) -> TranslationResult<()> {
        self.blocking(|db| {
            let txn = db.begin_read()?;
            txn.open_table(SESSIONS)?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> TranslationResult<()> {
        // redb 在最后一个引用释放时关闭文件
        Ok(())
    }
}
