//! 会话持久化存储
//!
//! 三种可互换实现：内存、嵌入式文件（redb）、关系型（SQLite）。
//! [`GuardedStore`] 为任意实现加上取消与超时控制。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::model::{CacheEntry, CacheKey, Session, StoreStatistics};
use crate::translation::config::{StorageConfig, StoreType};
use crate::translation::error::{TranslationError, TranslationResult};

pub mod file;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use file::FileStore;
pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// 存储后端统一接口
#[async_trait]
pub trait SessionStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_session(&self, session: &Session) -> TranslationResult<()>;

    async fn get_session(&self, session_id: &str) -> TranslationResult<Option<Session>>;

    /// 更新会话，计数器取已存储值与新值中的较大者
    async fn update_session(&self, session: &Session) -> TranslationResult<()>;

    /// 按创建时间倒序分页
    async fn list_sessions(&self, limit: usize, offset: usize) -> TranslationResult<Vec<Session>>;

    async fn delete_session(&self, session_id: &str) -> TranslationResult<bool>;

    /// 幂等写入，后写覆盖先写
    async fn cache_translation(&self, entry: &CacheEntry) -> TranslationResult<()>;

    /// 命中时递增 `access_count` 并刷新 `last_accessed_at`
    async fn get_cached_translation(&self, key: &CacheKey) -> TranslationResult<Option<CacheEntry>>;

    /// 清理最近访问早于 `now - older_than` 的条目，返回清理数量
    async fn cleanup_old_cache(&self, older_than: Duration) -> TranslationResult<u64>;

    async fn get_statistics(&self) -> TranslationResult<StoreStatistics>;

    async fn ping(&self) -> TranslationResult<()>;

    async fn close(&self) -> TranslationResult<()>;
}

/// 带操作超时的存储包装，可选绑定取消令牌
///
/// 绑定令牌后，令牌取消时所有操作立即返回 `cancelled`。
/// [`open_store`] 返回的存储不绑定令牌，会话取消后仍能写入最终状态。
pub struct GuardedStore {
    inner: Arc<dyn SessionStore>,
    cancel: Option<CancellationToken>,
    op_timeout: Duration,
}

impl GuardedStore {
    pub fn new(inner: Arc<dyn SessionStore>, op_timeout: Duration) -> Self {
        Self {
            inner,
            cancel: None,
            op_timeout,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    async fn guard<T, F>(&self, op: &str, fut: F) -> TranslationResult<T>
    where
        F: Future<Output = TranslationResult<T>> + Send,
    {
        let timed = async {
            match tokio::time::timeout(self.op_timeout, fut).await {
                Ok(inner) => inner,
                Err(_) => Err(TranslationError::StorageError(format!(
                    "存储操作 {} 超时（{}s）",
                    op,
                    self.op_timeout.as_secs()
                ))),
            }
        };

        let Some(cancel) = &self.cancel else {
            return timed.await;
        };
        if cancel.is_cancelled() {
            return Err(TranslationError::Cancelled(format!("存储操作 {} 已取消", op)));
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                Err(TranslationError::Cancelled(format!("存储操作 {} 已取消", op)))
            }
            result = timed => result,
        }
    }
}

#[async_trait]
impl SessionStore for GuardedStore {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn create_session(&self, session: &Session) -> TranslationResult<()> {
        self.guard("create_session", self.inner.create_session(session)).await
    }

    async fn get_session(&self, session_id: &str) -> TranslationResult<Option<Session>> {
        self.guard("get_session", self.inner.get_session(session_id)).await
    }

    async fn update_session(&self, session: &Session) -> TranslationResult<()> {
        self.guard("update_session", self.inner.update_session(session)).await
    }

    async fn list_sessions(&self, limit: usize, offset: usize) -> TranslationResult<Vec<Session>> {
        self.guard("list_sessions", self.inner.list_sessions(limit, offset)).await
    }

    async fn delete_session(&self, session_id: &str) -> TranslationResult<bool> {
        self.guard("delete_session", self.inner.delete_session(session_id)).await
    }

    async fn cache_translation(&self, entry: &CacheEntry) -> TranslationResult<()> {
        self.guard("cache_translation", self.inner.cache_translation(entry)).await
    }

    async fn get_cached_translation(&self, key: &CacheKey) -> TranslationResult<Option<CacheEntry>> {
        self.guard("get_cached_translation", self.inner.get_cached_translation(key)).await
    }

    async fn cleanup_old_cache(&self, older_than: Duration) -> TranslationResult<u64> {
        self.guard("cleanup_old_cache", self.inner.cleanup_old_cache(older_than)).await
    }

    async fn get_statistics(&self) -> TranslationResult<StoreStatistics> {
        self.guard("get_statistics", self.inner.get_statistics()).await
    }

    async fn ping(&self) -> TranslationResult<()> {
        self.guard("ping", self.inner.ping()).await
    }

    async fn close(&self) -> TranslationResult<()> {
        self.inner.close().await
    }
}

/// 按配置打开存储
pub async fn open_store(config: &StorageConfig) -> TranslationResult<Arc<dyn SessionStore>> {
    let store: Arc<dyn SessionStore> = match config.store_type {
        StoreType::Memory => Arc::new(MemoryStore::new()),
        StoreType::File => {
            let path = config.database_path().ok_or_else(|| {
                TranslationError::ConfigError("文件存储需要 database 路径".to_string())
            })?;
            Arc::new(FileStore::open(&path)?)
        }
        #[cfg(feature = "sqlite")]
        StoreType::Sqlite => {
            let path = config.database_path().ok_or_else(|| {
                TranslationError::ConfigError("SQLite 存储需要 database 路径".to_string())
            })?;
            Arc::new(SqliteStore::connect(&path, config).await?)
        }
        #[cfg(not(feature = "sqlite"))]
        StoreType::Sqlite => {
            return Err(TranslationError::ConfigError(
                "未启用 sqlite 特性，无法使用 SQLite 存储".to_string(),
            ));
        }
    };

    guard_store(store, config).await
}

/// 为已打开的存储加上操作超时并检查连通性
pub async fn guard_store(
    store: Arc<dyn SessionStore>,
    config: &StorageConfig,
) -> TranslationResult<Arc<dyn SessionStore>> {
    if config.encryption_key.is_some() {
        tracing::warn!("存储 {} 不支持静态加密，encryption_key 被忽略", store.name());
    }

    let store: Arc<dyn SessionStore> = Arc::new(GuardedStore::new(store, config.op_timeout()));
    store.ping().await?;
    tracing::info!(
        timeout_secs = config.op_timeout().as_secs(),
        "会话存储已就绪: {}",
        store.name()
    );
    Ok(store)
}
