//! 存储模块
//!
//! 翻译缓存、会话记录模型与持久化后端。

pub mod cache;
pub mod model;
pub mod store;

pub use cache::{CacheConfig, CacheStats, TranslationCache};
pub use model::{CacheEntry, CacheKey, Session, SessionMeta, SessionStatus, StoreStatistics};
pub use store::{guard_store, open_store, FileStore, GuardedStore, MemoryStore, SessionStore};
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
