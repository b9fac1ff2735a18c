//! 关系型存储（SQLite，WAL 模式）
//!
//! 会话表的时间戳以 RFC3339 文本保存，缓存表以毫秒时间戳保存，便于按时间清理。

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use super::SessionStore;
use crate::translation::config::StorageConfig;
use crate::translation::error::{TranslationError, TranslationResult};
use crate::translation::storage::model::{
    cleanup_cutoff, CacheEntry, CacheKey, Session, SessionStatus, StoreStatistics,
};

pub struct SqliteStore {
    pool: SqlitePool,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl SqliteStore {
    /// 连接数据库（不存在则创建）并建表
    pub async fn connect(path: &str, config: &StorageConfig) -> TranslationResult<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_open.max(1))
            .min_connections(config.max_idle.min(config.max_open))
            .max_lifetime(Duration::from_secs(config.conn_max_lifetime_secs))
            .acquire_timeout(config.op_timeout())
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        };
        store.migrate().await?;
        tracing::debug!("SQLite 会话存储已连接: {}", path);
        Ok(store)
    }

    async fn migrate(&self) -> TranslationResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                book_title TEXT NOT NULL,
                input_ref TEXT NOT NULL,
                output_ref TEXT NOT NULL,
                source_lang TEXT NOT NULL,
                target_lang TEXT NOT NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                status TEXT NOT NULL,
                current_task TEXT NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT,
                percent REAL NOT NULL DEFAULT 0,
                current_chapter INTEGER NOT NULL DEFAULT 0,
                chapter_title TEXT NOT NULL DEFAULT '',
                total_chapters INTEGER NOT NULL DEFAULT 0,
                current_section INTEGER NOT NULL DEFAULT 0,
                total_sections INTEGER NOT NULL DEFAULT 0,
                items_completed INTEGER NOT NULL DEFAULT 0,
                items_failed INTEGER NOT NULL DEFAULT 0,
                items_total INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_created_at ON sessions(created_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS translation_cache (
                source_text_hash TEXT NOT NULL,
                source_lang TEXT NOT NULL,
                target_lang TEXT NOT NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                source_text TEXT NOT NULL,
                target_text TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_accessed_at INTEGER NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (source_text_hash, source_lang, target_lang, provider, model)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_cache_last_accessed ON translation_cache(last_accessed_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn parse_time(raw: &str) -> TranslationResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TranslationError::StorageError(format!("时间字段无效 {}: {}", raw, e)))
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn row_to_session(row: &SqliteRow) -> TranslationResult<Session> {
    let status: String = row.try_get("status")?;
    let start_time: String = row.try_get("start_time")?;
    let end_time: Option<String> = row.try_get("end_time")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Session {
        session_id: row.try_get("session_id")?,
        book_title: row.try_get("book_title")?,
        input_ref: row.try_get("input_ref")?,
        output_ref: row.try_get("output_ref")?,
        source_lang: row.try_get("source_lang")?,
        target_lang: row.try_get("target_lang")?,
        provider: row.try_get("provider")?,
        model: row.try_get("model")?,
        status: SessionStatus::from_str(&status)?,
        current_task: row.try_get("current_task")?,
        start_time: parse_time(&start_time)?,
        end_time: end_time.as_deref().map(parse_time).transpose()?,
        percent: row.try_get("percent")?,
        current_chapter: row.try_get::<i64, _>("current_chapter")?.max(0) as usize,
        chapter_title: row.try_get("chapter_title")?,
        total_chapters: row.try_get::<i64, _>("total_chapters")?.max(0) as usize,
        current_section: row.try_get::<i64, _>("current_section")?.max(0) as usize,
        total_sections: row.try_get::<i64, _>("total_sections")?.max(0) as usize,
        items_completed: row.try_get::<i64, _>("items_completed")?.max(0) as u64,
        items_failed: row.try_get::<i64, _>("items_failed")?.max(0) as u64,
        items_total: row.try_get::<i64, _>("items_total")?.max(0) as u64,
        error_message: row.try_get("error_message")?,
        created_at: parse_time(&created_at)?,
        updated_at: parse_time(&updated_at)?,
    })
}

fn row_to_entry(row: &SqliteRow) -> TranslationResult<CacheEntry> {
    Ok(CacheEntry {
        key: CacheKey {
            source_text: row.try_get("source_text")?,
            source_lang: row.try_get("source_lang")?,
            target_lang: row.try_get("target_lang")?,
            provider: row.try_get("provider")?,
            model: row.try_get("model")?,
        },
        target_text: row.try_get("target_text")?,
        created_at: from_millis(row.try_get("created_at")?),
        last_accessed_at: from_millis(row.try_get("last_accessed_at")?),
        access_count: row.try_get::<i64, _>("access_count")?.max(0) as u64,
    })
}

#[async_trait]
impl SessionStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn create_session(&self, session: &Session) -> TranslationResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (
                session_id, book_title, input_ref, output_ref, source_lang, target_lang,
                provider, model, status, current_task, start_time, end_time, percent,
                current_chapter, chapter_title, total_chapters, current_section, total_sections,
                items_completed, items_failed, items_total, error_message, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.book_title)
        .bind(&session.input_ref)
        .bind(&session.output_ref)
        .bind(&session.source_lang)
        .bind(&session.target_lang)
        .bind(&session.provider)
        .bind(&session.model)
        .bind(session.status.as_str())
        .bind(&session.current_task)
        .bind(session.start_time.to_rfc3339())
        .bind(session.end_time.map(|t| t.to_rfc3339()))
        .bind(session.percent)
        .bind(session.current_chapter as i64)
        .bind(&session.chapter_title)
        .bind(session.total_chapters as i64)
        .bind(session.current_section as i64)
        .bind(session.total_sections as i64)
        .bind(session.items_completed as i64)
        .bind(session.items_failed as i64)
        .bind(session.items_total as i64)
        .bind(&session.error_message)
        .bind(session.created_at.to_rfc3339())
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> TranslationResult<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_session).transpose()
    }

    async fn update_session(&self, session: &Session) -> TranslationResult<()> {
        // 右侧表达式引用的是更新前的列值
        let result = sqlx::query(
            r#"
            UPDATE sessions SET
                book_title = ?, input_ref = ?, output_ref = ?, source_lang = ?, target_lang = ?,
                provider = ?, model = ?, status = ?, current_task = ?, start_time = ?, end_time = ?,
                percent = ?, current_chapter = ?, chapter_title = ?, total_chapters = ?,
                current_section = ?, total_sections = ?,
                items_completed = MAX(items_completed, ?),
                items_failed = MAX(items_failed, ?),
                items_total = MAX(items_total, ?, MAX(items_completed, ?) + MAX(items_failed, ?)),
                error_message = ?, updated_at = ?
            WHERE session_id = ?
            "#,
        )
        .bind(&session.book_title)
        .bind(&session.input_ref)
        .bind(&session.output_ref)
        .bind(&session.source_lang)
        .bind(&session.target_lang)
        .bind(&session.provider)
        .bind(&session.model)
        .bind(session.status.as_str())
        .bind(&session.current_task)
        .bind(session.start_time.to_rfc3339())
        .bind(session.end_time.map(|t| t.to_rfc3339()))
        .bind(session.percent)
        .bind(session.current_chapter as i64)
        .bind(&session.chapter_title)
        .bind(session.total_chapters as i64)
        .bind(session.current_section as i64)
        .bind(session.total_sections as i64)
        .bind(session.items_completed as i64)
        .bind(session.items_failed as i64)
        .bind(session.items_total as i64)
        .bind(session.items_completed as i64)
        .bind(session.items_failed as i64)
        .bind(&session.error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(&session.session_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TranslationError::StorageError(format!(
                "会话不存在: {}",
                session.session_id
            )));
        }
        Ok(())
    }

    async fn list_sessions(&self, limit: usize, offset: usize) -> TranslationResult<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT * FROM sessions ORDER BY created_at DESC, session_id ASC LIMIT ? OFFSET ?",
        )
        .bind(limit.min(i64::MAX as usize) as i64)
        .bind(offset.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_session).collect()
    }

    async fn delete_session(&self, session_id: &str) -> TranslationResult<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cache_translation(&self, entry: &CacheEntry) -> TranslationResult<()> {
        let key = &entry.key;
        sqlx::query(
            r#"
            INSERT INTO translation_cache (
                source_text_hash, source_lang, target_lang, provider, model,
                source_text, target_text, created_at, last_accessed_at, access_count
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_text_hash, source_lang, target_lang, provider, model) DO UPDATE SET
                target_text = excluded.target_text,
                last_accessed_at = excluded.last_accessed_at
            "#,
        )
        .bind(key.source_text_hash())
        .bind(&key.source_lang)
        .bind(&key.target_lang)
        .bind(&key.provider)
        .bind(&key.model)
        .bind(&key.source_text)
        .bind(&entry.target_text)
        .bind(entry.created_at.timestamp_millis())
        .bind(entry.last_accessed_at.timestamp_millis())
        .bind(entry.access_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_cached_translation(&self, key: &CacheKey) -> TranslationResult<Option<CacheEntry>> {
        let hash = key.source_text_hash();
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query(
            r#"
            UPDATE translation_cache
            SET access_count = access_count + 1, last_accessed_at = ?
            WHERE source_text_hash = ? AND source_lang = ? AND target_lang = ? AND provider = ? AND model = ?
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(&hash)
        .bind(&key.source_lang)
        .bind(&key.target_lang)
        .bind(&key.provider)
        .bind(&key.model)
        .execute(&mut *tx)
        .await?;

        let entry = if touched.rows_affected() > 0 {
            let row = sqlx::query(
                r#"
                SELECT * FROM translation_cache
                WHERE source_text_hash = ? AND source_lang = ? AND target_lang = ? AND provider = ? AND model = ?
                "#,
            )
            .bind(&hash)
            .bind(&key.source_lang)
            .bind(&key.target_lang)
            .bind(&key.provider)
            .bind(&key.model)
            .fetch_optional(&mut *tx)
            .await?;
            row.as_ref().map(row_to_entry).transpose()?
        } else {
            None
        };
        tx.commit().await?;

        let counter = if entry.is_some() {
            &self.cache_hits
        } else {
            &self.cache_misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(entry)
    }

    async fn cleanup_old_cache(&self, older_than: Duration) -> TranslationResult<u64> {
        let cutoff = cleanup_cutoff(older_than).timestamp_millis();
        let result = sqlx::query("DELETE FROM translation_cache WHERE last_accessed_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn get_statistics(&self) -> TranslationResult<StoreStatistics> {
        let rows = sqlx::query("SELECT * FROM sessions")
            .fetch_all(&self.pool)
            .await?;
        let sessions = rows
            .iter()
            .map(row_to_session)
            .collect::<TranslationResult<Vec<_>>>()?;
        Ok(StoreStatistics::from_sessions(
            &sessions,
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        ))
    }

    async fn ping(&self) -> TranslationResult<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> TranslationResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translation::storage::model::SessionMeta;

    async fn store(dir: &tempfile::TempDir) -> SqliteStore {
        let path = dir.path().join("translator.db");
        SqliteStore::connect(path.to_str().unwrap(), &StorageConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_update_is_monotonic_in_sql() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;

        let mut session = Session::new(&SessionMeta {
            book_title: "Book".into(),
            ..Default::default()
        });
        store.create_session(&session).await.unwrap();

        session.status = SessionStatus::Translating;
        session.items_total = 5;
        session.items_completed = 4;
        store.update_session(&session).await.unwrap();

        session.items_completed = 2;
        session.items_failed = 2;
        store.update_session(&session).await.unwrap();

        let loaded = store.get_session(&session.session_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SessionStatus::Translating);
        assert_eq!(loaded.items_completed, 4);
        assert_eq!(loaded.items_failed, 2);
        assert_eq!(loaded.items_total, 6);
    }

    #[tokio::test]
    async fn test_update_missing_session_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;
        let session = Session::new(&SessionMeta::default());
        assert!(store.update_session(&session).await.is_err());
    }

    #[tokio::test]
    async fn test_cache_upsert_hit_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).await;

        let key = CacheKey::new("Hello", "en", "es", "openai", "gpt-4o-mini");
        store.cache_translation(&CacheEntry::new(key.clone(), "Hola")).await.unwrap();
        store.cache_translation(&CacheEntry::new(key.clone(), "¡Hola!")).await.unwrap();

        let hit = store.get_cached_translation(&key).await.unwrap().unwrap();
        assert_eq!(hit.target_text, "¡Hola!");
        assert_eq!(hit.access_count, 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.cleanup_old_cache(Duration::ZERO).await.unwrap(), 1);
        assert!(store.get_cached_translation(&key).await.unwrap().is_none());
        store.close().await.unwrap();
    }
}
