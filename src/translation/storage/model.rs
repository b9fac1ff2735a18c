//! 持久化记录：会话、缓存条目与统计

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::translation::error::TranslationError;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Translating,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Translating => "translating",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Initializing | SessionStatus::Translating)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = TranslationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(SessionStatus::Initializing),
            "translating" => Ok(SessionStatus::Translating),
            "completed" => Ok(SessionStatus::Completed),
            "error" => Ok(SessionStatus::Error),
            other => Err(TranslationError::StorageError(format!("未知的会话状态: {}", other))),
        }
    }
}

/// 启动会话所需的元数据
#[derive(Debug, Clone, Default)]
pub struct SessionMeta {
    /// 指定时沿用该 id（恢复会话），否则生成新的
    pub session_id: Option<String>,
    pub book_title: String,
    pub input_ref: String,
    pub output_ref: String,
    pub source_lang: String,
    pub target_lang: String,
    pub provider: String,
    pub model: String,
    pub total_chapters: usize,
}

/// 会话记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub book_title: String,
    pub input_ref: String,
    pub output_ref: String,
    pub source_lang: String,
    pub target_lang: String,
    pub provider: String,
    pub model: String,
    pub status: SessionStatus,
    pub current_task: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub percent: f64,
    pub current_chapter: usize,
    pub chapter_title: String,
    pub total_chapters: usize,
    pub current_section: usize,
    pub total_sections: usize,
    pub items_completed: u64,
    pub items_failed: u64,
    pub items_total: u64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(meta: &SessionMeta) -> Self {
        let now = Utc::now();
        Self {
            session_id: meta
                .session_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            book_title: meta.book_title.clone(),
            input_ref: meta.input_ref.clone(),
            output_ref: meta.output_ref.clone(),
            source_lang: meta.source_lang.clone(),
            target_lang: meta.target_lang.clone(),
            provider: meta.provider.clone(),
            model: meta.model.clone(),
            status: SessionStatus::Initializing,
            current_task: "Initializing translation".to_string(),
            start_time: now,
            end_time: None,
            percent: 0.0,
            current_chapter: 0,
            chapter_title: String::new(),
            total_chapters: meta.total_chapters,
            current_section: 0,
            total_sections: 0,
            items_completed: 0,
            items_failed: 0,
            items_total: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 与已存储的版本合并，计数器只增不减
    pub fn merge_monotonic(&mut self, stored: &Session) {
        self.items_completed = self.items_completed.max(stored.items_completed);
        self.items_failed = self.items_failed.max(stored.items_failed);
        self.items_total = self
            .items_total
            .max(stored.items_total)
            .max(self.items_completed + self.items_failed);
        self.created_at = stored.created_at;
    }

    /// 会话耗时（秒），未结束时为 `None`
    pub fn duration_secs(&self) -> Option<f64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds().max(0) as f64 / 1000.0)
    }
}

/// 缓存键五元组
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub source_text: String,
    pub source_lang: String,
    pub target_lang: String,
    pub provider: String,
    pub model: String,
}

impl CacheKey {
    pub fn new(
        source_text: impl Into<String>,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            source_text: source_text.into(),
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// 五元组摘要，作为缓存主键
    pub fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for part in [
            &self.source_text,
            &self.source_lang,
            &self.target_lang,
            &self.provider,
            &self.model,
        ] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        format!("trans:{}", hasher.finalize().to_hex())
    }

    /// 原文摘要，关系型存储的主键列
    pub fn source_text_hash(&self) -> String {
        blake3::hash(self.source_text.as_bytes()).to_hex().to_string()
    }
}

/// 缓存条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub target_text: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
}

impl CacheEntry {
    pub fn new(key: CacheKey, target_text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key,
            target_text: target_text.into(),
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
        }
    }

    /// 命中时更新访问时间和次数
    pub fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
        self.access_count += 1;
    }
}

/// 存储统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub in_progress: u64,
    pub cache_hit_rate: f64,
    /// 已完成会话的平均耗时（秒）
    pub avg_duration: f64,
}

impl StoreStatistics {
    /// 从会话列表与缓存计数汇总
    pub fn from_sessions<'a>(
        sessions: impl IntoIterator<Item = &'a Session>,
        cache_hits: u64,
        cache_misses: u64,
    ) -> Self {
        let mut stats = StoreStatistics::default();
        let mut durations = Vec::new();

        for session in sessions {
            stats.total += 1;
            match session.status {
                SessionStatus::Completed => {
                    stats.completed += 1;
                    if let Some(d) = session.duration_secs() {
                        durations.push(d);
                    }
                }
                SessionStatus::Error => stats.failed += 1,
                SessionStatus::Initializing | SessionStatus::Translating => stats.in_progress += 1,
            }
        }

        if !durations.is_empty() {
            stats.avg_duration = durations.iter().sum::<f64>() / durations.len() as f64;
        }
        stats.cache_hit_rate = hit_rate(cache_hits, cache_misses);
        stats
    }
}

/// 清理截止时间：`now - older_than`，溢出时取最早时间
pub fn cleanup_cutoff(older_than: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(older_than)
        .ok()
        .and_then(|delta| Utc::now().checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CacheKey {
        CacheKey::new("x", "en", "fr", "P", "M")
    }

    #[test]
    fn test_cache_key_stable() {
        assert_eq!(key().digest(), key().digest());
        assert_ne!(key().digest(), CacheKey::new("x", "en", "fr", "P", "M2").digest());
        // 字段边界不可混淆
        assert_ne!(
            CacheKey::new("ab", "c", "fr", "P", "M").digest(),
            CacheKey::new("a", "bc", "fr", "P", "M").digest()
        );
    }

    #[test]
    fn test_merge_monotonic() {
        let meta = SessionMeta::default();
        let mut stored = Session::new(&meta);
        stored.items_completed = 5;
        stored.items_total = 10;

        let mut update = stored.clone();
        update.items_completed = 3;
        update.items_failed = 1;
        update.merge_monotonic(&stored);
        assert_eq!(update.items_completed, 5);
        assert_eq!(update.items_failed, 1);
        assert_eq!(update.items_total, 10);
    }

    #[test]
    fn test_statistics() {
        let meta = SessionMeta::default();
        let mut done = Session::new(&meta);
        done.status = SessionStatus::Completed;
        done.end_time = Some(done.start_time + chrono::Duration::seconds(4));
        let mut failed = Session::new(&meta);
        failed.status = SessionStatus::Error;
        let running = Session::new(&meta);

        let stats = StoreStatistics::from_sessions([&done, &failed, &running], 3, 1);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.in_progress, 1);
        assert!((stats.avg_duration - 4.0).abs() < 1e-9);
        assert!((stats.cache_hit_rate - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("completed".parse::<SessionStatus>().unwrap(), SessionStatus::Completed);
        assert!("paused".parse::<SessionStatus>().is_err());
    }
}
