//! 翻译缓存
//!
//! 两级结构：内存 LRU 热层 + 可选的持久层（任意 [`SessionStore`]）。
//! 同一个键同时只会有一次真正的翻译，其余调用者等待并复用结果。

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use metrics::counter;
use tokio::sync::watch;

use super::model::{cleanup_cutoff, hit_rate, CacheEntry, CacheKey};
use super::store::SessionStore;
use crate::translation::config::constants;
use crate::translation::error::{TranslationError, TranslationResult};
use crate::translation::events::{Event, EventBus, EventType};

// ============================================================================
// 核心类型
// ============================================================================

/// 缓存配置
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// 热层最大条目数
    pub capacity: usize,
    /// 热层条目存活时间
    pub ttl: Duration,
    /// 等待进行中翻译的超时，与后端调用超时一致
    pub wait_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: constants::DEFAULT_CACHE_CAPACITY,
            ttl: constants::DEFAULT_CACHE_TTL,
            wait_timeout: constants::DEFAULT_BACKEND_TIMEOUT,
        }
    }
}

/// 缓存统计信息
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CacheStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// 等待他人进行中翻译而命中的次数
    pub coalesced: u64,
    /// 从持久层提升到热层的次数
    pub promotions: u64,
    pub total_entries: usize,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        hit_rate(self.cache_hits, self.cache_misses)
    }
}

struct HotEntry {
    text: String,
    inserted_at: Instant,
    last_accessed: Instant,
}

type InFlightResult = Option<TranslationResult<String>>;

/// 翻译缓存
pub struct TranslationCache {
    hot: Mutex<LruCache<String, HotEntry>>,
    durable: Option<Arc<dyn SessionStore>>,
    in_flight: DashMap<String, Arc<watch::Sender<InFlightResult>>>,
    events: EventBus,
    ttl: Duration,
    wait_timeout: Duration,
    stats: Mutex<CacheStats>,
}

/// 领头者退出（包括被取消）时移除进行中标记
struct InFlightGuard<'a> {
    map: &'a DashMap<String, Arc<watch::Sender<InFlightResult>>>,
    digest: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.digest);
    }
}

enum Role {
    Leader(Arc<watch::Sender<InFlightResult>>),
    Waiter(watch::Receiver<InFlightResult>),
}

// ============================================================================
// 实现
// ============================================================================

impl TranslationCache {
    pub fn new(config: CacheConfig, durable: Option<Arc<dyn SessionStore>>, events: EventBus) -> Self {
        let capacity = NonZeroUsize::new(config.capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            hot: Mutex::new(LruCache::new(capacity)),
            durable,
            in_flight: DashMap::new(),
            events,
            ttl: config.ttl,
            wait_timeout: config.wait_timeout,
            stats: Mutex::new(CacheStats::default()),
        }
    }

    /// 仅内存热层，无持久层
    pub fn in_memory(events: EventBus) -> Self {
        Self::new(CacheConfig::default(), None, events)
    }

    /// 查询缓存：先热层，再持久层（命中则提升到热层）
    pub async fn get(&self, key: &CacheKey) -> Option<String> {
        let found = self.lookup(key).await;
        self.record(|stats| {
            stats.total_requests += 1;
            if found.is_some() {
                stats.cache_hits += 1;
            } else {
                stats.cache_misses += 1;
            }
        });
        found
    }

    /// 写入热层并同步写入持久层
    pub async fn put(&self, key: &CacheKey, text: &str) -> TranslationResult<()> {
        self.put_hot(key.digest(), text);
        if let Some(store) = &self.durable {
            store
                .cache_translation(&CacheEntry::new(key.clone(), text))
                .await?;
        }
        Ok(())
    }

    /// 清理最近访问早于 `now - older_than` 的条目，返回两层共清理的数量
    pub async fn cleanup(&self, older_than: Duration) -> TranslationResult<u64> {
        let removed_hot = {
            let mut hot = self.lock_hot();
            let stale: Vec<String> = hot
                .iter()
                .filter(|(_, entry)| entry.last_accessed.elapsed() > older_than)
                .map(|(digest, _)| digest.clone())
                .collect();
            for digest in &stale {
                hot.pop(digest);
            }
            stale.len() as u64
        };

        let removed_durable = match &self.durable {
            Some(store) => store.cleanup_old_cache(older_than).await?,
            None => 0,
        };

        tracing::debug!(
            removed_hot,
            removed_durable,
            cutoff = %cleanup_cutoff(older_than),
            "缓存清理完成"
        );
        Ok(removed_hot + removed_durable)
    }

    /// 带单飞保护的查询或翻译
    ///
    /// 未命中时第一个调用者执行 `translate`，并发的同键调用者等待它的结果。
    /// 返回 `(译文, 是否命中)`。
    pub async fn get_or_translate<F, Fut>(
        &self,
        key: &CacheKey,
        session_id: Option<&str>,
        translate: F,
    ) -> TranslationResult<(String, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = TranslationResult<String>>,
    {
        let digest = key.digest();
        let mut translate = Some(translate);

        loop {
            if let Some(text) = self.lookup(key).await {
                self.record(|stats| {
                    stats.total_requests += 1;
                    stats.cache_hits += 1;
                });
                self.emit(EventType::CacheHit, key, session_id);
                return Ok((text, true));
            }

            let role = match self.in_flight.entry(digest.clone()) {
                Entry::Occupied(existing) => Role::Waiter(existing.get().subscribe()),
                Entry::Vacant(slot) => {
                    let (tx, _rx) = watch::channel(None);
                    let tx = Arc::new(tx);
                    slot.insert(Arc::clone(&tx));
                    Role::Leader(tx)
                }
            };

            match role {
                Role::Leader(tx) => {
                    let _guard = InFlightGuard {
                        map: &self.in_flight,
                        digest: digest.clone(),
                    };

                    // 上一个领头者可能刚写完热层并移除了标记
                    if let Some(text) = self.peek_hot(&digest) {
                        tx.send_replace(Some(Ok(text.clone())));
                        self.record(|stats| {
                            stats.total_requests += 1;
                            stats.cache_hits += 1;
                        });
                        self.emit(EventType::CacheHit, key, session_id);
                        return Ok((text, true));
                    }

                    let Some(run) = translate.take() else {
                        return Err(TranslationError::InternalError(
                            "缓存领头者重复执行翻译".to_string(),
                        ));
                    };

                    self.record(|stats| {
                        stats.total_requests += 1;
                        stats.cache_misses += 1;
                    });
                    counter!("translator_cache_misses_total").increment(1);
                    self.emit(EventType::CacheMiss, key, session_id);

                    let result = run().await;
                    if let Ok(text) = &result {
                        // 先写缓存，再唤醒等待者，最后移除标记
                        self.put_hot(digest.clone(), text);
                        self.write_durable(key, text).await;
                    }
                    tx.send_replace(Some(result.clone()));
                    return result.map(|text| (text, false));
                }
                Role::Waiter(mut rx) => {
                    match self.wait(&mut rx).await {
                        Some(Ok(text)) => {
                            self.record(|stats| {
                                stats.total_requests += 1;
                                stats.cache_hits += 1;
                                stats.coalesced += 1;
                            });
                            counter!("translator_cache_hits_total", "kind" => "coalesced")
                                .increment(1);
                            self.emit(EventType::CacheHit, key, session_id);
                            return Ok((text, true));
                        }
                        Some(Err(err)) => return Err(err),
                        None => {
                            // 领头者被取消，未留下结果，重新竞争
                            tracing::debug!(digest = %digest, "进行中的翻译已放弃，重新尝试");
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// 当前统计
    pub fn stats(&self) -> CacheStats {
        let mut stats = match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        stats.total_entries = self.lock_hot().len();
        stats
    }

    /// 清空热层
    pub fn clear(&self) {
        self.lock_hot().clear();
    }

    pub fn len(&self) -> usize {
        self.lock_hot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn wait(&self, rx: &mut watch::Receiver<InFlightResult>) -> InFlightResult {
        let waited = tokio::time::timeout(self.wait_timeout, async {
            loop {
                let current = rx.borrow_and_update().clone();
                if current.is_some() {
                    return current;
                }
                if rx.changed().await.is_err() {
                    return rx.borrow().clone();
                }
            }
        })
        .await;

        match waited {
            Ok(result) => result,
            Err(_) => Some(Err(TranslationError::TimeoutError(format!(
                "等待进行中的翻译超时（{}s）",
                self.wait_timeout.as_secs()
            )))),
        }
    }

    async fn lookup(&self, key: &CacheKey) -> Option<String> {
        let digest = key.digest();
        if let Some(text) = self.peek_hot(&digest) {
            counter!("translator_cache_hits_total", "kind" => "memory").increment(1);
            return Some(text);
        }

        let store = self.durable.as_ref()?;
        match store.get_cached_translation(key).await {
            Ok(Some(entry)) => {
                self.put_hot(digest, &entry.target_text);
                self.record(|stats| stats.promotions += 1);
                counter!("translator_cache_hits_total", "kind" => "durable").increment(1);
                Some(entry.target_text)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("持久缓存读取失败，按未命中处理: {}", e);
                None
            }
        }
    }

    async fn write_durable(&self, key: &CacheKey, text: &str) {
        if let Some(store) = &self.durable {
            if let Err(e) = store.cache_translation(&CacheEntry::new(key.clone(), text)).await {
                tracing::warn!("持久缓存写入失败: {}", e);
            }
        }
    }

    fn peek_hot(&self, digest: &str) -> Option<String> {
        let mut hot = self.lock_hot();
        let expired = match hot.get_mut(digest) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                entry.last_accessed = Instant::now();
                return Some(entry.text.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            hot.pop(digest);
        }
        None
    }

    fn put_hot(&self, digest: String, text: &str) {
        let now = Instant::now();
        let evicted = {
            let mut hot = self.lock_hot();
            let entry = HotEntry {
                text: text.to_string(),
                inserted_at: now,
                last_accessed: now,
            };
            matches!(hot.push(digest.clone(), entry), Some((old, _)) if old != digest)
        };
        if evicted {
            self.record(|stats| stats.evictions += 1);
        }
    }

    fn emit(&self, event_type: EventType, key: &CacheKey, session_id: Option<&str>) {
        let message = match event_type {
            EventType::CacheHit => "缓存命中",
            _ => "缓存未命中",
        };
        self.events.publish(
            Event::new(event_type, message)
                .with_session(session_id)
                .with_data("provider", key.provider.as_str())
                .with_data("model", key.model.as_str())
                .with_data("source_lang", key.source_lang.as_str())
                .with_data("target_lang", key.target_lang.as_str())
                .with_data("text_bytes", key.source_text.len() as u64)
                .with_text_preview("text_preview", &key.source_text),
        );
    }

    fn record(&self, update: impl FnOnce(&mut CacheStats)) {
        match self.stats.lock() {
            Ok(mut stats) => update(&mut stats),
            Err(poisoned) => update(&mut poisoned.into_inner()),
        }
    }

    fn lock_hot(&self) -> std::sync::MutexGuard<'_, LruCache<String, HotEntry>> {
        match self.hot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translation::storage::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(text: &str) -> CacheKey {
        CacheKey::new(text, "en", "fr", "P", "M")
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let cache = TranslationCache::in_memory(EventBus::new());
        assert!(cache.get(&key("x")).await.is_none());
        cache.put(&key("x"), "y").await.unwrap();
        assert_eq!(cache.get(&key("x")).await.as_deref(), Some("y"));

        let stats = cache.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.total_entries, 1);
    }

    #[tokio::test]
    async fn test_durable_hit_is_promoted() {
        let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
        let first = TranslationCache::new(CacheConfig::default(), Some(Arc::clone(&store)), EventBus::new());
        first.put(&key("x"), "y").await.unwrap();

        let second = TranslationCache::new(CacheConfig::default(), Some(store), EventBus::new());
        assert!(second.is_empty());
        assert_eq!(second.get(&key("x")).await.as_deref(), Some("y"));
        assert_eq!(second.len(), 1);
        assert_eq!(second.stats().promotions, 1);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let config = CacheConfig {
            capacity: 2,
            ..Default::default()
        };
        let cache = TranslationCache::new(config, None, EventBus::new());
        cache.put(&key("a"), "1").await.unwrap();
        cache.put(&key("b"), "2").await.unwrap();
        cache.put(&key("c"), "3").await.unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("a")).await.is_none());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let config = CacheConfig {
            ttl: Duration::from_millis(10),
            ..Default::default()
        };
        let cache = TranslationCache::new(config, None, EventBus::new());
        cache.put(&key("a"), "1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get(&key("a")).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_requests_coalesce() {
        let bus = EventBus::new();
        let hits = bus.subscribe(EventType::CacheHit);
        let misses = bus.subscribe(EventType::CacheMiss);
        let cache = Arc::new(TranslationCache::in_memory(bus));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_translate(&key("x"), Some("s1"), || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok("X".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            let (text, _) = handle.await.unwrap().unwrap();
            assert_eq!(text, "X");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(misses.drain().len(), 1);
        assert_eq!(hits.drain().len(), 9);
    }

    #[tokio::test]
    async fn test_failed_translation_is_not_cached() {
        let cache = TranslationCache::in_memory(EventBus::new());
        let err = cache
            .get_or_translate(&key("x"), None, || async {
                Err::<String, _>(TranslationError::ProviderError("503".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TranslationError::ProviderError(_)));
        assert!(cache.is_empty());

        let (text, hit) = cache
            .get_or_translate(&key("x"), None, || async { Ok("ok".to_string()) })
            .await
            .unwrap();
        assert_eq!(text, "ok");
        assert!(!hit);
    }

    #[tokio::test]
    async fn test_cleanup_hot_entries() {
        let cache = TranslationCache::in_memory(EventBus::new());
        cache.put(&key("a"), "1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.cleanup(Duration::from_millis(5)).await.unwrap(), 1);
        assert!(cache.is_empty());
    }
}
