//! 翻译服务
//!
//! 把遍历器、协调器、缓存、进度跟踪和会话存储串成一次完整的书籍翻译：
//! 先翻译书籍元数据，再按章节顺序翻译；章内单元并发执行，完成顺序不限，
//! 最后按 `unit_id` 回写。单元失败时保留原文并计入失败数，会话继续；
//! 根取消或存储故障会让会话以 `error` 结束。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use super::coordinator::{CallContext, Coordinator, UnitOutcome};
use crate::book::Book;
use crate::distributed::WorkerPool;
use crate::hardware;
use crate::translation::backends::BackendRequest;
use crate::translation::config::{TranslationSettings, TranslatorConfig};
use crate::translation::error::{ErrorStats, TranslationError, TranslationResult};
use crate::translation::events::EventBus;
use crate::translation::pipeline::{script, BookWalker, Script, TranslationUnit};
use crate::translation::progress::ProgressTracker;
use crate::translation::storage::{
    open_store, CacheConfig, Session, SessionMeta, SessionStatus, SessionStore, TranslationCache,
};

/// 一次会话运行的汇总
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session: Session,
    pub errors: ErrorStats,
    /// 后端实例 id → 完成的单元数
    pub backend_usage: BTreeMap<String, u64>,
    pub cache_hits: u64,
    pub fallbacks: u64,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.session.status == SessionStatus::Completed
    }
}

/// 运行过程中的累计状态
#[derive(Default)]
struct RunState {
    translations: HashMap<String, String>,
    errors: ErrorStats,
    backend_usage: BTreeMap<String, u64>,
    cache_hits: u64,
    fallbacks: u64,
    completed: u64,
    failed: u64,
}

impl RunState {
    fn record_success(&mut self, unit_id: String, outcome: UnitOutcome) {
        self.completed += 1;
        if outcome.cached {
            self.cache_hits += 1;
        }
        if outcome.fallback {
            self.fallbacks += 1;
        }
        *self.backend_usage.entry(outcome.backend_id).or_insert(0) += 1;
        self.translations.insert(unit_id, outcome.text);
    }
}

/// 书籍翻译服务
pub struct TranslationService {
    coordinator: Arc<Coordinator>,
    store: Arc<dyn SessionStore>,
    events: EventBus,
    walker: BookWalker,
    source_lang: String,
    target_lang: String,
    output_script: Option<Script>,
    max_concurrent: usize,
    // 保持工作节点池存活，远程后端通过它派发
    _pool: Option<Arc<WorkerPool>>,
}

impl TranslationService {
    pub fn new(
        coordinator: Arc<Coordinator>,
        store: Arc<dyn SessionStore>,
        events: EventBus,
        settings: &TranslationSettings,
    ) -> Self {
        Self {
            coordinator,
            store,
            events,
            walker: BookWalker::new().with_paragraph_units(settings.paragraph_units),
            source_lang: settings.source_lang.clone(),
            target_lang: settings.target_lang.clone(),
            output_script: settings.output_script,
            max_concurrent: settings.max_concurrent.max(1),
            _pool: None,
        }
    }

    /// 按完整配置组装：存储、缓存、工作节点池、协调器
    pub async fn from_config(config: &TranslatorConfig, events: EventBus) -> TranslationResult<Self> {
        config.validate()?;

        let store = open_store(&config.storage).await?;
        let cache = Arc::new(TranslationCache::new(
            CacheConfig {
                capacity: config.translation.cache_capacity,
                ttl: config.translation.cache_ttl(),
                wait_timeout: config.translation.backend_timeout(),
            },
            Some(Arc::clone(&store)),
            events.clone(),
        ));

        let pool = if config.distributed.enabled {
            let pool = Arc::new(WorkerPool::from_config(&config.distributed, events.clone())?);
            pool.probe_all().await;
            Some(pool)
        } else {
            None
        };

        let mut coordinator =
            Coordinator::from_config(config, events.clone(), pool.as_ref())?.with_cache(cache);
        match hardware::detect_local() {
            Ok(host) => {
                tracing::info!("本机硬件: {}", host);
                coordinator = coordinator.with_host(host);
            }
            Err(e) => tracing::warn!("无法检测本机硬件，跳过本地模型内存检查: {}", e),
        }

        let mut service = Self::new(Arc::new(coordinator), store, events, &config.translation);
        service._pool = pool;
        Ok(service)
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// 实际并发单元数，不超过 `max_concurrent`
    pub fn fan_out(&self) -> usize {
        self.coordinator.fan_out().min(self.max_concurrent).max(1)
    }

    /// 翻译整本书，原地改写 `book`
    pub async fn translate_book(
        &self,
        book: &mut Book,
        mut meta: SessionMeta,
        cancel: &CancellationToken,
    ) -> TranslationResult<SessionReport> {
        if meta.book_title.is_empty() {
            meta.book_title = book.title.clone();
        }
        if meta.source_lang.is_empty() {
            meta.source_lang = self.source_lang.clone();
        }
        if meta.target_lang.is_empty() {
            meta.target_lang = self.target_lang.clone();
        }
        if meta.provider.is_empty() {
            if let Some((provider, model)) =
                self.coordinator.preferred(&meta.source_lang, &meta.target_lang)
            {
                meta.provider = provider;
                if meta.model.is_empty() {
                    meta.model = model;
                }
            }
        }
        meta.total_chapters = book.chapters.len();

        let tracker = ProgressTracker::start(&meta, self.events.clone());
        self.store.create_session(&tracker.snapshot()).await?;
        self.execute(book, tracker, cancel).await
    }

    /// 恢复已存储的会话
    ///
    /// 重新遍历整本书；此前完成的单元由缓存直接返回，不会再次调用后端。
    pub async fn resume(
        &self,
        session_id: &str,
        book: &mut Book,
        cancel: &CancellationToken,
    ) -> TranslationResult<SessionReport> {
        let mut session = self.store.get_session(session_id).await?.ok_or_else(|| {
            TranslationError::InvalidInput(format!("会话不存在: {}", session_id))
        })?;
        session.total_chapters = book.chapters.len();

        let tracker = ProgressTracker::resume(session, self.events.clone());
        self.execute(book, tracker, cancel).await
    }

    async fn execute(
        &self,
        book: &mut Book,
        tracker: ProgressTracker,
        cancel: &CancellationToken,
    ) -> TranslationResult<SessionReport> {
        let mut state = RunState::default();

        if let Err(err) = self.run(book, &tracker, &mut state, cancel).await {
            let reason = if err.is_cancelled() {
                "cancelled".to_string()
            } else {
                err.to_string()
            };
            tracker.error(&reason);
            // 已完成单元的缓存已在翻译返回前写入，这里只需落盘会话
            if let Err(e) = tracker.persist(self.store.as_ref()).await {
                tracing::warn!(session_id = %tracker.session_id(), "保存出错会话失败: {}", e);
            }
            return Err(err);
        }

        self.walker.apply(book, &state.translations);
        if let Some(target) = self.output_script {
            let converted = script::convert_book(book, target);
            tracing::info!("输出文字转换为 {}，改写 {} 个字段", target, converted);
        }

        tracker.complete();
        tracker.persist(self.store.as_ref()).await?;

        Ok(SessionReport {
            session: tracker.snapshot(),
            errors: state.errors,
            backend_usage: state.backend_usage,
            cache_hits: state.cache_hits,
            fallbacks: state.fallbacks,
        })
    }

    async fn run(
        &self,
        book: &Book,
        tracker: &ProgressTracker,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> TranslationResult<()> {
        let units = self.walker.collect_units(book);
        tracker.set_total(units.len() as u64);

        let mut metadata = Vec::new();
        let mut chapters: Vec<Vec<TranslationUnit>> = vec![Vec::new(); book.chapters.len()];
        for unit in units {
            match unit.chapter_index {
                Some(ci) if ci < chapters.len() => chapters[ci].push(unit),
                _ => metadata.push(unit),
            }
        }

        tracing::info!(
            session_id = %tracker.session_id(),
            chapters = chapters.len(),
            fan_out = self.fan_out(),
            "开始翻译"
        );

        tracker.set_status(SessionStatus::Translating, "Translating book metadata");
        self.translate_group(&metadata, tracker, state, cancel, false).await?;

        for (ci, units) in chapters.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(TranslationError::Cancelled("翻译已取消".to_string()));
            }
            // 章内进度按单元计
            tracker.update_chapter(ci + 1, &book.chapters[ci].title, units.len());
            self.translate_group(units, tracker, state, cancel, true).await?;
            tracker.persist(self.store.as_ref()).await?;
            tracing::debug!(
                session_id = %tracker.session_id(),
                chapter = ci + 1,
                units = units.len(),
                "章节完成"
            );
        }
        Ok(())
    }

    async fn translate_group(
        &self,
        units: &[TranslationUnit],
        tracker: &ProgressTracker,
        state: &mut RunState,
        cancel: &CancellationToken,
        in_chapter: bool,
    ) -> TranslationResult<()> {
        let session_id = tracker.session_id();
        let session = tracker.snapshot();
        let (source_lang, target_lang) = (session.source_lang.as_str(), session.target_lang.as_str());

        let mut results = stream::iter(units)
            .map(|unit| {
                let session_id = session_id.as_str();
                async move {
                    let request = BackendRequest::new(unit.source_text.as_str(), source_lang, target_lang)
                        .with_context_hint(Some(unit.context_hint.as_str()));
                    let ctx = CallContext {
                        session_id: Some(session_id),
                        unit_id: Some(&unit.unit_id),
                    };
                    (unit, self.coordinator.translate(&request, ctx, cancel).await)
                }
            })
            .buffer_unordered(self.fan_out());

        let mut done = 0;
        while let Some((unit, result)) = results.next().await {
            done += 1;
            match result {
                Ok(outcome) => {
                    state.record_success(unit.unit_id.clone(), outcome);
                    tracker.advance_completed_to(state.completed);
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        session_id = %session_id,
                        unit_id = %unit.unit_id,
                        role = %unit.role,
                        error_class = %err.category(),
                        "单元翻译失败，保留原文: {}",
                        err
                    );
                    state.errors.record_error(&err);
                    state.failed += 1;
                    tracker.advance_failed_to(state.failed);
                }
            }
            if in_chapter {
                tracker.update_section(done);
            }
        }
        Ok(())
    }
}
