// 集成测试公共模块
//
// 提供模拟后端、书籍构造器和临时存储

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use ebook_translator::book::{Book, Chapter, Section};
use ebook_translator::translation::backends::{
    with_cancel, BackendClient, BackendRequest, DictionaryBackend, TranslationBackend,
};
use ebook_translator::translation::config::{CoordinatorSettings, RetrySettings, TranslationSettings};
use ebook_translator::translation::core::{BackendInstance, Coordinator, TranslationService};
use ebook_translator::translation::error::TranslationResult;
use ebook_translator::translation::events::EventBus;
use ebook_translator::translation::storage::{
    CacheConfig, FileStore, GuardedStore, MemoryStore, SessionStore, TranslationCache,
};

type Respond = dyn Fn(&BackendRequest) -> TranslationResult<String> + Send + Sync;

/// 可编程的模拟后端
pub struct MockBackend {
    name: String,
    model: String,
    respond: Box<Respond>,
    delay: Duration,
    max_input: Option<usize>,
    calls: AtomicUsize,
    /// 第 n 次调用时取消根令牌
    cancel_at: Option<(usize, CancellationToken)>,
}

impl MockBackend {
    pub fn new<F>(name: &str, respond: F) -> Self
    where
        F: Fn(&BackendRequest) -> TranslationResult<String> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            model: "mock-model".to_string(),
            respond: Box::new(respond),
            delay: Duration::ZERO,
            max_input: None,
            calls: AtomicUsize::new(0),
            cancel_at: None,
        }
    }

    /// 原样返回输入
    pub fn identity(name: &str) -> Self {
        Self::new(name, |req| Ok(req.text.clone()))
    }

    /// 返回固定文本
    pub fn fixed(name: &str, text: &'static str) -> Self {
        Self::new(name, move |_| Ok(text.to_string()))
    }

    /// 给文本加上 `[..]`
    pub fn bracket(name: &str) -> Self {
        Self::new(name, |req| Ok(format!("[{}]", req.text)))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_input(mut self, bytes: usize) -> Self {
        self.max_input = Some(bytes);
        self
    }

    pub fn cancel_at(mut self, call: usize, token: CancellationToken) -> Self {
        self.cancel_at = Some((call, token));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranslationBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn max_input_bytes(&self) -> Option<usize> {
        self.max_input
    }

    async fn translate(
        &self,
        request: &BackendRequest,
        cancel: &CancellationToken,
    ) -> TranslationResult<String> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((at, token)) = &self.cancel_at {
            if call == *at {
                token.cancel();
            }
        }
        with_cancel(cancel, "mock backend", async {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.respond)(request)
        })
        .await
    }
}

/// 不等待的重试设置
pub fn fast_retry() -> RetrySettings {
    RetrySettings {
        max_attempts: 1,
        base_delay_ms: 1,
        factor: 1.0,
        max_delay_ms: 1,
    }
}

pub fn instance(
    id: &str,
    priority: i32,
    backend: Arc<dyn TranslationBackend>,
    events: &EventBus,
) -> BackendInstance {
    BackendInstance::new(id, priority, 4, BackendClient::new(backend, fast_retry(), events.clone()))
}

/// 协调器，`fan_out` 为 None 时取默认值
pub fn coordinator(events: &EventBus, fan_out: Option<usize>) -> Coordinator {
    let settings = CoordinatorSettings {
        fan_out,
        retry: fast_retry(),
        ..Default::default()
    };
    Coordinator::new(settings, events.clone())
}

pub fn cache(store: Option<Arc<dyn SessionStore>>, events: &EventBus) -> Arc<TranslationCache> {
    Arc::new(TranslationCache::new(
        CacheConfig::default(),
        store,
        events.clone(),
    ))
}

pub fn settings(source: &str, target: &str) -> TranslationSettings {
    TranslationSettings {
        source_lang: source.to_string(),
        target_lang: target.to_string(),
        ..Default::default()
    }
}

/// 单后端服务：缓存写入给定存储
pub fn service_with(
    backend: Arc<dyn TranslationBackend>,
    store: Arc<dyn SessionStore>,
    events: &EventBus,
    fan_out: Option<usize>,
    settings: &TranslationSettings,
) -> TranslationService {
    let mut coordinator = coordinator(events, fan_out).with_cache(cache(Some(Arc::clone(&store)), events));
    let id = backend.name().to_string();
    coordinator
        .register(instance(&id, 1, backend, events))
        .expect("register backend");
    TranslationService::new(Arc::new(coordinator), store, events.clone(), settings)
}

pub fn dictionary(entries: &[(&str, &str)]) -> Arc<DictionaryBackend> {
    Arc::new(DictionaryBackend::with_entries(
        entries.iter().map(|(a, b)| (a.to_string(), b.to_string())),
    ))
}

/// 与 `open_store` 相同的包装：只有操作超时，不绑定会话取消
fn guarded(store: Arc<dyn SessionStore>) -> Arc<dyn SessionStore> {
    Arc::new(GuardedStore::new(store, Duration::from_secs(5)))
}

pub fn memory_store() -> Arc<dyn SessionStore> {
    guarded(Arc::new(MemoryStore::new()))
}

/// 临时目录中的 redb 存储；目录随返回的 TempDir 一起删除
pub fn temp_file_store() -> (TempDir, String) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("sessions.redb").to_string_lossy().into_owned();
    (dir, path)
}

pub fn open_file_store(path: &str) -> Arc<dyn SessionStore> {
    guarded(Arc::new(FileStore::open(path).expect("open file store")))
}

// ============================================================================
// 书籍构造
// ============================================================================

/// 一章一节，正文为 `text`，无其他文本
pub fn single_section_book(text: &str) -> Book {
    Book::new("").with_chapter(Chapter::new("ch1", "").with_section(Section::new("s1", None, text)))
}

/// 章节标题加 S1 / S1.1 嵌套
pub fn nested_book() -> Book {
    Book::new("").with_chapter(
        Chapter::new("ch1", "Chapter One").with_section(
            Section::new("s1", Some("Part One"), "Intro text").with_child(Section::new(
                "s1.1",
                Some("Subpart"),
                "Alpha",
            )),
        ),
    )
}

/// 恰好 10 个翻译单元：书名、章节标题、4 节各含标题和正文
pub fn ten_unit_book() -> Book {
    let mut chapter = Chapter::new("ch1", "The Chapter");
    for i in 1..=4 {
        chapter = chapter.with_section(Section::new(
            format!("s{}", i),
            Some(format!("Heading {}", i).as_str()),
            format!("Body text number {}.", i),
        ));
    }
    Book::new("The Book").with_chapter(chapter)
}

/// 多章节、多层嵌套，带图片和空白边距
pub fn rich_book() -> Book {
    let mut book = Book::new("War and Peace");
    book.description = "A long novel".to_string();
    book.authors = vec!["Leo Tolstoy".to_string()];
    for c in 1..=3 {
        let mut section = Section::new(format!("c{}s1", c), Some("Opening"), "  First paragraph.\n\nSecond one.  ");
        section.images.push(ebook_translator::book::Image {
            id: format!("img{}", c),
            media_type: "image/png".to_string(),
            data: "iVBORw0KGgo=".to_string(),
        });
        let section = section.with_child(Section::new(format!("c{}s1a", c), None, "Nested text."));
        book = book.with_chapter(
            Chapter::new(format!("c{}", c), format!("Chapter {}", c))
                .with_section(section)
                .with_section(Section::new(format!("c{}s2", c), None, "")),
        );
    }
    book
}
