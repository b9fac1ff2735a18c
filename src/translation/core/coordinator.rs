//! LLM 协调器
//!
//! 维护后端实例注册表，按能力和优先级为每个翻译单元选择实例，跟踪实例健康
//! 状态，并在失败时回退到下一个候选。缓存探测也在这里进行：缓存键包含
//! 被选中实例的提供商与模型。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use metrics::counter;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::distributed::WorkerPool;
use crate::hardware::HardwareCapabilities;
use crate::translation::backends::{create_client, BackendClient, BackendKind, BackendRequest};
use crate::translation::config::{constants, BackendConfig, CoordinatorSettings, TranslatorConfig};
use crate::translation::error::{ErrorClass, TranslationError, TranslationResult};
use crate::translation::events::{Event, EventBus, EventType};
use crate::translation::storage::{CacheKey, TranslationCache};

// ============================================================================
// 健康状态
// ============================================================================

/// 实例健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendHealth {
    Available,
    /// 最近失败过，仍参与选择
    Degraded,
    /// 熔断打开，冷却结束前不参与选择
    Unavailable,
}

impl BackendHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendHealth::Available => "available",
            BackendHealth::Degraded => "degraded",
            BackendHealth::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug)]
struct HealthState {
    health: BackendHealth,
    consecutive_failures: u32,
    last_error: Option<String>,
    opened_at: Option<Instant>,
}

impl HealthState {
    fn new() -> Self {
        Self {
            health: BackendHealth::Available,
            consecutive_failures: 0,
            last_error: None,
            opened_at: None,
        }
    }
}

/// 实例状态快照
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub id: String,
    pub provider: String,
    pub model: String,
    pub priority: i32,
    pub concurrency_limit: usize,
    pub health: BackendHealth,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub in_flight: usize,
    pub supports_languages: Option<Vec<String>>,
}

// ============================================================================
// 令牌桶限速
// ============================================================================

/// 单实例令牌桶，容量为一秒的请求数
#[derive(Debug)]
struct RateLimiter {
    rate: f64,
    state: Mutex<(f64, Instant)>,
}

impl RateLimiter {
    fn new(requests_per_second: f64) -> Self {
        let rate = requests_per_second.max(0.001);
        Self {
            rate,
            state: Mutex::new((rate.max(1.0), Instant::now())),
        }
    }

    /// 需要等待的时长，`None` 表示已取得令牌
    fn try_take(&self) -> Option<Duration> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (tokens, last) = &mut *state;
        let now = Instant::now();
        *tokens = (*tokens + now.duration_since(*last).as_secs_f64() * self.rate).min(self.rate.max(1.0));
        *last = now;
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            None
        } else {
            Some(Duration::from_secs_f64((1.0 - *tokens) / self.rate))
        }
    }

    async fn acquire(&self, cancel: &CancellationToken) -> TranslationResult<()> {
        while let Some(wait) = self.try_take() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(TranslationError::Cancelled("限速等待已取消".to_string()));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
        Ok(())
    }
}

// ============================================================================
// 后端实例
// ============================================================================

/// 已注册的后端实例
pub struct BackendInstance {
    id: String,
    priority: i32,
    concurrency_limit: usize,
    supports_languages: Option<Vec<String>>,
    client: BackendClient,
    permits: Semaphore,
    in_flight: AtomicUsize,
    limiter: Option<RateLimiter>,
    state: Mutex<HealthState>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl BackendInstance {
    pub fn new(id: impl Into<String>, priority: i32, concurrency_limit: usize, client: BackendClient) -> Self {
        let concurrency_limit = concurrency_limit.max(1);
        Self {
            id: id.into(),
            priority,
            concurrency_limit,
            supports_languages: None,
            client,
            permits: Semaphore::new(concurrency_limit),
            in_flight: AtomicUsize::new(0),
            limiter: None,
            state: Mutex::new(HealthState::new()),
        }
    }

    pub fn from_config(config: &BackendConfig, client: BackendClient) -> Self {
        let mut instance = Self::new(
            config.id.clone(),
            config.priority,
            config.concurrency_limit,
            client,
        );
        instance.supports_languages = config.supports_languages.clone();
        instance.limiter = config
            .requests_per_second
            .filter(|rps| *rps > 0.0)
            .map(RateLimiter::new);
        instance
    }

    pub fn with_languages(mut self, languages: &[&str]) -> Self {
        self.supports_languages = Some(languages.iter().map(|l| l.to_string()).collect());
        self
    }

    pub fn with_rate_limit(mut self, requests_per_second: f64) -> Self {
        self.limiter = Some(RateLimiter::new(requests_per_second));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn provider(&self) -> &str {
        self.client.name()
    }

    pub fn model(&self) -> &str {
        self.client.model()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, HealthState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn health(&self) -> BackendHealth {
        self.lock_state().health
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn supports(&self, source_lang: &str, target_lang: &str) -> bool {
        match &self.supports_languages {
            None => true,
            Some(langs) => {
                let has = |code: &str| langs.iter().any(|l| l.eq_ignore_ascii_case(code));
                has(source_lang) && has(target_lang)
            }
        }
    }

    /// 熔断打开的实例在冷却结束后重新参与选择（半开），下一次成功时恢复
    fn is_eligible(&self, cooldown: Duration) -> bool {
        let state = self.lock_state();
        match state.health {
            BackendHealth::Unavailable => state
                .opened_at
                .map(|opened| opened.elapsed() >= cooldown)
                .unwrap_or(false),
            _ => true,
        }
    }

    fn record_success(&self) {
        let mut state = self.lock_state();
        if state.health != BackendHealth::Available {
            tracing::info!(backend_id = %self.id, "后端恢复可用");
        }
        *state = HealthState::new();
    }

    fn record_failure(&self, err: &TranslationError, threshold: u32) -> BackendHealth {
        let mut state = self.lock_state();
        state.consecutive_failures += 1;
        state.last_error = Some(err.to_string());
        if state.consecutive_failures >= threshold.max(1) {
            if state.health != BackendHealth::Unavailable {
                tracing::warn!(
                    backend_id = %self.id,
                    failures = state.consecutive_failures,
                    "连续失败达到阈值，熔断打开"
                );
            }
            state.health = BackendHealth::Unavailable;
            state.opened_at = Some(Instant::now());
        } else {
            state.health = BackendHealth::Degraded;
        }
        state.health
    }

    fn mark_unavailable(&self, reason: &str) {
        let mut state = self.lock_state();
        state.health = BackendHealth::Unavailable;
        state.last_error = Some(reason.to_string());
        state.opened_at = Some(Instant::now());
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let state = self.lock_state();
        InstanceSnapshot {
            id: self.id.clone(),
            provider: self.provider().to_string(),
            model: self.model().to_string(),
            priority: self.priority,
            concurrency_limit: self.concurrency_limit,
            health: state.health,
            consecutive_failures: state.consecutive_failures,
            last_error: state.last_error.clone(),
            in_flight: self.in_flight(),
            supports_languages: self.supports_languages.clone(),
        }
    }

    /// 在并发与速率约束下调用后端
    async fn call(
        &self,
        request: &BackendRequest,
        session_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> TranslationResult<String> {
        let _permit = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(TranslationError::Cancelled(format!("等待后端 {} 已取消", self.id)));
            }
            permit = self.permits.acquire() => permit.map_err(|_| {
                TranslationError::InternalError(format!("后端 {} 的并发信号量已关闭", self.id))
            })?,
        };

        if let Some(limiter) = &self.limiter {
            limiter.acquire(cancel).await?;
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);
        self.client.translate(request, session_id, cancel).await
    }
}

// ============================================================================
// 协调器
// ============================================================================

/// 单元翻译结果
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutcome {
    pub text: String,
    pub backend_id: String,
    pub provider: String,
    pub model: String,
    pub cached: bool,
    /// 由非首选实例完成
    pub fallback: bool,
}

/// 一次调用的上下文
#[derive(Debug, Clone, Copy, Default)]
pub struct CallContext<'a> {
    pub session_id: Option<&'a str>,
    pub unit_id: Option<&'a str>,
}

pub struct Coordinator {
    instances: Vec<Arc<BackendInstance>>,
    settings: CoordinatorSettings,
    events: EventBus,
    cache: Option<Arc<TranslationCache>>,
    host: Option<HardwareCapabilities>,
}

impl Coordinator {
    pub fn new(settings: CoordinatorSettings, events: EventBus) -> Self {
        Self {
            instances: Vec::new(),
            settings,
            events,
            cache: None,
            host: None,
        }
    }

    /// 按配置创建所有后端实例
    pub fn from_config(
        config: &TranslatorConfig,
        events: EventBus,
        pool: Option<&Arc<WorkerPool>>,
    ) -> TranslationResult<Self> {
        let mut coordinator = Self::new(config.coordinator.clone(), events.clone());
        let timeout = config.translation.backend_timeout();
        for backend in config.effective_backends() {
            let client = create_client(&backend, timeout, &config.coordinator.retry, events.clone(), pool)?;
            coordinator.register(BackendInstance::from_config(&backend, client))?;
        }
        Ok(coordinator)
    }

    pub fn with_cache(mut self, cache: Arc<TranslationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// 设置本机硬件能力，用于本地模型的内存检查
    pub fn with_host(mut self, host: HardwareCapabilities) -> Self {
        self.host = Some(host);
        self
    }

    pub fn register(&mut self, instance: BackendInstance) -> TranslationResult<()> {
        if self.instances.iter().any(|i| i.id == instance.id) {
            return Err(TranslationError::ConfigError(format!(
                "后端 id 重复: {}",
                instance.id
            )));
        }
        tracing::info!(
            backend_id = %instance.id,
            provider = %instance.provider(),
            model = %instance.model(),
            priority = instance.priority,
            "注册后端实例"
        );
        self.instances.push(Arc::new(instance));
        Ok(())
    }

    pub fn instance(&self, id: &str) -> Option<&Arc<BackendInstance>> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn health(&self, id: &str) -> Option<BackendHealth> {
        self.instance(id).map(|i| i.health())
    }

    pub fn snapshot(&self) -> Vec<InstanceSnapshot> {
        self.instances.iter().map(|i| i.snapshot()).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn cache(&self) -> Option<&Arc<TranslationCache>> {
        self.cache.as_ref()
    }

    /// 首选实例的提供商与模型，会话记录中使用
    pub fn preferred(&self, source_lang: &str, target_lang: &str) -> Option<(String, String)> {
        self.candidates(source_lang, target_lang)
            .first()
            .map(|i| (i.provider().to_string(), i.model().to_string()))
    }

    /// 并发单元数缺省值：min(8, 各实例并发上限之和)
    pub fn default_fan_out(&self) -> usize {
        let total: usize = self.instances.iter().map(|i| i.concurrency_limit).sum();
        total.clamp(1, constants::MAX_DEFAULT_FAN_OUT)
    }

    pub fn fan_out(&self) -> usize {
        self.settings
            .fan_out
            .filter(|n| *n > 0)
            .unwrap_or_else(|| self.default_fan_out())
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(self.settings.cooldown_secs)
    }

    /// 候选实例，按选择顺序排列
    ///
    /// 过滤掉熔断中的和不支持该语言对的实例，然后依次按：首选提供商、
    /// 优先级（数字小者优先）、当前进行中请求数、id 排序。
    pub fn candidates(&self, source_lang: &str, target_lang: &str) -> Vec<Arc<BackendInstance>> {
        let cooldown = self.cooldown();
        let primary = self.settings.primary_provider.as_deref();

        let mut candidates: Vec<(bool, i32, usize, Arc<BackendInstance>)> = self
            .instances
            .iter()
            .filter(|i| i.supports(source_lang, target_lang) && i.is_eligible(cooldown))
            .map(|i| {
                let not_primary = primary.map_or(true, |p| p != i.provider());
                (not_primary, i.priority, i.in_flight(), Arc::clone(i))
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
                .then_with(|| a.3.id.cmp(&b.3.id))
        });
        candidates.into_iter().map(|(_, _, _, i)| i).collect()
    }

    /// 本地模型的内存检查，失败时实例标记为不可用
    fn check_fit(&self, instance: &BackendInstance) -> TranslationResult<()> {
        if instance.client.kind() != BackendKind::Local {
            return Ok(());
        }
        let (Some(host), Some(min_ram)) = (&self.host, instance.client.min_ram_bytes()) else {
            return Ok(());
        };
        if host.fits(min_ram) {
            return Ok(());
        }
        let reason = format!(
            "模型 {} 需要 {} MB 内存，本机可用 {} MB",
            instance.model(),
            min_ram / (1024 * 1024),
            host.available_ram / (1024 * 1024)
        );
        instance.mark_unavailable(&reason);
        Err(TranslationError::NoBackendAvailable(reason))
    }

    /// 翻译一个单元，失败时按顺序回退
    pub async fn translate(
        &self,
        request: &BackendRequest,
        ctx: CallContext<'_>,
        cancel: &CancellationToken,
    ) -> TranslationResult<UnitOutcome> {
        if request.text.trim().is_empty() {
            return Err(TranslationError::InvalidInput("待翻译文本为空".to_string()));
        }

        let candidates = self.candidates(&request.source_lang, &request.target_lang);
        if candidates.is_empty() {
            return Err(TranslationError::NoBackendAvailable(format!(
                "没有支持 {} → {} 的可用后端",
                request.source_lang, request.target_lang
            )));
        }

        let mut attempts = 0;
        let mut last_error = None;

        for instance in candidates {
            if cancel.is_cancelled() {
                return Err(TranslationError::Cancelled("翻译已取消".to_string()));
            }
            attempts += 1;

            self.events.publish(
                Event::new(EventType::BackendSelected, format!("选择后端 {}", instance.id))
                    .with_session(ctx.session_id)
                    .with_data("backend_id", instance.id.as_str())
                    .with_data("provider", instance.provider())
                    .with_data("model", instance.model())
                    .with_data("unit_id", ctx.unit_id.unwrap_or_default())
                    .with_data("attempt", attempts as u64),
            );

            if let Err(err) = self.check_fit(&instance) {
                tracing::warn!(
                    backend_id = %instance.id,
                    provider = %instance.provider(),
                    error_class = %err.category(),
                    "本地模型内存不足，跳过: {}",
                    err
                );
                self.events.publish(
                    Event::new(EventType::BackendFailed, err.to_string())
                        .with_session(ctx.session_id)
                        .with_data("backend_id", instance.id.as_str())
                        .with_data("provider", instance.provider())
                        .with_data("unit_id", ctx.unit_id.unwrap_or_default())
                        .with_data("error_class", err.category())
                        .with_data("health", BackendHealth::Unavailable.as_str()),
                );
                last_error = Some(err);
                continue;
            }

            match self.translate_with(&instance, request, ctx, cancel).await {
                Ok((text, cached)) => {
                    // 只有真正调用后端成功才关闭熔断
                    if !cached {
                        instance.record_success();
                    }
                    let fallback = attempts > 1;
                    if fallback {
                        counter!("translator_fallbacks_total").increment(1);
                        self.events.publish(
                            Event::new(
                                EventType::FallbackUsed,
                                format!("回退到后端 {}", instance.id),
                            )
                            .with_session(ctx.session_id)
                            .with_data("backend_id", instance.id.as_str())
                            .with_data("provider", instance.provider())
                            .with_data("unit_id", ctx.unit_id.unwrap_or_default())
                            .with_data("attempts", attempts as u64),
                        );
                    }
                    return Ok(UnitOutcome {
                        text,
                        backend_id: instance.id.clone(),
                        provider: instance.provider().to_string(),
                        model: instance.model().to_string(),
                        cached,
                        fallback,
                    });
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    // 超长是输入本身的问题，不计入实例健康
                    let health = if err.class() == ErrorClass::SizeExceeded {
                        instance.health()
                    } else {
                        instance.record_failure(&err, self.settings.failure_threshold)
                    };
                    counter!("translator_backend_failures_total", "provider" => instance.provider().to_string())
                        .increment(1);
                    tracing::warn!(
                        session_id = ctx.session_id.unwrap_or_default(),
                        unit_id = ctx.unit_id.unwrap_or_default(),
                        provider = %instance.provider(),
                        backend_id = %instance.id,
                        error_class = %err.category(),
                        health = health.as_str(),
                        "后端调用失败: {}",
                        err
                    );
                    self.events.publish(
                        Event::new(EventType::BackendFailed, err.to_string())
                            .with_session(ctx.session_id)
                            .with_data("backend_id", instance.id.as_str())
                            .with_data("provider", instance.provider())
                            .with_data("unit_id", ctx.unit_id.unwrap_or_default())
                            .with_data("error_class", err.category())
                            .with_data("health", health.as_str()),
                    );
                    last_error = Some(err);
                }
            }
        }

        let last = last_error.unwrap_or_else(|| {
            TranslationError::NoBackendAvailable("没有候选后端".to_string())
        });
        Err(TranslationError::FallbackExhausted {
            attempts,
            last: Box::new(last),
        })
    }

    async fn translate_with(
        &self,
        instance: &BackendInstance,
        request: &BackendRequest,
        ctx: CallContext<'_>,
        cancel: &CancellationToken,
    ) -> TranslationResult<(String, bool)> {
        match &self.cache {
            Some(cache) => {
                let key = CacheKey::new(
                    &request.text,
                    &request.source_lang,
                    &request.target_lang,
                    instance.provider(),
                    instance.model(),
                );
                cache
                    .get_or_translate(&key, ctx.session_id, || {
                        instance.call(request, ctx.session_id, cancel)
                    })
                    .await
            }
            None => instance
                .call(request, ctx.session_id, cancel)
                .await
                .map(|text| (text, false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::translation::backends::{DictionaryBackend, TranslationBackend};
    use crate::translation::config::RetrySettings;

    struct FixedBackend {
        name: &'static str,
        result: Result<&'static str, TranslationError>,
        kind: BackendKind,
        min_ram: Option<u64>,
        calls: AtomicUsize,
    }

    impl FixedBackend {
        fn ok(name: &'static str, text: &'static str) -> Self {
            Self {
                name,
                result: Ok(text),
                kind: BackendKind::Remote,
                min_ram: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn err(name: &'static str, err: TranslationError) -> Self {
            Self {
                result: Err(err),
                ..Self::ok(name, "")
            }
        }
    }

    #[async_trait]
    impl TranslationBackend for FixedBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn model(&self) -> &str {
            "m"
        }

        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn min_ram_bytes(&self) -> Option<u64> {
            self.min_ram
        }

        async fn translate(
            &self,
            _request: &BackendRequest,
            _cancel: &CancellationToken,
        ) -> TranslationResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone().map(str::to_string)
        }
    }

    fn instance(id: &str, priority: i32, backend: Arc<dyn TranslationBackend>) -> BackendInstance {
        let retry = RetrySettings {
            max_attempts: 1,
            ..RetrySettings::default()
        };
        BackendInstance::new(id, priority, 2, BackendClient::new(backend, retry, EventBus::new()))
    }

    fn request() -> BackendRequest {
        BackendRequest::new("Hello", "en", "fr")
    }

    #[tokio::test]
    async fn test_fallback_marks_failed_instance_degraded() {
        let events = EventBus::new();
        let all = events.subscribe_all();
        let mut coordinator = Coordinator::new(CoordinatorSettings::default(), events);
        coordinator
            .register(instance(
                "A",
                1,
                Arc::new(FixedBackend::err("pa", TranslationError::AuthError("401".into()))),
            ))
            .unwrap();
        coordinator
            .register(instance("B", 2, Arc::new(FixedBackend::ok("pb", "OK"))))
            .unwrap();

        let outcome = coordinator
            .translate(&request(), CallContext::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.text, "OK");
        assert_eq!(outcome.backend_id, "B");
        assert!(outcome.fallback);
        assert_eq!(coordinator.health("A"), Some(BackendHealth::Degraded));
        assert_eq!(coordinator.health("B"), Some(BackendHealth::Available));

        let events = all.drain();
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::BackendFailed && e.data_str("backend_id") == Some("A")));
        assert!(events
            .iter()
            .any(|e| e.event_type == EventType::FallbackUsed && e.data_str("backend_id") == Some("B")));
    }

    #[tokio::test]
    async fn test_circuit_opens_and_recovers_after_cooldown() {
        let settings = CoordinatorSettings {
            failure_threshold: 2,
            cooldown_secs: 0,
            ..CoordinatorSettings::default()
        };
        let mut coordinator = Coordinator::new(settings, EventBus::new());
        coordinator
            .register(instance(
                "A",
                1,
                Arc::new(FixedBackend::err("pa", TranslationError::NetworkError("down".into()))),
            ))
            .unwrap();

        let token = CancellationToken::new();
        for _ in 0..2 {
            let err = coordinator
                .translate(&request(), CallContext::default(), &token)
                .await
                .unwrap_err();
            assert!(matches!(err, TranslationError::FallbackExhausted { .. }));
            assert_eq!(err.category(), "fallback_exhausted:network");
        }
        assert_eq!(coordinator.health("A"), Some(BackendHealth::Unavailable));
        // 冷却为 0，立即半开
        assert_eq!(coordinator.candidates("en", "fr").len(), 1);
    }

    #[tokio::test]
    async fn test_open_circuit_excluded_during_cooldown() {
        let settings = CoordinatorSettings {
            failure_threshold: 1,
            cooldown_secs: 60,
            ..CoordinatorSettings::default()
        };
        let mut coordinator = Coordinator::new(settings, EventBus::new());
        let flaky = Arc::new(FixedBackend::err("pa", TranslationError::ProviderError("500".into())));
        coordinator.register(instance("A", 1, flaky.clone())).unwrap();
        coordinator
            .register(instance("B", 2, Arc::new(FixedBackend::ok("pb", "ok"))))
            .unwrap();

        let token = CancellationToken::new();
        coordinator.translate(&request(), CallContext::default(), &token).await.unwrap();
        let outcome = coordinator.translate(&request(), CallContext::default(), &token).await.unwrap();
        assert_eq!(outcome.backend_id, "B");
        assert!(!outcome.fallback);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_candidate_ordering() {
        let settings = CoordinatorSettings {
            primary_provider: Some("pz".into()),
            ..CoordinatorSettings::default()
        };
        let mut coordinator = Coordinator::new(settings, EventBus::new());
        coordinator.register(instance("b", 1, Arc::new(FixedBackend::ok("px", "")))).unwrap();
        coordinator.register(instance("a", 1, Arc::new(FixedBackend::ok("px", "")))).unwrap();
        coordinator.register(instance("c", 0, Arc::new(FixedBackend::ok("px", "")))).unwrap();
        coordinator.register(instance("z", 9, Arc::new(FixedBackend::ok("pz", "")))).unwrap();
        coordinator
            .register(
                instance("ja", 0, Arc::new(FixedBackend::ok("px", ""))).with_languages(&["ja", "en"]),
            )
            .unwrap();

        let order: Vec<String> = coordinator
            .candidates("en", "fr")
            .iter()
            .map(|i| i.id().to_string())
            .collect();
        assert_eq!(order, vec!["z", "c", "a", "b"]);
        assert_eq!(coordinator.candidates("ja", "en").len(), 5);
    }

    #[test]
    fn test_duplicate_ids_rejected_and_fan_out() {
        let mut coordinator = Coordinator::new(CoordinatorSettings::default(), EventBus::new());
        let dict: Arc<dyn TranslationBackend> = Arc::new(DictionaryBackend::new());
        coordinator.register(instance("d", 1, dict.clone())).unwrap();
        assert!(coordinator.register(instance("d", 2, dict.clone())).is_err());
        assert_eq!(coordinator.default_fan_out(), 2);
        for i in 0..10 {
            coordinator.register(instance(&format!("d{}", i), 1, dict.clone())).unwrap();
        }
        assert_eq!(coordinator.default_fan_out(), 8);
    }

    #[tokio::test]
    async fn test_local_model_that_does_not_fit_is_skipped() {
        let mut local = FixedBackend::ok("llamacpp", "local");
        local.kind = BackendKind::Local;
        local.min_ram = Some(8 * crate::hardware::GB);
        let local = Arc::new(local);

        let host = HardwareCapabilities::from_probe("x86_64", 4, 4 * crate::hardware::GB, 4 * crate::hardware::GB, None);
        let mut coordinator = Coordinator::new(CoordinatorSettings::default(), EventBus::new()).with_host(host);
        coordinator.register(instance("local", 1, local.clone())).unwrap();
        coordinator
            .register(instance("remote", 2, Arc::new(FixedBackend::ok("openai", "remote"))))
            .unwrap();

        let outcome = coordinator
            .translate(&request(), CallContext::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.text, "remote");
        assert_eq!(local.calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.health("local"), Some(BackendHealth::Unavailable));
    }

    #[tokio::test]
    async fn test_cancelled_error_stops_fallback() {
        let mut coordinator = Coordinator::new(CoordinatorSettings::default(), EventBus::new());
        coordinator
            .register(instance(
                "A",
                1,
                Arc::new(FixedBackend::err("pa", TranslationError::Cancelled("stop".into()))),
            ))
            .unwrap();
        let b = Arc::new(FixedBackend::ok("pb", "OK"));
        coordinator.register(instance("B", 2, b.clone())).unwrap();

        let err = coordinator
            .translate(&request(), CallContext::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(b.calls.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.health("A"), Some(BackendHealth::Available));
    }

    #[tokio::test]
    async fn test_cache_hit_skips_backend() {
        let events = EventBus::new();
        let cache = Arc::new(TranslationCache::in_memory(events.clone()));
        let backend = Arc::new(FixedBackend::ok("pa", "Bonjour"));
        let mut coordinator = Coordinator::new(CoordinatorSettings::default(), events).with_cache(cache);
        coordinator.register(instance("A", 1, backend.clone())).unwrap();

        let token = CancellationToken::new();
        let first = coordinator.translate(&request(), CallContext::default(), &token).await.unwrap();
        let second = coordinator.translate(&request(), CallContext::default(), &token).await.unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.text, "Bonjour");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_keeps_failing_instance_degraded() {
        let events = EventBus::new();
        let cache = Arc::new(TranslationCache::in_memory(events.clone()));
        cache
            .put(&CacheKey::new("cached", "en", "fr", "pa", "m"), "en cache")
            .await
            .unwrap();

        let failing = Arc::new(FixedBackend::err("pa", TranslationError::AuthError("401".into())));
        let mut coordinator = Coordinator::new(CoordinatorSettings::default(), events).with_cache(cache);
        coordinator.register(instance("A", 1, failing.clone())).unwrap();
        coordinator
            .register(instance("B", 2, Arc::new(FixedBackend::ok("pb", "OK"))))
            .unwrap();

        let token = CancellationToken::new();
        coordinator.translate(&request(), CallContext::default(), &token).await.unwrap();
        assert_eq!(coordinator.health("A"), Some(BackendHealth::Degraded));

        let hit = coordinator
            .translate(&BackendRequest::new("cached", "en", "fr"), CallContext::default(), &token)
            .await
            .unwrap();
        assert!(hit.cached);
        assert_eq!(hit.backend_id, "A");
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.health("A"), Some(BackendHealth::Degraded));
    }

    #[test]
    fn test_rate_limiter_refills() {
        let limiter = RateLimiter::new(1.0);
        assert!(limiter.try_take().is_none());
        let wait = limiter.try_take().unwrap();
        assert!(wait <= Duration::from_secs(1));
    }
}
