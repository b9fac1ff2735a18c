//! 后端客户端
//!
//! 在适配器外加两层处理：暂时性故障的指数退避重试，以及输入超出上下文时
//! 沿段落/句子边界切分后逐块翻译。

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use metrics::counter;
use tokio_util::sync::CancellationToken;

use super::{BackendKind, BackendRequest, TranslationBackend};
use crate::translation::config::RetrySettings;
use crate::translation::error::{ErrorClass, TranslationError, TranslationResult};
use crate::translation::events::{Event, EventBus, EventType};
use crate::translation::pipeline::chunker;

/// 包装单个后端的客户端
#[derive(Clone)]
pub struct BackendClient {
    backend: Arc<dyn TranslationBackend>,
    retry: RetrySettings,
    events: EventBus,
}

impl std::fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClient")
            .field("provider", &self.backend.name())
            .field("model", &self.backend.model())
            .finish()
    }
}

/// 拆出首尾空白，返回 (前缀, 核心, 后缀)
fn split_padding(raw: &str) -> (&str, &str, &str) {
    let core_start = raw.len() - raw.trim_start().len();
    let core_end = raw.trim_end().len();
    if core_end <= core_start {
        return (raw, "", "");
    }
    (&raw[..core_start], &raw[core_start..core_end], &raw[core_end..])
}

impl BackendClient {
    pub fn new(backend: Arc<dyn TranslationBackend>, retry: RetrySettings, events: EventBus) -> Self {
        Self {
            backend,
            retry,
            events,
        }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn model(&self) -> &str {
        self.backend.model()
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn min_ram_bytes(&self) -> Option<u64> {
        self.backend.min_ram_bytes()
    }

    pub fn backend(&self) -> &Arc<dyn TranslationBackend> {
        &self.backend
    }

    /// 翻译一段文本
    ///
    /// 超过后端声明的输入上限时先切分；后端返回 `size_exceeded` 时以一半的
    /// 上限重新切分，直到单个句子仍然超限为止。
    pub async fn translate(
        &self,
        request: &BackendRequest,
        session_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> TranslationResult<String> {
        self.translate_bounded(request, self.backend.max_input_bytes(), session_id, cancel)
            .await
    }

    fn translate_bounded<'a>(
        &'a self,
        request: &'a BackendRequest,
        limit: Option<usize>,
        session_id: Option<&'a str>,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, TranslationResult<String>> {
        async move {
            let len = request.text.len();
            if let Some(limit) = limit {
                if len > limit {
                    return self.translate_chunks(request, limit, session_id, cancel).await;
                }
            }

            match self.call_with_retry(request, cancel).await {
                Err(err) if err.class() == ErrorClass::SizeExceeded => {
                    let next = limit.unwrap_or(len).min(len) / 2;
                    tracing::debug!(
                        provider = %self.name(),
                        text_bytes = len,
                        next_limit = next,
                        "输入超出上下文，缩小分块上限"
                    );
                    self.translate_chunks(request, next.max(1), session_id, cancel)
                        .await
                }
                other => other,
            }
        }
        .boxed()
    }

    async fn translate_chunks(
        &self,
        request: &BackendRequest,
        limit: usize,
        session_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> TranslationResult<String> {
        let chunks = chunker::split(&request.text, limit);
        if chunks.len() <= 1 {
            return Err(TranslationError::SizeExceeded(format!(
                "{} 字节的单个句子超过 {} 字节上限，无法继续切分",
                request.text.len(),
                limit
            )));
        }

        self.events.publish(
            Event::new(EventType::ChunkSplit, format!("文本切分为 {} 块", chunks.len()))
                .with_session(session_id)
                .with_data("provider", self.name())
                .with_data("chunks", chunks.len() as u64)
                .with_data("max_bytes", limit as u64)
                .with_data("text_bytes", request.text.len() as u64),
        );

        let mut output = String::with_capacity(request.text.len());
        for chunk in &chunks {
            let (prefix, core, suffix) = split_padding(chunk);
            if core.is_empty() {
                output.push_str(chunk);
                continue;
            }
            let part = self
                .translate_bounded(&request.with_text(core), Some(limit), session_id, cancel)
                .await?;
            output.push_str(prefix);
            output.push_str(&part);
            output.push_str(suffix);
        }
        Ok(output)
    }

    async fn call_with_retry(
        &self,
        request: &BackendRequest,
        cancel: &CancellationToken,
    ) -> TranslationResult<String> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.backend.translate(request, cancel).await {
                Ok(text) => return Ok(text),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= max_attempts {
                return Err(err);
            }

            let delay = self.retry.delay_for(attempt - 1);
            counter!("translator_backend_retries_total", "provider" => self.name().to_string())
                .increment(1);
            tracing::warn!(
                provider = %self.name(),
                error_class = %err.category(),
                attempt,
                "后端调用失败，{}ms 后重试: {}",
                delay.as_millis(),
                err
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(TranslationError::Cancelled(format!("{} 重试等待已取消", self.name())));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// 按脚本依次返回结果的后端，脚本用尽后回显原文
    struct ScriptedBackend {
        limit: Option<usize>,
        reject_above: Option<usize>,
        script: Mutex<Vec<TranslationResult<String>>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<TranslationResult<String>>) -> Self {
            Self {
                limit: None,
                reject_above: None,
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TranslationBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn model(&self) -> &str {
            "m"
        }

        fn max_input_bytes(&self) -> Option<usize> {
            self.limit
        }

        async fn translate(
            &self,
            request: &BackendRequest,
            _cancel: &CancellationToken,
        ) -> TranslationResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.text.clone());
            if let Some(max) = self.reject_above {
                if request.text.len() > max {
                    return Err(TranslationError::SizeExceeded("context".into()));
                }
            }
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Ok(request.text.to_uppercase())
            } else {
                script.remove(0)
            }
        }
    }

    fn fast_retry() -> RetrySettings {
        RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1,
            factor: 2.0,
            max_delay_ms: 5,
        }
    }

    fn client(backend: Arc<ScriptedBackend>, events: EventBus) -> BackendClient {
        BackendClient::new(backend, fast_retry(), events)
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(TranslationError::NetworkError("reset".into())),
            Err(TranslationError::RateLimited("429".into())),
        ]));
        let client = client(Arc::clone(&backend), EventBus::new());
        let text = client
            .translate(&BackendRequest::new("ok", "en", "fr"), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "OK");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            Err(TranslationError::ProviderError("500".into())),
            Err(TranslationError::ProviderError("502".into())),
            Err(TranslationError::ProviderError("503".into())),
        ]));
        let client = client(Arc::clone(&backend), EventBus::new());
        let err = client
            .translate(&BackendRequest::new("x", "en", "fr"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Provider);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(TranslationError::AuthError(
            "401".into(),
        ))]));
        let client = client(Arc::clone(&backend), EventBus::new());
        let err = client
            .translate(&BackendRequest::new("x", "en", "fr"), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Auth);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_size_exceeded_splits_and_preserves_whitespace() {
        let mut backend = ScriptedBackend::new(Vec::new());
        backend.reject_above = Some(12);
        let backend = Arc::new(backend);
        let events = EventBus::new();
        let splits = events.subscribe(EventType::ChunkSplit);
        let client = client(Arc::clone(&backend), events);

        let text = client
            .translate(
                &BackendRequest::new("One. Two.\n\nThree. Four.", "en", "fr"),
                Some("s-1"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(text, "ONE. TWO.\n\nTHREE. FOUR.");
        let seen = backend.seen.lock().unwrap().clone();
        assert!(seen.iter().skip(1).all(|part| part.len() <= 12));
        let events = splits.drain();
        assert!(!events.is_empty());
        assert_eq!(events[0].session_id.as_deref(), Some("s-1"));
    }

    #[tokio::test]
    async fn test_declared_limit_splits_before_calling() {
        let mut backend = ScriptedBackend::new(Vec::new());
        backend.limit = Some(20);
        let backend = Arc::new(backend);
        let client = client(Arc::clone(&backend), EventBus::new());

        let text = client
            .translate(
                &BackendRequest::new("One. Two. Three. Four. Five. Six.", "en", "fr"),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(text, "ONE. TWO. THREE. FOUR. FIVE. SIX.");
        let seen = backend.seen.lock().unwrap().clone();
        assert!(seen.len() >= 2);
        assert!(seen.iter().all(|part| part.len() <= 20));
    }

    #[tokio::test]
    async fn test_single_oversize_sentence_fails() {
        let mut backend = ScriptedBackend::new(Vec::new());
        backend.reject_above = Some(4);
        let client = client(Arc::new(backend), EventBus::new());
        let err = client
            .translate(
                &BackendRequest::new("Unsplittable sentence", "en", "fr"),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::SizeExceeded);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(TranslationError::NetworkError(
            "reset".into(),
        ))]));
        let slow = RetrySettings {
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
            ..fast_retry()
        };
        let client = BackendClient::new(backend, slow, EventBus::new());
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = client
            .translate(&BackendRequest::new("x", "en", "fr"), None, &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
