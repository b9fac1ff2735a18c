//! 翻译后端
//!
//! 每个提供商是一个实现 [`TranslationBackend`] 的适配器，负责自己的提示词构造和
//! 协议细节。[`create_backend`] 按配置构造适配器，[`BackendClient`] 在其外层加上
//! 重试与超长输入分块。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::distributed::WorkerPool;
use crate::translation::config::{BackendConfig, RetrySettings};
use crate::translation::error::{TranslationError, TranslationResult};
use crate::translation::events::EventBus;

pub mod anthropic;
pub mod client;
pub mod dictionary;
pub mod http;
pub mod llamacpp;
pub mod openai;
pub mod prompt;

pub use anthropic::AnthropicBackend;
pub use client::BackendClient;
pub use dictionary::DictionaryBackend;
pub use llamacpp::LlamaCppBackend;
pub use openai::OpenAiCompatibleBackend;

/// 可在配置中使用的提供商名称
pub const KNOWN_PROVIDERS: &[&str] = &[
    "openai",
    "anthropic",
    "zhipu",
    "deepseek",
    "ollama",
    "llamacpp",
    "dictionary",
    "remote",
];

/// 后端运行位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// 远程 HTTP 服务或远程工作节点
    Remote,
    /// 本机进程内或子进程推理，受本机内存约束
    Local,
}

/// 单次翻译请求
#[derive(Debug, Clone, PartialEq)]
pub struct BackendRequest {
    pub text: String,
    pub context_hint: Option<String>,
    pub source_lang: String,
    pub target_lang: String,
}

impl BackendRequest {
    pub fn new(
        text: impl Into<String>,
        source_lang: impl Into<String>,
        target_lang: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            context_hint: None,
            source_lang: source_lang.into(),
            target_lang: target_lang.into(),
        }
    }

    pub fn with_context_hint(mut self, hint: Option<&str>) -> Self {
        self.context_hint = hint.filter(|h| !h.trim().is_empty()).map(str::to_string);
        self
    }

    /// 同一上下文下替换文本，分块时使用
    pub fn with_text(&self, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..self.clone()
        }
    }
}

/// 统一的后端契约
#[async_trait]
pub trait TranslationBackend: Send + Sync {
    /// 提供商名称，也用作缓存键的一部分
    fn name(&self) -> &str;

    fn model(&self) -> &str;

    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    /// 单次请求允许的最大输入字节数，超过则客户端先分块
    fn max_input_bytes(&self) -> Option<usize> {
        None
    }

    /// 本地模型运行所需的最小内存（字节）
    fn min_ram_bytes(&self) -> Option<u64> {
        None
    }

    /// 翻译文本；取消令牌触发后须在有限时间内返回 `cancelled`
    async fn translate(
        &self,
        request: &BackendRequest,
        cancel: &CancellationToken,
    ) -> TranslationResult<String>;
}

/// 令牌取消时放弃 `fut` 并返回 `cancelled`
pub async fn with_cancel<T, F>(cancel: &CancellationToken, what: &str, fut: F) -> TranslationResult<T>
where
    F: Future<Output = TranslationResult<T>>,
{
    if cancel.is_cancelled() {
        return Err(TranslationError::Cancelled(what.to_string()));
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(TranslationError::Cancelled(what.to_string())),
        result = fut => result,
    }
}

/// 按配置构造后端适配器
///
/// `remote` 提供商需要工作节点池，未提供时报配置错误。
pub fn create_backend(
    config: &BackendConfig,
    default_timeout: Duration,
    pool: Option<&Arc<WorkerPool>>,
) -> TranslationResult<Arc<dyn TranslationBackend>> {
    let timeout = config.timeout(default_timeout);
    let backend: Arc<dyn TranslationBackend> = match config.provider.as_str() {
        "openai" | "deepseek" | "zhipu" | "ollama" => {
            Arc::new(OpenAiCompatibleBackend::from_config(config, timeout)?)
        }
        "anthropic" => Arc::new(AnthropicBackend::from_config(config, timeout)?),
        "llamacpp" => Arc::new(LlamaCppBackend::from_config(config)?),
        "dictionary" => Arc::new(DictionaryBackend::from_config(config)),
        "remote" => {
            let pool = pool.ok_or_else(|| {
                TranslationError::ConfigError(format!(
                    "后端 {} 使用 remote 提供商，但未启用分布式工作节点",
                    config.id
                ))
            })?;
            Arc::new(crate::distributed::RemoteWorkerBackend::new(
                Arc::clone(pool),
                config.model.clone().unwrap_or_else(|| "default".to_string()),
            ))
        }
        other => {
            return Err(TranslationError::ConfigError(format!(
                "未知的提供商: {}（可选: {}）",
                other,
                KNOWN_PROVIDERS.join(", ")
            )))
        }
    };

    tracing::debug!(
        backend_id = %config.id,
        provider = %backend.name(),
        model = %backend.model(),
        "后端已创建"
    );
    Ok(backend)
}

/// 构造后端并包上重试与分块客户端
pub fn create_client(
    config: &BackendConfig,
    default_timeout: Duration,
    retry: &RetrySettings,
    events: EventBus,
    pool: Option<&Arc<WorkerPool>>,
) -> TranslationResult<BackendClient> {
    let backend = create_backend(config, default_timeout, pool)?;
    Ok(BackendClient::new(backend, retry.clone(), events))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_known_backends() {
        let timeout = Duration::from_secs(5);
        let dict = create_backend(&BackendConfig::new("d", "dictionary"), timeout, None).unwrap();
        assert_eq!(dict.name(), "dictionary");

        let ollama = create_backend(&BackendConfig::new("o", "ollama"), timeout, None).unwrap();
        assert_eq!(ollama.name(), "ollama");
        assert_eq!(ollama.model(), "llama3");
    }

    #[test]
    fn test_unknown_and_remote_without_pool() {
        let timeout = Duration::from_secs(5);
        assert!(create_backend(&BackendConfig::new("x", "babelfish"), timeout, None).is_err());
        assert!(create_backend(&BackendConfig::new("r", "remote"), timeout, None).is_err());
    }

    #[tokio::test]
    async fn test_with_cancel_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let result = with_cancel(&token, "test", async { Ok::<_, TranslationError>(1) }).await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
