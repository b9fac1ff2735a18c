//! OpenAI 兼容的 Chat Completions 适配器
//!
//! OpenAI、DeepSeek、智谱与 Ollama 共用同一协议，只是默认地址和模型不同。

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::http::{build_client, normalize_base_url, read_success_body};
use super::prompt::{clean_chat_output, system_prompt, user_prompt};
use super::{with_cancel, BackendRequest, TranslationBackend};
use crate::translation::config::BackendConfig;
use crate::translation::error::{TranslationError, TranslationResult};

/// 提供商默认值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderDefaults {
    pub base_url: &'static str,
    pub model: &'static str,
    pub requires_api_key: bool,
}

pub fn provider_defaults(provider: &str) -> Option<ProviderDefaults> {
    let defaults = match provider {
        "openai" => ProviderDefaults {
            base_url: "https://api.openai.com/v1",
            model: "gpt-4o-mini",
            requires_api_key: true,
        },
        "deepseek" => ProviderDefaults {
            base_url: "https://api.deepseek.com/v1",
            model: "deepseek-chat",
            requires_api_key: true,
        },
        "zhipu" => ProviderDefaults {
            base_url: "https://open.bigmodel.cn/api/paas/v4",
            model: "glm-4",
            requires_api_key: true,
        },
        "ollama" => ProviderDefaults {
            base_url: "http://localhost:11434/v1",
            model: "llama3",
            requires_api_key: false,
        },
        _ => return None,
    };
    Some(defaults)
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiCompatibleBackend {
    provider: String,
    model: String,
    base_url: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: Option<u32>,
    max_input_bytes: Option<usize>,
    client: reqwest::Client,
}

impl OpenAiCompatibleBackend {
    pub fn from_config(config: &BackendConfig, timeout: Duration) -> TranslationResult<Self> {
        let defaults = provider_defaults(&config.provider).ok_or_else(|| {
            TranslationError::ConfigError(format!(
                "{} 不是 OpenAI 兼容的提供商",
                config.provider
            ))
        })?;

        let api_key = config.resolved_api_key();
        if defaults.requires_api_key && api_key.is_none() {
            return Err(TranslationError::ConfigError(format!(
                "后端 {} ({}) 缺少 API 密钥",
                config.id, config.provider
            )));
        }

        let base_url = normalize_base_url(config.base_url.as_deref().unwrap_or(defaults.base_url))?;

        Ok(Self {
            provider: config.provider.clone(),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| defaults.model.to_string()),
            base_url,
            api_key,
            temperature: config.temperature.unwrap_or(0.3),
            max_tokens: config.max_tokens,
            max_input_bytes: config.max_input_bytes,
            client: build_client(timeout)?,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn send(&self, request: &BackendRequest) -> TranslationResult<String> {
        let system = system_prompt(request);
        let user = user_prompt(request);
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &system,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: false,
        };

        let mut builder = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let raw = read_success_body(&self.provider, response).await?;
        let parsed: ChatResponse = serde_json::from_str(&raw).map_err(|e| {
            TranslationError::ProviderError(format!("{} 响应格式无效: {}", self.provider, e))
        })?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| {
            TranslationError::ProviderError(format!("{} 响应中没有 choices", self.provider))
        })?;

        match choice.finish_reason.as_deref() {
            Some("content_filter") => {
                return Err(TranslationError::ContentPolicy(format!(
                    "{} 拦截了该内容",
                    self.provider
                )))
            }
            Some("length") => {
                return Err(TranslationError::SizeExceeded(format!(
                    "{} 输出被截断",
                    self.provider
                )))
            }
            _ => {}
        }

        let content = choice.message.content.unwrap_or_default();
        let cleaned = clean_chat_output(&content);
        if cleaned.is_empty() {
            return Err(TranslationError::ProviderError(format!(
                "{} 返回了空译文",
                self.provider
            )));
        }
        Ok(cleaned)
    }
}

#[async_trait]
impl TranslationBackend for OpenAiCompatibleBackend {
    fn name(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn max_input_bytes(&self) -> Option<usize> {
        self.max_input_bytes
    }

    async fn translate(
        &self,
        request: &BackendRequest,
        cancel: &CancellationToken,
    ) -> TranslationResult<String> {
        with_cancel(cancel, &format!("{} 请求已取消", self.provider), self.send(request)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_per_provider() {
        assert_eq!(provider_defaults("deepseek").unwrap().model, "deepseek-chat");
        assert_eq!(provider_defaults("zhipu").unwrap().model, "glm-4");
        assert!(!provider_defaults("ollama").unwrap().requires_api_key);
        assert!(provider_defaults("anthropic").is_none());
    }

    #[test]
    fn test_key_required_for_remote_providers() {
        let mut config = BackendConfig::new("z", "zhipu");
        config.api_key = None;
        if std::env::var("ZHIPU_API_KEY").is_err() {
            assert!(OpenAiCompatibleBackend::from_config(&config, Duration::from_secs(5)).is_err());
        }

        config.api_key = Some("sk-test".into());
        config.base_url = Some("https://example.com/v4/".into());
        let backend = OpenAiCompatibleBackend::from_config(&config, Duration::from_secs(5)).unwrap();
        assert_eq!(backend.endpoint(), "https://example.com/v4/chat/completions");
        assert_eq!(backend.model(), "glm-4");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_network_error() {
        let mut config = BackendConfig::new("o", "ollama");
        config.base_url = Some("http://127.0.0.1:9/v1".into());
        let backend = OpenAiCompatibleBackend::from_config(&config, Duration::from_secs(2)).unwrap();
        let err = backend
            .translate(&BackendRequest::new("x", "en", "fr"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
