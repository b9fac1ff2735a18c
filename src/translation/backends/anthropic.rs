//! Anthropic Messages API 适配器

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::http::{build_client, normalize_base_url, read_success_body};
use super::prompt::{clean_chat_output, system_prompt, user_prompt};
use super::{with_cancel, BackendRequest, TranslationBackend};
use crate::translation::config::BackendConfig;
use crate::translation::error::{TranslationError, TranslationResult};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    system: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

pub struct AnthropicBackend {
    model: String,
    base_url: String,
    api_key: String,
    max_tokens: u32,
    temperature: f32,
    max_input_bytes: Option<usize>,
    client: reqwest::Client,
}

impl AnthropicBackend {
    pub fn from_config(config: &BackendConfig, timeout: Duration) -> TranslationResult<Self> {
        let api_key = config.resolved_api_key().ok_or_else(|| {
            TranslationError::ConfigError(format!("后端 {} (anthropic) 缺少 API 密钥", config.id))
        })?;

        Ok(Self {
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: normalize_base_url(config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL))?,
            api_key,
            max_tokens: config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: config.temperature.unwrap_or(0.3),
            max_input_bytes: config.max_input_bytes,
            client: build_client(timeout)?,
        })
    }

    async fn send(&self, request: &BackendRequest) -> TranslationResult<String> {
        let system = system_prompt(request);
        let user = user_prompt(request);
        let body = MessagesRequest {
            model: &self.model,
            system: &system,
            messages: vec![Message {
                role: "user",
                content: &user,
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let raw = read_success_body("anthropic", response).await?;
        let parsed: MessagesResponse = serde_json::from_str(&raw)
            .map_err(|e| TranslationError::ProviderError(format!("anthropic 响应格式无效: {}", e)))?;

        if parsed.stop_reason.as_deref() == Some("max_tokens") {
            return Err(TranslationError::SizeExceeded("anthropic 输出达到 max_tokens".to_string()));
        }

        let text: String = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect();
        let cleaned = clean_chat_output(&text);
        if cleaned.is_empty() {
            return Err(TranslationError::ProviderError("anthropic 返回了空译文".to_string()));
        }
        Ok(cleaned)
    }
}

#[async_trait]
impl TranslationBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
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
        with_cancel(cancel, "anthropic 请求已取消", self.send(request)).await
    }
}
