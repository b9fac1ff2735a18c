//! HTTP 提供商共用部分：客户端构造与错误分类

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::translation::error::{TranslationError, TranslationResult};

/// 构造带超时的 HTTP 客户端
pub fn build_client(timeout: Duration) -> TranslationResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .user_agent(concat!("ebook-translator/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| TranslationError::ConfigError(format!("无法创建 HTTP 客户端: {}", e)))
}

/// 校验并规范化 base_url（去掉末尾斜杠）
pub fn normalize_base_url(raw: &str) -> TranslationResult<String> {
    let parsed = url::Url::parse(raw)
        .map_err(|e| TranslationError::ConfigError(format!("base_url 无效 {}: {}", raw, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(TranslationError::ConfigError(format!(
            "base_url 必须是 http 或 https: {}",
            raw
        )));
    }
    Ok(raw.trim_end_matches('/').to_string())
}

fn size_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"context_length_exceeded|context length|maximum context|too many tokens|prompt is too long|input is too long|request too large|token limit",
            )
            .ok()
        })
        .as_ref()
}

fn policy_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"content_filter|content_policy|content policy|content management policy|safety system|flagged|sensitive content")
                .ok()
        })
        .as_ref()
}

fn matches(pattern: Option<&Regex>, body: &str) -> bool {
    pattern.map(|re| re.is_match(body)).unwrap_or(false)
}

/// 按 HTTP 状态码与响应体把失败映射到错误类别
pub fn classify_status(provider: &str, status: u16, body: &str) -> TranslationError {
    let lowered = body.to_lowercase();
    let snippet: String = body.chars().take(200).collect();
    let detail = format!("{} 返回 HTTP {}: {}", provider, status, snippet);

    if status == 413 || matches(size_pattern(), &lowered) {
        return TranslationError::SizeExceeded(detail);
    }
    if matches(policy_pattern(), &lowered) {
        return TranslationError::ContentPolicy(detail);
    }

    match status {
        401 | 403 => TranslationError::AuthError(detail),
        429 => TranslationError::RateLimited(detail),
        404 => TranslationError::InvalidModel(detail),
        408 => TranslationError::TimeoutError(detail),
        500..=599 => TranslationError::ProviderError(detail),
        _ => TranslationError::InternalError(detail),
    }
}

/// 成功状态下返回响应体，否则分类为错误
pub async fn read_success_body(provider: &str, response: reqwest::Response) -> TranslationResult<String> {
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        Ok(body)
    } else {
        Err(classify_status(provider, status.as_u16(), &body))
    }
}
