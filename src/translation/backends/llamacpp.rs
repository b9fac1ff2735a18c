//! llama.cpp 子进程后端
//!
//! 每次调用启动一个推理进程，从标准输出中取 `Translation:` 标记之后的内容。

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::prompt::{completion_prompt, parse_output};
use super::{BackendKind, BackendRequest, TranslationBackend};
use crate::translation::config::{constants, BackendConfig};
use crate::translation::error::{TranslationError, TranslationResult};
use crate::translation::models::ModelRegistry;

pub const DEFAULT_BINARY: &str = "llama-cli";
pub const DEFAULT_MODEL: &str = "hunyuan-mt-7b-q4";
pub const MODEL_DIR: &str = "~/.cache/ebook-translator/models";
const DEFAULT_PREDICT_TOKENS: u32 = 1024;

pub struct LlamaCppBackend {
    binary: String,
    model: String,
    model_path: String,
    context_length: u32,
    max_tokens: u32,
    temperature: f32,
    min_ram: Option<u64>,
    max_input_bytes: Option<usize>,
    timeout: Duration,
}

impl LlamaCppBackend {
    pub fn from_config(config: &BackendConfig) -> TranslationResult<Self> {
        let registry = ModelRegistry::new();
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let info = registry.get(&model);

        let model_path = match (&config.model_path, info) {
            (Some(path), _) => shellexpand::tilde(path).into_owned(),
            (None, Some(info)) => {
                let dir = shellexpand::tilde(MODEL_DIR);
                format!("{}/{}", dir, info.file_name)
            }
            (None, None) => {
                return Err(TranslationError::ConfigError(format!(
                    "后端 {} 的模型 {} 不在注册表中，需要指定 model_path",
                    config.id, model
                )))
            }
        };

        let context_length = info.map(|i| i.context_length).unwrap_or(4096);
        // 输入约占上下文的一半，按每 token 约 4 字节估算
        let derived_limit = context_length as usize * 2;

        Ok(Self {
            binary: config
                .binary_path
                .clone()
                .map(|p| shellexpand::tilde(&p).into_owned())
                .unwrap_or_else(|| DEFAULT_BINARY.to_string()),
            model,
            model_path,
            context_length,
            max_tokens: config.max_tokens.unwrap_or(DEFAULT_PREDICT_TOKENS),
            temperature: config.temperature.unwrap_or(0.3),
            min_ram: info.map(|i| i.min_ram),
            max_input_bytes: Some(config.max_input_bytes.unwrap_or(derived_limit)),
            timeout: config.timeout(constants::DEFAULT_SUBPROCESS_TIMEOUT),
        })
    }

    pub fn model_path(&self) -> &str {
        &self.model_path
    }

    fn command(&self, prompt: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-m")
            .arg(&self.model_path)
            .arg("-p")
            .arg(prompt)
            .arg("-n")
            .arg(self.max_tokens.to_string())
            .arg("-c")
            .arg(self.context_length.to_string())
            .arg("--temp")
            .arg(self.temperature.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// 保留 stderr 末尾若干字符
fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let chars: Vec<char> = text.trim().chars().collect();
    let start = chars.len().saturating_sub(300);
    chars[start..].iter().collect()
}

#[async_trait]
impl TranslationBackend for LlamaCppBackend {
    fn name(&self) -> &str {
        "llamacpp"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn max_input_bytes(&self) -> Option<usize> {
        self.max_input_bytes
    }

    fn min_ram_bytes(&self) -> Option<u64> {
        self.min_ram
    }

    async fn translate(
        &self,
        request: &BackendRequest,
        cancel: &CancellationToken,
    ) -> TranslationResult<String> {
        if cancel.is_cancelled() {
            return Err(TranslationError::Cancelled("llama.cpp 调用已取消".to_string()));
        }

        let prompt = completion_prompt(request);
        let child = self.command(&prompt).spawn().map_err(|e| {
            TranslationError::ProviderError(format!("无法启动 {}: {}", self.binary, e))
        })?;

        // 子进程随 future 一起被丢弃时由 kill_on_drop 终止
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(TranslationError::Cancelled("llama.cpp 调用已取消".to_string()));
            }
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => match result {
                Ok(output) => output?,
                Err(_) => {
                    return Err(TranslationError::TimeoutError(format!(
                        "llama.cpp 超过 {}s 未完成",
                        self.timeout.as_secs()
                    )));
                }
            }
        };

        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            let tail = stderr_tail(&output.stderr);
            let lowered = tail.to_lowercase();
            if lowered.contains("context") && lowered.contains("exceed") {
                return Err(TranslationError::SizeExceeded(format!(
                    "llama.cpp 退出码 {}: {}",
                    code, tail
                )));
            }
            return Err(TranslationError::ProviderError(format!(
                "llama.cpp 退出码 {}: {}",
                code, tail
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let translated = parse_output(&stdout);
        if translated.is_empty() {
            return Err(TranslationError::ProviderError(format!(
                "llama.cpp 输出中没有译文: {}",
                stderr_tail(&output.stderr)
            )));
        }
        Ok(translated)
    }
}
