//! 远程工作节点后端
//!
//! 把文本通过标准输入交给节点上的翻译程序，译文从标准输出读回。

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::pool::{Job, WorkerPool};
use super::types::shell_quote;
use crate::translation::backends::{BackendKind, BackendRequest, TranslationBackend};
use crate::translation::error::{TranslationError, TranslationResult};

/// 节点使用自身默认提供商时的名称
const DEFAULT_REMOTE_PROVIDER: &str = "default";

/// 远程程序以 2 退出表示翻译失败
const EXIT_TRANSLATION_FAILED: i32 = 2;

pub struct RemoteWorkerBackend {
    pool: Arc<WorkerPool>,
    /// 节点上使用的提供商
    provider: String,
}

impl RemoteWorkerBackend {
    pub fn new(pool: Arc<WorkerPool>, provider: impl Into<String>) -> Self {
        Self {
            pool,
            provider: provider.into(),
        }
    }

    fn command(&self, request: &BackendRequest) -> String {
        let mut command = format!(
            "{} --stdin --source {} --target {}",
            self.pool.remote_binary(),
            shell_quote(&request.source_lang),
            shell_quote(&request.target_lang)
        );
        if self.provider != DEFAULT_REMOTE_PROVIDER {
            command.push_str(&format!(" --provider {}", shell_quote(&self.provider)));
        }
        command
    }

    fn job(&self, request: &BackendRequest) -> Job {
        let job = Job::new(self.command(request)).with_stdin(request.text.clone());
        if self.provider == DEFAULT_REMOTE_PROVIDER {
            job
        } else {
            job.with_backend(self.provider.clone())
        }
    }
}

#[async_trait]
impl TranslationBackend for RemoteWorkerBackend {
    fn name(&self) -> &str {
        "remote"
    }

    fn model(&self) -> &str {
        &self.provider
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn translate(
        &self,
        request: &BackendRequest,
        cancel: &CancellationToken,
    ) -> TranslationResult<String> {
        let output = self.pool.dispatch(&self.job(request), cancel).await?;
        match output.exit_code {
            0 => {
                let text = output.stdout.trim_end_matches('\n').to_string();
                if text.trim().is_empty() && !request.text.trim().is_empty() {
                    return Err(TranslationError::ProviderError("远程节点返回空译文".to_string()));
                }
                Ok(text)
            }
            EXIT_TRANSLATION_FAILED => Err(TranslationError::ProviderError(format!(
                "远程翻译失败: {}",
                output.stderr.trim()
            ))),
            code => Err(TranslationError::WorkerError(format!(
                "远程程序异常退出（{}）: {}",
                code,
                output.stderr.trim()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::distributed::pool::tests::{ok, worker_config, ScriptedTransport, PROBE_OUTPUT};
    use crate::distributed::ssh::CommandOutput;
    use crate::translation::events::EventBus;

    async fn probed_pool(transport: Arc<ScriptedTransport>) -> Arc<WorkerPool> {
        let pool = WorkerPool::new(transport, EventBus::new(), Duration::from_secs(5));
        pool.register(&worker_config("w1", 2)).unwrap();
        pool.probe_all().await;
        Arc::new(pool)
    }

    #[tokio::test]
    async fn test_remote_translate_uses_stdin() {
        let transport = Arc::new(ScriptedTransport::new(|_, command, stdin| {
            if command.contains("uname") {
                return ok(PROBE_OUTPUT);
            }
            assert!(command.starts_with("translate --stdin --source 'ru' --target 'sr'"));
            assert!(command.ends_with("--provider 'llamacpp'"));
            ok(&format!("[{}]\n", stdin.unwrap_or_default()))
        }));
        let pool = probed_pool(transport).await;
        let backend = RemoteWorkerBackend::new(pool, "llamacpp");

        let request = BackendRequest::new("Привет", "ru", "sr");
        let text = backend.translate(&request, &CancellationToken::new()).await.unwrap();
        assert_eq!(text, "[Привет]");
        assert_eq!(backend.name(), "remote");
    }

    #[tokio::test]
    async fn test_remote_failure_exit_code() {
        let transport = Arc::new(ScriptedTransport::new(|_, command, _| {
            if command.contains("uname") {
                return ok(PROBE_OUTPUT);
            }
            Ok(CommandOutput {
                stdout: String::new(),
                stderr: "all backends failed".into(),
                exit_code: 2,
            })
        }));
        let backend = RemoteWorkerBackend::new(probed_pool(transport).await, "default");
        let err = backend
            .translate(&BackendRequest::new("x", "ru", "sr"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TranslationError::ProviderError(_)));
    }
}
