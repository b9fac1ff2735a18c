//! SSH 传输
//!
//! 通过系统的 OpenSSH 客户端执行远程命令。发送任何命令前都要先在
//! known_hosts 中找到目标主机的公钥，且始终以 `StrictHostKeyChecking=yes`
//! 运行，未知主机一律拒绝。

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::translation::config::{constants, WorkerConfig};
use crate::translation::error::{TranslationError, TranslationResult};

/// ssh 自身连接失败时的退出码
const SSH_CONNECT_FAILURE: i32 = 255;

/// 远程节点的 SSH 连接信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_file: String,
}

impl SshEndpoint {
    pub fn from_worker(config: &WorkerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            key_file: shellexpand::tilde(&config.key_file).into_owned(),
        }
    }

    pub fn destination(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }

    /// known_hosts 中的主机名形式，非默认端口写作 `[host]:port`
    pub fn known_hosts_name(&self) -> String {
        if self.port == constants::DEFAULT_SSH_PORT {
            self.host.clone()
        } else {
            format!("[{}]:{}", self.host, self.port)
        }
    }
}

/// 远程命令输出
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// 工作节点传输层
#[async_trait]
pub trait SshTransport: Send + Sync {
    /// 确认主机公钥已在 known_hosts 中
    async fn verify_host(&self, endpoint: &SshEndpoint) -> TranslationResult<()>;

    /// 执行远程命令；命令本身失败时返回非零退出码，连接失败时返回错误
    async fn exec(
        &self,
        endpoint: &SshEndpoint,
        command: &str,
        stdin: Option<&str>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TranslationResult<CommandOutput>;

    async fn upload(
        &self,
        endpoint: &SshEndpoint,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> TranslationResult<()>;
}

/// 基于 OpenSSH 命令行的传输
pub struct OpenSshTransport {
    known_hosts: PathBuf,
    verified: Mutex<HashSet<String>>,
}

impl OpenSshTransport {
    pub fn new(known_hosts: &str) -> Self {
        Self {
            known_hosts: PathBuf::from(shellexpand::tilde(known_hosts).into_owned()),
            verified: Mutex::new(HashSet::new()),
        }
    }

    fn is_verified(&self, name: &str) -> bool {
        match self.verified.lock() {
            Ok(set) => set.contains(name),
            Err(poisoned) => poisoned.into_inner().contains(name),
        }
    }

    fn mark_verified(&self, name: String) {
        match self.verified.lock() {
            Ok(mut set) => set.insert(name),
            Err(poisoned) => poisoned.into_inner().insert(name),
        };
    }

    fn ssh_options(&self, cmd: &mut Command, endpoint: &SshEndpoint, timeout: Duration) {
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=yes")
            .arg("-o")
            .arg(format!("UserKnownHostsFile={}", self.known_hosts.display()))
            .arg("-o")
            .arg(format!("ConnectTimeout={}", timeout.as_secs().max(1)));
        if !endpoint.key_file.is_empty() {
            cmd.arg("-i").arg(&endpoint.key_file);
        }
    }
}

#[async_trait]
impl SshTransport for OpenSshTransport {
    async fn verify_host(&self, endpoint: &SshEndpoint) -> TranslationResult<()> {
        let name = endpoint.known_hosts_name();
        if self.is_verified(&name) {
            return Ok(());
        }
        if !self.known_hosts.is_file() {
            return Err(TranslationError::WorkerError(format!(
                "known_hosts 文件不存在: {}",
                self.known_hosts.display()
            )));
        }

        let mut cmd = Command::new("ssh-keygen");
        cmd.arg("-F").arg(&name).arg("-f").arg(&self.known_hosts);
        let output = run(cmd, None, constants::DEFAULT_SSH_TIMEOUT, None).await?;
        if !output.success() || output.stdout.trim().is_empty() {
            tracing::warn!(host = %name, "主机公钥不在 known_hosts 中，拒绝连接");
            return Err(TranslationError::WorkerError(format!(
                "主机 {} 未在 {} 中登记，拒绝连接",
                name,
                self.known_hosts.display()
            )));
        }

        tracing::debug!(host = %name, "主机公钥校验通过");
        self.mark_verified(name);
        Ok(())
    }

    async fn exec(
        &self,
        endpoint: &SshEndpoint,
        command: &str,
        stdin: Option<&str>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> TranslationResult<CommandOutput> {
        self.verify_host(endpoint).await?;

        let mut cmd = Command::new("ssh");
        cmd.arg("-p").arg(endpoint.port.to_string());
        self.ssh_options(&mut cmd, endpoint, timeout);
        cmd.arg(endpoint.destination()).arg("--").arg(command);

        let output = run(cmd, stdin, timeout, Some(cancel)).await?;
        if output.exit_code == SSH_CONNECT_FAILURE {
            return Err(TranslationError::WorkerError(format!(
                "无法连接 {}: {}",
                endpoint.destination(),
                output.stderr.trim()
            )));
        }
        Ok(output)
    }

    async fn upload(
        &self,
        endpoint: &SshEndpoint,
        local: &Path,
        remote: &str,
        timeout: Duration,
    ) -> TranslationResult<()> {
        self.verify_host(endpoint).await?;

        let mut cmd = Command::new("scp");
        cmd.arg("-P").arg(endpoint.port.to_string());
        self.ssh_options(&mut cmd, endpoint, timeout);
        cmd.arg(local)
            .arg(format!("{}:{}", endpoint.destination(), remote));

        let output = run(cmd, None, timeout, None).await?;
        if !output.success() {
            return Err(TranslationError::WorkerError(format!(
                "上传 {} 到 {} 失败: {}",
                local.display(),
                endpoint.host,
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}

/// 运行本地命令并收集输出，超时或取消时终止进程
async fn run(
    mut cmd: Command,
    stdin: Option<&str>,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
) -> TranslationResult<CommandOutput> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let program = format!("{:?}", cmd.as_std().get_program());
    let mut child = cmd
        .spawn()
        .map_err(|e| TranslationError::WorkerError(format!("无法启动 {}: {}", program, e)))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        let input = input.to_string();
        tokio::spawn(async move {
            if let Err(e) = pipe.write_all(input.as_bytes()).await {
                tracing::debug!("写入远程命令标准输入失败: {}", e);
            }
        });
    }

    let never = CancellationToken::new();
    let cancel = cancel.unwrap_or(&never);
    let output = tokio::select! {
        _ = cancel.cancelled() => {
            return Err(TranslationError::Cancelled("远程命令已取消".to_string()));
        }
        result = tokio::time::timeout(timeout, child.wait_with_output()) => match result {
            Ok(output) => output?,
            Err(_) => {
                return Err(TranslationError::WorkerError(format!(
                    "{} 超过 {}s 未完成",
                    program,
                    timeout.as_secs()
                )));
            }
        }
    };

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> SshEndpoint {
        SshEndpoint {
            host: "worker1.example.com".into(),
            port,
            user: "translator".into(),
            key_file: String::new(),
        }
    }

    #[test]
    fn test_known_hosts_name() {
        assert_eq!(endpoint(22).known_hosts_name(), "worker1.example.com");
        assert_eq!(endpoint(2222).known_hosts_name(), "[worker1.example.com]:2222");
        assert_eq!(endpoint(22).destination(), "translator@worker1.example.com");
    }

    #[tokio::test]
    async fn test_missing_known_hosts_rejects_host() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let transport = OpenSshTransport::new(path.to_str().unwrap());
        let err = transport.verify_host(&endpoint(22)).await.unwrap_err();
        assert!(err.to_string().contains("known_hosts"));

        let cancel = CancellationToken::new();
        let err = transport
            .exec(&endpoint(22), "true", None, Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TranslationError::WorkerError(_)));
    }
}
