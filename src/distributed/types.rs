//! 部署与工作节点数据类型

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hardware::HardwareCapabilities;
use crate::translation::error::ValidationError;

pub const DEFAULT_DEPLOY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_DEPLOY_RETRIES: u32 = 3;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// 资源占用健康阈值（百分比）
const HEALTH_THRESHOLD: f64 = 80.0;

fn require(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::new(field, format!("{} is required", field)))
    } else {
        Ok(())
    }
}

// ============================================================================
// 部署请求
// ============================================================================

/// 单个节点的部署请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub id: String,
    pub target_host: String,
    /// 本地安装包路径，上传到节点后执行
    pub package_ref: String,
    pub command: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub pre_cmds: Vec<String>,
    #[serde(default)]
    pub post_cmds: Vec<String>,
    /// 回滚时执行的命令
    #[serde(default)]
    pub rollback_command: Option<String>,
    #[serde(default, with = "duration_secs")]
    pub timeout: Duration,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl DeploymentRequest {
    pub fn new(
        id: impl Into<String>,
        target_host: impl Into<String>,
        package_ref: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            target_host: target_host.into(),
            package_ref: package_ref.into(),
            command: command.into(),
            env: HashMap::new(),
            labels: HashMap::new(),
            pre_cmds: Vec::new(),
            post_cmds: Vec::new(),
            rollback_command: None,
            timeout: DEFAULT_DEPLOY_TIMEOUT,
            retries: DEFAULT_DEPLOY_RETRIES,
            created_at: Some(Utc::now()),
        }
    }

    /// 校验必填字段，并为缺省的超时、重试次数和创建时间补上默认值
    pub fn validate(&mut self) -> Result<(), ValidationError> {
        require("id", &self.id)?;
        require("target_host", &self.target_host)?;
        require("package_ref", &self.package_ref)?;
        require("command", &self.command)?;

        if self.timeout.is_zero() {
            self.timeout = DEFAULT_DEPLOY_TIMEOUT;
        }
        if self.retries == 0 {
            self.retries = DEFAULT_DEPLOY_RETRIES;
        }
        if self.created_at.is_none() {
            self.created_at = Some(Utc::now());
        }
        Ok(())
    }

    /// 节点上依次执行的完整命令列表
    pub fn command_plan(&self) -> Vec<String> {
        let env: String = {
            let mut pairs: Vec<_> = self.env.iter().collect();
            pairs.sort();
            pairs
                .into_iter()
                .map(|(k, v)| format!("{}={} ", k, shell_quote(v)))
                .collect()
        };
        self.pre_cmds
            .iter()
            .cloned()
            .chain(std::iter::once(format!("{}{}", env, self.command)))
            .chain(self.post_cmds.iter().cloned())
            .collect()
    }
}

/// 回滚策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackMode {
    /// 任一请求失败时回滚所有成功的请求
    #[default]
    Any,
    /// 全部失败时才回滚
    All,
    None,
}

impl RollbackMode {
    /// 按成功与失败数判断是否需要回滚
    pub fn should_rollback(&self, succeeded: usize, failed: usize) -> bool {
        match self {
            RollbackMode::Any => failed > 0,
            RollbackMode::All => failed > 0 && succeeded == 0,
            RollbackMode::None => false,
        }
    }
}

/// 批量部署请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDeploymentRequest {
    pub id: String,
    pub name: String,
    pub requests: Vec<DeploymentRequest>,
    /// 同时执行的请求数，0 表示全部并行
    #[serde(default)]
    pub parallelism: usize,
    #[serde(default, with = "duration_secs")]
    pub timeout: Duration,
    #[serde(default)]
    pub rollback_mode: RollbackMode,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl BatchDeploymentRequest {
    pub fn new(id: impl Into<String>, name: impl Into<String>, requests: Vec<DeploymentRequest>) -> Self {
        let parallelism = requests.len();
        Self {
            id: id.into(),
            name: name.into(),
            requests,
            parallelism,
            timeout: DEFAULT_BATCH_TIMEOUT,
            rollback_mode: RollbackMode::Any,
            created_at: Some(Utc::now()),
        }
    }

    pub fn validate(&mut self) -> Result<(), ValidationError> {
        require("id", &self.id)?;
        require("name", &self.name)?;
        if self.requests.is_empty() {
            return Err(ValidationError::new("requests", "at least one request is required"));
        }
        for (i, request) in self.requests.iter_mut().enumerate() {
            request
                .validate()
                .map_err(|e| ValidationError::new(format!("requests[{}]", i), e.to_string()))?;
        }

        if self.parallelism == 0 {
            self.parallelism = self.requests.len();
        }
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_BATCH_TIMEOUT;
        }
        if self.created_at.is_none() {
            self.created_at = Some(Utc::now());
        }
        Ok(())
    }
}

// ============================================================================
// 部署结果
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentResponse {
    pub request_id: String,
    pub host: String,
    pub status: DeploymentStatus,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DeploymentResponse {
    pub fn new(request: &DeploymentRequest) -> Self {
        Self {
            request_id: request.id.clone(),
            host: request.target_host.clone(),
            status: DeploymentStatus::Pending,
            success: false,
            output: String::new(),
            error: None,
            attempts: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// 成功且没有任何错误信息
    pub fn is_successful(&self) -> bool {
        self.success && self.error.as_deref().map_or(true, str::is_empty)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, DeploymentStatus::Completed | DeploymentStatus::Failed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchDeploymentResponse {
    pub batch_id: String,
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub failed_jobs: usize,
    pub success_jobs: usize,
    pub responses: Vec<DeploymentResponse>,
    /// 已回滚的请求 id
    pub rolled_back: Vec<String>,
}

impl BatchDeploymentResponse {
    pub fn is_complete(&self) -> bool {
        self.completed_jobs == self.total_jobs
    }

    pub fn is_successful(&self) -> bool {
        self.is_complete() && self.failed_jobs == 0
    }
}

/// 节点资源占用（百分比）
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemResources {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub disk_usage: f64,
}

impl SystemResources {
    pub fn is_healthy(&self) -> bool {
        self.cpu_usage < HEALTH_THRESHOLD
            && self.memory_usage < HEALTH_THRESHOLD
            && self.disk_usage < HEALTH_THRESHOLD
    }
}

// ============================================================================
// 工作节点
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Busy,
    Unreachable,
    #[default]
    Unknown,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Busy => "busy",
            WorkerState::Unreachable => "unreachable",
            WorkerState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 节点能力：硬件探测结果加上节点声明的格式与后端
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    pub arch: String,
    pub total_ram: u64,
    pub available_ram: u64,
    pub cpu_cores: usize,
    pub has_gpu: bool,
    pub gpu_type: Option<String>,
    pub supported_platforms: Vec<String>,
    pub supported_formats: Vec<String>,
    pub backends: Vec<String>,
    pub max_concurrent: usize,
}

impl WorkerCapabilities {
    pub fn from_hardware(hw: &HardwareCapabilities, backends: &[String]) -> Self {
        Self {
            arch: hw.arch.clone(),
            total_ram: hw.total_ram,
            available_ram: hw.available_ram.min(hw.total_ram),
            cpu_cores: hw.cpu_cores,
            has_gpu: hw.has_gpu,
            gpu_type: hw.gpu_type.clone(),
            supported_platforms: vec!["linux".to_string()],
            supported_formats: ["fb2", "epub", "html", "md", "txt"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            backends: backends.to_vec(),
            max_concurrent: hw.max_concurrent,
        }
    }

    pub fn supports_platform(&self, platform: &str) -> bool {
        !platform.is_empty() && self.supported_platforms.iter().any(|p| p == platform)
    }

    pub fn supports_format(&self, format: &str) -> bool {
        !format.is_empty() && self.supported_formats.iter().any(|f| f == format)
    }

    /// 未声明后端列表的节点视为支持任意后端
    pub fn supports_backend(&self, backend: &str) -> bool {
        self.backends.is_empty() || self.backends.iter().any(|b| b == backend)
    }
}

/// 节点状态记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub id: String,
    pub host: String,
    #[serde(default)]
    pub status: WorkerState,
    #[serde(default)]
    pub capabilities: WorkerCapabilities,
    #[serde(default)]
    pub last_activity: Option<DateTime<Utc>>,
    #[serde(default)]
    pub jobs_completed: u64,
    #[serde(default)]
    pub jobs_failed: u64,
}

impl WorkerStatus {
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            status: WorkerState::Idle,
            capabilities: WorkerCapabilities::default(),
            last_activity: Some(Utc::now()),
            jobs_completed: 0,
            jobs_failed: 0,
        }
    }

    pub fn validate(&mut self) -> Result<(), ValidationError> {
        require("id", &self.id)?;
        require("host", &self.host)?;
        if self.last_activity.is_none() {
            self.last_activity = Some(Utc::now());
        }
        Ok(())
    }

    pub fn touch(&mut self) {
        self.last_activity = Some(Utc::now());
    }
}

/// 把值包进单引号，供远程 shell 使用
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> DeploymentRequest {
        DeploymentRequest::new("deploy-1", "worker1.example.com", "/tmp/worker.tar.gz", "./worker start")
    }

    #[test]
    fn test_deployment_request_required_fields() {
        for (field, mut req) in [
            ("id", DeploymentRequest { id: String::new(), ..request() }),
            ("target_host", DeploymentRequest { target_host: " ".into(), ..request() }),
            ("package_ref", DeploymentRequest { package_ref: String::new(), ..request() }),
            ("command", DeploymentRequest { command: String::new(), ..request() }),
        ] {
            assert_eq!(req.validate().unwrap_err().field, field);
        }
    }

    #[test]
    fn test_deployment_request_defaults() {
        let mut req = DeploymentRequest {
            timeout: Duration::ZERO,
            retries: 0,
            created_at: None,
            ..request()
        };
        req.validate().unwrap();
        assert_eq!(req.timeout, Duration::from_secs(1800));
        assert_eq!(req.retries, 3);
        assert!(req.created_at.is_some());
    }

    #[test]
    fn test_batch_validation() {
        let mut batch = BatchDeploymentRequest {
            parallelism: 0,
            timeout: Duration::ZERO,
            ..BatchDeploymentRequest::new("b1", "workers", vec![request(), request()])
        };
        batch.validate().unwrap();
        assert_eq!(batch.parallelism, 2);
        assert_eq!(batch.timeout, Duration::from_secs(7200));

        let mut empty = BatchDeploymentRequest::new("b1", "workers", Vec::new());
        assert_eq!(empty.validate().unwrap_err().field, "requests");

        let bad = DeploymentRequest { id: String::new(), ..request() };
        let mut nested = BatchDeploymentRequest::new("b1", "workers", vec![request(), bad]);
        assert_eq!(nested.validate().unwrap_err().field, "requests[1]");

        let mut unnamed = BatchDeploymentRequest::new("b1", "", vec![request()]);
        assert_eq!(unnamed.validate().unwrap_err().field, "name");
    }

    #[test]
    fn test_rollback_modes() {
        assert!(RollbackMode::Any.should_rollback(3, 1));
        assert!(!RollbackMode::Any.should_rollback(3, 0));
        assert!(!RollbackMode::All.should_rollback(3, 1));
        assert!(RollbackMode::All.should_rollback(0, 2));
        assert!(!RollbackMode::None.should_rollback(0, 2));
    }

    #[test]
    fn test_response_helpers() {
        let mut resp = DeploymentResponse::new(&request());
        resp.status = DeploymentStatus::Running;
        resp.success = true;
        assert!(resp.is_successful());
        assert!(!resp.is_completed());

        resp.status = DeploymentStatus::Completed;
        resp.error = Some("warning".into());
        assert!(!resp.is_successful());
        assert!(resp.is_completed());

        let batch = BatchDeploymentResponse {
            total_jobs: 5,
            completed_jobs: 5,
            failed_jobs: 2,
            success_jobs: 3,
            ..Default::default()
        };
        assert!(batch.is_complete());
        assert!(!batch.is_successful());
    }

    #[test]
    fn test_resources_health() {
        let ok = SystemResources { cpu_usage: 79.9, memory_usage: 79.9, disk_usage: 79.9 };
        assert!(ok.is_healthy());
        let hot = SystemResources { disk_usage: 95.0, ..ok };
        assert!(!hot.is_healthy());
    }

    #[test]
    fn test_worker_status() {
        let status = WorkerStatus::new("w1", "host");
        assert_eq!(status.status, WorkerState::Idle);
        assert_eq!(status.jobs_completed, 0);

        let mut missing_host: WorkerStatus =
            serde_json::from_str(r#"{"id": "w1", "host": ""}"#).unwrap();
        assert_eq!(missing_host.validate().unwrap_err().field, "host");

        let mut defaulted: WorkerStatus = serde_json::from_str(r#"{"id": "w1", "host": "h"}"#).unwrap();
        defaulted.validate().unwrap();
        assert_eq!(defaulted.status, WorkerState::Unknown);
        assert!(defaulted.last_activity.is_some());
    }

    #[test]
    fn test_capabilities_support() {
        let caps = WorkerCapabilities {
            supported_platforms: vec!["linux".into(), "darwin".into()],
            supported_formats: vec!["fb2".into(), "epub".into()],
            ..Default::default()
        };
        assert!(caps.supports_platform("darwin"));
        assert!(!caps.supports_platform("freebsd"));
        assert!(!caps.supports_platform(""));
        assert!(caps.supports_format("epub"));
        assert!(!caps.supports_format("txt"));
        assert!(caps.supports_backend("openai"));
    }

    #[test]
    fn test_command_plan_order() {
        let mut req = request();
        req.pre_cmds = vec!["tar xzf worker.tar.gz".into()];
        req.post_cmds = vec!["./worker status".into()];
        req.env.insert("LEVEL".into(), "it's".into());
        assert_eq!(
            req.command_plan(),
            vec![
                "tar xzf worker.tar.gz".to_string(),
                r"LEVEL='it'\''s' ./worker start".to_string(),
                "./worker status".to_string(),
            ]
        );
    }
}
