//! 工作节点池
//!
//! 负责节点注册与硬件探测、按负载派发任务、部署与批量部署。
//! 同一个 job_id 在前一次派发未结束时不会再次派发，除非承接它的节点
//! 已被判定为不可达。连续三次命令失败的节点标记为不可达，
//! 其上的任务转交给其他符合条件的节点。

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use metrics::counter;
use tokio_util::sync::CancellationToken;

use super::probe;
use super::ssh::{CommandOutput, OpenSshTransport, SshEndpoint, SshTransport};
use super::types::{
    BatchDeploymentRequest, BatchDeploymentResponse, DeploymentRequest, DeploymentResponse,
    DeploymentStatus, SystemResources, WorkerCapabilities, WorkerState, WorkerStatus,
};
use crate::hardware;
use crate::translation::config::{constants, DistributedConfig, WorkerConfig};
use crate::translation::error::{TranslationError, TranslationResult};
use crate::translation::events::{Event, EventBus, EventType};

const MARK_NPROC: &str = "__NPROC__";
const MARK_MEM: &str = "__MEM__";
const MARK_DISK: &str = "__DISK__";

/// 派发到节点的任务
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub stdin: Option<String>,
    /// 节点必须声明支持的后端
    pub backend: Option<String>,
}

impl Job {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            command: command.into(),
            stdin: None,
            backend: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }
}

struct Worker {
    endpoint: SshEndpoint,
    max_capacity: usize,
    backends: Vec<String>,
    status: Mutex<WorkerStatus>,
    load: AtomicUsize,
    failures: AtomicU32,
}

impl Worker {
    fn id(&self) -> String {
        self.with_status(|s| s.id.clone())
    }

    fn with_status<T>(&self, f: impl FnOnce(&mut WorkerStatus) -> T) -> T {
        match self.status.lock() {
            Ok(mut status) => f(&mut status),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn state(&self) -> WorkerState {
        self.with_status(|s| s.status)
    }

    /// 并发上限：探测到的 max_concurrent 与配置容量取小
    fn limit(&self) -> usize {
        let probed = self.with_status(|s| s.capabilities.max_concurrent);
        if probed == 0 {
            self.max_capacity.max(1)
        } else {
            probed.min(self.max_capacity.max(1))
        }
    }

    fn supports(&self, backend: Option<&str>) -> bool {
        match backend {
            None => true,
            Some(b) => self.backends.is_empty() || self.backends.iter().any(|x| x == b),
        }
    }

    fn admissible(&self, backend: Option<&str>) -> bool {
        matches!(self.state(), WorkerState::Idle | WorkerState::Busy)
            && self.supports(backend)
            && self.load.load(Ordering::SeqCst) < self.limit()
    }

    /// 原子地占用一个并发槽
    fn try_reserve(&self) -> Option<Reservation<'_>> {
        let limit = self.limit();
        self.load
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .ok()?;
        self.with_status(|s| {
            if s.status == WorkerState::Idle {
                s.status = WorkerState::Busy;
            }
            s.touch();
        });
        Some(Reservation { worker: self })
    }

    fn record_success(&self, command_ok: bool) {
        self.failures.store(0, Ordering::SeqCst);
        self.with_status(|s| {
            if command_ok {
                s.jobs_completed += 1;
            } else {
                s.jobs_failed += 1;
            }
            s.touch();
        });
    }

    /// 记录传输失败，返回是否因此变为不可达
    fn record_failure(&self) -> bool {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.with_status(|s| {
            s.jobs_failed += 1;
            if failures >= constants::UNREACHABLE_AFTER_FAILURES && s.status != WorkerState::Unreachable {
                s.status = WorkerState::Unreachable;
                true
            } else {
                false
            }
        })
    }
}

struct Reservation<'a> {
    worker: &'a Worker,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let remaining = self.worker.load.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining == 0 {
            self.worker.with_status(|s| {
                if s.status == WorkerState::Busy {
                    s.status = WorkerState::Idle;
                }
            });
        }
    }
}

/// 工作节点池
pub struct WorkerPool {
    workers: DashMap<String, Arc<Worker>>,
    transport: Arc<dyn SshTransport>,
    /// 进行中的 job_id → 承接节点
    outstanding: DashMap<String, String>,
    events: EventBus,
    timeout: Duration,
    remote_binary: String,
}

impl WorkerPool {
    pub fn new(transport: Arc<dyn SshTransport>, events: EventBus, timeout: Duration) -> Self {
        Self {
            workers: DashMap::new(),
            transport,
            outstanding: DashMap::new(),
            events,
            timeout,
            remote_binary: constants::DEFAULT_REMOTE_BINARY.to_string(),
        }
    }

    /// 按配置注册所有节点，使用系统 OpenSSH
    pub fn from_config(config: &DistributedConfig, events: EventBus) -> TranslationResult<Self> {
        let transport = Arc::new(OpenSshTransport::new(&config.known_hosts));
        let mut pool = Self::new(transport, events, config.ssh_timeout());
        pool.remote_binary = config.remote_binary.clone();
        for worker in &config.workers {
            pool.register(worker)?;
        }
        Ok(pool)
    }

    pub fn remote_binary(&self) -> &str {
        &self.remote_binary
    }

    pub fn register(&self, config: &WorkerConfig) -> TranslationResult<()> {
        if self.workers.contains_key(&config.name) {
            return Err(TranslationError::ConfigError(format!(
                "工作节点名称重复: {}",
                config.name
            )));
        }
        let mut status = WorkerStatus::new(config.name.clone(), config.host.clone());
        status.status = WorkerState::Unknown;
        status.validate()?;

        let worker = Worker {
            endpoint: SshEndpoint::from_worker(config),
            max_capacity: config.max_capacity,
            backends: config.backends.clone(),
            status: Mutex::new(status),
            load: AtomicUsize::new(0),
            failures: AtomicU32::new(0),
        };
        self.workers.insert(config.name.clone(), Arc::new(worker));

        tracing::info!(worker = %config.name, host = %config.host, "注册工作节点");
        self.events.publish(
            Event::new(EventType::WorkerRegistered, format!("注册工作节点 {}", config.name))
                .with_data("worker_id", config.name.as_str())
                .with_data("host", config.host.as_str()),
        );
        Ok(())
    }

    fn get(&self, worker_id: &str) -> TranslationResult<Arc<Worker>> {
        self.workers
            .get(worker_id)
            .map(|w| Arc::clone(w.value()))
            .ok_or_else(|| TranslationError::InvalidInput(format!("未知的工作节点: {}", worker_id)))
    }

    pub fn worker(&self, worker_id: &str) -> Option<WorkerStatus> {
        self.workers
            .get(worker_id)
            .map(|w| w.with_status(|s| s.clone()))
    }

    /// 所有节点状态，按 id 排序
    pub fn workers(&self) -> Vec<WorkerStatus> {
        let mut all: Vec<WorkerStatus> = self
            .workers
            .iter()
            .map(|w| w.with_status(|s| s.clone()))
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    fn mark_unreachable(&self, worker: &Worker, reason: &str) {
        worker.with_status(|s| s.status = WorkerState::Unreachable);
        let id = worker.id();
        tracing::warn!(worker = %id, "工作节点不可达: {}", reason);
        self.events.publish(
            Event::new(EventType::WorkerUnreachable, reason)
                .with_data("worker_id", id.as_str())
                .with_data("host", worker.endpoint.host.as_str()),
        );
    }

    /// 探测节点硬件；失败时节点标记为不可达
    pub async fn probe(&self, worker_id: &str) -> TranslationResult<WorkerCapabilities> {
        let worker = self.get(worker_id)?;
        let cancel = CancellationToken::new();
        match probe::probe(self.transport.as_ref(), &worker.endpoint, self.timeout, &cancel).await {
            Ok(hw) => {
                let caps = WorkerCapabilities::from_hardware(&hw, &worker.backends);
                worker.failures.store(0, Ordering::SeqCst);
                worker.with_status(|s| {
                    s.capabilities = caps.clone();
                    s.status = WorkerState::Idle;
                    s.touch();
                });
                Ok(caps)
            }
            Err(err) => {
                self.mark_unreachable(&worker, &format!("硬件探测失败: {}", err));
                Err(err)
            }
        }
    }

    /// 并发探测所有节点，返回探测成功的节点数
    pub async fn probe_all(&self) -> usize {
        let ids: Vec<String> = self.workers.iter().map(|w| w.key().clone()).collect();
        let results = join_all(ids.iter().map(|id| self.probe(id))).await;
        let ok = results.iter().filter(|r| r.is_ok()).count();
        tracing::info!("工作节点探测完成: {}/{} 可用", ok, ids.len());
        ok
    }

    /// 选出负载最低且可接收任务的节点
    fn select(&self, backend: Option<&str>, exclude: &HashSet<String>) -> Option<Arc<Worker>> {
        let mut eligible: Vec<Arc<Worker>> = self
            .workers
            .iter()
            .filter(|w| !exclude.contains(w.key()) && w.admissible(backend))
            .map(|w| Arc::clone(w.value()))
            .collect();
        eligible.sort_by_key(|w| (w.load.load(Ordering::SeqCst), w.id()));
        eligible.into_iter().next()
    }

    /// 登记进行中的任务；前一次派发仍在可达节点上进行时拒绝
    fn claim(&self, job_id: &str, worker_id: &str) -> TranslationResult<()> {
        match self.outstanding.entry(job_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut existing) => {
                let holder = existing.get().clone();
                let holder_unreachable = self
                    .workers
                    .get(&holder)
                    .map_or(true, |w| w.state() == WorkerState::Unreachable);
                if holder == worker_id || !holder_unreachable {
                    return Err(TranslationError::WorkerError(format!(
                        "任务 {} 已在节点 {} 上进行",
                        job_id, holder
                    )));
                }
                existing.insert(worker_id.to_string());
                Ok(())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(worker_id.to_string());
                Ok(())
            }
        }
    }

    /// 派发任务到一个节点并等待结果
    ///
    /// 传输失败时换一个节点重试；命令本身的非零退出码原样返回给调用方。
    pub async fn dispatch(&self, job: &Job, cancel: &CancellationToken) -> TranslationResult<CommandOutput> {
        let mut tried = HashSet::new();
        let mut last_error = None;

        loop {
            if cancel.is_cancelled() {
                return Err(TranslationError::Cancelled("任务派发已取消".to_string()));
            }
            let Some(worker) = self.select(job.backend.as_deref(), &tried) else {
                return Err(last_error.unwrap_or_else(|| {
                    TranslationError::NoBackendAvailable(format!(
                        "没有可接收任务 {} 的工作节点",
                        job.id
                    ))
                }));
            };
            let worker_id = worker.id();
            tried.insert(worker_id.clone());

            let Some(_slot) = worker.try_reserve() else {
                continue;
            };
            self.claim(&job.id, &worker_id)?;

            counter!("translator_worker_dispatches_total", "worker" => worker_id.clone()).increment(1);
            self.events.publish(
                Event::new(EventType::JobDispatched, format!("任务派发到 {}", worker_id))
                    .with_data("job_id", job.id.as_str())
                    .with_data("worker_id", worker_id.as_str())
                    .with_data("attempt", tried.len() as u64),
            );
            tracing::debug!(job_id = %job.id, worker = %worker_id, "派发任务");

            let result = self
                .transport
                .exec(&worker.endpoint, &job.command, job.stdin.as_deref(), self.timeout, cancel)
                .await;

            match result {
                Ok(output) => {
                    worker.record_success(output.success());
                    self.outstanding.remove(&job.id);
                    return Ok(output);
                }
                Err(err) if err.is_cancelled() => {
                    self.outstanding.remove(&job.id);
                    return Err(err);
                }
                Err(err) => {
                    if worker.record_failure() {
                        self.mark_unreachable(&worker, &format!("连续 {} 次命令失败", constants::UNREACHABLE_AFTER_FAILURES));
                    }
                    tracing::warn!(job_id = %job.id, worker = %worker_id, "任务传输失败，转交其他节点: {}", err);
                    self.outstanding.remove(&job.id);
                    last_error = Some(err);
                }
            }
        }
    }

    fn worker_for_host(&self, host: &str) -> TranslationResult<Arc<Worker>> {
        self.workers
            .iter()
            .find(|w| w.endpoint.host == host || w.key() == host)
            .map(|w| Arc::clone(w.value()))
            .ok_or_else(|| TranslationError::ConfigError(format!("目标主机未注册为工作节点: {}", host)))
    }

    /// 部署到单个节点：上传安装包，依次执行前置命令、主命令和后置命令
    pub async fn deploy(
        &self,
        mut request: DeploymentRequest,
        cancel: &CancellationToken,
    ) -> TranslationResult<DeploymentResponse> {
        request.validate()?;
        let worker = self.worker_for_host(&request.target_host)?;
        let mut response = DeploymentResponse::new(&request);
        response.status = DeploymentStatus::Running;

        let package = Path::new(&request.package_ref);
        let remote_path = format!(
            "/tmp/{}",
            package
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| request.id.clone())
        );
        let script = request.command_plan().join(" && ");

        while response.attempts < request.retries {
            if cancel.is_cancelled() {
                return Err(TranslationError::Cancelled("部署已取消".to_string()));
            }
            response.attempts += 1;

            let attempt = match self
                .transport
                .upload(&worker.endpoint, package, &remote_path, request.timeout)
                .await
            {
                Ok(()) => {
                    self.transport
                        .exec(&worker.endpoint, &script, None, request.timeout, cancel)
                        .await
                }
                Err(err) => Err(err),
            };

            match attempt {
                Ok(output) if output.success() => {
                    response.success = true;
                    response.error = None;
                    response.output = output.stdout;
                    break;
                }
                Ok(output) => {
                    response.error = Some(format!("退出码 {}: {}", output.exit_code, output.stderr.trim()));
                    response.output = output.stdout;
                }
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => response.error = Some(err.to_string()),
            }
            tracing::warn!(
                deployment = %request.id,
                host = %request.target_host,
                attempt = response.attempts,
                "部署失败: {}",
                response.error.as_deref().unwrap_or_default()
            );
        }

        response.status = if response.success {
            DeploymentStatus::Completed
        } else {
            DeploymentStatus::Failed
        };
        response.finished_at = Some(Utc::now());
        tracing::info!(deployment = %request.id, status = ?response.status, "部署结束");
        Ok(response)
    }

    /// 批量部署，按回滚策略撤销已成功的部署
    pub async fn deploy_batch(
        &self,
        mut batch: BatchDeploymentRequest,
        cancel: &CancellationToken,
    ) -> TranslationResult<BatchDeploymentResponse> {
        batch.validate()?;
        let mut result = BatchDeploymentResponse {
            batch_id: batch.id.clone(),
            total_jobs: batch.requests.len(),
            ..Default::default()
        };

        let run = stream::iter(batch.requests.iter().cloned())
            .map(|request| async move {
                let outcome = self.deploy(request.clone(), cancel).await;
                (request, outcome)
            })
            .buffer_unordered(batch.parallelism.max(1))
            .collect::<Vec<_>>();

        let outcomes = tokio::time::timeout(batch.timeout, run).await.map_err(|_| {
            TranslationError::TimeoutError(format!(
                "批量部署 {} 超过 {}s 未完成",
                batch.id,
                batch.timeout.as_secs()
            ))
        })?;

        for (request, outcome) in outcomes {
            let response = match outcome {
                Ok(response) => response,
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    let mut failed = DeploymentResponse::new(&request);
                    failed.status = DeploymentStatus::Failed;
                    failed.error = Some(err.to_string());
                    failed.finished_at = Some(Utc::now());
                    failed
                }
            };
            result.completed_jobs += 1;
            if response.is_successful() {
                result.success_jobs += 1;
            } else {
                result.failed_jobs += 1;
            }
            result.responses.push(response);
        }

        if batch.rollback_mode.should_rollback(result.success_jobs, result.failed_jobs) {
            self.rollback(&batch, &mut result, cancel).await;
        }
        Ok(result)
    }

    async fn rollback(
        &self,
        batch: &BatchDeploymentRequest,
        result: &mut BatchDeploymentResponse,
        cancel: &CancellationToken,
    ) {
        tracing::warn!(batch = %batch.id, mode = ?batch.rollback_mode, "批量部署失败，开始回滚");
        for response in result.responses.iter_mut().filter(|r| r.is_successful()) {
            let Some(request) = batch.requests.iter().find(|r| r.id == response.request_id) else {
                continue;
            };
            if let Some(command) = &request.rollback_command {
                let outcome = match self.worker_for_host(&request.target_host) {
                    Ok(worker) => self
                        .transport
                        .exec(&worker.endpoint, command, None, request.timeout, cancel)
                        .await
                        .and_then(|out| {
                            if out.success() {
                                Ok(())
                            } else {
                                Err(TranslationError::WorkerError(out.stderr))
                            }
                        }),
                    Err(err) => Err(err),
                };
                if let Err(err) = outcome {
                    tracing::error!(deployment = %request.id, "回滚命令失败: {}", err);
                    continue;
                }
            }
            response.status = DeploymentStatus::RolledBack;
            result.rolled_back.push(request.id.clone());
        }
    }

    /// 节点资源占用
    pub async fn health(&self, worker_id: &str) -> TranslationResult<SystemResources> {
        let worker = self.get(worker_id)?;
        let script = format!(
            "cat /proc/loadavg; echo {}; nproc; echo {}; cat /proc/meminfo; echo {}; df -P / | tail -1",
            MARK_NPROC, MARK_MEM, MARK_DISK
        );
        let output = self
            .transport
            .exec(&worker.endpoint, &script, None, self.timeout, &CancellationToken::new())
            .await?;
        if !output.success() {
            return Err(TranslationError::WorkerError(format!(
                "{} 资源查询失败: {}",
                worker_id,
                output.stderr.trim()
            )));
        }
        parse_resources(&output.stdout)
    }
}

/// 解析资源查询输出：负载按核数折算为 CPU 占用
pub fn parse_resources(output: &str) -> TranslationResult<SystemResources> {
    let mut sections: [String; 4] = Default::default();
    let mut current = 0;
    for line in output.lines() {
        match line.trim() {
            MARK_NPROC => current = 1,
            MARK_MEM => current = 2,
            MARK_DISK => current = 3,
            _ => {
                sections[current].push_str(line);
                sections[current].push('\n');
            }
        }
    }

    let bad = |what: &str| TranslationError::WorkerError(format!("无法解析资源输出: {}", what));

    let load: f64 = sections[0]
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| bad("loadavg"))?;
    let cores: f64 = sections[1].trim().parse().map_err(|_| bad("nproc"))?;
    let (total, available) = hardware::parse_meminfo(&sections[2]);
    let total = total.filter(|t| *t > 0).ok_or_else(|| bad("meminfo"))?;
    let available = available.unwrap_or(0).min(total);
    let disk: f64 = sections[3]
        .split_whitespace()
        .find(|f| f.ends_with('%'))
        .and_then(|f| f.trim_end_matches('%').parse().ok())
        .ok_or_else(|| bad("df"))?;

    Ok(SystemResources {
        cpu_usage: (load / cores.max(1.0) * 100.0).min(100.0),
        memory_usage: (1.0 - available as f64 / total as f64) * 100.0,
        disk_usage: disk,
    })
}
