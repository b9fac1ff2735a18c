//! 分布式工作节点
//!
//! 通过 SSH 管理远程翻译节点：主机公钥校验、硬件探测、按负载派发任务、
//! 部署与回滚。

pub mod pool;
pub mod probe;
pub mod remote;
pub mod ssh;
pub mod types;

pub use pool::{Job, WorkerPool};
pub use remote::RemoteWorkerBackend;
pub use ssh::{CommandOutput, OpenSshTransport, SshEndpoint, SshTransport};
pub use types::{
    BatchDeploymentRequest, BatchDeploymentResponse, DeploymentRequest, DeploymentResponse,
    DeploymentStatus, RollbackMode, SystemResources, WorkerCapabilities, WorkerState, WorkerStatus,
};
