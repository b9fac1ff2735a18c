//! 翻译配置管理模块
//!
//! 配置以不可变结构体的形式经由构造函数传入各组件；
//! 环境变量只负责 API 密钥和会话存储覆盖。

pub mod manager;

// 重新导出主要类型
pub use manager::{
    BackendConfig, ConfigManager, CoordinatorSettings, DistributedConfig, RetrySettings,
    StorageConfig, StoreType, TranslationSettings, TranslatorConfig, WorkerConfig,
};

/// 配置常量
pub mod constants {
    use std::time::Duration;

    // 翻译默认值
    pub const DEFAULT_SOURCE_LANG: &str = "ru";
    pub const DEFAULT_TARGET_LANG: &str = "sr";
    pub const DEFAULT_PROVIDER: &str = "dictionary";
    pub const DEFAULT_MAX_CONCURRENT: usize = 5;
    pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

    // 缓存设置
    pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(3600); // 1小时

    // 超时设置
    pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(300);
    pub const DEFAULT_SSH_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_STORE_OP_TIMEOUT: Duration = Duration::from_secs(10);

    // 协调器
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
    pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);
    pub const DEFAULT_BACKEND_CONCURRENCY: usize = 2;
    pub const MAX_DEFAULT_FAN_OUT: usize = 8;

    // 重试退避
    pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
    pub const DEFAULT_RETRY_BASE_MS: u64 = 1000;
    pub const DEFAULT_RETRY_FACTOR: f64 = 2.0;
    pub const DEFAULT_RETRY_CAP_MS: u64 = 30_000;

    // 进度
    pub const PROGRESS_THROTTLE: Duration = Duration::from_millis(200);

    // 分布式
    pub const DEFAULT_SSH_PORT: u16 = 22;
    pub const DEFAULT_SSH_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_KNOWN_HOSTS: &str = "~/.ssh/known_hosts";
    pub const DEFAULT_REMOTE_BINARY: &str = "translate";
    pub const UNREACHABLE_AFTER_FAILURES: u32 = 3;

    // 配置文件搜索路径
    pub const CONFIG_PATHS: &[&str] = &[
        "translator.toml",
        ".translator.toml",
        "~/.config/ebook-translator/config.toml",
        "/etc/ebook-translator/config.toml",
    ];
}

/// 便利函数
pub fn config_file_exists() -> bool {
    constants::CONFIG_PATHS
        .iter()
        .any(|path| std::path::Path::new(shellexpand::tilde(path).as_ref()).exists())
}
