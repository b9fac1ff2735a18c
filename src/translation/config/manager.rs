//! 配置管理器
//!
//! 提供统一的配置接口，支持配置文件、环境变量和默认值

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::constants;
use crate::translation::error::{TranslationError, TranslationResult};
use crate::translation::pipeline::Script;

/// 完整配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TranslatorConfig {
    #[serde(default)]
    pub translation: TranslationSettings,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub coordinator: CoordinatorSettings,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
}

/// 翻译设置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TranslationSettings {
    pub source_lang: String,
    pub target_lang: String,
    /// 未配置 `backends` 时使用的提供商
    pub default_provider: String,
    pub model: Option<String>,
    pub max_concurrent: usize,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub output_script: Option<Script>,
    /// 节正文按段落拆分为独立单元
    pub paragraph_units: bool,
    pub backend_timeout_secs: u64,
}

impl Default for TranslationSettings {
    fn default() -> Self {
        Self {
            source_lang: constants::DEFAULT_SOURCE_LANG.to_string(),
            target_lang: constants::DEFAULT_TARGET_LANG.to_string(),
            default_provider: constants::DEFAULT_PROVIDER.to_string(),
            model: None,
            max_concurrent: constants::DEFAULT_MAX_CONCURRENT,
            cache_ttl_secs: constants::DEFAULT_CACHE_TTL.as_secs(),
            cache_capacity: constants::DEFAULT_CACHE_CAPACITY,
            output_script: None,
            paragraph_units: false,
            backend_timeout_secs: constants::DEFAULT_BACKEND_TIMEOUT.as_secs(),
        }
    }
}

impl TranslationSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }
}

/// 单个后端实例配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    pub id: String,
    pub provider: String,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// 数字越小越优先
    pub priority: i32,
    pub concurrency_limit: usize,
    pub timeout_secs: Option<u64>,
    /// 超过该字节数时先分块再发送
    pub max_input_bytes: Option<usize>,
    pub supports_languages: Option<Vec<String>>,
    pub requests_per_second: Option<f64>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// llama.cpp 可执行文件
    pub binary_path: Option<String>,
    /// llama.cpp 模型文件，缺省时按模型注册表选择
    pub model_path: Option<String>,
    /// 词典后端的词条 `[["Hello", "Hola"], ...]`
    pub dictionary: Option<Vec<(String, String)>>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            provider: String::new(),
            model: None,
            api_key: None,
            base_url: None,
            priority: 1,
            concurrency_limit: constants::DEFAULT_BACKEND_CONCURRENCY,
            timeout_secs: None,
            max_input_bytes: None,
            supports_languages: None,
            requests_per_second: None,
            max_tokens: None,
            temperature: None,
            binary_path: None,
            model_path: None,
            dictionary: None,
        }
    }
}

impl BackendConfig {
    pub fn new(id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            ..Default::default()
        }
    }

    /// 配置中的密钥优先，其次读取对应的环境变量
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| crate::env::providers::api_key_for(&self.provider))
    }

    pub fn timeout(&self, fallback: Duration) -> Duration {
        self.timeout_secs.map(Duration::from_secs).unwrap_or(fallback)
    }
}

/// 重试退避设置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: constants::DEFAULT_RETRY_ATTEMPTS,
            base_delay_ms: constants::DEFAULT_RETRY_BASE_MS,
            factor: constants::DEFAULT_RETRY_FACTOR,
            max_delay_ms: constants::DEFAULT_RETRY_CAP_MS,
        }
    }
}

impl RetrySettings {
    /// 第 `retry` 次重试（从 0 起）前的等待时间：base × factor^retry，不超过上限
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = if self.factor.is_finite() && self.factor >= 1.0 {
            self.factor
        } else {
            1.0
        };
        let raw = self.base_delay_ms as f64 * factor.powi(retry.min(32) as i32);
        Duration::from_millis(raw.min(self.max_delay_ms as f64) as u64)
    }
}

/// 协调器设置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub primary_provider: Option<String>,
    /// 并发单元数，缺省为 min(8, 后端数 × 单后端并发)
    pub fan_out: Option<usize>,
    pub retry: RetrySettings,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            failure_threshold: constants::DEFAULT_FAILURE_THRESHOLD,
            cooldown_secs: constants::DEFAULT_COOLDOWN.as_secs(),
            primary_provider: None,
            fan_out: None,
            retry: RetrySettings::default(),
        }
    }
}

/// 会话存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    #[default]
    Memory,
    File,
    Sqlite,
}

/// 会话存储配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub store_type: StoreType,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// 文件存储与 SQLite 的数据库路径
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ssl: bool,
    pub encryption_key: Option<String>,
    pub max_open: u32,
    pub max_idle: u32,
    pub conn_max_lifetime_secs: u64,
    pub op_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_type: StoreType::Memory,
            host: None,
            port: None,
            database: None,
            user: None,
            password: None,
            ssl: false,
            encryption_key: None,
            max_open: 5,
            max_idle: 2,
            conn_max_lifetime_secs: 1800,
            op_timeout_secs: constants::DEFAULT_STORE_OP_TIMEOUT.as_secs(),
        }
    }
}

impl StorageConfig {
    pub fn op_timeout(&self) -> Duration {
        Duration::from_secs(self.op_timeout_secs.max(1))
    }

    /// 展开 `~` 后的数据库路径
    pub fn database_path(&self) -> Option<String> {
        self.database
            .as_deref()
            .map(|p| shellexpand::tilde(p).into_owned())
    }

    /// 应用 `TRANSLATOR_SESSION_STORE` 覆盖
    pub fn apply_env_overrides(&mut self) -> TranslationResult<()> {
        use crate::env::storage::SessionStore;
        use crate::env::EnvVar;

        let raw = match std::env::var(SessionStore::NAME) {
            Ok(raw) => raw,
            Err(_) => return Ok(()),
        };
        let store = SessionStore::parse(&raw)
            .map_err(|e| TranslationError::ConfigError(e.to_string()))?;

        self.store_type = match store.kind.as_str() {
            "file" => StoreType::File,
            "sqlite" => StoreType::Sqlite,
            _ => StoreType::Memory,
        };
        if store.location.is_some() {
            self.database = store.location;
        }
        tracing::info!("环境变量覆盖会话存储: {:?}", self.store_type);
        Ok(())
    }
}

/// 远程工作节点配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_file: String,
    pub max_capacity: usize,
    /// 该节点可运行的后端提供商
    pub backends: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: constants::DEFAULT_SSH_PORT,
            user: String::new(),
            key_file: String::new(),
            max_capacity: 1,
            backends: Vec::new(),
        }
    }
}

/// 分布式设置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DistributedConfig {
    pub enabled: bool,
    pub ssh_timeout_secs: u64,
    pub ssh_max_retries: u32,
    pub known_hosts: String,
    pub remote_binary: String,
    pub workers: Vec<WorkerConfig>,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ssh_timeout_secs: constants::DEFAULT_SSH_TIMEOUT.as_secs(),
            ssh_max_retries: constants::DEFAULT_SSH_MAX_RETRIES,
            known_hosts: constants::DEFAULT_KNOWN_HOSTS.to_string(),
            remote_binary: constants::DEFAULT_REMOTE_BINARY.to_string(),
            workers: Vec::new(),
        }
    }
}

impl DistributedConfig {
    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout_secs)
    }
}

/// 语言代码：2 到 8 位字母，可带 `-` 子标签
pub fn is_valid_language_code(code: &str) -> bool {
    let mut parts = code.split('-');
    let primary_ok = parts
        .next()
        .map_or(false, |p| (2..=3).contains(&p.len()) && p.chars().all(|c| c.is_ascii_alphabetic()));
    primary_ok && parts.all(|p| (2..=8).contains(&p.len()) && p.chars().all(|c| c.is_ascii_alphanumeric()))
}

fn config_error(msg: impl Into<String>) -> TranslationError {
    TranslationError::ConfigError(msg.into())
}

impl TranslatorConfig {
    /// 未显式配置后端时，按默认提供商生成一个
    pub fn effective_backends(&self) -> Vec<BackendConfig> {
        if !self.backends.is_empty() {
            return self.backends.clone();
        }
        let provider = self.translation.default_provider.clone();
        let mut backend = BackendConfig::new(provider.clone(), provider);
        backend.model = self.translation.model.clone();
        vec![backend]
    }

    /// 验证配置
    pub fn validate(&self) -> TranslationResult<()> {
        let t = &self.translation;
        if !is_valid_language_code(&t.source_lang) {
            return Err(config_error(format!("无效的源语言代码: '{}'", t.source_lang)));
        }
        if !is_valid_language_code(&t.target_lang) {
            return Err(config_error(format!("无效的目标语言代码: '{}'", t.target_lang)));
        }
        if t.max_concurrent == 0 {
            return Err(config_error("最大并发数不能为0"));
        }
        if t.cache_capacity == 0 {
            return Err(config_error("缓存容量不能为0"));
        }
        if t.backend_timeout_secs == 0 {
            return Err(config_error("后端超时不能为0"));
        }

        let mut ids = HashSet::new();
        for backend in &self.effective_backends() {
            self.validate_backend(backend)?;
            if !ids.insert(backend.id.as_str()) {
                return Err(config_error(format!("后端 id 重复: {}", backend.id)));
            }
        }

        let c = &self.coordinator;
        if c.failure_threshold == 0 {
            return Err(config_error("熔断阈值必须大于0"));
        }
        if c.retry.max_attempts == 0 {
            return Err(config_error("重试次数必须至少为1"));
        }
        if c.retry.factor < 1.0 {
            return Err(config_error("退避因子不能小于1"));
        }
        if c.fan_out == Some(0) {
            return Err(config_error("fan_out 不能为0"));
        }

        match self.storage.store_type {
            StoreType::File | StoreType::Sqlite if self.storage.database.is_none() => {
                return Err(config_error("文件存储和 SQLite 存储需要配置 database 路径"));
            }
            _ => {}
        }

        self.validate_distributed()
    }

    fn validate_backend(&self, backend: &BackendConfig) -> TranslationResult<()> {
        if backend.id.trim().is_empty() {
            return Err(config_error("后端 id 不能为空"));
        }
        if !crate::translation::backends::KNOWN_PROVIDERS.contains(&backend.provider.as_str()) {
            return Err(config_error(format!(
                "后端 {}: 未知的提供商 '{}'",
                backend.id, backend.provider
            )));
        }
        if backend.concurrency_limit == 0 {
            return Err(config_error(format!("后端 {}: 并发上限不能为0", backend.id)));
        }
        if let Some(url) = &backend.base_url {
            url::Url::parse(url).map_err(|e| {
                config_error(format!("后端 {}: base_url 无效 ({}): {}", backend.id, url, e))
            })?;
        }
        if let Some(rps) = backend.requests_per_second {
            if rps <= 0.0 {
                return Err(config_error(format!("后端 {}: 请求速率必须大于0", backend.id)));
            }
        }
        if let Some(langs) = &backend.supports_languages {
            if let Some(bad) = langs.iter().find(|l| !is_valid_language_code(l)) {
                return Err(config_error(format!("后端 {}: 无效的语言代码 '{}'", backend.id, bad)));
            }
        }
        Ok(())
    }

    fn validate_distributed(&self) -> TranslationResult<()> {
        let d = &self.distributed;
        if !d.enabled {
            return Ok(());
        }
        if d.ssh_timeout_secs == 0 {
            return Err(config_error("SSH 超时必须大于0"));
        }
        if d.workers.is_empty() {
            return Err(config_error("启用分布式时至少需要配置一个工作节点"));
        }
        for (index, worker) in d.workers.iter().enumerate() {
            let label = if worker.name.is_empty() {
                format!("#{}", index)
            } else {
                worker.name.clone()
            };
            if worker.name.trim().is_empty() {
                return Err(config_error(format!("工作节点 {}: name 不能为空", label)));
            }
            if worker.host.trim().is_empty() {
                return Err(config_error(format!("工作节点 {}: host 不能为空", label)));
            }
            if worker.port == 0 {
                return Err(config_error(format!("工作节点 {}: 端口无效 {}", label, worker.port)));
            }
            if worker.user.trim().is_empty() {
                return Err(config_error(format!("工作节点 {}: user 不能为空", label)));
            }
            if worker.key_file.trim().is_empty() {
                return Err(config_error(format!("工作节点 {}: 必须提供 key_file", label)));
            }
            if worker.max_capacity == 0 {
                return Err(config_error(format!("工作节点 {}: max_capacity 必须大于0", label)));
            }
        }
        Ok(())
    }
}

/// 配置管理器
pub struct ConfigManager {
    config: TranslatorConfig,
}

impl ConfigManager {
    /// 按搜索路径加载配置
    pub fn new() -> TranslationResult<Self> {
        Self::load_dotenv();

        for path in constants::CONFIG_PATHS {
            let expanded_path = shellexpand::tilde(path);
            if Path::new(expanded_path.as_ref()).exists() {
                tracing::info!("加载配置文件: {}", expanded_path);
                return Self::from_file(Path::new(expanded_path.as_ref()));
            }
        }

        tracing::info!("未找到配置文件，使用默认配置");
        Self::from_config(TranslatorConfig::default())
    }

    /// 从指定文件加载配置
    pub fn from_file(path: &Path) -> TranslationResult<Self> {
        if !path.exists() {
            return Err(config_error(format!("配置文件不存在: {}", path.display())));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .build()?;
        let config: TranslatorConfig = settings.try_deserialize()?;
        Self::from_config(config)
    }

    /// 使用已构造的配置，应用环境覆盖后校验
    pub fn from_config(mut config: TranslatorConfig) -> TranslationResult<Self> {
        config.storage.apply_env_overrides()?;
        config.validate()?;
        Ok(Self { config })
    }

    /// 获取配置
    pub fn get_config(&self) -> &TranslatorConfig {
        &self.config
    }

    pub fn into_config(self) -> TranslatorConfig {
        self.config
    }

    /// 加载 .env 文件
    pub fn load_dotenv() {
        let env_files = [".env.local", ".env"];

        for env_file in &env_files {
            if Path::new(env_file).exists() {
                if dotenv::from_filename(env_file).is_ok() {
                    tracing::info!("已加载环境变量文件: {}", env_file);
                    break;
                }
            }
        }
    }

    /// 生成带注释的默认配置文件
    pub fn create_default_config(path: &Path) -> TranslationResult<()> {
        let mut config = TranslatorConfig::default();
        let mut dictionary = BackendConfig::new("dictionary", "dictionary");
        dictionary.priority = 10;
        let mut openai = BackendConfig::new("openai-main", "openai");
        openai.model = Some("gpt-4o-mini".to_string());
        openai.priority = 1;
        config.backends = vec![openai, dictionary];
        config.storage.store_type = StoreType::File;
        config.storage.database = Some("~/.local/share/ebook-translator/sessions.redb".to_string());

        let body = toml::to_string_pretty(&config)?;
        let header = "\
# ebook-translator 配置文件
#
# API 密钥可以写在 backends.api_key 中，也可以通过环境变量提供：
#   OPENAI_API_KEY, ANTHROPIC_API_KEY, ZHIPU_API_KEY, DEEPSEEK_API_KEY
# 会话存储可用 TRANSLATOR_SESSION_STORE 覆盖（memory / file:<路径> / sqlite:<路径>）
# backends.priority 数字越小越优先

";
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, format!("{}{}", header, body))
            .map_err(|e| config_error(format!("写入配置文件失败: {}", e)))?;
        tracing::info!("已生成默认配置: {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TranslatorConfig::default();
        assert!(config.validate().is_ok());
        let backends = config.effective_backends();
        assert_eq!(backends.len(), 1);
        assert_eq!(backends[0].provider, "dictionary");
    }

    #[test]
    fn test_retry_backoff_is_capped() {
        let retry = RetrySettings::default();
        assert_eq!(retry.delay_for(0), Duration::from_secs(1));
        assert_eq!(retry.delay_for(1), Duration::from_secs(2));
        assert_eq!(retry.delay_for(4), Duration::from_secs(16));
        assert_eq!(retry.delay_for(10), Duration::from_secs(30));
    }

    #[test]
    fn test_language_codes() {
        assert!(is_valid_language_code("en"));
        assert!(is_valid_language_code("sr-Latn"));
        assert!(is_valid_language_code("zh-CN"));
        assert!(!is_valid_language_code(""));
        assert!(!is_valid_language_code("english"));
        assert!(!is_valid_language_code("e1"));
    }

    #[test]
    fn test_validation_errors() {
        let mut config = TranslatorConfig::default();
        config.translation.target_lang = "??".into();
        assert!(config.validate().is_err());

        let mut config = TranslatorConfig::default();
        config.backends = vec![BackendConfig::new("a", "openai"), BackendConfig::new("a", "anthropic")];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("重复"));

        let mut config = TranslatorConfig::default();
        config.backends = vec![BackendConfig::new("x", "babelfish")];
        assert!(config.validate().is_err());

        let mut config = TranslatorConfig::default();
        config.storage.store_type = StoreType::Sqlite;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_worker_validation() {
        let mut config = TranslatorConfig::default();
        config.distributed.enabled = true;
        assert!(config.validate().is_err());

        config.distributed.workers.push(WorkerConfig {
            name: "gpu-1".into(),
            host: "10.0.0.5".into(),
            user: "translator".into(),
            key_file: "~/.ssh/id_ed25519".into(),
            max_capacity: 2,
            ..Default::default()
        });
        assert!(config.validate().is_ok());

        config.distributed.workers[0].key_file.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("key_file"));
    }

    #[test]
    fn test_create_and_load_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("translator.toml");
        ConfigManager::create_default_config(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# ebook-translator"));

        let manager = ConfigManager::from_file(&path).unwrap();
        let config = manager.get_config();
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.storage.store_type, StoreType::File);
        assert_eq!(config.coordinator.failure_threshold, 3);
    }

    #[test]
    fn test_dictionary_entries_keep_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dict.toml");
        std::fs::write(
            &path,
            r#"
[translation]
source_lang = "en"
target_lang = "es"

[[backends]]
id = "dict"
provider = "dictionary"
dictionary = [["Hello", "Hola"]]
"#,
        )
        .unwrap();
        let manager = ConfigManager::from_file(&path).unwrap();
        let entries = manager.get_config().backends[0].dictionary.clone().unwrap();
        assert_eq!(entries, vec![("Hello".to_string(), "Hola".to_string())]);
    }
}
