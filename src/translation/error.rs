//! 翻译模块统一错误处理
//!
//! 所有失败都带有一个错误类别（[`ErrorClass`]），调用方按类别分派，
//! 不对提供商返回的字符串做匹配。

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// 错误类别
///
/// 分类发生在适配器边界，上层只看类别。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// 输入超出模型上下文
    SizeExceeded,
    RateLimited,
    Auth,
    Network,
    /// 服务端错误（5xx）
    Provider,
    ContentPolicy,
    Cancelled,
    /// 输入或配置不合法，永不重试
    Validation,
    /// 持久化存储不可用
    Storage,
    Other,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::SizeExceeded => "size_exceeded",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Auth => "auth",
            ErrorClass::Network => "network",
            ErrorClass::Provider => "provider",
            ErrorClass::ContentPolicy => "content_policy",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Validation => "validation",
            ErrorClass::Storage => "storage",
            ErrorClass::Other => "other",
        }
    }

    /// 暂时性故障，可在同一后端内退避重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorClass::Network | ErrorClass::RateLimited | ErrorClass::Provider
        )
    }

    /// 永久性后端故障，不重试，实例降级
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ErrorClass::Auth | ErrorClass::ContentPolicy | ErrorClass::Other
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 字段级校验错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (field: {})", self.message, self.field)
    }
}

impl std::error::Error for ValidationError {}

/// 翻译错误类型
#[derive(Error, Debug, Clone)]
pub enum TranslationError {
    /// 配置错误
    #[error("配置错误: {0}")]
    ConfigError(String),

    /// 输入验证错误
    #[error("输入无效: {0}")]
    InvalidInput(String),

    /// 字段校验失败
    #[error("校验失败: {0}")]
    Validation(ValidationError),

    /// 输入超过模型上下文窗口
    #[error("输入超出模型上下文: {0}")]
    SizeExceeded(String),

    /// 速率限制错误
    #[error("请求速率过快，已达到限制: {0}")]
    RateLimited(String),

    /// 认证失败
    #[error("认证失败: {0}")]
    AuthError(String),

    /// 网络错误
    #[error("网络错误: {0}")]
    NetworkError(String),

    /// 超时错误
    #[error("操作超时: {0}")]
    TimeoutError(String),

    /// 提供商服务端错误
    #[error("翻译服务错误: {0}")]
    ProviderError(String),

    /// 模型或接口不存在
    #[error("模型无效: {0}")]
    InvalidModel(String),

    /// 内容被提供商策略拦截
    #[error("内容策略拒绝: {0}")]
    ContentPolicy(String),

    /// 操作被取消
    #[error("操作已取消: {0}")]
    Cancelled(String),

    /// 存储错误
    #[error("存储错误: {0}")]
    StorageError(String),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    SerializationError(String),

    /// 没有满足条件的后端
    #[error("没有可用的后端: {0}")]
    NoBackendAvailable(String),

    /// 所有候选后端均失败
    #[error("所有后端均失败（尝试 {attempts} 个），最后错误: {last}")]
    FallbackExhausted {
        attempts: usize,
        last: Box<TranslationError>,
    },

    /// 远程工作节点错误
    #[error("工作节点错误: {0}")]
    WorkerError(String),

    /// 内部错误
    #[error("内部错误: {0}")]
    InternalError(String),
}

impl TranslationError {
    /// 错误类别
    pub fn class(&self) -> ErrorClass {
        match self {
            TranslationError::ConfigError(_) => ErrorClass::Validation,
            TranslationError::InvalidInput(_) => ErrorClass::Validation,
            TranslationError::Validation(_) => ErrorClass::Validation,
            TranslationError::SizeExceeded(_) => ErrorClass::SizeExceeded,
            TranslationError::RateLimited(_) => ErrorClass::RateLimited,
            TranslationError::AuthError(_) => ErrorClass::Auth,
            TranslationError::NetworkError(_) => ErrorClass::Network,
            TranslationError::TimeoutError(_) => ErrorClass::Network,
            TranslationError::ProviderError(_) => ErrorClass::Provider,
            TranslationError::InvalidModel(_) => ErrorClass::Other,
            TranslationError::ContentPolicy(_) => ErrorClass::ContentPolicy,
            TranslationError::Cancelled(_) => ErrorClass::Cancelled,
            TranslationError::StorageError(_) => ErrorClass::Storage,
            TranslationError::SerializationError(_) => ErrorClass::Other,
            TranslationError::NoBackendAvailable(_) => ErrorClass::Other,
            TranslationError::FallbackExhausted { last, .. } => last.class(),
            TranslationError::WorkerError(_) => ErrorClass::Network,
            TranslationError::InternalError(_) => ErrorClass::Other,
        }
    }

    /// 检查错误是否可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            TranslationError::FallbackExhausted { .. } => false,
            other => other.class().is_transient(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.class() == ErrorClass::Cancelled
    }

    /// 获取错误的严重程度
    pub fn severity(&self) -> ErrorSeverity {
        match self.class() {
            ErrorClass::Validation => ErrorSeverity::Info,
            ErrorClass::Cancelled => ErrorSeverity::Info,
            ErrorClass::Network | ErrorClass::RateLimited | ErrorClass::SizeExceeded => {
                ErrorSeverity::Warning
            }
            ErrorClass::Provider | ErrorClass::ContentPolicy | ErrorClass::Other => {
                ErrorSeverity::Error
            }
            ErrorClass::Auth | ErrorClass::Storage => ErrorSeverity::Critical,
        }
    }

    /// 日志与事件中使用的类别标签
    ///
    /// 回退耗尽的错误带 `fallback_exhausted` 标注。
    pub fn category(&self) -> String {
        match self {
            TranslationError::FallbackExhausted { last, .. } => {
                format!("fallback_exhausted:{}", last.class())
            }
            other => other.class().to_string(),
        }
    }

    /// 创建带上下文的错误
    pub fn with_context<T: fmt::Display>(mut self, context: T) -> Self {
        let new_msg = |msg: &str| format!("{} (上下文: {})", msg, context);

        match &mut self {
            TranslationError::ConfigError(ref mut msg)
            | TranslationError::InvalidInput(ref mut msg)
            | TranslationError::SizeExceeded(ref mut msg)
            | TranslationError::RateLimited(ref mut msg)
            | TranslationError::AuthError(ref mut msg)
            | TranslationError::NetworkError(ref mut msg)
            | TranslationError::TimeoutError(ref mut msg)
            | TranslationError::ProviderError(ref mut msg)
            | TranslationError::InvalidModel(ref mut msg)
            | TranslationError::ContentPolicy(ref mut msg)
            | TranslationError::Cancelled(ref mut msg)
            | TranslationError::StorageError(ref mut msg)
            | TranslationError::SerializationError(ref mut msg)
            | TranslationError::NoBackendAvailable(ref mut msg)
            | TranslationError::WorkerError(ref mut msg)
            | TranslationError::InternalError(ref mut msg) => *msg = new_msg(msg),
            TranslationError::Validation(ref mut err) => err.message = new_msg(&err.message),
            TranslationError::FallbackExhausted { .. } => {}
        }

        self
    }
}

/// 错误严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl From<ValidationError> for TranslationError {
    fn from(error: ValidationError) -> Self {
        TranslationError::Validation(error)
    }
}

/// 标准错误转换
impl From<std::io::Error> for TranslationError {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::TimedOut => TranslationError::TimeoutError(format!("IO超时: {}", error)),
            _ => TranslationError::InternalError(format!("IO错误: {}", error)),
        }
    }
}

impl From<serde_json::Error> for TranslationError {
    fn from(error: serde_json::Error) -> Self {
        TranslationError::SerializationError(format!("JSON序列化错误: {}", error))
    }
}

impl From<toml::de::Error> for TranslationError {
    fn from(error: toml::de::Error) -> Self {
        TranslationError::ConfigError(format!("TOML解析错误: {}", error))
    }
}

impl From<toml::ser::Error> for TranslationError {
    fn from(error: toml::ser::Error) -> Self {
        TranslationError::SerializationError(format!("TOML序列化错误: {}", error))
    }
}

impl From<config::ConfigError> for TranslationError {
    fn from(error: config::ConfigError) -> Self {
        TranslationError::ConfigError(error.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TranslationError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        TranslationError::TimeoutError(format!("异步操作超时: {}", error))
    }
}

impl From<reqwest::Error> for TranslationError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            TranslationError::TimeoutError(format!("请求超时: {}", error))
        } else if error.is_connect() || error.is_request() {
            TranslationError::NetworkError(format!("请求失败: {}", error))
        } else if error.is_decode() {
            TranslationError::ProviderError(format!("响应解析失败: {}", error))
        } else {
            TranslationError::NetworkError(error.to_string())
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for TranslationError {
    fn from(error: sqlx::Error) -> Self {
        TranslationError::StorageError(format!("SQLite错误: {}", error))
    }
}

macro_rules! storage_error_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for TranslationError {
                fn from(error: $ty) -> Self {
                    TranslationError::StorageError(format!("redb错误: {}", error))
                }
            }
        )*
    };
}

storage_error_from!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

/// 错误结果类型别名
pub type TranslationResult<T> = Result<T, TranslationError>;

/// 错误统计信息
#[derive(Debug, Clone, Default)]
pub struct ErrorStats {
    pub total_errors: usize,
    pub by_class: HashMap<ErrorClass, usize>,
    pub by_severity: HashMap<ErrorSeverity, usize>,
    pub retryable_errors: usize,
    pub critical_errors: usize,
}

impl ErrorStats {
    /// 记录错误
    pub fn record_error(&mut self, error: &TranslationError) {
        self.total_errors += 1;

        *self.by_class.entry(error.class()).or_insert(0) += 1;

        let severity = error.severity();
        *self.by_severity.entry(severity).or_insert(0) += 1;

        if error.is_retryable() {
            self.retryable_errors += 1;
        }

        if severity == ErrorSeverity::Critical {
            self.critical_errors += 1;
        }
    }

    /// 获取错误率
    pub fn error_rate(&self, total_operations: usize) -> f64 {
        if total_operations == 0 {
            0.0
        } else {
            self.total_errors as f64 / total_operations as f64
        }
    }
}

/// 错误处理助手函数
pub mod helpers {
    use super::*;

    /// 记录并返回错误
    pub fn log_error<T>(error: TranslationError) -> TranslationResult<T> {
        match error.severity() {
            ErrorSeverity::Info => tracing::info!(error_class = %error.category(), "翻译信息: {}", error),
            ErrorSeverity::Warning => tracing::warn!(error_class = %error.category(), "翻译警告: {}", error),
            ErrorSeverity::Error => tracing::error!(error_class = %error.category(), "翻译错误: {}", error),
            ErrorSeverity::Critical => {
                tracing::error!(error_class = %error.category(), "翻译严重错误: {}", error)
            }
        }

        Err(error)
    }

    /// 创建配置错误
    pub fn config_error<T: fmt::Display>(msg: T) -> TranslationError {
        TranslationError::ConfigError(msg.to_string())
    }

    /// 创建输入验证错误
    pub fn validation_error<T: fmt::Display>(msg: T) -> TranslationError {
        TranslationError::InvalidInput(msg.to_string())
    }

    /// 创建存储错误
    pub fn storage_error<T: fmt::Display>(msg: T) -> TranslationError {
        TranslationError::StorageError(msg.to_string())
    }

    /// 创建取消错误
    pub fn cancelled<T: fmt::Display>(msg: T) -> TranslationError {
        TranslationError::Cancelled(msg.to_string())
    }

    /// 创建内部错误
    pub fn internal_error<T: fmt::Display>(msg: T) -> TranslationError {
        TranslationError::InternalError(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(TranslationError::AuthError("bad key".into()).class(), ErrorClass::Auth);
        assert_eq!(TranslationError::TimeoutError("slow".into()).class(), ErrorClass::Network);
        assert_eq!(
            TranslationError::ConfigError("x".into()).class(),
            ErrorClass::Validation
        );
        assert_eq!(ErrorClass::SizeExceeded.to_string(), "size_exceeded");
    }

    #[test]
    fn test_retryable_only_for_transient() {
        assert!(TranslationError::NetworkError("reset".into()).is_retryable());
        assert!(TranslationError::RateLimited("429".into()).is_retryable());
        assert!(TranslationError::ProviderError("500".into()).is_retryable());
        assert!(!TranslationError::AuthError("401".into()).is_retryable());
        assert!(!TranslationError::SizeExceeded("too long".into()).is_retryable());
        assert!(!TranslationError::Cancelled("stop".into()).is_retryable());
    }

    #[test]
    fn test_fallback_exhausted_keeps_last_class() {
        let err = TranslationError::FallbackExhausted {
            attempts: 2,
            last: Box::new(TranslationError::AuthError("denied".into())),
        };
        assert_eq!(err.class(), ErrorClass::Auth);
        assert_eq!(err.category(), "fallback_exhausted:auth");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::new("target_host", "target host is required");
        assert_eq!(err.to_string(), "target host is required (field: target_host)");
    }

    #[test]
    fn test_with_context() {
        let err = TranslationError::NetworkError("连接重置".into()).with_context("openai");
        assert!(err.to_string().contains("上下文: openai"));
        assert_eq!(err.class(), ErrorClass::Network);
    }

    #[test]
    fn test_error_stats() {
        let mut stats = ErrorStats::default();
        stats.record_error(&TranslationError::NetworkError("a".into()));
        stats.record_error(&TranslationError::AuthError("b".into()));
        assert_eq!(stats.total_errors, 2);
        assert_eq!(stats.retryable_errors, 1);
        assert_eq!(stats.critical_errors, 1);
        assert_eq!(stats.by_class.get(&ErrorClass::Auth), Some(&1));
        assert!((stats.error_rate(4) - 0.5).abs() < f64::EPSILON);
    }
}
