//! 统一的环境变量管理系统
//!
//! 环境变量只用于两类信息：提供商 API 密钥，以及会话存储的单一覆盖项。
//! 其余配置一律通过配置结构体传入。

use std::env;
use std::fmt;

/// 环境变量解析错误
#[derive(Debug, Clone)]
pub struct EnvError {
    pub variable: String,
    pub message: String,
}

impl fmt::Display for EnvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Environment variable '{}': {}", self.variable, self.message)
    }
}

impl std::error::Error for EnvError {}

pub type EnvResult<T> = Result<T, EnvError>;

/// 环境变量访问器特性
pub trait EnvVar<T> {
    const NAME: &'static str;
    const DEFAULT: Option<T>;
    const DESCRIPTION: &'static str;

    fn parse(value: &str) -> EnvResult<T>;

    fn get() -> EnvResult<T> {
        match env::var(Self::NAME) {
            Ok(value) => Self::parse(&value),
            Err(_) => {
                if let Some(default) = Self::DEFAULT {
                    Ok(default)
                } else {
                    Err(EnvError {
                        variable: Self::NAME.to_string(),
                        message: "Required environment variable not set".to_string(),
                    })
                }
            }
        }
    }

    fn get_or_default(default: T) -> T {
        Self::get().unwrap_or(default)
    }
}

/// 核心环境变量定义
pub mod core {
    use super::*;

    /// 日志级别
    pub struct LogLevel;
    impl EnvVar<String> for LogLevel {
        const NAME: &'static str = "TRANSLATOR_LOG_LEVEL";
        const DEFAULT: Option<String> = None;
        const DESCRIPTION: &'static str = "Log level: trace, debug, info, warn, error";

        fn get() -> EnvResult<String> {
            match env::var(Self::NAME) {
                Ok(value) => Self::parse(&value),
                Err(_) => Ok("info".to_string()),
            }
        }

        fn parse(value: &str) -> EnvResult<String> {
            match value.to_lowercase().as_str() {
                "trace" | "debug" | "info" | "warn" | "error" => Ok(value.to_lowercase()),
                _ => Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: format!(
                        "Invalid log level '{}'. Use: trace, debug, info, warn, error",
                        value
                    ),
                }),
            }
        }
    }
}

/// 提供商 API 密钥
pub mod providers {
    use super::*;

    macro_rules! api_key_var {
        ($name:ident, $var:literal, $desc:literal) => {
            pub struct $name;
            impl EnvVar<String> for $name {
                const NAME: &'static str = $var;
                const DEFAULT: Option<String> = None;
                const DESCRIPTION: &'static str = $desc;

                fn parse(value: &str) -> EnvResult<String> {
                    parse_non_empty(value, Self::NAME)
                }
            }
        };
    }

    api_key_var!(OpenAiApiKey, "OPENAI_API_KEY", "API key for OpenAI");
    api_key_var!(AnthropicApiKey, "ANTHROPIC_API_KEY", "API key for Anthropic");
    api_key_var!(ZhipuApiKey, "ZHIPU_API_KEY", "API key for Zhipu AI");
    api_key_var!(DeepSeekApiKey, "DEEPSEEK_API_KEY", "API key for DeepSeek");

    /// 按提供商名查找环境中的 API 密钥
    pub fn api_key_for(provider: &str) -> Option<String> {
        match provider.to_lowercase().as_str() {
            "openai" => OpenAiApiKey::get().ok(),
            "anthropic" => AnthropicApiKey::get().ok(),
            "zhipu" => ZhipuApiKey::get().ok(),
            "deepseek" => DeepSeekApiKey::get().ok(),
            _ => None,
        }
    }
}

/// 会话存储覆盖
pub mod storage {
    use super::*;

    /// 解析后的存储覆盖项，如 `sqlite:/var/lib/translator.db`
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct StoreOverride {
        pub kind: String,
        pub location: Option<String>,
    }

    pub struct SessionStore;
    impl EnvVar<StoreOverride> for SessionStore {
        const NAME: &'static str = "TRANSLATOR_SESSION_STORE";
        const DEFAULT: Option<StoreOverride> = None;
        const DESCRIPTION: &'static str =
            "Session store override: memory, file:<path> or sqlite:<path>";

        fn parse(value: &str) -> EnvResult<StoreOverride> {
            let (kind, location) = match value.split_once(':') {
                Some((kind, location)) => (kind, Some(location.to_string())),
                None => (value, None),
            };
            let kind = kind.trim().to_lowercase();

            match (kind.as_str(), &location) {
                ("memory", _) => Ok(StoreOverride {
                    kind: kind.clone(),
                    location: None,
                }),
                ("file" | "sqlite", Some(path)) if !path.trim().is_empty() => Ok(StoreOverride {
                    kind: kind.clone(),
                    location: Some(shellexpand::tilde(path.trim()).into_owned()),
                }),
                ("file" | "sqlite", _) => Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: format!("Store type '{}' requires a path, e.g. {}:/path/db", kind, kind),
                }),
                _ => Err(EnvError {
                    variable: Self::NAME.to_string(),
                    message: format!("Unknown store type '{}'. Use: memory, file, sqlite", kind),
                }),
            }
        }
    }
}

/// 辅助函数
fn parse_non_empty(value: &str, var_name: &str) -> EnvResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EnvError {
            variable: var_name.to_string(),
            message: "Value must not be empty".to_string(),
        });
    }
    Ok(trimmed.to_string())
}

/// 环境变量配置汇总
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub log_level: String,
    pub session_store: Option<storage::StoreOverride>,
    pub configured_providers: Vec<&'static str>,
}

impl EnvConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> EnvResult<Self> {
        use providers::*;

        let session_store = match env::var(storage::SessionStore::NAME) {
            Ok(value) => Some(storage::SessionStore::parse(&value)?),
            Err(_) => None,
        };

        let mut configured_providers = Vec::new();
        if OpenAiApiKey::get().is_ok() {
            configured_providers.push("openai");
        }
        if AnthropicApiKey::get().is_ok() {
            configured_providers.push("anthropic");
        }
        if ZhipuApiKey::get().is_ok() {
            configured_providers.push("zhipu");
        }
        if DeepSeekApiKey::get().is_ok() {
            configured_providers.push("deepseek");
        }

        Ok(Self {
            log_level: core::LogLevel::get()?,
            session_store,
            configured_providers,
        })
    }

    /// 打印配置摘要（隐藏敏感信息）
    pub fn print_summary(&self) {
        println!("Environment Configuration Summary:");
        println!("  Log Level: {}", self.log_level);
        match &self.session_store {
            Some(store) => println!(
                "  Session Store: {}{}",
                store.kind,
                store.location.as_deref().map(|l| format!(" ({})", l)).unwrap_or_default()
            ),
            None => println!("  Session Store: [from config]"),
        }
        for provider in &self.configured_providers {
            println!("  API Key ({}): [configured]", provider);
        }
    }
}

/// 环境变量文档生成器
pub fn generate_env_docs() -> String {
    use providers::*;

    let mut docs = String::new();
    docs.push_str("# Environment Variables Documentation\n\n");

    docs.push_str("## Core Configuration\n\n");
    docs.push_str(&format!(
        "- `{}`: {} (default: info)\n",
        core::LogLevel::NAME,
        core::LogLevel::DESCRIPTION
    ));
    docs.push_str(&format!(
        "- `{}`: {}\n",
        storage::SessionStore::NAME,
        storage::SessionStore::DESCRIPTION
    ));

    docs.push_str("\n## Provider API Keys\n\n");
    for (name, description) in [
        (OpenAiApiKey::NAME, OpenAiApiKey::DESCRIPTION),
        (AnthropicApiKey::NAME, AnthropicApiKey::DESCRIPTION),
        (ZhipuApiKey::NAME, ZhipuApiKey::DESCRIPTION),
        (DeepSeekApiKey::NAME, DeepSeekApiKey::DESCRIPTION),
    ] {
        docs.push_str(&format!("- `{}`: {}\n", name, description));
    }

    docs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(core::LogLevel::parse("DEBUG").unwrap(), "debug");
        assert!(core::LogLevel::parse("loud").is_err());
    }

    #[test]
    fn test_store_override_parsing() {
        use storage::SessionStore;

        let memory = SessionStore::parse("memory").unwrap();
        assert_eq!(memory.kind, "memory");
        assert_eq!(memory.location, None);

        let sqlite = SessionStore::parse("sqlite:/tmp/sessions.db").unwrap();
        assert_eq!(sqlite.kind, "sqlite");
        assert_eq!(sqlite.location.as_deref(), Some("/tmp/sessions.db"));

        assert!(SessionStore::parse("file:").is_err());
        assert!(SessionStore::parse("postgres:db").is_err());
    }

    #[test]
    fn test_api_key_must_not_be_empty() {
        assert!(providers::OpenAiApiKey::parse("  ").is_err());
        assert_eq!(providers::DeepSeekApiKey::parse(" sk-1 ").unwrap(), "sk-1");
        assert_eq!(providers::api_key_for("dictionary"), None);
    }

    #[test]
    fn test_env_docs_mention_all_keys() {
        let docs = generate_env_docs();
        for name in [
            "OPENAI_API_KEY",
            "ANTHROPIC_API_KEY",
            "ZHIPU_API_KEY",
            "DEEPSEEK_API_KEY",
            "TRANSLATOR_SESSION_STORE",
        ] {
            assert!(docs.contains(name), "missing {}", name);
        }
    }
}
