//! 翻译模块
//!
//! 采用分层的模块化结构：
//! - **backends**: 各提供商适配器，以及带重试和分块的客户端
//! - **core**: 多后端协调器与书籍翻译服务
//! - **pipeline**: 书籍遍历、文本分块、输出文字转换
//! - **storage**: 翻译缓存与会话持久化
//! - **progress**: 会话进度跟踪
//! - **events**: 进程内事件总线
//! - **config**: 配置管理
//! - **error**: 错误处理
//!
//! # 基本用法
//!
//! ```rust,no_run
//! use ebook_translator::book::Book;
//! use ebook_translator::translation::{EventBus, SessionMeta, TranslationService, TranslatorConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TranslatorConfig::default();
//! let service = TranslationService::from_config(&config, EventBus::new()).await?;
//!
//! let mut book = Book::load_json(std::path::Path::new("book.json"))?;
//! let report = service
//!     .translate_book(&mut book, SessionMeta::default(), &CancellationToken::new())
//!     .await?;
//! println!("完成 {} 个单元", report.session.items_completed);
//! # Ok(())
//! # }
//! ```

// ============================================================================
// 子模块声明
// ============================================================================

/// 翻译后端适配器
pub mod backends;

/// 配置管理模块 - 处理翻译相关的所有配置
pub mod config;

/// 核心模块 - 协调器与翻译服务
pub mod core;

/// 错误处理模块 - 统一的错误类型和处理机制
pub mod error;

/// 事件总线
pub mod events;

/// 本地模型目录
pub mod models;

/// 文本处理管道模块 - 遍历、分块与文字转换
pub mod pipeline;

/// 会话进度
pub mod progress;

/// 存储管理模块 - 缓存和持久化存储
pub mod storage;

// ============================================================================
// 核心API导出
// ============================================================================

pub use backends::{BackendClient, BackendKind, BackendRequest, TranslationBackend};
pub use config::{constants, ConfigManager, TranslatorConfig};
pub use core::{BackendHealth, BackendInstance, Coordinator, SessionReport, TranslationService};
pub use error::{ErrorClass, ErrorSeverity, ErrorStats, TranslationError, TranslationResult};
pub use events::{Event, EventBus, EventType};
pub use pipeline::{BookWalker, Script, TranslationUnit, UnitRole};
pub use progress::{Eta, ProgressTracker};
pub use storage::{
    open_store, CacheKey, Session, SessionMeta, SessionStatus, SessionStore, TranslationCache,
};

/// 模块版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
