//! 翻译系统核心模块
//!
//! - **协调器** (`coordinator.rs`): 后端实例注册、健康跟踪、按优先级回退
//! - **服务层** (`service.rs`): 一次完整的书籍翻译会话
//!
//! ```text
//! TranslationService (service.rs)
//!     ├── BookWalker (pipeline/walker.rs)
//!     ├── ProgressTracker (progress.rs)
//!     ├── SessionStore (storage/store)
//!     └── Coordinator (coordinator.rs)
//!             ├── TranslationCache (storage/cache.rs)
//!             └── BackendClient (backends/client.rs)
//! ```

pub mod coordinator;
pub mod service;

pub use coordinator::{
    BackendHealth, BackendInstance, CallContext, Coordinator, InstanceSnapshot, UnitOutcome,
};
pub use service::{SessionReport, TranslationService};
