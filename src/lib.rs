//! # ebook-translator
//!
//! 书籍翻译引擎：遍历书籍结构树，把每个文本单元交给按优先级排列的多个
//! 翻译后端，结果写入缓存与会话存储，支持断点续传和远程工作节点。
//!
//! ## 模块组织
//!
//! - `book` - 书籍结构树（章节、小节、图片）
//! - `translation` - 翻译核心：后端、协调器、缓存、会话与进度
//! - `distributed` - 通过 SSH 管理的远程工作节点
//! - `hardware` - 本机与远程节点的硬件检测
//! - `env` - 环境变量读取

pub mod book;
pub mod distributed;
pub mod env;
pub mod hardware;
pub mod translation;

pub use book::{Book, Chapter, Image, Section};
pub use translation::{TranslationError, TranslationResult, TranslationService};
