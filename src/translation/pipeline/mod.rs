//! 翻译管道模块
//!
//! 提供书籍遍历、文本分块和输出文字转换

pub mod chunker;
pub mod script;
pub mod walker;

// 重新导出主要类型
pub use script::Script;
pub use walker::{BookWalker, TranslationUnit, UnitRole};
