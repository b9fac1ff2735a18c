//! 书籍树
//!
//! 格式解析器产出、序列化器消费的内存结构。只有文本字段会被翻译改写，
//! 标识符、嵌套关系和图片等二进制内容保持原样。

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::translation::error::{TranslationError, TranslationResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Book {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// 语言代码，如 `ru`、`sr`
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Section {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub children: Vec<Section>,
    #[serde(default)]
    pub images: Vec<Image>,
}

/// 内嵌图片，翻译过程中不做任何改动
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: String,
    #[serde(default)]
    pub media_type: String,
    /// 编码后的二进制内容
    #[serde(default)]
    pub data: String,
}

impl Book {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_chapter(mut self, chapter: Chapter) -> Self {
        self.chapters.push(chapter);
        self
    }

    /// 从 JSON 文件读取
    pub fn load_json(path: &Path) -> TranslationResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TranslationError::InvalidInput(format!("无法读取 {}: {}", path.display(), e))
        })?;
        let book = serde_json::from_str(&content)?;
        Ok(book)
    }

    pub fn save_json(&self, path: &Path) -> TranslationResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn section_count(&self) -> usize {
        fn count(sections: &[Section]) -> usize {
            sections.iter().map(|s| 1 + count(&s.children)).sum()
        }
        self.chapters.iter().map(|c| count(&c.sections)).sum()
    }

    /// 树形状签名：忽略文本，只保留结构
    pub fn shape(&self) -> String {
        fn section_shape(section: &Section, out: &mut String) {
            out.push_str(&format!(
                "S({};t={};i={}",
                section.id,
                section.title.is_some(),
                section.images.len()
            ));
            for child in &section.children {
                section_shape(child, out);
            }
            out.push(')');
        }

        let mut out = format!("B(a={}", self.authors.len());
        for chapter in &self.chapters {
            out.push_str(&format!("C({}", chapter.id));
            for section in &chapter.sections {
                section_shape(section, &mut out);
            }
            out.push(')');
        }
        out.push(')');
        out
    }
}

impl Chapter {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            sections: Vec::new(),
        }
    }

    pub fn with_section(mut self, section: Section) -> Self {
        self.sections.push(section);
        self
    }
}

impl Section {
    pub fn new(id: impl Into<String>, title: Option<&str>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.map(str::to_string),
            content: content.into(),
            children: Vec::new(),
            images: Vec::new(),
        }
    }

    pub fn with_child(mut self, child: Section) -> Self {
        self.children.push(child);
        self
    }
}
