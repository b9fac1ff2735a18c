//! 书籍遍历与回写
//!
//! 先序遍历：书名 → 简介 → 章标题 → 节标题 → 节正文 → 子节 → 下一节。
//! 每个非空文本字段生成一个翻译单元，回写时按 `unit_id` 对号入座，
//! 所以翻译完成的先后顺序不影响结果。

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::chunker;
use crate::book::{Book, Section};

/// 单元在书中的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitRole {
    BookTitle,
    BookDesc,
    ChapterTitle,
    SectionTitle,
    SectionContent,
    Paragraph,
}

impl UnitRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitRole::BookTitle => "book_title",
            UnitRole::BookDesc => "book_desc",
            UnitRole::ChapterTitle => "chapter_title",
            UnitRole::SectionTitle => "section_title",
            UnitRole::SectionContent => "section_content",
            UnitRole::Paragraph => "paragraph",
        }
    }
}

impl fmt::Display for UnitRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 翻译单元
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationUnit {
    pub unit_id: String,
    pub parent_path: String,
    pub role: UnitRole,
    /// 去掉首尾空白后的原文
    pub source_text: String,
    pub context_hint: String,
    /// 所属章节下标，书籍元数据为 `None`
    pub chapter_index: Option<usize>,
}

/// 计算单元标识：`H(path || role || text)`
pub fn unit_id(parent_path: &str, role: UnitRole, source_text: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in [parent_path, role.as_str(), source_text] {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher.finalize().to_hex()[..32].to_string()
}

/// 拆出首尾空白，返回 (前缀, 核心, 后缀)
fn split_padding(raw: &str) -> (&str, &str, &str) {
    let core_start = raw.len() - raw.trim_start().len();
    let core_end = raw.trim_end().len();
    if core_end <= core_start {
        return (raw, "", "");
    }
    (&raw[..core_start], &raw[core_start..core_end], &raw[core_end..])
}

fn make_unit(
    parent_path: &str,
    role: UnitRole,
    raw: &str,
    context_hint: String,
    chapter_index: Option<usize>,
) -> Option<TranslationUnit> {
    let (_, core, _) = split_padding(raw);
    if core.is_empty() {
        return None;
    }
    Some(TranslationUnit {
        unit_id: unit_id(parent_path, role, core),
        parent_path: parent_path.to_string(),
        role,
        source_text: core.to_string(),
        context_hint,
        chapter_index,
    })
}

/// 用译文替换核心部分，保留原有首尾空白
fn replace_core(raw: &str, translated: &str) -> String {
    let (prefix, _, suffix) = split_padding(raw);
    format!("{}{}{}", prefix, translated, suffix)
}

/// 书籍遍历器
#[derive(Debug, Clone, Copy, Default)]
pub struct BookWalker {
    /// 把节正文按段落拆成独立单元
    paragraph_units: bool,
}

impl BookWalker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_paragraph_units(mut self, enabled: bool) -> Self {
        self.paragraph_units = enabled;
        self
    }

    /// 按先序列出所有翻译单元
    pub fn collect_units(&self, book: &Book) -> Vec<TranslationUnit> {
        let mut units = Vec::new();
        units.extend(make_unit("book", UnitRole::BookTitle, &book.title, "book title".into(), None));
        units.extend(make_unit(
            "book",
            UnitRole::BookDesc,
            &book.description,
            "book description".into(),
            None,
        ));

        for (ci, chapter) in book.chapters.iter().enumerate() {
            let path = format!("ch[{}]", ci);
            units.extend(make_unit(
                &path,
                UnitRole::ChapterTitle,
                &chapter.title,
                format!("title of chapter {}", ci + 1),
                Some(ci),
            ));
            for (si, section) in chapter.sections.iter().enumerate() {
                self.collect_section(section, &format!("{}/sec[{}]", path, si), &chapter.title, ci, &mut units);
            }
        }
        units
    }

    fn collect_section(
        &self,
        section: &Section,
        path: &str,
        chapter_title: &str,
        ci: usize,
        units: &mut Vec<TranslationUnit>,
    ) {
        if let Some(title) = &section.title {
            units.extend(make_unit(
                path,
                UnitRole::SectionTitle,
                title,
                format!("section title in chapter \"{}\"", chapter_title),
                Some(ci),
            ));
        }

        let hint = format!("section text in chapter \"{}\"", chapter_title);
        if self.paragraph_units {
            for (pi, paragraph) in chunker::split_paragraphs(&section.content).iter().enumerate() {
                units.extend(make_unit(
                    &format!("{}/p[{}]", path, pi),
                    UnitRole::Paragraph,
                    paragraph,
                    hint.clone(),
                    Some(ci),
                ));
            }
        } else {
            units.extend(make_unit(path, UnitRole::SectionContent, &section.content, hint, Some(ci)));
        }

        for (ki, child) in section.children.iter().enumerate() {
            self.collect_section(child, &format!("{}/sec[{}]", path, ki), chapter_title, ci, units);
        }
    }

    /// 按 `unit_id` 回写译文，返回替换的字段数
    ///
    /// 缺少译文的单元保留原文。
    pub fn apply(&self, book: &mut Book, translations: &HashMap<String, String>) -> usize {
        let mut replaced = 0;
        let mut write = |path: &str, role: UnitRole, slot: &mut String| {
            let (_, core, _) = split_padding(slot);
            if core.is_empty() {
                return;
            }
            if let Some(translated) = translations.get(&unit_id(path, role, core)) {
                *slot = replace_core(slot, translated);
                replaced += 1;
            }
        };

        write("book", UnitRole::BookTitle, &mut book.title);
        write("book", UnitRole::BookDesc, &mut book.description);

        for (ci, chapter) in book.chapters.iter_mut().enumerate() {
            let path = format!("ch[{}]", ci);
            write(&path, UnitRole::ChapterTitle, &mut chapter.title);
            for (si, section) in chapter.sections.iter_mut().enumerate() {
                self.apply_section(section, &format!("{}/sec[{}]", path, si), &mut write);
            }
        }
        replaced
    }

    fn apply_section<W>(&self, section: &mut Section, path: &str, write: &mut W)
    where
        W: FnMut(&str, UnitRole, &mut String),
    {
        if let Some(title) = section.title.as_mut() {
            write(path, UnitRole::SectionTitle, title);
        }

        if self.paragraph_units {
            let mut rebuilt = String::with_capacity(section.content.len());
            for (pi, paragraph) in chunker::split_paragraphs(&section.content).iter().enumerate() {
                let mut piece = paragraph.to_string();
                write(&format!("{}/p[{}]", path, pi), UnitRole::Paragraph, &mut piece);
                rebuilt.push_str(&piece);
            }
            section.content = rebuilt;
        } else {
            write(path, UnitRole::SectionContent, &mut section.content);
        }

        for (ki, child) in section.children.iter_mut().enumerate() {
            self.apply_section(child, &format!("{}/sec[{}]", path, ki), write);
        }
    }

    /// 同步改写：对每个单元调用 `f`，结果原地写回
    pub fn rewrite<F>(&self, book: &mut Book, mut f: F) -> usize
    where
        F: FnMut(&TranslationUnit) -> String,
    {
        let translations: HashMap<String, String> = self
            .collect_units(book)
            .iter()
            .map(|unit| (unit.unit_id.clone(), f(unit)))
            .collect();
        self.apply(book, &translations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::Chapter;

    fn nested_book() -> Book {
        Book::new("").with_chapter(
            Chapter::new("c1", "Chapter").with_section(
                Section::new("s1", Some("S1 title"), "S1 content")
                    .with_child(Section::new("s1.1", Some("S1.1 title"), "Alpha")),
            ),
        )
    }

    #[test]
    fn test_preorder_roles() {
        let units = BookWalker::new().collect_units(&nested_book());
        let roles: Vec<UnitRole> = units.iter().map(|u| u.role).collect();
        assert_eq!(
            roles,
            vec![
                UnitRole::ChapterTitle,
                UnitRole::SectionTitle,
                UnitRole::SectionContent,
                UnitRole::SectionTitle,
                UnitRole::SectionContent,
            ]
        );
        assert_eq!(units[4].source_text, "Alpha");
        assert_eq!(units[4].parent_path, "ch[0]/sec[0]/sec[0]");
    }

    #[test]
    fn test_unit_ids_are_stable() {
        let a = BookWalker::new().collect_units(&nested_book());
        let b = BookWalker::new().collect_units(&nested_book());
        assert_eq!(a, b);
        assert_ne!(
            unit_id("p", UnitRole::SectionTitle, "x"),
            unit_id("p", UnitRole::SectionContent, "x")
        );
        // 长度前缀避免拼接歧义
        assert_ne!(
            unit_id("ab", UnitRole::Paragraph, "c"),
            unit_id("a", UnitRole::Paragraph, "bc")
        );
    }

    #[test]
    fn test_empty_fields_skipped() {
        let book = Book::new("   ").with_chapter(
            Chapter::new("c1", "").with_section(Section::new("s1", Some(" "), "\n\t")),
        );
        assert!(BookWalker::new().collect_units(&book).is_empty());
    }

    #[test]
    fn test_rewrite_preserves_padding_and_structure() {
        let mut book = Book::new("Title").with_chapter(
            Chapter::new("c1", "  One  ").with_section(Section::new("s1", None, "\nHello.\n")),
        );
        let shape = book.shape();
        let count = BookWalker::new().rewrite(&mut book, |u| u.source_text.to_uppercase());
        assert_eq!(count, 3);
        assert_eq!(book.title, "TITLE");
        assert_eq!(book.chapters[0].title, "  ONE  ");
        assert_eq!(book.chapters[0].sections[0].content, "\nHELLO.\n");
        assert_eq!(book.shape(), shape);
    }

    #[test]
    fn test_paragraph_units() {
        let mut book = Book::new("").with_chapter(
            Chapter::new("c1", "").with_section(Section::new("s1", None, "First.\n\nSecond.")),
        );
        let walker = BookWalker::new().with_paragraph_units(true);
        let units = walker.collect_units(&book);
        assert_eq!(units.len(), 2);
        assert!(units.iter().all(|u| u.role == UnitRole::Paragraph));

        walker.rewrite(&mut book, |u| format!("[{}]", u.source_text));
        assert_eq!(book.chapters[0].sections[0].content, "[First.]\n\n[Second.]");
    }

    #[test]
    fn test_missing_translation_keeps_source() {
        let mut book = nested_book();
        let units = BookWalker::new().collect_units(&book);
        let mut map = HashMap::new();
        map.insert(units[4].unit_id.clone(), "Альфа".to_string());
        assert_eq!(BookWalker::new().apply(&mut book, &map), 1);
        assert_eq!(book.chapters[0].sections[0].children[0].content, "Альфа");
        assert_eq!(book.chapters[0].sections[0].content, "S1 content");
    }
}
