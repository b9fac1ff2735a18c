//! 词典后端
//!
//! 整词替换：先精确匹配，再按小写匹配并保留首字母大写。没有网络依赖，
//! 用于测试和最后的低质量兜底。

use std::collections::HashMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{BackendKind, BackendRequest, TranslationBackend};
use crate::translation::config::BackendConfig;
use crate::translation::error::{TranslationError, TranslationResult};

/// 内置俄语 → 塞尔维亚语词表
const DEFAULT_ENTRIES: &[(&str, &str)] = &[
    ("мир", "свет"),
    ("человек", "човек"),
    ("жизнь", "живот"),
    ("любовь", "љубав"),
    ("смерть", "смрт"),
    ("время", "време"),
    ("дом", "кућа"),
    ("сердце", "срце"),
    ("душа", "душа"),
    ("ночь", "ноћ"),
    ("день", "дан"),
    ("солнце", "сунце"),
    ("луна", "месец"),
    ("звезда", "звезда"),
    ("небо", "небо"),
    ("земля", "земља"),
    ("вода", "вода"),
    ("огонь", "ватра"),
    ("воздух", "ваздух"),
    ("деревня", "село"),
    ("город", "град"),
    ("улица", "улица"),
    ("книга", "књига"),
    ("слово", "реч"),
    ("язык", "језик"),
    ("глава", "поглавље"),
    ("история", "прича"),
    ("конец", "крај"),
    ("начало", "почетак"),
    ("будущее", "будућност"),
    ("прошлое", "прошлост"),
    ("вопрос", "питање"),
    ("ответ", "одговор"),
    ("мысль", "мисао"),
    ("радость", "радост"),
    ("грусть", "туга"),
    ("страх", "страх"),
    ("надежда", "нада"),
    ("герой", "јунак"),
    ("приключения", "авантуре"),
];

pub struct DictionaryBackend {
    model: String,
    exact: HashMap<String, String>,
    folded: HashMap<String, String>,
}

impl DictionaryBackend {
    /// 使用内置词表
    pub fn new() -> Self {
        Self::with_entries(
            DEFAULT_ENTRIES
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string())),
        )
    }

    pub fn with_entries(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut backend = Self {
            model: "default".to_string(),
            exact: HashMap::new(),
            folded: HashMap::new(),
        };
        for (from, to) in entries {
            backend.add_entry(from, to);
        }
        backend
    }

    /// 配置中给出词条时只用这些词条，否则用内置词表
    pub fn from_config(config: &BackendConfig) -> Self {
        let mut backend = match &config.dictionary {
            Some(entries) => Self::with_entries(entries.iter().cloned()),
            None => Self::new(),
        };
        if let Some(model) = &config.model {
            backend.model = model.clone();
        }
        backend
    }

    pub fn add_entry(&mut self, from: String, to: String) {
        self.folded.insert(from.to_lowercase(), to.clone());
        self.exact.insert(from, to);
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }

    fn lookup(&self, word: &str) -> Option<String> {
        if let Some(hit) = self.exact.get(word) {
            return Some(hit.clone());
        }
        let hit = self.folded.get(&word.to_lowercase())?;
        let starts_upper = word.chars().next().map(char::is_uppercase).unwrap_or(false);
        if starts_upper {
            let mut chars = hit.chars();
            Some(match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            })
        } else {
            Some(hit.clone())
        }
    }

    /// 按单词边界逐词替换，非单词字符原样保留
    pub fn substitute(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut word = String::new();

        for ch in text.chars() {
            if ch.is_alphanumeric() || (ch == '\'' && !word.is_empty()) {
                word.push(ch);
                continue;
            }
            self.flush_word(&mut word, &mut out);
            out.push(ch);
        }
        self.flush_word(&mut word, &mut out);
        out
    }

    fn flush_word(&self, word: &mut String, out: &mut String) {
        if word.is_empty() {
            return;
        }
        match self.lookup(word) {
            Some(replacement) => out.push_str(&replacement),
            None => out.push_str(word),
        }
        word.clear();
    }
}

impl Default for DictionaryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranslationBackend for DictionaryBackend {
    fn name(&self) -> &str {
        "dictionary"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn translate(
        &self,
        request: &BackendRequest,
        cancel: &CancellationToken,
    ) -> TranslationResult<String> {
        if cancel.is_cancelled() {
            return Err(TranslationError::Cancelled("词典翻译已取消".to_string()));
        }
        Ok(self.substitute(&request.text))
    }
}
