//! 输出文字转换（塞尔维亚语西里尔字母 ↔ 拉丁字母）
//!
//! 逐字符映射，未知字符原样通过。

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::walker::BookWalker;
use crate::book::Book;
use crate::translation::error::TranslationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Script {
    Cyrillic,
    Latin,
}

impl FromStr for Script {
    type Err = TranslationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cyrillic" | "cyr" | "ћирилица" => Ok(Script::Cyrillic),
            "latin" | "lat" | "latinica" => Ok(Script::Latin),
            other => Err(TranslationError::InvalidInput(format!(
                "未知的文字类型: {}（可选 cyrillic, latin）",
                other
            ))),
        }
    }
}

impl fmt::Display for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Script::Cyrillic => f.write_str("cyrillic"),
            Script::Latin => f.write_str("latin"),
        }
    }
}

const CYRILLIC_TO_LATIN: [(char, &str); 30] = [
    ('а', "a"), ('б', "b"), ('в', "v"), ('г', "g"), ('д', "d"), ('ђ', "đ"),
    ('е', "e"), ('ж', "ž"), ('з', "z"), ('и', "i"), ('ј', "j"), ('к', "k"),
    ('л', "l"), ('љ', "lj"), ('м', "m"), ('н', "n"), ('њ', "nj"), ('о', "o"),
    ('п', "p"), ('р', "r"), ('с', "s"), ('т', "t"), ('ћ', "ć"), ('у', "u"),
    ('ф', "f"), ('х', "h"), ('ц', "c"), ('ч', "č"), ('џ', "dž"), ('ш', "š"),
];

fn latin_for(lower: char) -> Option<&'static str> {
    CYRILLIC_TO_LATIN
        .iter()
        .find(|(c, _)| *c == lower)
        .map(|(_, l)| *l)
}

fn cyrillic_for(latin: &str) -> Option<char> {
    CYRILLIC_TO_LATIN
        .iter()
        .find(|(_, l)| *l == latin)
        .map(|(c, _)| *c)
}

fn is_upper(ch: char) -> bool {
    ch.is_uppercase()
}

/// 西里尔字母转拉丁字母
pub fn to_latin(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());

    for (i, &ch) in chars.iter().enumerate() {
        let lower = ch.to_lowercase().next().unwrap_or(ch);
        let Some(latin) = latin_for(lower) else {
            out.push(ch);
            continue;
        };

        if !is_upper(ch) {
            out.push_str(latin);
            continue;
        }

        // 大写双字母：全大写词中为 LJ，否则为 Lj
        let neighbour_upper = chars.get(i + 1).map_or(false, |c| is_upper(*c))
            || (i > 0 && is_upper(chars[i - 1]) && chars.get(i + 1).map_or(true, |c| !c.is_alphabetic()));
        let mut letters = latin.chars();
        if let Some(first) = letters.next() {
            out.extend(first.to_uppercase());
        }
        for rest in letters {
            if neighbour_upper {
                out.extend(rest.to_uppercase());
            } else {
                out.push(rest);
            }
        }
    }
    out
}

/// 拉丁字母转西里尔字母
pub fn to_cyrillic(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len() * 2);
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let upper = is_upper(ch);

        // 双字母优先
        if let Some(&next) = chars.get(i + 1) {
            let pair: String = [ch, next].iter().flat_map(|c| c.to_lowercase()).collect();
            if matches!(pair.as_str(), "lj" | "nj" | "dž") {
                if let Some(cyr) = cyrillic_for(&pair) {
                    push_cased(&mut out, cyr, upper);
                    i += 2;
                    continue;
                }
            }
        }

        let lower: String = ch.to_lowercase().collect();
        match cyrillic_for(&lower) {
            Some(cyr) => push_cased(&mut out, cyr, upper),
            None => out.push(ch),
        }
        i += 1;
    }
    out
}

fn push_cased(out: &mut String, ch: char, upper: bool) {
    if upper {
        out.extend(ch.to_uppercase());
    } else {
        out.push(ch);
    }
}

pub fn convert(text: &str, target: Script) -> String {
    match target {
        Script::Latin => to_latin(text),
        Script::Cyrillic => to_cyrillic(text),
    }
}

/// 转换整本书的文字，返回改写的字段数
pub fn convert_book(book: &mut Book, target: Script) -> usize {
    BookWalker::new().rewrite(book, |unit| convert(&unit.source_text, target))
}
