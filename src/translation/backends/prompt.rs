//! 提示词构造与模型输出解析

use super::BackendRequest;

/// 输出标记，本地模型在此之后输出译文
pub const TRANSLATION_MARKER: &str = "Translation:";

/// 语言代码转为英文名称，未知代码原样返回
pub fn language_name(code: &str) -> String {
    let name = match code.to_ascii_lowercase().as_str() {
        "en" => "English",
        "ru" => "Russian",
        "sr" => "Serbian",
        "sr-cyrl" => "Serbian (Cyrillic script)",
        "sr-latn" => "Serbian (Latin script)",
        "hr" => "Croatian",
        "bs" => "Bosnian",
        "uk" => "Ukrainian",
        "be" => "Belarusian",
        "bg" => "Bulgarian",
        "mk" => "Macedonian",
        "pl" => "Polish",
        "cs" => "Czech",
        "de" => "German",
        "fr" => "French",
        "es" => "Spanish",
        "it" => "Italian",
        "pt" => "Portuguese",
        "zh" => "Chinese",
        "ja" => "Japanese",
        "ko" => "Korean",
        _ => return code.to_string(),
    };
    name.to_string()
}

/// 系统指令
pub fn system_prompt(request: &BackendRequest) -> String {
    format!(
        "You are a professional literary translator. Translate the given text from {} to {}. \
         Preserve meaning, tone, names and formatting. \
         Return ONLY the translation, without explanations, notes or quotation marks.",
        language_name(&request.source_lang),
        language_name(&request.target_lang),
    )
}

/// 用户消息：可选上下文 + 原文
pub fn user_prompt(request: &BackendRequest) -> String {
    let mut prompt = String::new();
    if let Some(hint) = &request.context_hint {
        prompt.push_str("Context: ");
        prompt.push_str(hint);
        prompt.push_str("\n\n");
    }
    prompt.push_str("Source text:\n");
    prompt.push_str(&request.text);
    prompt
}

/// 单段提示词，供不区分角色的本地模型使用，以标记行结尾
pub fn completion_prompt(request: &BackendRequest) -> String {
    format!(
        "{}\n\n{}\n\n{}",
        system_prompt(request),
        user_prompt(request),
        TRANSLATION_MARKER
    )
}

/// 取第一个标记之后的内容；没有标记时返回空串
pub fn parse_output(raw: &str) -> String {
    match raw.find(TRANSLATION_MARKER) {
        Some(pos) => raw[pos + TRANSLATION_MARKER.len()..].trim().to_string(),
        None => String::new(),
    }
}

/// 去掉聊天模型偶尔包裹的引号和首尾空白
pub fn clean_chat_output(raw: &str) -> String {
    let trimmed = raw.trim();
    let unquoted = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| trimmed.strip_prefix('«').and_then(|s| s.strip_suffix('»')))
        .unwrap_or(trimmed);
    unquoted.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_carries_languages_and_hint() {
        let request = BackendRequest::new("Привет", "ru", "sr").with_context_hint(Some("Chapter 1"));
        let system = system_prompt(&request);
        assert!(system.contains("Russian"));
        assert!(system.contains("Serbian"));
        assert!(system.contains("Return ONLY the translation"));

        let user = user_prompt(&request);
        assert!(user.starts_with("Context: Chapter 1"));
        assert!(user.ends_with("Привет"));
        assert!(completion_prompt(&request).ends_with(TRANSLATION_MARKER));
    }

    #[test]
    fn test_unknown_language_passes_through() {
        assert_eq!(language_name("xx"), "xx");
        assert_eq!(language_name("EN"), "English");
    }

    #[test]
    fn test_parse_output() {
        assert_eq!(parse_output("prompt...\nTranslation:  Zdravo svete \n"), "Zdravo svete");
        assert_eq!(parse_output("Translation: a\nTranslation: b"), "a\nTranslation: b");
        assert_eq!(parse_output("no marker"), "");
    }

    #[test]
    fn test_clean_chat_output() {
        assert_eq!(clean_chat_output("  \"Hola\" \n"), "Hola");
        assert_eq!(clean_chat_output("«Здраво»"), "Здраво");
        assert_eq!(clean_chat_output("plain"), "plain");
    }
}
