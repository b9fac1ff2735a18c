//! 文本分块器
//!
//! 把超长文本沿段落、句子边界切开，贪心地打包成不超过 `max_bytes` 的块。
//! 切分只在字符边界发生，所有空白原样保留，拼接结果与输入逐字节相同。

/// 句子终止符
const SENTENCE_TERMINATORS: [char; 5] = ['.', '!', '?', '…', '。'];

/// 全角终止符后不需要空白即可断句
const WIDE_TERMINATORS: [char; 4] = ['…', '。', '！', '？'];

/// 终止符后可能紧跟的闭合符号
const CLOSING_MARKS: [char; 8] = ['"', '\'', ')', ']', '»', '”', '’', '」'];

/// 按 `max_bytes` 切分文本
///
/// 单个句子本身超限时原样返回，由调用方决定是否失败。
pub fn split(text: &str, max_bytes: usize) -> Vec<String> {
    let max_bytes = max_bytes.max(1);
    if text.len() <= max_bytes {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    for group in pack(split_paragraphs(text), max_bytes) {
        if group.len() <= max_bytes {
            chunks.push(group);
        } else {
            chunks.extend(pack(split_sentences(&group), max_bytes));
        }
    }
    chunks
}

/// 按空行切分段落，每段带上其后的空行
pub fn split_paragraphs(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut offset = 0;
    let mut in_blank_run = false;

    for line in text.split_inclusive('\n') {
        let blank = line.trim().is_empty() && line.ends_with('\n');
        if in_blank_run && !blank {
            pieces.push(&text[start..offset]);
            start = offset;
        }
        if blank && offset > start {
            in_blank_run = true;
        } else if !blank {
            in_blank_run = false;
        }
        offset += line.len();
    }

    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// 按句子终止符和换行切分，终止符后的空白归入前一句
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        let mut end = idx + ch.len_utf8();

        let boundary = if ch == '\n' {
            true
        } else if SENTENCE_TERMINATORS.contains(&ch) || WIDE_TERMINATORS.contains(&ch) {
            // 连续终止符与闭合符号视为同一句尾
            while let Some(&(next_idx, next)) = chars.peek() {
                if SENTENCE_TERMINATORS.contains(&next)
                    || WIDE_TERMINATORS.contains(&next)
                    || CLOSING_MARKS.contains(&next)
                {
                    end = next_idx + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            match chars.peek() {
                None => true,
                Some(&(_, next)) => next.is_whitespace() || WIDE_TERMINATORS.contains(&ch),
            }
        } else {
            false
        };

        if !boundary {
            continue;
        }

        // 吞掉句尾空白（换行除外，换行本身就是边界）
        while let Some(&(next_idx, next)) = chars.peek() {
            if next.is_whitespace() && next != '\n' {
                end = next_idx + next.len_utf8();
                chars.next();
            } else {
                break;
            }
        }

        pieces.push(&text[start..end]);
        start = end;
    }

    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// 贪心打包，不重排
fn pack(pieces: Vec<&str>, max_bytes: usize) -> Vec<String> {
    let mut groups = Vec::new();
    let mut current = String::new();

    for piece in pieces {
        if !current.is_empty() && current.len() + piece.len() > max_bytes {
            groups.push(std::mem::take(&mut current));
        }
        current.push_str(piece);
    }

    if !current.is_empty() {
        groups.push(current);
    }
    groups
}
