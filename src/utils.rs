//! Text utilities shared across the pipeline
//!
//! Punctuation/emoji stripping for spoken segments, JSON extraction from
//! free-form LLM output, and the fuzzy filename match used by music playback.

use once_cell::sync::Lazy;
use regex::Regex;

/// Unicode ranges covering the common emoji blocks.
const EMOJI_RANGES: [(u32, u32); 7] = [
    (0x1F600, 0x1F64F),
    (0x1F300, 0x1F5FF),
    (0x1F680, 0x1F6FF),
    (0x1F900, 0x1F9FF),
    (0x1FA70, 0x1FAFF),
    (0x2600, 0x26FF),
    (0x2700, 0x27BF),
];

/// Full-width punctuation (U+FF01..U+FF5E minus alphanumerics is overkill;
/// this is the explicit set the device protocol cares about) plus the CJK
/// sentence marks that don't live in that block.
const FULL_WIDTH_PUNCTUATION: &str =
    "！＂＃＄％＆＇（）＊＋，－。／：；＜＝＞？＠［＼］＾＿｀｛｜｝～、《》「」【】…—·";

fn is_emoji(c: char) -> bool {
    let cp = c as u32;
    EMOJI_RANGES.iter().any(|&(start, end)| (start..=end).contains(&cp))
}

/// True for whitespace, half-/full-width punctuation, and emoji.
pub fn is_punctuation_or_emoji(c: char) -> bool {
    c.is_whitespace()
        || c.is_ascii_punctuation()
        || FULL_WIDTH_PUNCTUATION.contains(c)
        || is_emoji(c)
}

/// Trim whitespace, punctuation and emoji from both ends of a segment.
/// Interior characters are untouched so the spoken text keeps its rhythm.
pub fn strip_punctuation_and_emoji(s: &str) -> &str {
    s.trim_matches(is_punctuation_or_emoji)
}

/// Remove every punctuation character and space from the text, returning the
/// remaining length and the cleaned string. Used for exit-command matching
/// and for deciding whether a recognition result is worth dispatching.
pub fn remove_punctuation_and_length(text: &str) -> (usize, String) {
    let cleaned: String = text
        .chars()
        .filter(|c| {
            !c.is_whitespace()
                && !c.is_ascii_punctuation()
                && !FULL_WIDTH_PUNCTUATION.contains(*c)
        })
        .collect();
    // A bare "Yeah" is a recognizer hallucination on silence; treat as empty.
    if cleaned == "Yeah" {
        return (0, String::new());
    }
    (cleaned.chars().count(), cleaned)
}

static JSON_OBJECT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

/// Extract the first JSON object embedded in free-form text (markdown fences,
/// chatter around it). Returns the raw `{...}` span, not parsed.
pub fn extract_json_from_string(input: &str) -> Option<&str> {
    JSON_OBJECT_RE.find(input).map(|m| m.as_str())
}

/// Similarity of two strings as `2 * lcs / (len_a + len_b)` over characters.
/// 1.0 for identical strings, 0.0 for no common subsequence.
pub fn lcs_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for &ca in &a {
        for (j, &cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    2.0 * prev[b.len()] as f64 / (a.len() + b.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_removes_ends_only() {
        assert_eq!(strip_punctuation_and_emoji("，你好呀。"), "你好呀");
        assert_eq!(strip_punctuation_and_emoji("  hello, world!  "), "hello, world");
        assert_eq!(strip_punctuation_and_emoji("😊今天天气不错😊"), "今天天气不错");
        assert_eq!(strip_punctuation_and_emoji("。！？"), "");
    }

    #[test]
    fn remove_punctuation_counts_chars() {
        let (len, text) = remove_punctuation_and_length("你好，世界！");
        assert_eq!(len, 4);
        assert_eq!(text, "你好世界");

        let (len, text) = remove_punctuation_and_length("Yeah");
        assert_eq!(len, 0);
        assert_eq!(text, "");
    }

    #[test]
    fn extract_json_finds_embedded_object() {
        let input = "```json\n{\"name\":\"set_volume\",\"arguments\":{\"value\":50}}\n```";
        let json = extract_json_from_string(input).unwrap();
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(value["name"], "set_volume");

        assert!(extract_json_from_string("no json here").is_none());
    }

    #[test]
    fn lcs_ratio_orders_candidates() {
        assert_eq!(lcs_ratio("春天", "春天"), 1.0);
        assert!(lcs_ratio("春天", "春天的故事") > lcs_ratio("春天", "夏夜"));
        assert_eq!(lcs_ratio("", "abc"), 0.0);
        assert!(lcs_ratio("春天", "春天在哪里") >= 0.4);
    }
}
