//! Helpers for digging structured data out of free-form model responses.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Fence tags recognised as spec source, in priority order. An empty tag
/// is an untagged fence.
const CODE_FENCE_TAGS: &[&str] = &["typespec", "tsp", "cadl", ""];

static TRAILING_COMMA: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",(\s*[\]}])").unwrap());

static JSON_FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)```json[ \t]*\r?\n(.*?)```").unwrap());

static CODE_FENCES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    CODE_FENCE_TAGS
        .iter()
        .map(|tag| Regex::new(&format!(r"(?is)```{}[ \t]*\r?\n(.*?)```", tag)).unwrap())
        .collect()
});

/// Strip markdown code fences wrapping a whole response.
pub fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let clean = clean.strip_suffix("```").unwrap_or(clean);
    clean.trim()
}

/// Extract a JSON fragment between matching delimiters.
pub fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    if start <= end {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Extract the outermost JSON object from a response, handling fences and prose.
pub fn extract_json_object(response: &str) -> Option<&str> {
    let clean = strip_markdown_fences(response);
    extract_json_fragment(clean, '{', '}')
}

/// Body of the last fenced ```json block, if any.
pub fn extract_json_block(response: &str) -> Option<&str> {
    JSON_FENCE
        .captures_iter(response)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
}

/// Fix common JSON issues in model output.
pub fn fix_json_issues(json: &str) -> String {
    let fixed = TRAILING_COMMA.replace_all(json, "$1").into_owned();

    // Smart quotes to regular quotes
    let fixed = fixed
        .replace(['\u{201C}', '\u{201D}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    fixed
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t' || *c == '\r')
        .collect()
}

/// Lowercase every object key and drop `_` and `-`, so `startLine`,
/// `start_line` and `StartLine` all become `startline`.
pub fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, inner) in map {
                let key: String = key
                    .chars()
                    .filter(|c| *c != '_' && *c != '-')
                    .flat_map(char::to_lowercase)
                    .collect();
                out.insert(key, normalize_keys(inner));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_keys).collect()),
        other => other,
    }
}

/// Parse a lenient JSON object out of `text` with normalized keys.
pub fn parse_lenient_object(text: &str) -> Option<Value> {
    let fragment = extract_json_object(text)?;
    let value: Value = serde_json::from_str(&fix_json_issues(fragment)).ok()?;
    value.is_object().then(|| normalize_keys(value))
}

/// Body of the last code block of the highest-priority fence tag present.
pub fn extract_code_block(response: &str) -> Option<String> {
    CODE_FENCES.iter().find_map(|re| {
        re.captures_iter(response)
            .last()
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    })
}
