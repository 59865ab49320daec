//! Best-effort extraction of a JSON object from imperfect model output.
//!
//! The ladder: parse the whole body, extract a fenced ```json block (closed
//! or truncated), take the text from the first `{` with string-aware brace
//! counting, truncate to the last balanced position, and finally wrap a
//! body that starts at `"key":` in braces. Failure yields `None`, never a
//! guessed object.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```json\s*([\s\S]*?)\s*```").expect("json fence regex"));

static JSON_FENCE_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```json\s*([\s\S]+)$").expect("open json fence regex"));

static CODE_FIELD_OPEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""code"\s*:\s*""#).expect("code field regex"));

// Sentinels standing in for braces inside "code" string values while the
// brace counter runs. Private-use codepoints never appear in model output.
const OPEN_SENTINEL: char = '\u{E000}';
const CLOSE_SENTINEL: char = '\u{E001}';

pub fn salvage_json(response: &str) -> Option<Value> {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return None;
    }

    // 1. The whole body may already be valid JSON.
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    // 2. First fenced ```json block, closed or cut off at EOF.
    if let Some(caps) = JSON_FENCE.captures(response) {
        let body = caps[1].trim();
        if let Ok(value) = serde_json::from_str::<Value>(body) {
            return Some(value);
        }
        if let Some(value) = recover_incomplete(body) {
            return Some(value);
        }
    } else if let Some(caps) = JSON_FENCE_OPEN.captures(response) {
        let body = caps[1].trim();
        if let Some(value) = recover_incomplete(body) {
            return Some(value);
        }
    }

    // 3/4. Text from the first `{`, truncated to the last balanced brace
    // when the object is cut off.
    if let Some(pos) = response.find('{') {
        let body = &response[pos..];
        if let Ok(value) = serde_json::from_str::<Value>(body) {
            return Some(value);
        }
        if let Some(value) = recover_incomplete(body) {
            return Some(value);
        }
    }

    // 5. A body starting with `"key":` gets wrapped in braces.
    if trimmed.starts_with('"') && trimmed.contains(':') {
        let mut wrapped = format!("{{{trimmed}");
        if !wrapped.trim_end().ends_with('}') {
            wrapped.push('}');
        }
        if let Ok(value) = serde_json::from_str::<Value>(&wrapped) {
            return Some(value);
        }
        if let Some(value) = recover_incomplete(&wrapped) {
            return Some(value);
        }
    }

    None
}

/// Brace-count to the last position where the object closed, then parse the
/// prefix. Braces inside `"code"` strings are shielded first and restored in
/// the parsed value.
fn recover_incomplete(body: &str) -> Option<Value> {
    let shielded = shield_code_braces(body);

    let mut depth: i32 = 0;
    let mut last_balanced: Option<usize> = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in shielded.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if in_string && ch == '\\' {
            escaped = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if !in_string {
            if ch == '{' {
                depth += 1;
            } else if ch == '}' {
                depth -= 1;
                if depth == 0 {
                    last_balanced = Some(i);
                }
            }
        }
    }

    let end = last_balanced?;
    let mut value: Value = serde_json::from_str(&shielded[..=end]).ok()?;
    unshield_value(&mut value);
    Some(value)
}

/// Replace braces inside `"code": "..."` string spans with sentinels so they
/// cannot confuse the balance scan.
fn shield_code_braces(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut cursor = 0;

    while let Some(m) = CODE_FIELD_OPEN.find_at(body, cursor) {
        out.push_str(&body[cursor..m.end()]);
        let mut escaped = false;
        let mut end = body.len();
        for (i, ch) in body[m.end()..].char_indices() {
            if escaped {
                escaped = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    end = m.end() + i;
                    break;
                }
                '{' => out.push(OPEN_SENTINEL),
                '}' => out.push(CLOSE_SENTINEL),
                other => out.push(other),
            }
        }
        cursor = end;
    }
    out.push_str(&body[cursor..]);
    out
}

fn unshield_value(value: &mut Value) {
    match value {
        Value::String(s) => {
            if s.contains(OPEN_SENTINEL) || s.contains(CLOSE_SENTINEL) {
                *s = s.replace(OPEN_SENTINEL, "{").replace(CLOSE_SENTINEL, "}");
            }
        }
        Value::Array(items) => {
            for item in items {
                unshield_value(item);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                unshield_value(v);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_json_body() {
        let value = salvage_json(r#"{"plan": {"totalSteps": 1}}"#).expect("salvaged");
        assert_eq!(value["plan"]["totalSteps"], 1);
    }

    #[test]
    fn extracts_fenced_json_block() {
        let body = "Here is the plan:\n```json\n{\"decision\": \"refine\"}\n```\nDone.";
        let value = salvage_json(body).expect("salvaged");
        assert_eq!(value["decision"], "refine");
    }

    #[test]
    fn recovers_unclosed_fence() {
        let body = "```json\n{\"decision\": \"refine\", \"changes\": {}}";
        let value = salvage_json(body).expect("salvaged");
        assert_eq!(value["decision"], "refine");
    }

    #[test]
    fn extracts_object_embedded_in_prose() {
        let body = "The model says {\"reasoning\": \"ok\"} and nothing else.";
        let value = salvage_json(body).expect("salvaged");
        assert_eq!(value["reasoning"], "ok");
    }

    #[test]
    fn truncates_to_last_balanced_brace() {
        // The trailing garbage after the object must be dropped.
        let body = "{\"a\": {\"b\": 1}} trailing {{{ incomplete";
        let value = salvage_json(body).expect("salvaged");
        assert_eq!(value["a"]["b"], 1);
    }

    #[test]
    fn wraps_body_starting_at_key() {
        let body = "\"decision\": \"refine\", \"reasoning\": \"fix the code\"";
        let value = salvage_json(body).expect("salvaged");
        assert_eq!(value["decision"], "refine");
        assert_eq!(value["reasoning"], "fix the code");
    }

    #[test]
    fn prose_only_returns_none() {
        assert!(salvage_json("I could not produce a plan this time.").is_none());
        assert!(salvage_json("").is_none());
    }

    #[test]
    fn braces_inside_code_strings_survive_recovery() {
        // Cut-off response whose code value contains dict braces.
        let body = concat!(
            "```json\n",
            "{\"toolCalls\": [{\"tool\": \"jupyter_cell\", ",
            "\"parameters\": {\"code\": \"d = {'a': 1}\"}}], \"reasoning\": \"\"}",
        );
        let value = salvage_json(body).expect("salvaged");
        assert_eq!(
            value["toolCalls"][0]["parameters"]["code"],
            "d = {'a': 1}"
        );
    }

    #[test]
    fn arrays_alone_are_not_accepted() {
        assert!(salvage_json("[1, 2, 3]").is_none());
    }
}
