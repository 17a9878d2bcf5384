//! Pulling a JSON document out of model output.
//!
//! Models wrap JSON in prose or code fences and leave trailing commas. We repair what
//! is cheap to repair and let the caller's typed deserialization decide the rest.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;

static TRAILING_COMMA: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r",(\s*[}\]])").unwrap_or_else(|e| panic!("invalid trailing comma regex: {e}"))
});

/// Best-effort extraction of the outermost JSON object or array in `text`.
pub fn extract_json(text: &str) -> Option<String> {
    let trimmed = strip_fences(text.trim());
    let start = trimmed.find(['{', '['])?;
    let open = trimmed[start..].chars().next()?;
    let close = if open == '{' { '}' } else { ']' };
    let end = trimmed.rfind(close)?;
    if end < start {
        return None;
    }
    let candidate = &trimmed[start..=end];
    Some(TRAILING_COMMA.replace_all(candidate, "$1").into_owned())
}

/// Extract and deserialize in one go; the error string is what gets recorded as the
/// malformed-output reason.
pub fn parse_model_json<T: DeserializeOwned>(text: &str) -> Result<T, String> {
    let json = extract_json(text).ok_or_else(|| "no JSON object in model output".to_string())?;
    serde_json::from_str(&json).map_err(|e| format!("invalid JSON from model: {e}"))
}

fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        a: u32,
        #[serde(default)]
        b: Vec<String>,
    }

    #[test]
    fn extracts_from_code_fence() {
        let text = "```json\n{\"a\": 1, \"b\": [\"x\"]}\n```";
        let parsed: Sample = parse_model_json(text).unwrap();
        assert_eq!(parsed.a, 1);
        assert_eq!(parsed.b, vec!["x"]);
    }

    #[test]
    fn extracts_from_surrounding_prose() {
        let text = "Here you go:\n{\"a\": 7}\nHope this helps!";
        assert_eq!(extract_json(text).unwrap(), "{\"a\": 7}");
    }

    #[test]
    fn repairs_trailing_commas() {
        let text = "{\"a\": 2, \"b\": [\"x\", \"y\",],}";
        let parsed: Sample = parse_model_json(text).unwrap();
        assert_eq!(parsed.b.len(), 2);
    }

    #[test]
    fn reports_missing_json() {
        let err = parse_model_json::<Sample>("I cannot help with that.").unwrap_err();
        assert!(err.contains("no JSON"));
    }

    #[test]
    fn reports_schema_mismatch() {
        let err = parse_model_json::<Sample>("{\"b\": []}").unwrap_err();
        assert!(err.contains("invalid JSON"));
    }

    #[test]
    fn handles_top_level_arrays() {
        assert_eq!(extract_json("[1, 2, 3,]").unwrap(), "[1, 2, 3]");
    }
}
