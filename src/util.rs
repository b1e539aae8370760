//! Helpers for cleaning up language-model output and naming artifacts.

/// Extract the outermost JSON object from text that may contain other content.
///
/// Braces inside JSON string literals are ignored, so a `"}"` inside a
/// suggested code fix does not end the object early.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

/// Return the body of the first fenced code block, or the trimmed input when
/// there is no fence. A `lang` hint (`python`, `py`) on the fence is dropped.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed.to_string();
    };
    let after_open = &trimmed[open + 3..];
    // Skip the info string on the opening fence line.
    let body_start = after_open.find('\n').map(|n| n + 1).unwrap_or(after_open.len());
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim_end().to_string(),
        None => body.trim_end().to_string(),
    }
}

/// Drop any prose a model put before the first `import`/`from` line.
pub fn trim_to_first_import(code: &str) -> String {
    let lines: Vec<&str> = code.lines().collect();
    match lines
        .iter()
        .position(|l| l.trim_start().starts_with("import ") || l.trim_start().starts_with("from "))
    {
        Some(idx) => lines[idx..].join("\n"),
        None => code.to_string(),
    }
}

/// Convert a name to a lowercase `snake_case` identifier, limited to
/// `max_len` characters.
pub fn slugify(name: &str, max_len: usize) -> String {
    let slug = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('_').to_string()
    } else {
        slug
    }
}

/// Truncate to at most `max_chars` characters, appending `…` when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_object_with_prefix() {
        let text = r#"Here is the JSON: {"key": "value"}"#;
        assert_eq!(extract_json_object(text), Some(r#"{"key": "value"}"#.to_string()));
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}} trailing"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"outer": {"inner": "value"}}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_ignores_braces_in_strings() {
        let text = r#"{"fix": "def f():\n    return {\"a\": 1}}"} done"#;
        let extracted = extract_json_object(text).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&extracted).unwrap();
        assert!(parsed["fix"].as_str().unwrap().contains("return {"));
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
        assert_eq!(extract_json_object("No JSON here"), None);
    }

    #[test]
    fn test_strip_code_fences_with_language() {
        let text = "Sure!\n```python\nimport pytest\n\ndef test_x():\n    pass\n```\nThanks";
        assert_eq!(strip_code_fences(text), "import pytest\n\ndef test_x():\n    pass");
    }

    #[test]
    fn test_strip_code_fences_without_fence() {
        assert_eq!(strip_code_fences("  import os\n"), "import os");
    }

    #[test]
    fn test_trim_to_first_import() {
        let code = "Here is your test:\n\nimport pytest\nfrom x import y";
        assert_eq!(trim_to_first_import(code), "import pytest\nfrom x import y");
        assert_eq!(trim_to_first_import("def f(): pass"), "def f(): pass");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Basic Page Load Test", 50), "basic_page_load_test");
        assert_eq!(slugify("  Login -> Dashboard!! ", 50), "login_dashboard");
        assert_eq!(slugify("abc def ghi", 5), "abc_d");
        assert_eq!(slugify("abcd efgh", 5), "abcd");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello world", 5), "hello…");
    }
}
