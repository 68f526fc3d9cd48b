//! Markdown code-fence stripping for model output.

use once_cell::sync::Lazy;
use regex::Regex;

// A whole-payload fence: optional language tag, body, closing fence.
static FENCED_PAYLOAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)\A\s*```[A-Za-z0-9_+-]*[ \t]*\r?\n?(.*?)\r?\n?[ \t]*```\s*\z")
        .expect("Invalid fenced payload regex")
});

// A fenced block somewhere inside prose.
static EMBEDDED_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+-]*[ \t]*\r?\n(.*?)\r?\n[ \t]*```")
        .expect("Invalid embedded fence regex")
});

/// Remove a Markdown code fence wrapped around the whole payload.
///
/// Text without a surrounding fence is returned unchanged (borrowed).
pub fn strip_code_fence(text: &str) -> &str {
    match FENCED_PAYLOAD.captures(text).and_then(|c| c.get(1)) {
        Some(body) => body.as_str().trim(),
        None => text,
    }
}

/// Like [`strip_code_fence`], but also finds a fenced block surrounded by
/// prose and returns its body. Falls back to the input when no fence exists.
pub fn strip_any_code_fence(text: &str) -> &str {
    let stripped = strip_code_fence(text);
    if stripped.len() != text.len() {
        return stripped;
    }
    match EMBEDDED_FENCE.captures(text).and_then(|c| c.get(1)) {
        Some(body) => body.as_str().trim(),
        None => text,
    }
}
