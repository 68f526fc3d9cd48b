//! Tolerant JSON parsing for model output.
//!
//! A direct parse is tried first. When it fails, a fixed ordered list of pure
//! text repairs is applied cumulatively, re-attempting the parse after each
//! one. Input that already parses is never touched.

use std::borrow::Cow;

use serde_json::Value;

use crate::gateway::fence::strip_any_code_fence;

/// Longest slice of the offending text kept in an error.
const PREVIEW_CHARS: usize = 400;

/// One textual repair strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairPass {
    /// Drop a Markdown code fence left around (or inside) the payload.
    StripCodeFences,
    /// Remove `//` line comments and `/* */` block comments outside strings,
    /// within the span from the first `{` to the last `}` when there is one.
    RemoveComments,
    /// Remove commas directly followed by `}` or `]`.
    RemoveTrailingCommas,
    /// Remove a leading byte-order mark.
    StripBom,
    /// Keep only the text from the first `{` to the last `}`.
    ExtractOutermostObject,
}

/// The repair order. Later passes see the output of earlier ones.
pub const REPAIR_PASSES: [RepairPass; 5] = [
    RepairPass::StripCodeFences,
    RepairPass::RemoveComments,
    RepairPass::RemoveTrailingCommas,
    RepairPass::StripBom,
    RepairPass::ExtractOutermostObject,
];

impl RepairPass {
    pub fn name(self) -> &'static str {
        match self {
            Self::StripCodeFences => "strip_code_fences",
            Self::RemoveComments => "remove_comments",
            Self::RemoveTrailingCommas => "remove_trailing_commas",
            Self::StripBom => "strip_bom",
            Self::ExtractOutermostObject => "extract_outermost_object",
        }
    }

    pub fn apply(self, text: &str) -> Cow<'_, str> {
        match self {
            Self::StripCodeFences => Cow::Borrowed(strip_any_code_fence(text)),
            Self::RemoveComments => remove_comments(text),
            Self::RemoveTrailingCommas => remove_trailing_commas(text),
            Self::StripBom => Cow::Borrowed(text.strip_prefix('\u{feff}').unwrap_or(text)),
            Self::ExtractOutermostObject => Cow::Borrowed(extract_outermost_object(text)),
        }
    }
}

/// Every pass was tried and the text still did not parse.
#[derive(Debug, Clone, thiserror::Error)]
#[error("model output is not recoverable JSON ({message}); output starts with: {preview}")]
pub struct MalformedOutputError {
    /// Parser error from the final attempt.
    pub message: String,
    /// Leading slice of the original text.
    pub preview: String,
}

/// A successful parse plus the passes it needed.
#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub value: Value,
    pub passes_applied: Vec<RepairPass>,
}

impl RepairOutcome {
    pub fn was_repaired(&self) -> bool {
        !self.passes_applied.is_empty()
    }
}

/// Parse model output into a JSON value, repairing it if needed.
pub fn parse(text: &str) -> Result<Value, MalformedOutputError> {
    parse_with_report(text).map(|outcome| outcome.value)
}

/// Like [`parse`], also reporting which repair passes were applied.
pub fn parse_with_report(text: &str) -> Result<RepairOutcome, MalformedOutputError> {
    let mut last_error = match serde_json::from_str::<Value>(text) {
        Ok(value) => {
            return Ok(RepairOutcome {
                value,
                passes_applied: Vec::new(),
            })
        }
        Err(e) => e.to_string(),
    };

    let mut current = text.to_string();
    let mut passes_applied = Vec::new();
    for pass in REPAIR_PASSES {
        let repaired = pass.apply(&current);
        if repaired == current.as_str() {
            continue;
        }
        current = repaired.into_owned();
        passes_applied.push(pass);
        match serde_json::from_str::<Value>(&current) {
            Ok(value) => {
                return Ok(RepairOutcome {
                    value,
                    passes_applied,
                })
            }
            Err(e) => last_error = e.to_string(),
        }
    }

    Err(MalformedOutputError {
        message: last_error,
        preview: text.chars().take(PREVIEW_CHARS).collect(),
    })
}

// =============================================================================
// Passes
// =============================================================================

fn remove_comments(text: &str) -> Cow<'_, str> {
    // Prose around the object may hold URLs; only the object body is scanned.
    let (start, end) = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => (start, end + 1),
        _ => (0, text.len()),
    };
    match remove_comments_in(&text[start..end]) {
        Cow::Borrowed(_) => Cow::Borrowed(text),
        Cow::Owned(body) => Cow::Owned(format!("{}{}{}", &text[..start], body, &text[end..])),
    }
}

fn remove_comments_in(text: &str) -> Cow<'_, str> {
    if !text.contains("//") && !text.contains("/*") {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    let mut escape = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            '/' if chars.peek() == Some(&'/') => {
                // Line comment: skip to end of line, keep the newline.
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn remove_trailing_commas(text: &str) -> Cow<'_, str> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escape = false;
    let mut changed = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == ',' {
            let next = chars[i + 1..].iter().find(|n| !n.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                changed = true;
                continue;
            }
        }
        out.push(c);
    }

    if changed {
        Cow::Owned(out)
    } else {
        Cow::Borrowed(text)
    }
}

fn extract_outermost_object(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

// =============================================================================
// TESTS
// =============================================================================
