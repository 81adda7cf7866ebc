//! Template renderer — `{{name}}` substitution against a flat variable bag.
//!
//! No conditionals, no nesting, no expressions. Deterministic and
//! side-effect free: render twice, get the same text twice.

use std::collections::HashMap;

use crate::error::TemplateError;

/// Substitute `{{name}}` tokens in `text` from `vars`.
///
/// A name is a non-empty run of ASCII letters, digits, or underscores.
/// Unknown names render as empty string; malformed tokens (bad name
/// characters, embedded spaces) are emitted verbatim. An opening `{{`
/// with no closing `}}` on the same line is an error.
pub fn render(text: &str, vars: &HashMap<String, String>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(text.len());

    for (line_no, line) in text.split_inclusive('\n').enumerate() {
        let mut rest = line;
        while let Some(open) = rest.find("{{") {
            out.push_str(&rest[..open]);
            let after_open = &rest[open + 2..];

            let Some(close) = after_open.find("}}") else {
                let snippet: String = rest[open..].chars().take(24).collect();
                return Err(TemplateError::UnclosedToken {
                    line: line_no + 1,
                    snippet: snippet.trim_end().to_string(),
                });
            };

            let name = &after_open[..close];
            if is_valid_name(name) {
                if let Some(value) = vars.get(name) {
                    out.push_str(value);
                }
                rest = &after_open[close + 2..];
            } else {
                // Malformed token: emit the braces literally and keep
                // scanning right after them, so a nested valid token
                // like `{{ {{name}}` still resolves.
                out.push_str("{{");
                rest = after_open;
            }
        }
        out.push_str(rest);
    }

    Ok(out)
}

/// Names referenced by `text` that are absent from `vars`.
///
/// Used by the preview endpoint to surface typos to the operator;
/// production sends render unknowns as empty without complaint.
pub fn unknown_variables(text: &str, vars: &HashMap<String, String>) -> Vec<String> {
    let mut unknown = Vec::new();
    for line in text.lines() {
        let mut rest = line;
        while let Some(open) = rest.find("{{") {
            let after_open = &rest[open + 2..];
            let Some(close) = after_open.find("}}") else {
                break;
            };
            let name = &after_open[..close];
            if is_valid_name(name) {
                if !vars.contains_key(name) && !unknown.iter().any(|n| n == name) {
                    unknown.push(name.to_string());
                }
                rest = &after_open[close + 2..];
            } else {
                rest = after_open;
            }
        }
    }
    unknown
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}
