//! Inline step directives.
//!
//! A directive is an HTML comment directly above a fence:
//!
//! ```text
//! <!-- docrun: id=server background timeout=60 -->
//! <!-- expected_similarity=0.8 -->
//! ```
//!
//! The second form is accepted for tutorials written before the
//! `docrun:` prefix existed.

use serde::{Deserialize, Serialize};

const PREFIX: &str = "docrun:";
const LEGACY_KEY: &str = "expected_similarity";

/// Split a directive comment into raw `key[=value]` pairs.
///
/// Returns `Ok(None)` for HTML that is not a directive comment.
pub fn parse_directive_comment(html: &str) -> Result<Option<Vec<(String, Option<String>)>>, String> {
    let trimmed = html.trim();
    let Some(body) = trimmed
        .strip_prefix("<!--")
        .and_then(|rest| rest.strip_suffix("-->"))
    else {
        return Ok(None);
    };
    let body = body.trim();

    let tokens = if let Some(rest) = body.strip_prefix(PREFIX) {
        rest
    } else if body.starts_with(LEGACY_KEY) {
        body
    } else {
        return Ok(None);
    };

    let mut pairs = Vec::new();
    for token in tokens.split_whitespace() {
        match token.split_once('=') {
            Some((key, value)) => {
                if key.is_empty() {
                    return Err(format!("Directive '{}' has no key", token));
                }
                let value = value.trim_matches(|c| c == '"' || c == '\'');
                pairs.push((key.to_string(), Some(value.to_string())));
            }
            None => pairs.push((token.to_string(), None)),
        }
    }

    Ok(Some(pairs))
}

/// Typed directives for one step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepDirectives {
    /// Explicit step id
    pub id: Option<String>,

    /// Run without blocking later steps
    pub background: bool,

    /// Ask before running
    pub confirm: bool,

    /// Similarity threshold for the expected output
    pub similarity: Option<f64>,

    /// Timeout in seconds
    pub timeout_seconds: Option<u64>,

    /// Background step ids to join first
    pub wait_for: Vec<String>,
}

impl StepDirectives {
    /// Validate raw pairs and fold them into `self`.
    ///
    /// Later pairs override earlier ones; `wait` accumulates.
    pub fn apply(&mut self, pairs: &[(String, Option<String>)]) -> Result<(), String> {
        for (key, value) in pairs {
            match (key.as_str(), value.as_deref()) {
                ("id", Some(id)) if !id.is_empty() => self.id = Some(id.to_string()),
                ("background", None) => self.background = true,
                ("confirm", None) => self.confirm = true,
                ("similarity" | LEGACY_KEY, Some(raw)) => {
                    let similarity: f64 = raw
                        .parse()
                        .map_err(|_| format!("Invalid similarity '{}'", raw))?;
                    if !(0.0..=1.0).contains(&similarity) {
                        return Err(format!("Similarity {} is outside [0, 1]", similarity));
                    }
                    self.similarity = Some(similarity);
                }
                ("timeout", Some(raw)) => {
                    let seconds: u64 = raw
                        .parse()
                        .map_err(|_| format!("Invalid timeout '{}'", raw))?;
                    if seconds == 0 {
                        return Err("Timeout must be at least 1 second".to_string());
                    }
                    self.timeout_seconds = Some(seconds);
                }
                ("wait", Some(id)) if !id.is_empty() => self.wait_for.push(id.to_string()),
                ("id" | "similarity" | LEGACY_KEY | "timeout" | "wait", _) => {
                    return Err(format!("Directive '{}' requires a value", key));
                }
                ("background" | "confirm", Some(_)) => {
                    return Err(format!("Directive '{}' does not take a value", key));
                }
                _ => return Err(format!("Unknown directive '{}'", key)),
            }
        }
        Ok(())
    }
}
