//! Fenced blocks extracted from a markdown document.

use serde::{Deserialize, Serialize};

/// Fence tags that mark documented output rather than a command
pub const OUTPUT_LANGUAGES: &[&str] = &["output", "expected"];

/// A fenced block, in document order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Whether the fence holds a command or its documented output
    pub kind: BlockKind,

    /// Language tag after the opening fence (first word of the info string)
    pub language: String,

    /// Text between the fences
    pub content: String,

    /// Byte offset of the opening fence in the source
    pub source_position: usize,

    /// Nearest heading above the block, if any
    pub heading: Option<String>,

    /// Raw `key[=value]` pairs from a directive comment directly above the fence
    #[serde(default)]
    pub directives: Vec<(String, Option<String>)>,
}

impl Block {
    /// Check whether this is a code block tagged with one of `languages`
    pub fn is_code_in(&self, languages: &[String]) -> bool {
        self.kind == BlockKind::Code && languages.iter().any(|l| l == &self.language)
    }
}

/// Classification of a fenced block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// A command fence (any tag that is not an output tag)
    Code,

    /// Documented output of the preceding command
    ExpectedOutput,
}

impl BlockKind {
    /// Classify a fence by its language tag
    pub fn from_language(language: &str) -> Self {
        if OUTPUT_LANGUAGES.contains(&language) {
            Self::ExpectedOutput
        } else {
            Self::Code
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_language() {
        assert_eq!(BlockKind::from_language("output"), BlockKind::ExpectedOutput);
        assert_eq!(BlockKind::from_language("expected"), BlockKind::ExpectedOutput);
        assert_eq!(BlockKind::from_language("bash"), BlockKind::Code);
        assert_eq!(BlockKind::from_language("json"), BlockKind::Code);
    }
}
