//! Block extraction.
//!
//! Scans markdown with pulldown-cmark and yields typed fenced blocks
//! lazily, in document order. Untagged fences are skipped. A fence that is
//! opened but never closed is a parse error, and iteration stops there.

use std::ops::Range;

use pulldown_cmark::{CodeBlockKind, Event, Parser, Tag, TagEnd};

use crate::domain::{Block, BlockKind};
use crate::error::ScenarioError;

use super::directives::parse_directive_comment;

type OffsetEvents<'a> = Box<dyn Iterator<Item = (Event<'a>, Range<usize>)> + 'a>;

/// Start a lazy scan of `source`.
///
/// The sequence can only be restarted by calling this again.
pub fn extract_blocks(source: &str) -> Blocks<'_> {
    Blocks {
        source,
        events: Box::new(Parser::new(source).into_offset_iter()),
        heading: None,
        pending_directives: Vec::new(),
        finished: false,
    }
}

/// Lazy iterator over the fenced blocks of a document
pub struct Blocks<'a> {
    source: &'a str,
    events: OffsetEvents<'a>,
    /// Nearest heading seen so far
    heading: Option<String>,
    /// Directives from a comment directly above the next fence
    pending_directives: Vec<(String, Option<String>)>,
    finished: bool,
}

impl<'a> Blocks<'a> {
    /// Collect the text of a heading, leaving the iterator after its end tag
    fn read_heading(&mut self) -> String {
        let mut text = String::new();
        for (event, _) in self.events.by_ref() {
            match event {
                Event::Text(t) | Event::Code(t) => text.push_str(&t),
                Event::End(TagEnd::Heading(_)) => break,
                _ => {}
            }
        }
        text.trim().to_string()
    }

    /// Collect the raw text of an HTML block
    fn read_html(&mut self) -> String {
        let mut html = String::new();
        for (event, _) in self.events.by_ref() {
            match event {
                Event::Html(t) | Event::Text(t) => html.push_str(&t),
                Event::End(TagEnd::HtmlBlock) => break,
                _ => {}
            }
        }
        html
    }

    /// Collect a code block's content, leaving the iterator after its end tag
    fn read_code(&mut self) -> String {
        let mut content = String::new();
        for (event, _) in self.events.by_ref() {
            match event {
                Event::Text(t) => content.push_str(&t),
                Event::End(TagEnd::CodeBlock) => break,
                _ => {}
            }
        }
        content
    }

    fn fail(&mut self, error: ScenarioError) -> Option<Result<Block, ScenarioError>> {
        self.finished = true;
        Some(Err(error))
    }
}

impl<'a> Iterator for Blocks<'a> {
    type Item = Result<Block, ScenarioError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        while let Some((event, range)) = self.events.next() {
            match event {
                Event::Start(Tag::Heading { .. }) => {
                    self.pending_directives.clear();
                    self.heading = Some(self.read_heading());
                }
                Event::Start(Tag::HtmlBlock) => {
                    let html = self.read_html();
                    match parse_directive_comment(&html) {
                        Ok(Some(directives)) => self.pending_directives = directives,
                        Ok(None) => self.pending_directives.clear(),
                        Err(message) => {
                            return self.fail(ScenarioError::parse(message, range.start))
                        }
                    }
                }
                Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) => {
                    let language = fence_language(&info);
                    let directives = std::mem::take(&mut self.pending_directives);
                    let content = self.read_code();

                    if !is_closed_fence(&self.source[range.clone()]) {
                        return self.fail(ScenarioError::parse(
                            format!(
                                "Unterminated code fence{}",
                                if language.is_empty() {
                                    String::new()
                                } else {
                                    format!(" ({})", language)
                                }
                            ),
                            range.start,
                        ));
                    }

                    if language.is_empty() {
                        continue;
                    }

                    return Some(Ok(Block {
                        kind: BlockKind::from_language(&language),
                        language,
                        content,
                        source_position: range.start,
                        heading: self.heading.clone(),
                        directives,
                    }));
                }
                // Any other block-level element separates a directive from its fence
                Event::Start(_) => self.pending_directives.clear(),
                _ => {}
            }
        }

        self.finished = true;
        None
    }
}

/// First word of a fence info string (`bash {.copy}` -> `bash`)
fn fence_language(info: &str) -> String {
    info.split(|c: char| c.is_whitespace() || c == ',' || c == '{')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Check that the raw text of a fenced block ends with a closing fence
fn is_closed_fence(raw: &str) -> bool {
    let mut lines = raw
        .trim_end_matches(['\n', '\r'])
        .lines()
        .map(|l| l.trim_start_matches(|c: char| c.is_whitespace() || c == '>'));

    let Some(opening) = lines.next() else {
        return false;
    };
    let Some(fence_char) = opening.chars().next().filter(|c| *c == '`' || *c == '~') else {
        return false;
    };
    let fence_len = opening.chars().take_while(|c| *c == fence_char).count();

    match lines.last() {
        Some(closing) => {
            let run = closing.chars().take_while(|c| *c == fence_char).count();
            run >= fence_len && closing[run * fence_char.len_utf8()..].trim().is_empty()
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(source: &str) -> Result<Vec<Block>, ScenarioError> {
        extract_blocks(source).collect()
    }

    #[test]
    fn test_blocks_in_document_order() {
        let source = "# Title\n\n```bash\necho hello\n```\n\n```output\nhello\n```\n\n```json\n{}\n```\n";
        let blocks = collect(source).unwrap();

        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].kind, BlockKind::Code);
        assert_eq!(blocks[0].language, "bash");
        assert_eq!(blocks[0].content, "echo hello\n");
        assert_eq!(blocks[0].heading.as_deref(), Some("Title"));
        assert_eq!(blocks[1].kind, BlockKind::ExpectedOutput);
        assert_eq!(blocks[2].language, "json");
        assert!(blocks[0].source_position < blocks[1].source_position);
    }

    #[test]
    fn test_untagged_fences_are_skipped() {
        let source = "```\nplain\n```\n\n```bash\nls\n```\n";
        let blocks = collect(source).unwrap();

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].language, "bash");
    }

    #[test]
    fn test_unterminated_fence_is_an_error() {
        let source = "```bash\necho never closed\n";
        let err = collect(source).unwrap_err();
        assert!(matches!(err, ScenarioError::Parse { position: 0, .. }));
    }

    #[test]
    fn test_unterminated_fence_after_valid_block() {
        let source = "```bash\nls\n```\n\ntext\n\n~~~bash\nls\n";
        let mut blocks = extract_blocks(source);

        assert!(blocks.next().unwrap().is_ok());
        assert!(blocks.next().unwrap().is_err());
        assert!(blocks.next().is_none());
    }

    #[test]
    fn test_directive_attaches_to_next_fence_only() {
        let source = "<!-- docrun: background id=server -->\n```bash\n./serve\n```\n\n```bash\ncurl localhost\n```\n";
        let blocks = collect(source).unwrap();

        assert_eq!(
            blocks[0].directives,
            vec![
                ("background".to_string(), None),
                ("id".to_string(), Some("server".to_string()))
            ]
        );
        assert!(blocks[1].directives.is_empty());
    }

    #[test]
    fn test_prose_separates_directive_from_fence() {
        let source = "<!-- docrun: background -->\n\nSome prose.\n\n```bash\nls\n```\n";
        let blocks = collect(source).unwrap();
        assert!(blocks[0].directives.is_empty());
    }

    #[test]
    fn test_fence_language_first_word() {
        assert_eq!(fence_language("bash"), "bash");
        assert_eq!(fence_language("azurecli-interactive copy"), "azurecli-interactive");
        assert_eq!(fence_language("bash{.line-numbers}"), "bash");
        assert_eq!(fence_language(""), "");
    }

    #[test]
    fn test_closed_fence_detection() {
        assert!(is_closed_fence("```bash\nls\n```\n"));
        assert!(is_closed_fence("````bash\nls\n`````"));
        assert!(is_closed_fence("~~~\nls\n~~~\n"));
        assert!(!is_closed_fence("```bash\nls\n"));
        assert!(!is_closed_fence("```bash\n"));
        assert!(!is_closed_fence("````bash\nls\n```\n"));
    }
}
