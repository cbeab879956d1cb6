//! Markdown reading: fenced block extraction and document metadata.
//!
//! Only fenced blocks, headings, directive comments and the title
//! paragraph matter here; everything else in the document is prose.

pub mod blocks;
pub mod directives;

use pulldown_cmark::{Event, HeadingLevel, Parser, Tag, TagEnd};

pub use blocks::{extract_blocks, Blocks};
pub use directives::{parse_directive_comment, StepDirectives};

/// Title and description of a document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentInfo {
    /// Text of the first H1
    pub title: Option<String>,

    /// First paragraph after the title
    pub description: String,
}

/// Read the title (first H1) and the paragraph that follows it
pub fn document_info(source: &str) -> DocumentInfo {
    let mut info = DocumentInfo::default();
    let mut in_title = false;
    let mut in_paragraph = false;
    let mut title = String::new();

    for event in Parser::new(source) {
        match event {
            Event::Start(Tag::Heading {
                level: HeadingLevel::H1,
                ..
            }) if info.title.is_none() => in_title = true,
            Event::End(TagEnd::Heading(HeadingLevel::H1)) if in_title => {
                in_title = false;
                info.title = Some(title.trim().to_string());
            }
            Event::Start(Tag::Paragraph) if info.title.is_some() => in_paragraph = true,
            Event::End(TagEnd::Paragraph) if in_paragraph => break,
            Event::Text(text) | Event::Code(text) => {
                if in_title {
                    title.push_str(&text);
                } else if in_paragraph {
                    info.description.push_str(&text);
                }
            }
            Event::SoftBreak | Event::HardBreak if in_paragraph => info.description.push(' '),
            _ => {}
        }
    }

    info.description = info.description.trim().to_string();
    info
}
