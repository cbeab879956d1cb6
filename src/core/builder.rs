//! Scenario building.
//!
//! Groups extracted blocks into steps using a fixed two-block grammar:
//!
//! ```text
//! step := CODE(lang in allow-list) [OUTPUT]
//! ```
//!
//! An OUTPUT block belongs to the nearest executable command above it.
//! Code fences in languages outside the allow-list are skipped over; the
//! next executable command ends the search. OUTPUT blocks that follow
//! nothing executable are ignored.

use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::domain::scenario::DEFAULT_SIMILARITY;
use crate::domain::{Block, BlockKind, Scenario, Step};
use crate::error::ScenarioError;
use crate::markdown::{document_info, extract_blocks, StepDirectives};

/// Fence languages executed when the caller does not say otherwise
pub const DEFAULT_LANGUAGES: &[&str] = &["bash", "azurecli", "azurecli-interactive", "terraform"];

/// Default allow-list as owned strings
pub fn default_languages() -> Vec<String> {
    DEFAULT_LANGUAGES.iter().map(|l| l.to_string()).collect()
}

/// Parse markdown into a scenario ready to run
pub fn build_scenario(
    markdown: &str,
    allowed_languages: &[String],
    variables: &IndexMap<String, String>,
) -> Result<Scenario, ScenarioError> {
    let steps = build_steps(extract_blocks(markdown), allowed_languages)?;
    let info = document_info(markdown);

    Ok(Scenario {
        name: info.title.unwrap_or_else(|| "Untitled scenario".to_string()),
        description: info.description,
        fingerprint: fingerprint(markdown),
        steps,
        variables: variables.clone(),
    })
}

/// Group a block sequence into steps
pub fn build_steps<I>(blocks: I, allowed_languages: &[String]) -> Result<Vec<Step>, ScenarioError>
where
    I: IntoIterator<Item = Result<Block, ScenarioError>>,
{
    let mut blocks = blocks.into_iter().peekable();
    let mut steps: Vec<Step> = Vec::new();

    while let Some(block) = blocks.next() {
        let block = block?;

        if block.kind == BlockKind::ExpectedOutput {
            debug!(position = block.source_position, "Output block with no command above it, ignoring");
            continue;
        }
        if !block.is_code_in(allowed_languages) {
            debug!(language = %block.language, "Skipping non-executable code block");
            continue;
        }

        let mut directives = StepDirectives::default();
        directives
            .apply(&block.directives)
            .map_err(|message| ScenarioError::parse(message, block.source_position))?;

        // Fences in languages that never run do not separate a command from its output
        while let Some(Ok(next)) = blocks.peek() {
            if next.kind != BlockKind::Code || next.is_code_in(allowed_languages) {
                break;
            }
            debug!(language = %next.language, "Skipping non-executable code block");
            blocks.next();
        }

        let expected = match blocks.peek() {
            Some(Ok(next)) if next.kind == BlockKind::ExpectedOutput => {
                let output = blocks.next().and_then(Result::ok);
                if let Some(ref output) = output {
                    directives
                        .apply(&output.directives)
                        .map_err(|message| ScenarioError::parse(message, output.source_position))?;
                }
                output.map(|o| trim_block(&o.content))
            }
            _ => None,
        };

        let number = steps.len() + 1;
        let id = directives.id.clone().unwrap_or_else(|| format!("step-{}", number));
        if steps.iter().any(|s| s.id == id) {
            return Err(ScenarioError::parse(
                format!("Duplicate step id '{}'", id),
                block.source_position,
            ));
        }
        for waited in &directives.wait_for {
            let is_background = steps.iter().any(|s| &s.id == waited && s.background);
            if !is_background {
                return Err(ScenarioError::parse(
                    format!(
                        "Step '{}' waits on '{}', which is not an earlier background step",
                        id, waited
                    ),
                    block.source_position,
                ));
            }
        }

        steps.push(Step {
            id,
            name: block
                .heading
                .clone()
                .unwrap_or_else(|| format!("Step {}", number)),
            language: block.language.clone(),
            command: trim_block(&block.content),
            expected_output: expected,
            expected_similarity: directives.similarity.unwrap_or(DEFAULT_SIMILARITY),
            background: directives.background,
            requires_confirmation: directives.confirm,
            timeout_seconds: directives.timeout_seconds,
            wait_for: directives.wait_for,
            source_position: block.source_position,
        });
    }

    if steps.is_empty() {
        return Err(ScenarioError::parse(
            format!(
                "No executable steps found (looked for: {})",
                allowed_languages.join(", ")
            ),
            0,
        ));
    }

    Ok(steps)
}

/// Drop the trailing newline(s) a fence always leaves behind
fn trim_block(content: &str) -> String {
    content.trim_end_matches(['\n', '\r']).to_string()
}

/// `sha256:` digest of the markdown source
pub fn fingerprint(markdown: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(markdown.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}
