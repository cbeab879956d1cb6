//! Scenario and step definitions.
//!
//! A Scenario is parsed once from markdown, executed once, then discarded.
//! Steps are never mutated after the builder creates them.

use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::core::safety::SafetyLimits;

/// Threshold used when a step does not ask for fuzzy matching
pub const DEFAULT_SIMILARITY: f64 = 1.0;

/// The executable plan derived from one markdown document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name (first H1 of the document)
    pub name: String,

    /// Human-readable description (first paragraph after the title)
    pub description: String,

    /// `sha256:` digest of the markdown source
    pub fingerprint: String,

    /// Ordered steps, in document order
    pub steps: Vec<Step>,

    /// Variables written into the environment store before any step runs
    #[serde(default)]
    pub variables: IndexMap<String, String>,
}

impl Scenario {
    /// Get a step by id
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// One command block plus its optional expected output and directives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique id within the scenario (`step-N` unless set by directive)
    pub id: String,

    /// Display name (nearest heading)
    pub name: String,

    /// Fence language the command was written in
    pub language: String,

    /// Raw command text, before variable rendering
    pub command: String,

    /// Documented output, if an output fence followed the command
    pub expected_output: Option<String>,

    /// Minimum similarity in [0, 1] for the output to count as matched
    pub expected_similarity: f64,

    /// Spawn without blocking subsequent steps
    pub background: bool,

    /// Needs operator confirmation before running
    pub requires_confirmation: bool,

    /// Override timeout for this step (uses limits.step_timeout_seconds if not set)
    pub timeout_seconds: Option<u64>,

    /// Background steps that must finish before this one starts
    #[serde(default)]
    pub wait_for: Vec<String>,

    /// Byte offset of the command fence in the source
    pub source_position: usize,
}

impl Step {
    /// Get the effective timeout for this step
    pub fn timeout(&self, limits: &SafetyLimits) -> Duration {
        let seconds = self.timeout_seconds.unwrap_or(limits.step_timeout_seconds);
        Duration::from_secs(seconds)
    }

    /// Best-effort steps are judged by exit code alone
    pub fn is_best_effort(&self) -> bool {
        self.expected_output.is_none()
    }
}
