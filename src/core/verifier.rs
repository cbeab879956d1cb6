//! Output verification.
//!
//! Compares what a command printed against the output documented under it.
//! Both sides are normalised first: volatile tokens (timestamps, GUIDs, any
//! configured pattern) become a placeholder, runs of whitespace collapse,
//! blank lines drop out. The similarity function itself is pluggable.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::Step;

/// Replacement for tokens matched by an ignore pattern
const PLACEHOLDER: &str = "<ignored>";

/// ISO 8601 timestamps, with optional fraction and offset
pub const TIMESTAMP_PATTERN: &str =
    r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?";

/// GUIDs / UUIDs in canonical form
pub const GUID_PATTERN: &str =
    r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b";

/// Scores how closely actual output matches expected output, in [0, 1]
pub trait SimilarityMetric: Send + Sync {
    /// Metric name for logs and config
    fn name(&self) -> &str;

    /// Score normalised lines; identical input must score 1.0
    fn similarity(&self, expected: &[String], actual: &[String]) -> f64;
}

/// Available similarity metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Order-preserving line alignment with token-overlap partial credit
    #[default]
    LineAlignment,

    /// All-or-nothing comparison of normalised lines
    Exact,
}

impl MetricKind {
    /// Build the metric
    pub fn build(self) -> Box<dyn SimilarityMetric> {
        match self {
            Self::LineAlignment => Box::new(LineAlignment),
            Self::Exact => Box::new(ExactLines),
        }
    }
}

/// Aligns expected lines against actual lines in order and averages the
/// per-line credit over the expected lines.
///
/// Extra actual lines cost nothing, so documented output that is a subset of
/// what the command printed still scores 1.0. A line that differs only in
/// some words earns the token overlap (Jaccard) of the pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineAlignment;

impl SimilarityMetric for LineAlignment {
    fn name(&self) -> &str {
        "line_alignment"
    }

    fn similarity(&self, expected: &[String], actual: &[String]) -> f64 {
        if expected.is_empty() {
            return 1.0;
        }
        if actual.is_empty() {
            return 0.0;
        }

        let n = expected.len();
        let m = actual.len();
        let mut previous = vec![0.0f64; m + 1];
        let mut current = vec![0.0f64; m + 1];

        for exp in expected {
            for j in 1..=m {
                let pair = line_credit(exp, &actual[j - 1]);
                current[j] = previous[j].max(current[j - 1]).max(previous[j - 1] + pair);
            }
            std::mem::swap(&mut previous, &mut current);
        }

        (previous[m] / n as f64).clamp(0.0, 1.0)
    }
}

/// Credit for aligning two lines: 1.0 when equal, token overlap otherwise
fn line_credit(expected: &str, actual: &str) -> f64 {
    if expected == actual {
        return 1.0;
    }
    let a: std::collections::HashSet<&str> = expected.split(' ').collect();
    let b: std::collections::HashSet<&str> = actual.split(' ').collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// 1.0 when the normalised outputs are identical, else 0.0
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactLines;

impl SimilarityMetric for ExactLines {
    fn name(&self) -> &str {
        "exact"
    }

    fn similarity(&self, expected: &[String], actual: &[String]) -> f64 {
        if expected == actual {
            1.0
        } else {
            0.0
        }
    }
}

/// Outcome of verifying one step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    /// Whether the step passes
    pub matched: bool,

    /// Score in [0, 1]
    pub similarity: f64,
}

/// Output verifier with its ignore patterns and metric
pub struct OutputVerifier {
    ignore: Vec<Regex>,
    metric: Box<dyn SimilarityMetric>,
}

impl Default for OutputVerifier {
    fn default() -> Self {
        Self::with_defaults(MetricKind::default())
    }
}

impl OutputVerifier {
    /// Create a verifier from compiled patterns and a metric
    pub fn new(ignore: Vec<Regex>, metric: Box<dyn SimilarityMetric>) -> Self {
        Self { ignore, metric }
    }

    /// Default ignore set (timestamps, GUIDs) with the chosen metric
    pub fn with_defaults(metric: MetricKind) -> Self {
        Self::new(default_ignore_patterns(), metric.build())
    }

    /// Add an ignore pattern
    pub fn ignore(mut self, pattern: Regex) -> Self {
        self.ignore.push(pattern);
        self
    }

    /// Name of the active metric
    pub fn metric_name(&self) -> &str {
        self.metric.name()
    }

    /// Split into comparable lines with volatile tokens masked
    pub fn normalize(&self, text: &str) -> Vec<String> {
        text.lines()
            .map(|line| {
                let mut masked = line.to_string();
                for pattern in &self.ignore {
                    masked = pattern.replace_all(&masked, PLACEHOLDER).into_owned();
                }
                masked.split_whitespace().collect::<Vec<_>>().join(" ")
            })
            .filter(|line| !line.is_empty())
            .collect()
    }

    /// Score `actual` against `expected`
    pub fn similarity(&self, expected: &str, actual: &str) -> f64 {
        self.metric
            .similarity(&self.normalize(expected), &self.normalize(actual))
    }

    /// Judge a step's output.
    ///
    /// Without documented output a step passes on exit code 0. With it, the
    /// similarity must reach the step's threshold.
    pub fn verify(&self, step: &Step, exit_code: i32, stdout: &str) -> Verdict {
        match &step.expected_output {
            None => {
                let matched = exit_code == 0;
                Verdict {
                    matched,
                    similarity: if matched { 1.0 } else { 0.0 },
                }
            }
            Some(expected) => {
                let similarity = self.similarity(expected, stdout);
                Verdict {
                    matched: similarity >= step.expected_similarity,
                    similarity,
                }
            }
        }
    }
}

/// Compiled default ignore patterns
pub fn default_ignore_patterns() -> Vec<Regex> {
    [TIMESTAMP_PATTERN, GUID_PATTERN]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
}
