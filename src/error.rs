//! Error kinds raised while building and running a scenario.

use thiserror::Error;

use crate::core::safety::SafetyViolation;

/// Everything that can go wrong between reading markdown and producing a result.
///
/// Step-level variants carry the step id so a failure can always be traced
/// back to the block that produced it.
#[derive(Debug, Clone, Error)]
pub enum ScenarioError {
    /// Malformed markdown, bad directive, or no executable steps
    #[error("Parse error at byte {position}: {message}")]
    Parse { message: String, position: usize },

    /// A command references a variable that nothing has defined
    #[error("Step '{step_id}' references undefined variable '{name}'")]
    UndefinedVariable { step_id: String, name: String },

    /// A foreground step ran past its execution budget
    #[error("Step '{step_id}' timed out after {seconds}s")]
    Timeout { step_id: String, seconds: u64 },

    /// An interactive step was reached while running non-interactively
    #[error("Step '{step_id}' requires confirmation but the run is non-interactive")]
    ConfirmationRequired { step_id: String },

    /// Output did not satisfy the similarity threshold
    #[error(
        "Step '{step_id}' output mismatch (similarity {similarity:.2} < {threshold:.2})\n--- expected ---\n{expected}\n--- actual ---\n{actual}"
    )]
    VerificationMismatch {
        step_id: String,
        expected: String,
        actual: String,
        similarity: f64,
        threshold: f64,
    },

    /// A step without expected output exited nonzero
    #[error("Step '{step_id}' failed with exit code {exit_code}: {stderr}")]
    CommandFailed {
        step_id: String,
        exit_code: i32,
        stderr: String,
    },

    /// A cleanup deletion command failed (never fatal)
    #[error("Failed to delete {kind} '{identifier}': {message}")]
    TeardownFailure {
        kind: String,
        identifier: String,
        message: String,
    },

    /// The operator cancelled the run
    #[error("Run interrupted during step '{step_id}'")]
    Interrupted { step_id: String },

    /// The host refused to start a process
    #[error("Failed to spawn process for step '{step_id}': {message}")]
    Spawn { step_id: String, message: String },

    /// An execution safety limit was reached
    #[error("Safety limit reached: {0}")]
    SafetyLimit(#[from] SafetyViolation),
}

impl ScenarioError {
    /// Shorthand for a parse error at a source offset
    pub fn parse(message: impl Into<String>, position: usize) -> Self {
        Self::Parse {
            message: message.into(),
            position,
        }
    }

    /// Stable machine-readable name of the error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse { .. } => "parse_error",
            Self::UndefinedVariable { .. } => "undefined_variable",
            Self::Timeout { .. } => "timeout",
            Self::ConfirmationRequired { .. } => "confirmation_required",
            Self::VerificationMismatch { .. } => "verification_mismatch",
            Self::CommandFailed { .. } => "command_failed",
            Self::TeardownFailure { .. } => "teardown_failure",
            Self::Interrupted { .. } => "interrupted",
            Self::Spawn { .. } => "spawn_error",
            Self::SafetyLimit(_) => "safety_limit",
        }
    }
}
