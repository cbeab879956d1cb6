//! Step and scenario outcomes.
//!
//! Results are created once per step by the executor/verifier pair and
//! never mutated afterwards. The scenario result is the terminal artifact
//! of one run.

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::error::ScenarioError;

use super::resource::TeardownResult;

/// Outcome of a single step
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// Id of the step that produced this result
    pub step_id: String,

    /// Process exit code (-1 when killed by a signal or never spawned)
    pub exit_code: i32,

    /// Captured standard output, without engine bookkeeping
    pub stdout: String,

    /// Captured standard error
    pub stderr: String,

    /// Wall time from spawn to exit
    pub duration_ms: u64,

    /// Whether the output satisfied the step's verification policy
    pub matched: bool,

    /// Similarity score in [0, 1] against the expected output
    pub similarity: f64,

    /// The process was killed for exceeding its budget
    pub timed_out: bool,

    /// The step ran in the background and was joined later
    pub background: bool,
}

impl StepResult {
    /// Result for a step that never produced a process
    pub fn not_run(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            matched: false,
            similarity: 0.0,
            timed_out: false,
            background: false,
        }
    }
}

/// The first fatal failure of a run, with enough context to find the step
#[derive(Debug, Clone, Serialize)]
pub struct StepFailure {
    /// Id of the failing step
    pub step_id: String,

    /// Display name of the failing step
    pub step_name: String,

    /// Rendered command text (raw text if rendering itself failed)
    pub command: String,

    /// What went wrong
    #[serde(serialize_with = "serialize_error")]
    pub error: ScenarioError,
}

fn serialize_error<S: Serializer>(error: &ScenarioError, serializer: S) -> Result<S::Ok, S::Error> {
    let mut state = serializer.serialize_struct("ScenarioError", 2)?;
    state.serialize_field("kind", error.kind())?;
    state.serialize_field("message", &error.to_string())?;
    state.end()
}

/// Aggregate outcome of one run
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Unique identifier for this run
    pub run_id: Uuid,

    /// Name of the scenario that ran
    pub scenario_name: String,

    /// Digest of the markdown the scenario came from
    pub fingerprint: String,

    /// Terminal state of the run
    pub state: RunState,

    /// Overall verdict: every step matched
    pub success: bool,

    /// Step results in document order
    pub step_results: Vec<StepResult>,

    /// First fatal failure, if any
    pub failure: Option<StepFailure>,

    /// Outcome of each cleanup deletion
    pub teardown: Vec<TeardownResult>,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run finished
    pub completed_at: DateTime<Utc>,
}

impl ScenarioResult {
    /// Total run time in milliseconds
    pub fn duration_ms(&self) -> u64 {
        (self.completed_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

/// Lifecycle of a run: `NotStarted -> Running -> {Succeeded, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Scenario built but no step started
    NotStarted,

    /// Stepping through the scenario
    Running,

    /// Every step matched
    Succeeded,

    /// A step failed or the run was interrupted
    Failed,
}

impl Default for RunState {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl RunState {
    /// Check whether a transition to `next` is allowed
    pub fn can_transition_to(self, next: RunState) -> bool {
        matches!(
            (self, next),
            (RunState::NotStarted, RunState::Running)
                | (RunState::Running, RunState::Succeeded)
                | (RunState::Running, RunState::Failed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_transitions() {
        assert!(RunState::NotStarted.can_transition_to(RunState::Running));
        assert!(RunState::Running.can_transition_to(RunState::Failed));
        assert!(RunState::Running.can_transition_to(RunState::Succeeded));

        assert!(!RunState::NotStarted.can_transition_to(RunState::Succeeded));
        assert!(!RunState::Succeeded.can_transition_to(RunState::Running));
        assert!(!RunState::Failed.can_transition_to(RunState::Succeeded));
    }

    #[test]
    fn test_failure_serializes_kind_and_message() {
        let failure = StepFailure {
            step_id: "step-2".to_string(),
            step_name: "Deploy".to_string(),
            command: "az group create".to_string(),
            error: ScenarioError::Timeout {
                step_id: "step-2".to_string(),
                seconds: 5,
            },
        };

        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["error"]["kind"], "timeout");
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("timed out after 5s"));
    }
}
