//! Main orchestrator for scenario execution.
//!
//! Drives one run through `NotStarted -> Running -> {Succeeded, Failed}`:
//! steps execute strictly in document order, the first failure halts the
//! loop, background steps are joined, and cleanup always runs before the
//! result is produced.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{BackgroundHandle, CancelSignal, CommandOutput, CommandRunner, ShellRunner};
use crate::config::EngineConfig;
use crate::domain::{RunState, Scenario, ScenarioResult, Step, StepFailure, StepResult};
use crate::error::ScenarioError;

use super::cleanup::{CleanupCoordinator, ResourcePattern};
use super::environment::EnvironmentStore;
use super::executor::StepExecutor;
use super::safety::SafetyTracker;
use super::verifier::{OutputVerifier, Verdict};

/// A background step that has been spawned but not yet joined
struct PendingBackground {
    index: usize,
    rendered: String,
    handle: BackgroundHandle,
}

/// Main scenario orchestrator
pub struct Orchestrator {
    config: Arc<EngineConfig>,
    executor: StepExecutor,
    verifier: OutputVerifier,
    patterns: Vec<ResourcePattern>,
}

impl Orchestrator {
    /// Create an orchestrator that runs commands through the configured shell
    pub fn new(config: EngineConfig) -> Result<Self> {
        let runner = Arc::new(ShellRunner::with_shell(config.shell.clone()));
        Self::with_runner(config, runner)
    }

    /// Create an orchestrator with a custom command runner
    pub fn with_runner(config: EngineConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        config.validate()?;

        let mut verifier = OutputVerifier::with_defaults(config.metric);
        for pattern in config.ignore_regexes()? {
            verifier = verifier.ignore(pattern);
        }
        let patterns = config.resource_patterns()?;
        let config = Arc::new(config);

        Ok(Self {
            executor: StepExecutor::new(runner, Arc::clone(&config)),
            config,
            verifier,
            patterns,
        })
    }

    /// The configuration this orchestrator runs with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute a scenario to completion
    pub async fn run_scenario(&self, scenario: &Scenario) -> ScenarioResult {
        let (_cancel_tx, cancel) = watch::channel(false);
        self.run_scenario_with_cancel(scenario, cancel).await
    }

    /// Execute a scenario, stopping early when `cancel` turns `true`.
    ///
    /// Cleanup of tracked resources runs on every path out of the loop,
    /// including cancellation.
    #[instrument(skip(self, scenario, cancel), fields(scenario = %scenario.name))]
    pub async fn run_scenario_with_cancel(&self, scenario: &Scenario, cancel: CancelSignal) -> ScenarioResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut state = RunState::NotStarted;
        advance(&mut state, RunState::Running);
        info!(%run_id, steps = scenario.steps.len(), "Starting scenario execution");

        let mut env = self.executor.environment(&scenario.variables);
        let mut cleanup = CleanupCoordinator::new(self.patterns.clone(), self.config.subscription.clone());
        let mut tracker = SafetyTracker::new();
        let mut results: BTreeMap<usize, StepResult> = BTreeMap::new();
        let mut background: Vec<PendingBackground> = Vec::new();
        let mut failure: Option<StepFailure> = None;

        for (index, step) in scenario.steps.iter().enumerate() {
            if *cancel.borrow() {
                failure = Some(step_failure(step, &step.command, ScenarioError::Interrupted {
                    step_id: step.id.clone(),
                }));
                break;
            }

            // Safety check before each step
            if let Err(violation) = self.config.limits.check(&tracker) {
                failure = Some(step_failure(step, &step.command, violation.into()));
                break;
            }

            // Join the background steps this one waits on
            for waited in &step.wait_for {
                let Some(pos) = background
                    .iter()
                    .position(|p| scenario.steps[p.index].id == *waited)
                else {
                    continue;
                };
                let pending = background.remove(pos);
                let (result, error) = self
                    .collect_background(scenario, pending.index, &pending.rendered, pending.handle, &mut env, &mut cleanup)
                    .await;
                results.insert(pending.index, result);
                if let Some(error) = error {
                    failure = Some(error);
                    break;
                }
            }
            if failure.is_some() {
                break;
            }

            let prepared = match self.executor.prepare(step, &env).await {
                Ok(prepared) => prepared,
                Err(e) => {
                    results.insert(index, StepResult::not_run(&step.id));
                    failure = Some(step_failure(step, &step.command, e));
                    break;
                }
            };

            if step.background {
                match self.executor.spawn(step, &prepared, tracker.remaining(&self.config.limits)) {
                    Ok(handle) => {
                        tracker.record_step();
                        background.push(PendingBackground {
                            index,
                            rendered: prepared.rendered,
                            handle,
                        });
                        continue;
                    }
                    Err(e) => {
                        results.insert(index, StepResult::not_run(&step.id));
                        failure = Some(step_failure(step, &prepared.rendered, e));
                        break;
                    }
                }
            }

            let rendered = prepared.rendered.clone();
            match self.executor.run(step, prepared, &mut env, cancel.clone()).await {
                Ok(executed) => {
                    let output = &executed.output;
                    tracker.record_step();
                    cleanup.track(step, &executed.rendered, output.exit_code, &env);

                    let (result, error) = self.judge(step, output, false);
                    results.insert(index, result);
                    if let Some(error) = error {
                        failure = Some(step_failure(step, &rendered, error));
                        break;
                    }
                }
                Err(e) => {
                    let mut result = StepResult::not_run(&step.id);
                    result.timed_out = matches!(e, ScenarioError::Timeout { .. });
                    results.insert(index, result);
                    failure = Some(step_failure(step, &rendered, e));
                    break;
                }
            }
        }

        // Every background process is joined before the result exists
        for pending in background {
            if failure.is_some() {
                pending.handle.stop();
            }
            let (result, error) = self
                .collect_background(scenario, pending.index, &pending.rendered, pending.handle, &mut env, &mut cleanup)
                .await;
            results.insert(pending.index, result);
            if failure.is_none() {
                failure = error;
            }
        }

        let teardown = cleanup
            .teardown(self.config.do_not_delete, self.executor.runner(), |command| {
                self.executor.command_spec(command, &env)
            })
            .await;

        let next = if failure.is_none() {
            RunState::Succeeded
        } else {
            RunState::Failed
        };
        advance(&mut state, next);

        let result = ScenarioResult {
            run_id,
            scenario_name: scenario.name.clone(),
            fingerprint: scenario.fingerprint.clone(),
            state,
            success: state == RunState::Succeeded,
            step_results: results.into_values().collect(),
            failure,
            teardown,
            started_at,
            completed_at: Utc::now(),
        };

        match result.failure {
            None => info!(%run_id, duration_ms = result.duration_ms(), "Scenario succeeded"),
            Some(ref f) => error!(%run_id, step = %f.step_id, error = %f.error, "Scenario failed"),
        }
        result
    }

    /// Join a background step, verify it and track what it created
    async fn collect_background(
        &self,
        scenario: &Scenario,
        index: usize,
        rendered: &str,
        handle: BackgroundHandle,
        env: &mut EnvironmentStore,
        cleanup: &mut CleanupCoordinator,
    ) -> (StepResult, Option<StepFailure>) {
        let step = &scenario.steps[index];
        match self.executor.join(step, handle, env).await {
            Ok((output, _)) => {
                cleanup.track(step, rendered, output.exit_code, env);
                let stopped = output.cancelled || output.timed_out;
                let (mut result, error) = self.judge(step, &output, stopped);
                result.background = true;
                (result, error.map(|e| step_failure(step, rendered, e)))
            }
            Err(e) => {
                let mut result = StepResult::not_run(&step.id);
                result.background = true;
                (result, Some(step_failure(step, rendered, e)))
            }
        }
    }

    /// Turn captured output into a result, plus the error if it failed.
    ///
    /// A background process the engine had to stop, at the end of the run
    /// or when the run timeout ran out, is judged on its expected output
    /// alone; without one it passes.
    fn judge(&self, step: &Step, output: &CommandOutput, stopped: bool) -> (StepResult, Option<ScenarioError>) {
        let verdict = if stopped && step.expected_output.is_none() {
            Verdict {
                matched: true,
                similarity: 1.0,
            }
        } else {
            self.verifier.verify(step, output.exit_code, &output.stdout)
        };

        let result = StepResult {
            step_id: step.id.clone(),
            exit_code: output.exit_code,
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
            duration_ms: output.duration_ms,
            matched: verdict.matched,
            similarity: verdict.similarity,
            timed_out: output.timed_out,
            background: false,
        };

        if verdict.matched {
            info!(
                step = %step.id,
                similarity = verdict.similarity,
                duration_ms = output.duration_ms,
                "Step passed"
            );
            return (result, None);
        }

        let error = match step.expected_output {
            Some(ref expected) => ScenarioError::VerificationMismatch {
                step_id: step.id.clone(),
                expected: expected.clone(),
                actual: output.stdout.clone(),
                similarity: verdict.similarity,
                threshold: step.expected_similarity,
            },
            None => ScenarioError::CommandFailed {
                step_id: step.id.clone(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            },
        };
        (result, Some(error))
    }
}

/// Record a state transition, refusing illegal ones
fn advance(state: &mut RunState, next: RunState) {
    if state.can_transition_to(next) {
        *state = next;
    } else {
        warn!(from = ?state, to = ?next, "Ignoring invalid run state transition");
    }
}

fn step_failure(step: &Step, command: &str, error: ScenarioError) -> StepFailure {
    error!(step = %step.id, name = %step.name, error = %error, "Step failed");
    StepFailure {
        step_id: step.id.clone(),
        step_name: step.name.clone(),
        command: command.to_string(),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::{build_scenario, default_languages};
    use indexmap::IndexMap;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(EngineConfig {
            working_dir: std::env::temp_dir(),
            ..Default::default()
        })
        .unwrap()
    }

    fn scenario(markdown: &str) -> Scenario {
        build_scenario(markdown, &default_languages(), &IndexMap::new()).unwrap()
    }

    #[test]
    fn test_orchestrator_creation() {
        let orchestrator = orchestrator();
        assert_eq!(orchestrator.config().shell, "bash");

        let bad = Orchestrator::new(EngineConfig {
            working_dir: "/definitely/not/here".into(),
            ..Default::default()
        });
        assert!(bad.is_err());
    }

    #[test]
    fn test_advance_rejects_illegal_transitions() {
        let mut state = RunState::NotStarted;
        advance(&mut state, RunState::Succeeded);
        assert_eq!(state, RunState::NotStarted);
        advance(&mut state, RunState::Running);
        advance(&mut state, RunState::Failed);
        assert_eq!(state, RunState::Failed);
    }

    #[tokio::test]
    async fn test_halts_on_first_failure() {
        let result = orchestrator()
            .run_scenario(&scenario(
                "```bash\necho one\n```\n\n```bash\nexit 3\n```\n\n```bash\necho never\n```\n",
            ))
            .await;

        assert_eq!(result.state, RunState::Failed);
        assert_eq!(result.step_results.len(), 2);
        let failure = result.failure.unwrap();
        assert_eq!(failure.step_id, "step-2");
        assert_eq!(failure.command, "exit 3");
        assert!(matches!(failure.error, ScenarioError::CommandFailed { exit_code: 3, .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let result = orchestrator()
            .run_scenario_with_cancel(&scenario("```bash\necho hi\n```\n"), rx)
            .await;

        assert_eq!(result.state, RunState::Failed);
        assert!(result.step_results.is_empty());
        assert!(matches!(
            result.failure.unwrap().error,
            ScenarioError::Interrupted { .. }
        ));
    }

    #[tokio::test]
    async fn test_safety_limit_stops_run() {
        let orchestrator = Orchestrator::new(EngineConfig {
            working_dir: std::env::temp_dir(),
            limits: crate::core::SafetyLimits {
                max_steps: 1,
                ..Default::default()
            },
            ..Default::default()
        })
        .unwrap();

        let result = orchestrator
            .run_scenario(&scenario("```bash\ntrue\n```\n\n```bash\ntrue\n```\n"))
            .await;

        assert_eq!(result.step_results.len(), 1);
        assert!(matches!(
            result.failure.unwrap().error,
            ScenarioError::SafetyLimit(_)
        ));
    }
}
