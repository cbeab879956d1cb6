//! Step execution.
//!
//! Checks a step's variable references, applies the confirmation policy,
//! and hands the script to the [`CommandRunner`]. The shell sees the
//! command exactly as written and expands references itself from the
//! subprocess environment, so stored values are never parsed as code.
//! The script is wrapped so that the shell prints its exported variables
//! after the command finishes; that section is split off stdout and fed
//! into the environment store, along with any `export KEY=VALUE` lines
//! the command printed itself.

use std::io::{BufRead, IsTerminal, Write};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::adapters::{BackgroundHandle, CancelSignal, CommandOutput, CommandRunner, CommandSpec};
use crate::config::EngineConfig;
use crate::domain::Step;
use crate::error::ScenarioError;

use super::environment::EnvironmentStore;

/// Line separating command output from the exported environment
const EXPORT_MARKER: &str = "__DOCRUN_EXPORTS_5b1d0c__";

/// A step rendered and cleared to run
#[derive(Debug, Clone)]
pub struct PreparedStep {
    /// Command text with variables substituted, for display and tracking
    pub rendered: String,

    spec: CommandSpec,
}

/// A foreground step that ran to completion
#[derive(Debug, Clone)]
pub struct Executed {
    /// Command text with variables substituted
    pub rendered: String,

    /// Output with the export section removed
    pub output: CommandOutput,

    /// Variables the step exported or changed
    pub exported: Vec<String>,
}

/// Runs single steps against a [`CommandRunner`]
pub struct StepExecutor {
    runner: Arc<dyn CommandRunner>,
    config: Arc<EngineConfig>,
}

impl StepExecutor {
    /// Create an executor
    pub fn new(runner: Arc<dyn CommandRunner>, config: Arc<EngineConfig>) -> Self {
        Self { runner, config }
    }

    /// The runner commands go through
    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    /// Render the command and settle confirmation.
    ///
    /// Fails before anything is spawned when a variable is undefined or the
    /// step needs a confirmation nobody can give.
    pub async fn prepare(&self, step: &Step, env: &EnvironmentStore) -> Result<PreparedStep, ScenarioError> {
        let rendered = env
            .render_template(&step.command)
            .map_err(|e| ScenarioError::UndefinedVariable {
                step_id: step.id.clone(),
                name: e.0,
            })?;

        if step.requires_confirmation {
            self.confirm(step, &rendered).await?;
        }

        let spec = self
            .command_spec(&wrap_script(&step.command), env)
            .with_timeout(step.timeout(&self.config.limits));

        Ok(PreparedStep { rendered, spec })
    }

    /// Run a prepared foreground step and absorb what it exported
    pub async fn run(
        &self,
        step: &Step,
        prepared: PreparedStep,
        env: &mut EnvironmentStore,
        cancel: CancelSignal,
    ) -> Result<Executed, ScenarioError> {
        info!(step = %step.id, name = %step.name, "Running step");
        debug!(step = %step.id, command = %prepared.rendered, "Rendered command");

        let output = self
            .runner
            .run(&prepared.spec, cancel)
            .await
            .map_err(|e| ScenarioError::Spawn {
                step_id: step.id.clone(),
                message: format!("{:#}", e),
            })?;

        if output.cancelled {
            return Err(ScenarioError::Interrupted {
                step_id: step.id.clone(),
            });
        }
        if output.timed_out {
            return Err(ScenarioError::Timeout {
                step_id: step.id.clone(),
                seconds: step.timeout(&self.config.limits).as_secs(),
            });
        }

        let (output, exported) = self.finish(step, output, env);
        Ok(Executed {
            rendered: prepared.rendered,
            output,
            exported,
        })
    }

    /// Start a prepared step in the background.
    ///
    /// The step timeout does not apply; the process is killed once `budget`
    /// (what is left of the run timeout) runs out.
    pub fn spawn(&self, step: &Step, prepared: &PreparedStep, budget: Duration) -> Result<BackgroundHandle, ScenarioError> {
        info!(step = %step.id, name = %step.name, budget_secs = budget.as_secs(), "Starting background step");
        let spec = prepared.spec.clone().with_timeout(budget);

        self.runner
            .spawn_background(&spec)
            .map_err(|e| ScenarioError::Spawn {
                step_id: step.id.clone(),
                message: format!("{:#}", e),
            })
    }

    /// Collect a background step, giving it `grace` to exit on its own
    pub async fn join(
        &self,
        step: &Step,
        handle: BackgroundHandle,
        env: &mut EnvironmentStore,
    ) -> Result<(CommandOutput, Vec<String>), ScenarioError> {
        let output = handle
            .join(self.config.limits.background_grace())
            .await
            .map_err(|e| ScenarioError::Spawn {
                step_id: step.id.clone(),
                message: e.to_string(),
            })?;

        if output.cancelled {
            debug!(step = %step.id, "Background step was still running and has been stopped");
        }
        Ok(self.finish(step, output, env))
    }

    /// Fresh store for a run: host environment, injected variables, then `seed`
    pub fn environment(&self, seed: &indexmap::IndexMap<String, String>) -> EnvironmentStore {
        let mut env = EnvironmentStore::with_process_env();
        for (key, value) in self.injected_env() {
            env.inherit(key, value);
        }
        env.extend(seed.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    /// Spec for an arbitrary script with the run's environment
    pub fn command_spec(&self, script: &str, env: &EnvironmentStore) -> CommandSpec {
        CommandSpec::new(script, self.config.working_dir.clone())
            .with_env(self.process_env(env))
            .with_timeout(Duration::from_secs(self.config.limits.step_timeout_seconds))
    }

    /// Variables added to every subprocess: the store, then injected ones
    pub fn process_env(&self, env: &EnvironmentStore) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        vars.extend(self.injected_env());
        vars
    }

    /// Subscription and correlation id as subprocess variables
    fn injected_env(&self) -> Vec<(String, String)> {
        let mut vars = Vec::new();
        if let Some(ref subscription) = self.config.subscription {
            vars.push(("AZURE_SUBSCRIPTION_ID".to_string(), subscription.clone()));
        }
        if let Some(ref correlation) = self.config.correlation_id {
            vars.push((
                "AZURE_HTTP_USER_AGENT".to_string(),
                format!("docrun/{}", correlation),
            ));
        }
        vars
    }

    /// Absorb `export` lines the command printed and the shell's own
    /// export dump (which wins), then clamp and echo the output
    fn finish(&self, step: &Step, mut output: CommandOutput, env: &mut EnvironmentStore) -> (CommandOutput, Vec<String>) {
        let (stdout, exports) = split_exports(&output.stdout);
        let mut exported = env.absorb_exports(stdout);
        for name in exports.map(|e| env.absorb_exports(e)).unwrap_or_default() {
            if !exported.contains(&name) {
                exported.push(name);
            }
        }
        if !exported.is_empty() {
            debug!(step = %step.id, variables = ?exported, "Step exported variables");
        }

        output.stdout = self.config.limits.clamp_output(stdout.to_string());
        output.stderr = self.config.limits.clamp_output(std::mem::take(&mut output.stderr));

        if self.config.verbose {
            print!("{}", output.stdout);
            eprint!("{}", output.stderr);
            let _ = std::io::stdout().flush();
        } else {
            debug!(step = %step.id, stdout = %output.stdout, stderr = %output.stderr, "Step output");
        }

        (output, exported)
    }

    /// Auto-confirm, ask on a terminal, or refuse
    async fn confirm(&self, step: &Step, rendered: &str) -> Result<(), ScenarioError> {
        if self.config.auto_confirm {
            info!(step = %step.id, "Confirmation auto-approved");
            return Ok(());
        }

        let refused = || ScenarioError::ConfirmationRequired {
            step_id: step.id.clone(),
        };
        if !self.config.interactive || !std::io::stdin().is_terminal() {
            return Err(refused());
        }

        let prompt = format!("\nStep '{}' ({}) will run:\n\n{}\n\nProceed? [y/N] ", step.id, step.name, rendered);
        let answer = tokio::task::spawn_blocking(move || {
            eprint!("{}", prompt);
            let _ = std::io::stderr().flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;

        match answer {
            Ok(Ok(line)) if matches!(line.trim().to_lowercase().as_str(), "y" | "yes") => Ok(()),
            _ => Err(refused()),
        }
    }
}

/// Append the export dump to a command, preserving its exit code
fn wrap_script(command: &str) -> String {
    format!(
        "{command}\n__docrun_rc=$?\nprintf '\\n%s\\n' '{marker}'\nexport -p\nexit $__docrun_rc\n",
        command = command,
        marker = EXPORT_MARKER,
    )
}

/// Split wrapped stdout into the command's own output and the export dump
fn split_exports(stdout: &str) -> (&str, Option<&str>) {
    let needle = format!("\n{}\n", EXPORT_MARKER);
    match stdout.rfind(&needle) {
        Some(idx) => (&stdout[..idx], Some(&stdout[idx + needle.len()..])),
        None => (stdout, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ShellRunner;
    use crate::domain::scenario::DEFAULT_SIMILARITY;
    use tokio::sync::watch;

    fn step(command: &str) -> Step {
        Step {
            id: "step-1".to_string(),
            name: "Test".to_string(),
            language: "bash".to_string(),
            command: command.to_string(),
            expected_output: None,
            expected_similarity: DEFAULT_SIMILARITY,
            background: false,
            requires_confirmation: false,
            timeout_seconds: None,
            wait_for: Vec::new(),
            source_position: 0,
        }
    }

    fn executor(config: EngineConfig) -> StepExecutor {
        StepExecutor::new(Arc::new(ShellRunner::new()), Arc::new(config))
    }

    fn config() -> EngineConfig {
        EngineConfig {
            working_dir: std::env::temp_dir(),
            ..Default::default()
        }
    }

    fn no_cancel() -> CancelSignal {
        watch::channel(false).1
    }

    async fn run(executor: &StepExecutor, step: &Step, env: &mut EnvironmentStore) -> Result<Executed, ScenarioError> {
        let prepared = executor.prepare(step, env).await?;
        executor.run(step, prepared, env, no_cancel()).await
    }

    #[test]
    fn test_split_exports() {
        assert_eq!(
            split_exports(&format!("hello\n\n{}\ndeclare -x A=\"1\"\n", EXPORT_MARKER)),
            ("hello\n", Some("declare -x A=\"1\"\n"))
        );
        assert_eq!(
            split_exports(&format!("no newline\n{}\n", EXPORT_MARKER)),
            ("no newline", Some(""))
        );
        assert_eq!(split_exports("exited early\n"), ("exited early\n", None));
    }

    #[tokio::test]
    async fn test_output_is_clean_and_exports_are_absorbed() {
        let executor = executor(config());
        let mut env = EnvironmentStore::with_process_env();

        let executed = run(&executor, &step("echo hello\nexport REGION=westus"), &mut env)
            .await
            .unwrap();

        assert_eq!(executed.output.stdout, "hello\n");
        assert_eq!(executed.output.exit_code, 0);
        assert_eq!(executed.exported, vec!["REGION"]);
        assert_eq!(env.get("REGION"), Some("westus"));
    }

    #[tokio::test]
    async fn test_printed_export_lines_are_absorbed() {
        let executor = executor(config());
        let mut env = EnvironmentStore::with_process_env();

        let executed = run(&executor, &step("echo 'export FROM_STDOUT=1'"), &mut env)
            .await
            .unwrap();
        assert_eq!(executed.exported, vec!["FROM_STDOUT"]);
        assert_eq!(env.get("FROM_STDOUT"), Some("1"));

        let next = run(&executor, &step("echo \"got $FROM_STDOUT\""), &mut env)
            .await
            .unwrap();
        assert_eq!(next.output.stdout, "got 1\n");
    }

    #[tokio::test]
    async fn test_real_export_wins_over_printed_line() {
        let executor = executor(config());
        let mut env = EnvironmentStore::with_process_env();

        run(&executor, &step("echo 'export REGION=printed'; export REGION=actual"), &mut env)
            .await
            .unwrap();
        assert_eq!(env.get("REGION"), Some("actual"));
    }

    #[tokio::test]
    async fn test_values_are_not_parsed_as_shell_code() {
        let dir = tempfile::TempDir::new().unwrap();
        let executor = executor(EngineConfig {
            working_dir: dir.path().to_path_buf(),
            ..config()
        });
        let mut env = EnvironmentStore::with_process_env();
        env.set("PASSWORD", "abc$def");
        env.set("MSG", "it's");

        let executed = run(&executor, &step("echo \"$PASSWORD\"; echo $MSG"), &mut env)
            .await
            .unwrap();
        assert_eq!(executed.output.exit_code, 0);
        assert_eq!(executed.output.stdout, "abc$def\nit's\n");

        run(&executor, &step("export NOTE='$(touch injected)'"), &mut env)
            .await
            .unwrap();
        let executed = run(&executor, &step("echo \"$NOTE\""), &mut env).await.unwrap();
        assert_eq!(executed.output.stdout, "$(touch injected)\n");
        assert_eq!(executed.rendered, "echo \"$(touch injected)\"");
        assert!(!dir.path().join("injected").exists());
    }

    #[tokio::test]
    async fn test_exit_code_is_preserved() {
        let executor = executor(config());
        let mut env = EnvironmentStore::with_process_env();

        let executed = run(&executor, &step("echo partial; false"), &mut env).await.unwrap();
        assert_eq!(executed.output.exit_code, 1);
        assert_eq!(executed.output.stdout, "partial\n");
    }

    #[tokio::test]
    async fn test_store_values_reach_subprocess() {
        let executor = executor(config());
        let mut env = EnvironmentStore::with_process_env();
        env.set("GREETING", "hi there");

        let executed = run(&executor, &step("echo \"$GREETING\"; sh -c 'echo \"$GREETING\"'"), &mut env)
            .await
            .unwrap();
        assert_eq!(executed.output.stdout, "hi there\nhi there\n");
    }

    #[tokio::test]
    async fn test_undefined_variable_fails_before_spawn() {
        let executor = executor(config());
        let env = EnvironmentStore::with_process_env();

        let err = executor
            .prepare(&step("echo $DOCRUN_SURELY_UNDEFINED_VAR"), &env)
            .await
            .unwrap_err();
        assert!(matches!(err, ScenarioError::UndefinedVariable { ref name, .. } if name == "DOCRUN_SURELY_UNDEFINED_VAR"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let mut s = step("sleep 20");
        s.timeout_seconds = Some(1);
        let executor = executor(config());
        let mut env = EnvironmentStore::with_process_env();

        let err = run(&executor, &s, &mut env).await.unwrap_err();
        assert!(matches!(err, ScenarioError::Timeout { seconds: 1, .. }));
    }

    #[tokio::test]
    async fn test_confirmation_policy() {
        let mut s = step("echo confirmed");
        s.requires_confirmation = true;
        let env = EnvironmentStore::with_process_env();

        let refused = executor(config()).prepare(&s, &env).await.unwrap_err();
        assert!(matches!(refused, ScenarioError::ConfirmationRequired { .. }));

        let auto = executor(EngineConfig {
            auto_confirm: true,
            ..config()
        });
        assert!(auto.prepare(&s, &env).await.is_ok());
    }

    #[tokio::test]
    async fn test_subscription_and_correlation_env() {
        let executor = executor(EngineConfig {
            subscription: Some("sub-1".to_string()),
            correlation_id: Some("corr-9".to_string()),
            ..config()
        });
        let mut env = executor.environment(&indexmap::IndexMap::new());

        let executed = run(
            &executor,
            &step("echo \"$AZURE_SUBSCRIPTION_ID $AZURE_HTTP_USER_AGENT\""),
            &mut env,
        )
        .await
        .unwrap();
        assert_eq!(executed.output.stdout, "sub-1 docrun/corr-9\n");
    }

    #[tokio::test]
    async fn test_background_step_is_bounded_by_run_budget() {
        let executor = executor(EngineConfig {
            limits: crate::core::SafetyLimits {
                background_grace_seconds: 60,
                ..Default::default()
            },
            ..config()
        });
        let mut env = EnvironmentStore::with_process_env();
        let s = step("sleep 30");
        let started = std::time::Instant::now();

        let prepared = executor.prepare(&s, &env).await.unwrap();
        let handle = executor.spawn(&s, &prepared, Duration::from_secs(1)).unwrap();
        let (output, _) = executor.join(&s, handle, &mut env).await.unwrap();

        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_background_join_absorbs_exports() {
        let executor = executor(config());
        let mut env = EnvironmentStore::with_process_env();
        let s = step("export BG_READY=yes; echo bg");

        let prepared = executor.prepare(&s, &env).await.unwrap();
        let handle = executor.spawn(&s, &prepared, Duration::from_secs(60)).unwrap();
        let (output, exported) = executor.join(&s, handle, &mut env).await.unwrap();

        assert_eq!(output.stdout, "bg\n");
        assert_eq!(exported, vec!["BG_READY"]);
        assert_eq!(env.get("BG_READY"), Some("yes"));
    }
}
