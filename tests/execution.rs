//! Execution Integration Tests
//!
//! Runs small tutorials end to end against the host shell.

use std::time::{Duration, Instant};

use docrun::core::{build_scenario, default_languages};
use docrun::{EngineConfig, Orchestrator, RunState, Scenario, ScenarioError};
use indexmap::IndexMap;
use tempfile::TempDir;
use tokio::sync::watch;

fn config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        working_dir: dir.path().to_path_buf(),
        ..Default::default()
    }
}

fn scenario(markdown: &str) -> Scenario {
    scenario_with_vars(markdown, IndexMap::new())
}

fn scenario_with_vars(markdown: &str, vars: IndexMap<String, String>) -> Scenario {
    build_scenario(markdown, &default_languages(), &vars).unwrap()
}

#[tokio::test]
async fn test_echo_hello_matches() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(config(&dir)).unwrap();

    let result = orchestrator
        .run_scenario(&scenario("```bash\necho hello\n```\n\n```output\nhello\n```\n"))
        .await;

    assert!(result.success);
    assert_eq!(result.state, RunState::Succeeded);
    assert_eq!(serde_json::to_value(&result).unwrap()["success"], true);
    assert_eq!(result.step_results.len(), 1);
    assert!(result.step_results[0].matched);
    assert_eq!(result.step_results[0].similarity, 1.0);
    assert!(result.failure.is_none());
}

#[tokio::test]
async fn test_exit_1_without_expected_output_fails() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(config(&dir)).unwrap();

    let result = orchestrator.run_scenario(&scenario("```bash\nexit 1\n```\n")).await;

    assert!(!result.success);
    assert_eq!(result.state, RunState::Failed);
    assert!(!result.step_results[0].matched);
    assert_eq!(result.step_results[0].exit_code, 1);
}

#[tokio::test]
async fn test_undefined_variable_fails_before_spawn() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(config(&dir)).unwrap();
    let marker = dir.path().join("spawned");

    let markdown = format!(
        "```bash\ntouch {}\necho $DOCRUN_TEST_UNDEFINED_VAR\n```\n",
        marker.display()
    );
    let result = orchestrator.run_scenario(&scenario(&markdown)).await;

    let failure = result.failure.unwrap();
    assert!(matches!(
        failure.error,
        ScenarioError::UndefinedVariable { ref name, .. } if name == "DOCRUN_TEST_UNDEFINED_VAR"
    ));
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_exports_propagate_to_later_steps() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(config(&dir)).unwrap();

    let markdown = "```bash\nexport X=1\n```\n\n```bash\necho \"x is $X\"\n```\n\n```output\nx is 1\n```\n";
    let result = orchestrator.run_scenario(&scenario(markdown)).await;

    assert!(result.success, "{:?}", result.failure);
    assert_eq!(result.step_results[1].stdout, "x is 1\n");
}

#[tokio::test]
async fn test_cli_variables_seed_the_environment() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(config(&dir)).unwrap();

    let mut vars = IndexMap::new();
    vars.insert("NAME".to_string(), "world".to_string());
    let result = orchestrator
        .run_scenario(&scenario_with_vars(
            "```bash\necho \"hello $NAME\"\n```\n\n```output\nhello world\n```\n",
            vars,
        ))
        .await;

    assert!(result.success, "{:?}", result.failure);
}

#[tokio::test]
async fn test_variable_values_are_never_run_as_code() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(config(&dir)).unwrap();

    let mut vars = IndexMap::new();
    vars.insert("PASSWORD".to_string(), "abc$def".to_string());
    vars.insert("MSG".to_string(), "it's".to_string());
    let markdown = r#"
```bash
echo "$PASSWORD" $MSG
```

```output
abc$def it's
```

```bash
export NOTE='$(touch injected)'
```

```bash
echo "$NOTE"
```

```output
$(touch injected)
```
"#;
    let result = orchestrator
        .run_scenario(&scenario_with_vars(markdown, vars))
        .await;

    assert!(result.success, "{:?}", result.failure);
    assert!(!dir.path().join("injected").exists());
}

#[tokio::test]
async fn test_printed_export_lines_reach_later_steps() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(config(&dir)).unwrap();

    let markdown = "```bash\necho 'export FROM_STDOUT=1'\n```\n\n```bash\necho $FROM_STDOUT\n```\n\n```output\n1\n```\n";
    let result = orchestrator.run_scenario(&scenario(markdown)).await;

    assert!(result.success, "{:?}", result.failure);
}

#[tokio::test]
async fn test_commands_run_in_working_directory() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("marker.txt"), "here\n").unwrap();
    let orchestrator = Orchestrator::new(config(&dir)).unwrap();
    let cwd_before = std::env::current_dir().unwrap();

    let result = orchestrator
        .run_scenario(&scenario("```bash\ncat marker.txt\n```\n\n```output\nhere\n```\n"))
        .await;

    assert!(result.success, "{:?}", result.failure);
    assert_eq!(std::env::current_dir().unwrap(), cwd_before);
}

#[tokio::test]
async fn test_verification_mismatch_reports_both_texts() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(config(&dir)).unwrap();

    let result = orchestrator
        .run_scenario(&scenario(
            "## Greet\n\n```bash\necho goodbye\n```\n\n```output\nhello\n```\n\n```bash\necho unreachable\n```\n",
        ))
        .await;

    assert_eq!(result.step_results.len(), 1);
    let failure = result.failure.unwrap();
    assert_eq!(failure.step_name, "Greet");
    assert_eq!(failure.command, "echo goodbye");
    match failure.error {
        ScenarioError::VerificationMismatch {
            expected, actual, ..
        } => {
            assert_eq!(expected, "hello");
            assert_eq!(actual, "goodbye\n");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_fuzzy_threshold_allows_partial_match() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(config(&dir)).unwrap();

    let markdown = "```bash\necho 'status: ok'; echo 'items: 4'\n```\n\n<!-- docrun: similarity=0.5 -->\n```output\nstatus: ok\nitems: 3\n```\n";
    let result = orchestrator.run_scenario(&scenario(markdown)).await;

    assert!(result.success, "{:?}", result.failure);
    let similarity = result.step_results[0].similarity;
    assert!(similarity >= 0.5 && similarity < 1.0);
}

#[tokio::test]
async fn test_step_timeout() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(config(&dir)).unwrap();
    let started = Instant::now();

    let result = orchestrator
        .run_scenario(&scenario(
            "<!-- docrun: timeout=1 -->\n```bash\nsleep 30\n```\n",
        ))
        .await;

    assert!(started.elapsed() < Duration::from_secs(15));
    assert!(result.step_results[0].timed_out);
    assert!(matches!(
        result.failure.unwrap().error,
        ScenarioError::Timeout { seconds: 1, .. }
    ));
}

#[tokio::test]
async fn test_confirmation_required_when_non_interactive() {
    let dir = TempDir::new().unwrap();
    let markdown = "<!-- docrun: confirm -->\n```bash\necho dangerous\n```\n";

    let strict = Orchestrator::new(config(&dir)).unwrap();
    let result = strict.run_scenario(&scenario(markdown)).await;
    assert!(matches!(
        result.failure.unwrap().error,
        ScenarioError::ConfirmationRequired { .. }
    ));

    let auto = Orchestrator::new(EngineConfig {
        auto_confirm: true,
        ..config(&dir)
    })
    .unwrap();
    assert!(auto.run_scenario(&scenario(markdown)).await.success);
}

#[tokio::test]
async fn test_background_step_is_joined() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(config(&dir)).unwrap();

    let markdown = r#"
<!-- docrun: id=writer background -->
```bash
sleep 0.2; echo written > out.txt; echo done
```

<!-- docrun: wait=writer -->
```bash
cat out.txt
```

```output
written
```
"#;
    let result = orchestrator.run_scenario(&scenario(markdown)).await;

    assert!(result.success, "{:?}", result.failure);
    assert_eq!(result.step_results.len(), 2);
    assert_eq!(result.step_results[0].step_id, "writer");
    assert!(result.step_results[0].background);
    assert_eq!(result.step_results[0].stdout, "done\n");
}

#[tokio::test]
async fn test_long_running_background_step_is_stopped_at_end() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(EngineConfig {
        limits: docrun::core::SafetyLimits {
            background_grace_seconds: 0,
            ..Default::default()
        },
        ..config(&dir)
    })
    .unwrap();
    let started = Instant::now();

    let markdown = "<!-- docrun: background -->\n```bash\nsleep 60\n```\n\n```bash\necho foreground\n```\n";
    let result = orchestrator.run_scenario(&scenario(markdown)).await;

    assert!(result.success, "{:?}", result.failure);
    assert!(started.elapsed() < Duration::from_secs(15));
    // Results stay in document order
    assert_eq!(result.step_results[0].step_id, "step-1");
    assert_eq!(result.step_results[1].step_id, "step-2");
}

#[tokio::test]
async fn test_interrupt_stops_current_step() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(config(&dir)).unwrap();
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        let _ = tx.send(true);
    });

    let markdown = "```bash\nsleep 30\n```\n\n```bash\necho never\n```\n";
    let result = orchestrator.run_scenario_with_cancel(&scenario(markdown), rx).await;

    assert_eq!(result.state, RunState::Failed);
    assert_eq!(result.step_results.len(), 1);
    assert!(matches!(
        result.failure.unwrap().error,
        ScenarioError::Interrupted { .. }
    ));
}

#[tokio::test]
async fn test_report_serializes() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::new(config(&dir)).unwrap();

    let result = orchestrator.run_scenario(&scenario("```bash\nexit 2\n```\n")).await;
    let json = serde_json::to_value(&result).unwrap();

    assert_eq!(json["state"], "failed");
    assert_eq!(json["success"], false);
    assert_eq!(json["failure"]["error"]["kind"], "command_failed");
    assert_eq!(json["step_results"][0]["exit_code"], 2);
}
