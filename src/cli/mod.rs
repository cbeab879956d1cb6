//! Command-line interface for docrun.
//!
//! Provides commands for executing markdown tutorials, inspecting the
//! steps parsed from them, exporting them as shell scripts, and showing
//! the resolved configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{is_variable_name, load_var_file, EngineConfig};
use crate::core::{build_scenario, shell_word, Orchestrator};
use crate::domain::{Scenario, ScenarioResult};
use crate::markdown::document_info;

/// docrun - run markdown tutorials as verifiable scenarios
#[derive(Parser, Debug)]
#[command(name = "docrun")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Debug logging, and echo each step's raw output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every step of a tutorial and verify its output
    Execute(ExecuteArgs),

    /// Print the steps parsed from a tutorial without running them
    Inspect {
        #[command(flatten)]
        scenario: ScenarioArgs,

        /// Print the scenario as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print a tutorial as a standalone shell script
    ToBash {
        #[command(flatten)]
        scenario: ScenarioArgs,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Arguments shared by every command that reads a tutorial
#[derive(Args, Debug, Clone)]
pub struct ScenarioArgs {
    /// Markdown file to read
    pub file: PathBuf,

    /// Executable fence language (repeatable, replaces the defaults)
    #[arg(short, long = "language")]
    pub languages: Vec<String>,

    /// Variable override as KEY=VALUE (repeatable)
    #[arg(long = "var", value_parser = parse_var)]
    pub vars: Vec<(String, String)>,

    /// YAML file with a flat map of variables
    #[arg(long)]
    pub var_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ExecuteArgs {
    #[command(flatten)]
    pub scenario: ScenarioArgs,

    /// Leave created resources in place
    #[arg(long)]
    pub do_not_delete: bool,

    /// Subscription passed to commands and resource deletions
    #[arg(long, env = "AZURE_SUBSCRIPTION_ID")]
    pub subscription: Option<String>,

    /// Correlation id threaded into every command's environment
    #[arg(long, env = "DOCRUN_CORRELATION_ID")]
    pub correlation_id: Option<String>,

    /// Directory commands run in (default: current directory)
    #[arg(short = 'C', long)]
    pub working_dir: Option<PathBuf>,

    /// Approve steps that require confirmation without asking
    #[arg(short = 'y', long)]
    pub auto_confirm: bool,

    /// Ask on the terminal before steps that require confirmation
    #[arg(long)]
    pub interactive: bool,

    /// Per-step timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Shell used to run commands
    #[arg(long)]
    pub shell: Option<String>,

    /// Write the run result as JSON to this file
    #[arg(long)]
    pub report: Option<PathBuf>,
}

/// Parse a `KEY=VALUE` pair
pub fn parse_var(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    if !is_variable_name(key) {
        return Err(format!("'{}' is not a valid variable name", key));
    }
    Ok((key.to_string(), value.to_string()))
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let verbose = self.verbose;
        match self.command {
            Commands::Execute(args) => execute_scenario(args, verbose).await,
            Commands::Inspect { scenario, json } => inspect(&scenario, json),
            Commands::ToBash { scenario } => to_bash(&scenario),
            Commands::Config => show_config(),
        }
    }
}

/// Resolve config with the tutorial-level flags applied
fn resolve_config(args: &ScenarioArgs) -> Result<EngineConfig> {
    let mut config = EngineConfig::load()?;

    if !args.languages.is_empty() {
        config.languages = args.languages.clone();
    }
    if let Some(ref path) = args.var_file {
        config.variables.extend(load_var_file(path)?);
    }
    config.variables.extend(args.vars.iter().cloned());
    config.working_dir = std::env::current_dir().context("Failed to determine current directory")?;

    Ok(config)
}

/// Read and parse a tutorial
fn load_scenario(path: &Path, config: &EngineConfig) -> Result<Scenario> {
    let markdown = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read markdown file: {}", path.display()))?;

    let mut scenario = build_scenario(&markdown, &config.languages, &config.variables)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    if document_info(&markdown).title.is_none() {
        if let Some(stem) = path.file_stem() {
            scenario.name = stem.to_string_lossy().into_owned();
        }
    }
    Ok(scenario)
}

/// Run a tutorial end to end
async fn execute_scenario(args: ExecuteArgs, verbose: bool) -> Result<()> {
    let mut config = resolve_config(&args.scenario)?;
    config.verbose = verbose;
    config.do_not_delete = args.do_not_delete;
    config.subscription = args.subscription;
    config.correlation_id = args.correlation_id;
    config.auto_confirm = config.auto_confirm || args.auto_confirm;
    config.interactive = args.interactive;
    if let Some(dir) = args.working_dir {
        config.working_dir = dir;
    }
    if let Some(seconds) = args.timeout {
        config.limits.step_timeout_seconds = seconds;
    }
    if let Some(shell) = args.shell {
        config.shell = shell;
    }

    let scenario = load_scenario(&args.scenario.file, &config)?;
    let orchestrator = Orchestrator::new(config)?;

    // Ctrl-C stops the current step; cleanup still runs
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping current step and cleaning up");
            let _ = cancel_tx.send(true);
        }
    });

    info!(file = %args.scenario.file.display(), "Executing scenario");
    let result = orchestrator.run_scenario_with_cancel(&scenario, cancel_rx).await;

    if let Some(path) = args.report {
        let json = serde_json::to_string_pretty(&result).context("Failed to serialize run result")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write report: {}", path.display()))?;
        info!(path = %path.display(), "Report written");
    }

    print_summary(&scenario, &result);

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_summary(scenario: &Scenario, result: &ScenarioResult) {
    eprintln!();
    eprintln!("Scenario: {}", scenario.name);
    for step_result in &result.step_results {
        let name = scenario
            .get_step(&step_result.step_id)
            .map(|s| s.name.as_str())
            .unwrap_or("");
        let mark = if step_result.matched { "ok" } else { "FAIL" };
        eprintln!(
            "  [{:<4}] {:<12} {} ({}ms, similarity {:.2})",
            mark, step_result.step_id, name, step_result.duration_ms, step_result.similarity
        );
    }
    for teardown in &result.teardown {
        let status = match (teardown.issued, teardown.success) {
            (false, _) => "kept",
            (true, true) => "deleted",
            (true, false) => "delete failed",
        };
        eprintln!(
            "  cleanup: {} '{}' {}",
            teardown.handle.kind, teardown.handle.identifier, status
        );
    }

    match result.failure {
        None => eprintln!("\n[Run {} succeeded in {}ms]", result.run_id, result.duration_ms()),
        Some(ref failure) => {
            eprintln!("\n[Run {} failed at step '{}' ({})]", result.run_id, failure.step_id, failure.step_name);
            eprintln!("Command:\n{}\n", failure.command);
            eprintln!("{}", failure.error);
        }
    }
}

/// Print the parsed steps
fn inspect(args: &ScenarioArgs, json: bool) -> Result<()> {
    let config = resolve_config(args)?;
    let scenario = load_scenario(&args.file, &config)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&scenario)?);
        return Ok(());
    }

    println!("Scenario:    {}", scenario.name);
    if !scenario.description.is_empty() {
        println!("Description: {}", scenario.description);
    }
    println!("Fingerprint: {}", scenario.fingerprint);
    if !scenario.variables.is_empty() {
        println!("\nVariables:");
        for (key, value) in &scenario.variables {
            println!("  {}={}", key, value);
        }
    }

    println!("\n{:<12} {:<14} {:<10} {:<30}", "ID", "LANGUAGE", "EXPECTED", "NAME");
    println!("{}", "-".repeat(70));
    for step in &scenario.steps {
        let expected = match step.expected_output {
            Some(_) => format!("{:.2}", step.expected_similarity),
            None => "-".to_string(),
        };
        let mut flags = Vec::new();
        if step.background {
            flags.push("background");
        }
        if step.requires_confirmation {
            flags.push("confirm");
        }
        println!(
            "{:<12} {:<14} {:<10} {:<30} {}",
            step.id,
            step.language,
            expected,
            step.name,
            flags.join(",")
        );
    }

    Ok(())
}

/// Emit the scenario as a shell script
fn to_bash(args: &ScenarioArgs) -> Result<()> {
    let config = resolve_config(args)?;
    let scenario = load_scenario(&args.file, &config)?;
    print!("{}", render_bash(&scenario));
    Ok(())
}

/// Shell script equivalent of a scenario
pub fn render_bash(scenario: &Scenario) -> String {
    let mut script = String::from("#!/usr/bin/env bash\n");
    script.push_str(&format!("# {}\n", scenario.name));
    script.push_str("set -euo pipefail\n");

    if !scenario.variables.is_empty() {
        script.push('\n');
        for (key, value) in &scenario.variables {
            script.push_str(&format!("export {}={}\n", key, shell_word(value)));
        }
    }

    for step in &scenario.steps {
        script.push_str(&format!("\n# {}: {}\n", step.id, step.name));
        if step.background {
            script.push_str(&format!("( {} ) &\n", step.command));
        } else {
            script.push_str(&step.command);
            script.push('\n');
        }
    }

    if scenario.steps.iter().any(|s| s.background) {
        script.push_str("\nwait\n");
    }
    script
}

/// Print the resolved configuration
fn show_config() -> Result<()> {
    let config = EngineConfig::load()?;

    println!("docrun configuration");
    println!();
    println!(
        "Config file: {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    print!("{}", serde_yaml::to_string(&config).context("Failed to render configuration")?);

    let patterns = config.resource_patterns()?;
    println!("\nTracked resource kinds:");
    for pattern in &patterns {
        println!("  {}", pattern.kind());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::default_languages;
    use indexmap::IndexMap;

    #[test]
    fn test_parse_var() {
        assert_eq!(
            parse_var("RG=my=group").unwrap(),
            ("RG".to_string(), "my=group".to_string())
        );
        assert_eq!(parse_var("EMPTY=").unwrap().1, "");
        assert!(parse_var("NOEQUALS").is_err());
        assert!(parse_var("9X=1").is_err());
    }

    #[test]
    fn test_cli_parses_execute_flags() {
        let cli = Cli::try_parse_from([
            "docrun",
            "execute",
            "README.md",
            "--var",
            "RG=demo",
            "-l",
            "sh",
            "--do-not-delete",
            "-y",
            "--timeout",
            "30",
        ])
        .unwrap();

        let Commands::Execute(args) = cli.command else {
            panic!("expected execute");
        };
        assert_eq!(args.scenario.file, PathBuf::from("README.md"));
        assert_eq!(args.scenario.vars, vec![("RG".to_string(), "demo".to_string())]);
        assert_eq!(args.scenario.languages, vec!["sh"]);
        assert!(args.do_not_delete);
        assert!(args.auto_confirm);
        assert_eq!(args.timeout, Some(30));
    }

    #[test]
    fn test_render_bash() {
        let mut vars = IndexMap::new();
        vars.insert("MSG".to_string(), "it's here".to_string());
        let scenario = build_scenario(
            "# Demo\n\n```bash\necho \"$MSG\"\n```\n\n<!-- docrun: background -->\n```bash\nsleep 1\n```\n",
            &default_languages(),
            &vars,
        )
        .unwrap();

        let script = render_bash(&scenario);
        assert!(script.starts_with("#!/usr/bin/env bash\n# Demo\n"));
        assert!(script.contains("export MSG='it'\\''s here'\n"));
        assert!(script.contains("# step-1: Demo\necho \"$MSG\"\n"));
        assert!(script.contains("( sleep 1 ) &\n"));
        assert!(script.ends_with("\nwait\n"));
    }
}
