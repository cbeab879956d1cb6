//! Configuration for docrun runs.
//!
//! Configuration sources (highest priority first):
//! 1. CLI flags (applied by the caller on top of [`EngineConfig::load`])
//! 2. Environment variables (DOCRUN_SHELL, DOCRUN_STEP_TIMEOUT)
//! 3. Config file (.docrun/config.yaml)
//! 4. Defaults
//!
//! Config file discovery:
//! - Searches current directory and parents for .docrun/config.yaml
//! - Falls back to ~/.docrun/config.yaml

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::builder::default_languages;
use crate::core::cleanup::{default_resource_patterns, ResourcePattern};
use crate::core::safety::SafetyLimits;
use crate::core::verifier::MetricKind;

/// Directory holding the config file
const CONFIG_DIR: &str = ".docrun";

/// Config file name inside [`CONFIG_DIR`]
const CONFIG_FILE: &str = "config.yaml";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    /// Executable fence languages
    #[serde(default)]
    pub languages: Option<Vec<String>>,
    /// Variables seeded into every run
    #[serde(default)]
    pub variables: IndexMap<String, String>,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionConfig {
    pub shell: Option<String>,
    pub step_timeout_seconds: Option<u64>,
    pub run_timeout_seconds: Option<u64>,
    pub max_steps: Option<u32>,
    pub max_output_bytes: Option<u64>,
    pub background_grace_seconds: Option<u64>,
    pub auto_confirm: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VerifierConfig {
    pub metric: Option<MetricKind>,
    /// Extra regexes masked before comparison
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CleanupConfig {
    /// Additional resource creation/deletion rules
    #[serde(default)]
    pub resources: Vec<ResourceRule>,
}

/// One resource rule as written in the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRule {
    /// Resource kind reported in teardown results
    pub kind: String,
    /// Regex with a `name` capture group matched against rendered commands
    pub create: String,
    /// Delete command with `{name}` and optional `{subscription_flag}` placeholders
    pub delete: String,
}

/// Everything a run needs, resolved and validated once at the boundary
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    /// Fence languages that become steps
    pub languages: Vec<String>,

    /// Variables written into the environment store before step 1
    pub variables: IndexMap<String, String>,

    /// Working directory of every subprocess
    pub working_dir: PathBuf,

    /// Shell binary commands are handed to
    pub shell: String,

    /// Echo raw step output to the console
    pub verbose: bool,

    /// Skip issuing deletion commands during cleanup
    pub do_not_delete: bool,

    /// Subscription passed to subprocesses and resource deletions
    pub subscription: Option<String>,

    /// Opaque id threaded into subprocesses for telemetry correlation
    pub correlation_id: Option<String>,

    /// Proceed through confirmation steps without asking
    pub auto_confirm: bool,

    /// Allow prompting on a terminal for confirmation steps
    pub interactive: bool,

    /// Execution limits
    pub limits: SafetyLimits,

    /// Similarity metric used by the verifier
    pub metric: MetricKind,

    /// Extra ignore patterns for the verifier (defaults always apply)
    pub ignore_patterns: Vec<String>,

    /// Extra resource rules for cleanup (defaults always apply)
    pub resources: Vec<ResourceRule>,

    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            languages: default_languages(),
            variables: IndexMap::new(),
            working_dir: PathBuf::from("."),
            shell: "bash".to_string(),
            verbose: false,
            do_not_delete: false,
            subscription: None,
            correlation_id: None,
            auto_confirm: false,
            interactive: false,
            limits: SafetyLimits::default(),
            metric: MetricKind::default(),
            ignore_patterns: Vec::new(),
            resources: Vec::new(),
            config_file: None,
        }
    }
}

impl EngineConfig {
    /// Load defaults, the discovered config file, then environment overrides
    pub fn load() -> Result<Self> {
        let config_file = find_config_file();
        let mut config = match config_file {
            Some(ref path) => Self::from_file(path, load_config_file(path)?),
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults overlaid with a parsed config file
    pub fn from_file(path: &Path, file: ConfigFile) -> Self {
        let mut config = Self {
            config_file: Some(path.to_path_buf()),
            ..Self::default()
        };

        if let Some(languages) = file.languages {
            config.languages = languages;
        }
        config.variables = file.variables;

        let exec = file.execution;
        if let Some(shell) = exec.shell {
            config.shell = shell;
        }
        if let Some(v) = exec.step_timeout_seconds {
            config.limits.step_timeout_seconds = v;
        }
        if let Some(v) = exec.run_timeout_seconds {
            config.limits.run_timeout_seconds = v;
        }
        if let Some(v) = exec.max_steps {
            config.limits.max_steps = v;
        }
        if let Some(v) = exec.max_output_bytes {
            config.limits.max_output_bytes = v;
        }
        if let Some(v) = exec.background_grace_seconds {
            config.limits.background_grace_seconds = v;
        }
        config.auto_confirm = exec.auto_confirm.unwrap_or(false);

        if let Some(metric) = file.verifier.metric {
            config.metric = metric;
        }
        config.ignore_patterns = file.verifier.ignore_patterns;
        config.resources = file.cleanup.resources;

        config
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(shell) = lookup("DOCRUN_SHELL").filter(|s| !s.is_empty()) {
            self.shell = shell;
        }
        if let Some(raw) = lookup("DOCRUN_STEP_TIMEOUT").filter(|s| !s.is_empty()) {
            self.limits.step_timeout_seconds = raw
                .trim()
                .parse()
                .with_context(|| format!("DOCRUN_STEP_TIMEOUT is not a number: {}", raw))?;
        }
        Ok(())
    }

    /// Check the config once before entering the engine
    pub fn validate(&self) -> Result<()> {
        if self.languages.is_empty() {
            bail!("At least one executable language is required");
        }
        if !self.working_dir.is_dir() {
            bail!(
                "Working directory does not exist: {}",
                self.working_dir.display()
            );
        }
        if self.shell.trim().is_empty() {
            bail!("Shell must not be empty");
        }
        if self.limits.step_timeout_seconds == 0 || self.limits.run_timeout_seconds == 0 {
            bail!("Timeouts must be at least 1 second");
        }
        if self.limits.max_steps == 0 {
            bail!("max_steps must be at least 1");
        }
        for key in self.variables.keys() {
            if !is_variable_name(key) {
                bail!("Invalid variable name '{}'", key);
            }
        }
        self.ignore_regexes()?;
        self.resource_patterns()?;
        Ok(())
    }

    /// Compile the extra verifier ignore patterns
    pub fn ignore_regexes(&self) -> Result<Vec<Regex>> {
        self.ignore_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("Invalid ignore pattern: {}", p)))
            .collect()
    }

    /// Built-in resource patterns followed by the configured ones
    pub fn resource_patterns(&self) -> Result<Vec<ResourcePattern>> {
        let mut patterns = default_resource_patterns();
        for rule in &self.resources {
            let pattern = ResourcePattern::new(&rule.kind, &rule.create, &rule.delete)
                .with_context(|| format!("Invalid resource rule for '{}'", rule.kind))?;
            patterns.push(pattern);
        }
        Ok(patterns)
    }
}

/// Check for a shell-compatible variable name
pub fn is_variable_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Find config file by searching current directory and parents, then home
pub fn find_config_file() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    find_config_file_from(&cwd).or_else(|| {
        let home = dirs::home_dir()?.join(CONFIG_DIR).join(CONFIG_FILE);
        home.is_file().then_some(home)
    })
}

/// Find config file starting at `start` and walking up
pub fn find_config_file_from(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(CONFIG_DIR).join(CONFIG_FILE);
        if config_path.is_file() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Load a flat YAML map of variables
pub fn load_var_file(path: &Path) -> Result<IndexMap<String, String>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read variable file: {}", path.display()))?;

    let raw: IndexMap<String, serde_yaml::Value> = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse variable file: {}", path.display()))?;

    let mut vars = IndexMap::new();
    for (key, value) in raw {
        let value = match value {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Number(n) => n.to_string(),
            serde_yaml::Value::Bool(b) => b.to_string(),
            serde_yaml::Value::Null => String::new(),
            _ => bail!("Variable '{}' in {} must be a scalar", key, path.display()),
        };
        vars.insert(key, value);
    }
    Ok(vars)
}
