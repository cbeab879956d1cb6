//! Cleanup of resources created by a run.
//!
//! Each successful step's rendered command is matched against resource
//! creation patterns. Every match becomes a [`ResourceHandle`]; teardown
//! deletes the handles last-created-first and never aborts part way.

use anyhow::{bail, Context};
use regex::Regex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::adapters::{CommandRunner, CommandSpec};
use crate::domain::{ResourceHandle, Step, TeardownResult};
use crate::error::ScenarioError;

use super::environment::{shell_word, EnvironmentStore};

/// Placeholder for the created resource's name in delete templates
const NAME_PLACEHOLDER: &str = "{name}";

/// Placeholder expanded to ` --subscription <id>` when a subscription is set
const SUBSCRIPTION_PLACEHOLDER: &str = "{subscription_flag}";

/// `az group create` with its name given by any of the accepted flags
const RESOURCE_GROUP_CREATE: &str = r#"\baz\s+group\s+create\b.*?\s(?:--name|-n|--resource-group|-g)(?:\s+|=)["']?(?P<name>[^\s"';]+)"#;

const RESOURCE_GROUP_DELETE: &str = "az group delete --name {name} --yes --no-wait{subscription_flag}";

/// A resource creation command and how to undo it
#[derive(Debug, Clone)]
pub struct ResourcePattern {
    kind: String,
    create: Regex,
    delete_template: String,
}

impl ResourcePattern {
    /// Compile a rule; `create` must capture the resource name as `name`
    pub fn new(kind: &str, create: &str, delete_template: &str) -> anyhow::Result<Self> {
        let create = Regex::new(create).context("Invalid creation pattern")?;
        if !create.capture_names().any(|n| n == Some("name")) {
            bail!("Creation pattern must have a `name` capture group");
        }
        if !delete_template.contains(NAME_PLACEHOLDER) {
            bail!("Delete command must contain {}", NAME_PLACEHOLDER);
        }
        Ok(Self {
            kind: kind.to_string(),
            create,
            delete_template: delete_template.to_string(),
        })
    }

    /// Resource kind
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Names of every resource `command` creates
    pub fn created_names(&self, command: &str) -> Vec<String> {
        self.create
            .captures_iter(command)
            .filter_map(|c| c.name("name").map(|m| m.as_str().to_string()))
            .collect()
    }

    /// Delete command for one resource
    pub fn delete_command(&self, identifier: &str, subscription: Option<&str>) -> String {
        let flag = subscription
            .map(|s| format!(" --subscription {}", shell_word(s)))
            .unwrap_or_default();
        self.delete_template
            .replace(NAME_PLACEHOLDER, &shell_word(identifier))
            .replace(SUBSCRIPTION_PLACEHOLDER, &flag)
    }
}

/// Patterns every run knows about
pub fn default_resource_patterns() -> Vec<ResourcePattern> {
    ResourcePattern::new("resource-group", RESOURCE_GROUP_CREATE, RESOURCE_GROUP_DELETE)
        .into_iter()
        .collect()
}

/// Tracks created resources and tears them down at the end of a run
pub struct CleanupCoordinator {
    patterns: Vec<ResourcePattern>,
    subscription: Option<String>,
    handles: Vec<ResourceHandle>,
}

impl CleanupCoordinator {
    /// Create a coordinator with no tracked resources
    pub fn new(patterns: Vec<ResourcePattern>, subscription: Option<String>) -> Self {
        Self {
            patterns,
            subscription,
            handles: Vec::new(),
        }
    }

    /// Resources tracked so far, in creation order
    pub fn handles(&self) -> &[ResourceHandle] {
        &self.handles
    }

    /// Record resources created by a finished step.
    ///
    /// Only commands that exited 0 are considered. A name still holding a
    /// `$` reference (assigned in the same block) is resolved against `env`
    /// after the step's exports were absorbed. Returns the new handles.
    pub fn track(
        &mut self,
        step: &Step,
        rendered_command: &str,
        exit_code: i32,
        env: &EnvironmentStore,
    ) -> Vec<ResourceHandle> {
        if exit_code != 0 {
            return Vec::new();
        }

        let command = rendered_command.replace("\\\n", " ");
        let mut added = Vec::new();

        for pattern in &self.patterns {
            for raw in pattern.created_names(&command) {
                let identifier = match resolve_identifier(&raw, env) {
                    Some(id) => id,
                    None => {
                        warn!(
                            step = %step.id,
                            kind = pattern.kind(),
                            name = %raw,
                            "Could not resolve created resource name, it will not be cleaned up"
                        );
                        continue;
                    }
                };

                let known = self
                    .handles
                    .iter()
                    .any(|h| h.kind == pattern.kind() && h.identifier == identifier);
                if known {
                    continue;
                }

                let handle = ResourceHandle {
                    kind: pattern.kind().to_string(),
                    delete_command: pattern
                        .delete_command(&identifier, self.subscription.as_deref()),
                    identifier,
                    created_by_step_id: step.id.clone(),
                };
                info!(
                    step = %step.id,
                    kind = %handle.kind,
                    identifier = %handle.identifier,
                    "Tracking created resource"
                );
                self.handles.push(handle.clone());
                added.push(handle);
            }
        }

        added
    }

    /// Delete every tracked resource, newest first.
    ///
    /// The handle list is drained, so a second call issues nothing. With
    /// `suppress` set no command runs and the handles are only reported.
    /// Failed deletions are logged and never stop the remaining ones.
    pub async fn teardown<F>(
        &mut self,
        suppress: bool,
        runner: &dyn CommandRunner,
        make_spec: F,
    ) -> Vec<TeardownResult>
    where
        F: Fn(&str) -> CommandSpec,
    {
        let handles: Vec<ResourceHandle> = self.handles.drain(..).rev().collect();
        if handles.is_empty() {
            return Vec::new();
        }

        if suppress {
            for handle in &handles {
                warn!(
                    kind = %handle.kind,
                    identifier = %handle.identifier,
                    "Cleanup suppressed, leaving resource in place"
                );
            }
            return handles
                .into_iter()
                .map(|handle| TeardownResult {
                    handle,
                    issued: false,
                    success: false,
                    exit_code: None,
                    error: None,
                })
                .collect();
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            info!(kind = %handle.kind, identifier = %handle.identifier, "Deleting resource");

            // Teardown must survive an interrupted run, so it gets its own signal
            let (_keep, never) = watch::channel(false);
            let outcome = runner.run(&make_spec(&handle.delete_command), never).await;

            let result = match outcome {
                Ok(output) if output.exit_code == 0 && !output.timed_out => TeardownResult {
                    handle,
                    issued: true,
                    success: true,
                    exit_code: Some(0),
                    error: None,
                },
                Ok(output) => {
                    let message = if output.timed_out {
                        "deletion timed out".to_string()
                    } else {
                        output.stderr.trim().to_string()
                    };
                    teardown_failure(handle, Some(output.exit_code), message)
                }
                Err(e) => teardown_failure(handle, None, format!("{:#}", e)),
            };
            results.push(result);
        }

        results
    }
}

fn teardown_failure(handle: ResourceHandle, exit_code: Option<i32>, message: String) -> TeardownResult {
    let error = ScenarioError::TeardownFailure {
        kind: handle.kind.clone(),
        identifier: handle.identifier.clone(),
        message,
    };
    warn!(error = %error, "Teardown failed, continuing");
    TeardownResult {
        handle,
        issued: true,
        success: false,
        exit_code,
        error: Some(error.to_string()),
    }
}

/// Resolve `$NAME` / `${NAME}` left in an identifier
fn resolve_identifier(raw: &str, env: &EnvironmentStore) -> Option<String> {
    if !raw.contains('$') {
        return Some(raw.to_string());
    }
    let resolved = env.render_template(raw).ok()?;
    (!resolved.contains('$') && !resolved.is_empty()).then_some(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::scenario::DEFAULT_SIMILARITY;

    fn step(id: &str) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            language: "azurecli".to_string(),
            command: String::new(),
            expected_output: None,
            expected_similarity: DEFAULT_SIMILARITY,
            background: false,
            requires_confirmation: false,
            timeout_seconds: None,
            wait_for: Vec::new(),
            source_position: 0,
        }
    }

    fn coordinator(subscription: Option<&str>) -> CleanupCoordinator {
        CleanupCoordinator::new(default_resource_patterns(), subscription.map(str::to_string))
    }

    #[test]
    fn test_resource_group_create_forms() {
        let pattern = &default_resource_patterns()[0];
        assert_eq!(pattern.created_names("az group create --name rg1 -l westus"), vec!["rg1"]);
        assert_eq!(pattern.created_names("az group create -l westus -n rg2"), vec!["rg2"]);
        assert_eq!(pattern.created_names("az group create --resource-group=\"rg3\""), vec!["rg3"]);
        assert!(pattern.created_names("az group show --name rg1").is_empty());
        assert!(pattern.created_names("az group delete --name rg1").is_empty());
    }

    #[test]
    fn test_delete_command_includes_subscription() {
        let pattern = &default_resource_patterns()[0];
        assert_eq!(
            pattern.delete_command("rg1", None),
            "az group delete --name rg1 --yes --no-wait"
        );
        assert_eq!(
            pattern.delete_command("rg1", Some("sub-123")),
            "az group delete --name rg1 --yes --no-wait --subscription sub-123"
        );
        // Names are quoted before they reach the shell
        assert_eq!(
            pattern.delete_command("$(id)", None),
            "az group delete --name '$(id)' --yes --no-wait"
        );
    }

    #[test]
    fn test_track_only_on_success_and_once() {
        let env = EnvironmentStore::new();
        let mut cleanup = coordinator(None);

        assert!(cleanup.track(&step("a"), "az group create -n rg1", 1, &env).is_empty());
        assert_eq!(cleanup.track(&step("b"), "az group create -n rg1", 0, &env).len(), 1);
        assert!(cleanup.track(&step("c"), "az group create -n rg1", 0, &env).is_empty());

        assert_eq!(cleanup.handles().len(), 1);
        assert_eq!(cleanup.handles()[0].created_by_step_id, "b");
    }

    #[test]
    fn test_track_resolves_names_assigned_in_the_same_block() {
        let mut env = EnvironmentStore::new();
        env.set("RG", "from-export");
        let mut cleanup = coordinator(None);

        let command = "export RG=from-export\naz group create \\\n  --name $RG --location westus";
        let added = cleanup.track(&step("a"), command, 0, &env);
        assert_eq!(added[0].identifier, "from-export");

        let unresolved = cleanup.track(&step("b"), "az group create -n $MISSING", 0, &env);
        assert!(unresolved.is_empty());
    }

    #[test]
    fn test_custom_rule_validation() {
        assert!(ResourcePattern::new("x", "create (?P<name>\\S+)", "delete {name}").is_ok());
        assert!(ResourcePattern::new("x", "create (\\S+)", "delete {name}").is_err());
        assert!(ResourcePattern::new("x", "create (?P<name>\\S+)", "delete it").is_err());
        assert!(ResourcePattern::new("x", "(", "delete {name}").is_err());
    }
}
