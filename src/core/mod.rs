//! Core scenario logic.
//!
//! This module contains:
//! - Builder: markdown blocks to an ordered step sequence
//! - Environment: variable store and command rendering
//! - Executor: running one step through a command runner
//! - Verifier: fuzzy comparison against documented output
//! - Cleanup: tracking and deleting created resources
//! - Safety: execution limits
//! - Orchestrator: the run state machine

pub mod builder;
pub mod cleanup;
pub mod environment;
pub mod executor;
pub mod orchestrator;
pub mod safety;
pub mod verifier;

// Re-export commonly used types
pub use builder::{build_scenario, build_steps, default_languages, fingerprint, DEFAULT_LANGUAGES};
pub use cleanup::{default_resource_patterns, CleanupCoordinator, ResourcePattern};
pub use environment::{parse_exports, shell_word, EnvironmentStore, UndefinedVariable};
pub use executor::{Executed, PreparedStep, StepExecutor};
pub use orchestrator::Orchestrator;
pub use safety::{SafetyLimits, SafetyTracker, SafetyViolation};
pub use verifier::{MetricKind, OutputVerifier, SimilarityMetric, Verdict};
