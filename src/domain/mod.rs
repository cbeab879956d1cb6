//! Domain types for the scenario engine.
//!
//! This module contains the core data structures:
//! - Block: Typed fenced regions extracted from markdown
//! - Scenario/Step: The executable plan built from blocks
//! - Results: Per-step and per-run outcomes
//! - Resources: Handles for things a run created and must delete

pub mod block;
pub mod resource;
pub mod result;
pub mod scenario;

// Re-export commonly used types
pub use block::{Block, BlockKind};
pub use resource::{ResourceHandle, TeardownResult};
pub use result::{RunState, ScenarioResult, StepFailure, StepResult};
pub use scenario::{Scenario, Step};
