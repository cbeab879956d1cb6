//! docrun - executable markdown tutorials
//!
//! Turns a markdown tutorial into a scenario: every fenced command block is
//! run for real, its output is compared against the documented output that
//! follows it, and resources the commands created are deleted at the end.
//!
//! # Architecture
//!
//! A run flows through a fixed pipeline:
//! - Markdown is scanned into typed fenced blocks
//! - Blocks are grouped into steps (command + optional expected output)
//! - Steps execute strictly in order, sharing an environment store
//! - Each step's output is verified with a pluggable similarity metric
//! - Created resources are torn down in reverse order, always
//!
//! # Modules
//!
//! - `markdown`: Block extraction and inline directives
//! - `domain`: Data structures (Block, Step, Scenario, results)
//! - `core`: Builder, environment, executor, verifier, cleanup, orchestrator
//! - `adapters`: Command runner seam and the host shell implementation
//! - `config`: Config file discovery and the resolved engine config
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a tutorial
//! docrun execute README.md --var RESOURCE_GROUP=demo-rg
//!
//! # Show the parsed steps
//! docrun inspect README.md
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod markdown;

// Re-export main types at crate root for convenience
pub use config::EngineConfig;
pub use core::{build_scenario, Orchestrator};
pub use domain::{RunState, Scenario, ScenarioResult, Step, StepResult};
pub use error::ScenarioError;
