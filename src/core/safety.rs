//! Safety limits and enforcement for scenario execution.
//!
//! Prevents runaway execution through configurable limits on:
//! - Number of steps
//! - Captured output size
//! - Per-step and per-run timeouts

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Safety limits for scenario execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum number of steps per run (default: 200)
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Maximum captured bytes per stream (default: 10MB)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,

    /// Per-step timeout in seconds (default: 300 = 5 min)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    /// Total run timeout in seconds (default: 3600 = 1 hour)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,

    /// How long background steps may keep running once the loop is done
    #[serde(default = "default_background_grace")]
    pub background_grace_seconds: u64,
}

fn default_max_steps() -> u32 {
    200
}
fn default_max_output_bytes() -> u64 {
    10 * 1024 * 1024
} // 10MB
fn default_step_timeout() -> u64 {
    300
} // 5 min
fn default_run_timeout() -> u64 {
    3600
} // 1 hour
fn default_background_grace() -> u64 {
    5
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_output_bytes: default_max_output_bytes(),
            step_timeout_seconds: default_step_timeout(),
            run_timeout_seconds: default_run_timeout(),
            background_grace_seconds: default_background_grace(),
        }
    }
}

impl SafetyLimits {
    /// Check current tracker state against limits
    pub fn check(&self, tracker: &SafetyTracker) -> Result<(), SafetyViolation> {
        // Check step count
        if tracker.steps_executed >= self.max_steps {
            return Err(SafetyViolation::MaxSteps {
                actual: tracker.steps_executed,
                limit: self.max_steps,
            });
        }

        // Check run timeout
        let elapsed = tracker.started_at.elapsed().as_secs();
        if elapsed >= self.run_timeout_seconds {
            return Err(SafetyViolation::RunTimeout {
                elapsed_seconds: elapsed,
                limit_seconds: self.run_timeout_seconds,
            });
        }

        Ok(())
    }

    /// Cut captured output down to `max_output_bytes`, on a char boundary
    pub fn clamp_output(&self, mut output: String) -> String {
        let limit = self.max_output_bytes as usize;
        if output.len() <= limit {
            return output;
        }

        let mut cut = limit;
        while cut > 0 && !output.is_char_boundary(cut) {
            cut -= 1;
        }
        output.truncate(cut);
        output.push_str("\n[output truncated]\n");
        output
    }

    /// Grace period for background steps as a duration
    pub fn background_grace(&self) -> Duration {
        Duration::from_secs(self.background_grace_seconds)
    }
}

/// Tracks resource usage during a run
#[derive(Debug, Clone)]
pub struct SafetyTracker {
    /// Number of steps executed
    pub steps_executed: u32,

    /// When the run started
    pub started_at: Instant,
}

impl Default for SafetyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyTracker {
    /// Create a new tracker
    pub fn new() -> Self {
        Self {
            steps_executed: 0,
            started_at: Instant::now(),
        }
    }

    /// Record a step execution
    pub fn record_step(&mut self) {
        self.steps_executed += 1;
    }

    /// Time left before the run timeout, zero once it has passed
    pub fn remaining(&self, limits: &SafetyLimits) -> Duration {
        Duration::from_secs(limits.run_timeout_seconds).saturating_sub(self.started_at.elapsed())
    }
}

/// Safety violation errors
#[derive(Debug, Clone, Error)]
pub enum SafetyViolation {
    #[error("Maximum steps exceeded: {actual} >= {limit}")]
    MaxSteps { actual: u32, limit: u32 },

    #[error("Run timeout: {elapsed_seconds}s >= {limit_seconds}s")]
    RunTimeout {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },
}
