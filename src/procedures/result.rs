//! Scenario Results
//!
//! Structured output of a suite run, serializable to JSON for the CLI's `--json`
//! mode and for archiving alongside kernel logs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::BspError;
use crate::procedures::Scenario;

// =============================================================================
// ScenarioReport
// =============================================================================

/// Verdict of a single scenario
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Every check passed
    Passed,
    /// Nothing in the topology exercises this scenario
    Skipped {
        /// Why the scenario did not apply
        reason: String,
    },
    /// At least one check failed; every failure is listed
    Failed {
        /// One message per individual failure, in the order they were collected
        failures: Vec<String>,
    },
}

impl Outcome {
    /// Skipped outcome with a reason.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Outcome::Skipped {
            reason: reason.into(),
        }
    }

    /// Failed outcome listing every individual failure carried by `err`.
    pub fn from_error(err: &BspError) -> Self {
        Outcome::Failed {
            failures: err.failures().iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// Result of running one scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    /// Which scenario ran
    pub scenario: Scenario,

    /// Verdict
    #[serde(flatten)]
    pub outcome: Outcome,

    /// Wall-clock duration, including module load and adapter teardown
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl ScenarioReport {
    /// Create a report
    pub fn new(scenario: Scenario, outcome: Outcome, duration: Duration) -> Self {
        Self {
            scenario,
            outcome,
            duration,
        }
    }

    /// True unless the scenario failed. A skipped scenario is not a failure.
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, Outcome::Failed { .. })
    }

    /// Generate a human-readable summary
    pub fn summary(&self) -> String {
        let secs = self.duration.as_secs_f64();
        match &self.outcome {
            Outcome::Passed => format!("{} - PASSED - {secs:.2}s", self.scenario),
            Outcome::Skipped { reason } => {
                format!("{} - SKIPPED - {reason}", self.scenario)
            }
            Outcome::Failed { failures } => {
                let mut out = format!(
                    "{} - FAILED - {} failure(s) - {secs:.2}s",
                    self.scenario,
                    failures.len()
                );
                for failure in failures {
                    out.push_str("\n    ");
                    out.push_str(failure);
                }
                out
            }
        }
    }
}

// =============================================================================
// SuiteReport
// =============================================================================

/// Reports of every scenario in one invocation, in execution order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuiteReport {
    pub reports: Vec<ScenarioReport>,
}

impl SuiteReport {
    pub fn push(&mut self, report: ScenarioReport) {
        self.reports.push(report);
    }

    pub fn all_passed(&self) -> bool {
        self.reports.iter().all(ScenarioReport::is_success)
    }

    pub fn failed_count(&self) -> usize {
        self.reports.iter().filter(|r| !r.is_success()).count()
    }

    pub fn summary(&self) -> String {
        let mut lines: Vec<String> = self.reports.iter().map(ScenarioReport::summary).collect();
        lines.push(format!(
            "{} scenario(s), {} failed",
            self.reports.len(),
            self.failed_count()
        ));
        lines.join("\n")
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}
