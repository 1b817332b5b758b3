//! Outcome of one benchmark step against one VM
//!
//! Used by the dispatcher to record step outcomes and by the report for
//! serialization.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Parsed benchmark metrics keyed by metric name
pub type Metrics = BTreeMap<String, f64>;

/// Terminal status of a benchmark step
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum StepStatus {
    /// Command ran and its output parsed
    Success,
    /// Connection errors exhausted the budget, non-zero exit, or unparseable output
    Failed,
    /// Every attempt hit the step timeout
    TimedOut,
    /// Never executed (VM not ready, or run cancelled)
    Skipped,
}

/// Result of a single benchmark step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkResult {
    /// Benchmark step name
    pub benchmark: String,
    /// Terminal status
    pub status: StepStatus,
    /// Raw command output (stdout, plus stderr when the command failed)
    pub raw_output: String,
    /// Parsed metrics (empty unless `status` is `Success`)
    pub metrics: Metrics,
    /// Number of attempts made (0 for skipped steps)
    pub attempt_count: u32,
    /// Wall time across all attempts, in milliseconds
    pub duration_ms: u64,
    /// Last error message, if the step did not succeed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BenchmarkResult {
    /// Create a successful result
    pub fn success(
        benchmark: impl Into<String>,
        raw_output: String,
        metrics: Metrics,
        attempt_count: u32,
        duration: Duration,
    ) -> Self {
        Self {
            benchmark: benchmark.into(),
            status: StepStatus::Success,
            raw_output,
            metrics,
            attempt_count,
            duration_ms: duration_ms(duration),
            error: None,
        }
    }

    /// Create a failed or timed-out result
    pub fn failure(
        benchmark: impl Into<String>,
        status: StepStatus,
        raw_output: String,
        error: impl Into<String>,
        attempt_count: u32,
        duration: Duration,
    ) -> Self {
        Self {
            benchmark: benchmark.into(),
            status,
            raw_output,
            metrics: Metrics::new(),
            attempt_count,
            duration_ms: duration_ms(duration),
            error: Some(error.into()),
        }
    }

    /// Create a skipped result with the reason it never ran
    pub fn skipped(benchmark: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            benchmark: benchmark.into(),
            status: StepStatus::Skipped,
            raw_output: String::new(),
            metrics: Metrics::new(),
            attempt_count: 0,
            duration_ms: 0,
            error: Some(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
