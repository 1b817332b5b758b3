//! Run fixtures
//!
//! Small, medium and large specs plus quick benchmark steps whose timeouts
//! and budgets keep paused-clock tests short.

use std::collections::HashSet;

use chrono::Utc;
use kvm_bench_common::{BenchmarkStep, Metrics, OutputFormat, VmSpec};
use kvm_bench_coordinator::ParseError;
use kvm_bench_coordinator::parser::{BenchmarkParser, GenericParser};

/// A spec with memory and disk scaled from the vCPU count
pub fn spec(id: &str, vcpus: u32) -> VmSpec {
    VmSpec::new(id, vcpus, u64::from(vcpus) * 1024, 10 + u64::from(vcpus) * 5)
}

/// The usual three-size matrix: small, medium, large
pub fn matrix() -> Vec<VmSpec> {
    vec![spec("small", 1), spec("medium", 2), spec("large", 4)]
}

/// A text-output step with a 60s timeout and three attempts
pub fn step(name: &str, command: &str) -> BenchmarkStep {
    BenchmarkStep::new(name, command)
        .with_output(OutputFormat::Text)
        .with_timeout_secs(60)
        .with_max_attempts(3)
}

/// Generate a unique run ID for test runs.
///
/// Format: `test-{timestamp_hex}-{counter}`. The counter forms the last
/// eight hex digits, so instance names stay distinct across runs started in
/// the same millisecond.
///
/// # Example
///
/// ```
/// use kvm_bench_test_utils::test_run_id;
///
/// let run_id = test_run_id();
/// assert!(run_id.starts_with("test-"));
/// ```
pub fn test_run_id() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let ts = Utc::now().timestamp_millis();
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("test-{ts:x}-{counter:08x}")
}

/// Parses like [`GenericParser`] but rejects output of the listed benchmarks
#[derive(Debug, Clone, Default)]
pub struct RejectingParser {
    rejected: HashSet<String>,
}

impl RejectingParser {
    pub fn new<I, S>(rejected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rejected: rejected.into_iter().map(Into::into).collect(),
        }
    }
}

impl BenchmarkParser for RejectingParser {
    fn parse(&self, benchmark: &str, format: OutputFormat, raw: &str) -> Result<Metrics, ParseError> {
        if self.rejected.contains(benchmark) {
            return Err(ParseError::new(benchmark, "output rejected by test parser"));
        }
        GenericParser.parse(benchmark, format, raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_ids_distinct_in_last_eight_hex() {
        let a = test_run_id();
        let b = test_run_id();
        assert_ne!(a[a.len() - 8..], b[b.len() - 8..]);
    }

    #[test]
    fn test_matrix_ids() {
        let ids: Vec<_> = matrix().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, ["small", "medium", "large"]);
    }

    #[test]
    fn test_rejecting_parser() {
        let parser = RejectingParser::new(["disk"]);
        assert!(parser.parse("disk", OutputFormat::Text, "iops: 10").is_err());
        let metrics = parser.parse("cpu", OutputFormat::Text, "score: 10").unwrap();
        assert_eq!(metrics.get("score"), Some(&10.0));
    }
}
