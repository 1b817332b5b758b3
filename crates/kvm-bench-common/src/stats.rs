//! Step duration statistics
//!
//! Summarizes how long a VM's executed benchmark steps took.

use std::time::Duration;

use crate::result::{BenchmarkResult, StepStatus};

/// Min/avg/max over a set of step durations
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DurationStats {
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
    /// Number of durations summarized
    pub count: usize,
}

impl DurationStats {
    /// Compute statistics from a slice of durations.
    ///
    /// # Example
    /// ```
    /// use std::time::Duration;
    /// use kvm_bench_common::stats::DurationStats;
    ///
    /// let durations = [1, 2, 3, 4, 5].map(Duration::from_secs);
    /// let stats = DurationStats::from_durations(&durations);
    /// assert_eq!(stats.min, Duration::from_secs(1));
    /// assert_eq!(stats.max, Duration::from_secs(5));
    /// assert_eq!(stats.avg, Duration::from_secs(3));
    /// assert_eq!(stats.count, 5);
    /// ```
    pub fn from_durations(durations: &[Duration]) -> Self {
        let (Some(min), Some(max)) = (durations.iter().min(), durations.iter().max()) else {
            return Self::default();
        };

        let count = durations.len();
        let total: Duration = durations.iter().sum();
        let avg = total / u32::try_from(count).unwrap_or(u32::MAX);

        Self {
            min: *min,
            max: *max,
            avg,
            count,
        }
    }

    /// Statistics over every step that actually executed (skipped steps excluded)
    pub fn from_results(results: &[BenchmarkResult]) -> Self {
        let durations: Vec<Duration> = results
            .iter()
            .filter(|r| r.status != StepStatus::Skipped)
            .map(BenchmarkResult::duration)
            .collect();
        Self::from_durations(&durations)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}
