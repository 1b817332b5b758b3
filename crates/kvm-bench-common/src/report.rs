//! Aggregate run report handed to external reporting
//!
//! A `RunReport` holds exactly one `VmReport` per test-matrix entry, in
//! matrix order, whatever order the VMs actually finished in. It is assembled
//! through `RunReportBuilder` and never changes once built.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lifecycle::LifecycleState;
use crate::result::{BenchmarkResult, Metrics, StepStatus};

/// Overall outcome of a run
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    /// Every step on every VM succeeded
    Completed,
    /// The run finished but at least one step or VM did not succeed
    CompletedWithFailures,
    /// An external cancellation signal stopped the run early
    Cancelled,
    /// The run-level deadline expired
    DeadlineExceeded,
}

impl RunStatus {
    /// Cancelled and deadline-exceeded runs are run-wide failures
    pub fn is_interrupted(self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

/// One VM size variant's contribution to the run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmReport {
    /// VmSpec identifier
    pub vm_spec_id: String,
    /// Hypervisor domain id, if one was ever defined
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Lifecycle state the instance ended in
    pub final_state: LifecycleState,
    /// Whether the instance reached `Ready` (results are only real if it did)
    pub reached_ready: bool,
    /// VM-level error (provisioning failure, readiness timeout, cancellation)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Step results in configured order
    pub results: Vec<BenchmarkResult>,
}

impl VmReport {
    /// Entry for a spec that never ran at all, with every step skipped
    pub fn not_started<S: AsRef<str>>(
        vm_spec_id: impl Into<String>,
        steps: &[S],
        reason: &str,
    ) -> Self {
        Self {
            vm_spec_id: vm_spec_id.into(),
            domain: None,
            final_state: LifecycleState::Requested,
            reached_ready: false,
            error: Some(reason.to_string()),
            results: skipped_results(steps, reason),
        }
    }

    /// Number of successful steps
    pub fn successes(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    /// True if every step succeeded
    pub fn is_success(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(BenchmarkResult::is_success)
    }
}

/// Build one skipped result per step name
pub fn skipped_results<S: AsRef<str>>(steps: &[S], reason: &str) -> Vec<BenchmarkResult> {
    steps
        .iter()
        .map(|s| BenchmarkResult::skipped(s.as_ref(), reason))
        .collect()
}

/// Non-fatal problem surfaced alongside the results (e.g. an abandoned VM)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunWarning {
    pub vm_spec_id: String,
    pub message: String,
}

/// Flat, language-neutral record: one per benchmark result
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultRecord {
    pub vm_spec_id: String,
    pub benchmark_name: String,
    pub status: StepStatus,
    pub metrics: Metrics,
    pub attempt_count: u32,
    pub duration_ms: u64,
}

/// Aggregate result of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    /// One entry per matrix item, in matrix order
    pub entries: Vec<VmReport>,
    #[serde(default)]
    pub warnings: Vec<RunWarning>,
}

impl RunReport {
    /// Look up the entry for a VmSpec identifier
    pub fn get(&self, vm_spec_id: &str) -> Option<&VmReport> {
        self.entries.iter().find(|e| e.vm_spec_id == vm_spec_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flatten into one record per benchmark result, in matrix then step order
    pub fn records(&self) -> Vec<ResultRecord> {
        self.entries
            .iter()
            .flat_map(|entry| {
                entry.results.iter().map(move |r| ResultRecord {
                    vm_spec_id: entry.vm_spec_id.clone(),
                    benchmark_name: r.benchmark.clone(),
                    status: r.status,
                    metrics: r.metrics.clone(),
                    attempt_count: r.attempt_count,
                    duration_ms: r.duration_ms,
                })
            })
            .collect()
    }

    /// Wall-clock run duration
    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Incrementally assembles a `RunReport` in matrix order
///
/// Slots are filled as VMs finish, in any order. Slots never filled by the
/// time the run ends are reported with every step skipped.
#[derive(Debug)]
pub struct RunReportBuilder {
    run_id: String,
    started_at: DateTime<Utc>,
    matrix: Vec<String>,
    steps: Vec<String>,
    slots: Vec<Option<VmReport>>,
    warnings: Vec<RunWarning>,
}

impl RunReportBuilder {
    pub fn new(run_id: impl Into<String>, matrix: Vec<String>, steps: Vec<String>) -> Self {
        let slots = vec![None; matrix.len()];
        Self {
            run_id: run_id.into(),
            started_at: Utc::now(),
            matrix,
            steps,
            slots,
            warnings: Vec::new(),
        }
    }

    /// Store the entry for matrix position `index`.
    ///
    /// Results of an instance that never reached `Ready` are replaced by
    /// skipped placeholders, so only executed-on-ready results are kept.
    pub fn insert(&mut self, index: usize, mut entry: VmReport) {
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        if !entry.reached_ready {
            let reason = entry.error.as_deref().unwrap_or("vm never became ready");
            entry.results = skipped_results(&self.steps, reason);
        }
        *slot = Some(entry);
    }

    /// Attach a warning to the report
    pub fn warn(&mut self, vm_spec_id: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(RunWarning {
            vm_spec_id: vm_spec_id.into(),
            message: message.into(),
        });
    }

    /// Whether matrix position `index` already has an entry
    pub fn is_filled(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(Option::is_some)
    }

    /// Freeze the report.
    ///
    /// `interrupted` carries the run-wide status when the run was cancelled or
    /// hit its deadline; otherwise status is derived from the entries.
    pub fn finish(self, interrupted: Option<RunStatus>) -> RunReport {
        let reason = match interrupted {
            Some(RunStatus::DeadlineExceeded) => "run deadline exceeded before start",
            Some(RunStatus::Cancelled) => "run cancelled before start",
            _ => "vm was never scheduled",
        };

        let entries: Vec<VmReport> = self
            .slots
            .into_iter()
            .zip(self.matrix)
            .map(|(slot, id)| slot.unwrap_or_else(|| VmReport::not_started(id, &self.steps, reason)))
            .collect();

        let status = interrupted.unwrap_or_else(|| {
            if !entries.is_empty() && entries.iter().all(VmReport::is_success) {
                RunStatus::Completed
            } else {
                RunStatus::CompletedWithFailures
            }
        });

        RunReport {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            status,
            entries,
            warnings: self.warnings,
        }
    }
}
