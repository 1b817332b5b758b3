//! Run coordinator
//!
//! `RunCoordinator::execute` pushes every matrix entry through
//! `provision → await_ready → run_suite → teardown` on a bounded worker
//! pool, then sweeps the registry so nothing outlives the run.
//!
//! Workers pull `(matrix index, spec)` tasks from a shared bounded channel
//! and send finished entries back on a results channel; the coordinator is
//! the only writer of the report. Entries land by matrix index, so report
//! order never depends on completion order.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use kvm_bench_common::defaults::DOMAIN_NAME_PREFIX;
use kvm_bench_common::{
    BenchmarkResult, BenchmarkStep, RunReport, RunReportBuilder, RunStatus, VmReport, VmSpec,
};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::RunConfig;
use crate::dispatcher::BenchmarkDispatcher;
use crate::error::LifecycleError;
use crate::hypervisor::Hypervisor;
use crate::lifecycle::{Teardown, VmLifecycleManager};
use crate::parser::BenchmarkParser;
use crate::registry::ResourceRegistry;
use crate::remote::{RemoteExecutor, SessionFactory};

/// Run-wide knobs for the coordinator
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub run_id: String,
    /// Worker count (clamped to at least 1)
    pub concurrency: usize,
    /// Whole-run deadline; `None` runs until done or cancelled
    pub run_deadline: Option<Duration>,
    /// Per-VM readiness deadline
    pub ready_deadline: Duration,
    /// Steps run on every VM, in order
    pub steps: Vec<BenchmarkStep>,
}

impl RunSettings {
    pub fn new(steps: Vec<BenchmarkStep>) -> Self {
        use kvm_bench_common::defaults::{DEFAULT_CONCURRENCY, DEFAULT_READY_TIMEOUT_SECS};
        Self {
            run_id: new_run_id(),
            concurrency: DEFAULT_CONCURRENCY,
            run_deadline: None,
            ready_deadline: Duration::from_secs(DEFAULT_READY_TIMEOUT_SECS),
            steps,
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            run_id: new_run_id(),
            concurrency: config.concurrency,
            run_deadline: config.deadlines.run(),
            ready_deadline: config.deadlines.ready(),
            steps: config.benchmarks.clone(),
        }
    }
}

/// Time-ordered run identifier
pub fn new_run_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// Domain name for one spec within one run.
///
/// The suffix is the random tail of the run id, so concurrent runs on the
/// same host never collide.
pub fn instance_name(run_id: &str, vm_spec_id: &str) -> String {
    let hex: String = run_id.chars().filter(char::is_ascii_hexdigit).collect();
    let suffix = &hex[hex.len().saturating_sub(8)..];
    format!("{DOMAIN_NAME_PREFIX}-{}-{suffix}", domain_label(vm_spec_id))
}

/// The part of a domain name derived from a spec id.
///
/// Distinct ids can share a label (`a.b` and `a/b`); configuration
/// validation rejects such matrices.
pub fn domain_label(vm_spec_id: &str) -> String {
    vm_spec_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// One worker's finished contribution
struct VmOutcome {
    report: VmReport,
    /// Set when teardown gave up on the instance
    abandoned: Option<String>,
}

/// Top-level driver for a run
#[derive(Clone)]
pub struct RunCoordinator {
    lifecycle: VmLifecycleManager,
    dispatcher: BenchmarkDispatcher,
    settings: Arc<RunSettings>,
    cancel: CancellationToken,
}

impl RunCoordinator {
    pub fn new(lifecycle: VmLifecycleManager, dispatcher: BenchmarkDispatcher, settings: RunSettings) -> Self {
        Self {
            lifecycle,
            dispatcher,
            settings: Arc::new(settings),
            cancel: CancellationToken::new(),
        }
    }

    /// Wire up a coordinator from configuration and collaborators
    pub fn from_config(
        config: &RunConfig,
        hypervisor: Arc<dyn Hypervisor>,
        sessions: Arc<dyn SessionFactory>,
        parser: Arc<dyn BenchmarkParser>,
    ) -> Self {
        let executor = RemoteExecutor::new(sessions, config.credentials.clone());
        let lifecycle = VmLifecycleManager::new(
            hypervisor,
            executor.clone(),
            ResourceRegistry::new(),
            config.lifecycle_policy(),
        );
        let dispatcher = BenchmarkDispatcher::new(executor, parser, config.retry_backoff());
        Self::new(lifecycle, dispatcher, RunSettings::from_config(config))
    }

    pub fn run_id(&self) -> &str {
        &self.settings.run_id
    }

    pub fn registry(&self) -> &ResourceRegistry {
        self.lifecycle.registry()
    }

    /// Token that cancels the run when triggered (e.g. on Ctrl-C)
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every spec and return the report.
    ///
    /// Never fails: per-VM problems are recorded in the report, and
    /// cancellation or the run deadline yield a partial report after every
    /// tracked instance has been torn down.
    pub async fn execute(&self, vm_specs: &[VmSpec]) -> RunReport {
        let settings = &self.settings;
        let matrix: Vec<String> = vm_specs.iter().map(|s| s.id.clone()).collect();
        let step_names: Vec<String> = settings.steps.iter().map(|s| s.name.clone()).collect();
        let mut builder = RunReportBuilder::new(settings.run_id.clone(), matrix, step_names);

        let concurrency = settings.concurrency.max(1).min(vm_specs.len().max(1));
        info!(
            run_id = %settings.run_id,
            vms = vm_specs.len(),
            steps = settings.steps.len(),
            concurrency,
            "Starting run"
        );

        // Child token: the run deadline must not cancel the caller's token
        let run_cancel = self.cancel.child_token();
        let deadline_hit = Arc::new(AtomicBool::new(false));
        let timer = settings.run_deadline.map(|deadline| {
            let run_cancel = run_cancel.clone();
            let deadline_hit = deadline_hit.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => {
                        warn!(deadline = ?deadline, "Run deadline exceeded, cancelling");
                        deadline_hit.store(true, Ordering::SeqCst);
                        run_cancel.cancel();
                    }
                    _ = run_cancel.cancelled() => {}
                }
            })
        });

        let (task_tx, task_rx) = mpsc::channel::<(usize, Arc<VmSpec>)>(concurrency);
        let (result_tx, mut result_rx) = mpsc::channel::<(usize, VmOutcome)>(concurrency);
        let task_rx = Arc::new(Mutex::new(task_rx));

        let tasks: Vec<(usize, Arc<VmSpec>)> = vm_specs
            .iter()
            .cloned()
            .map(Arc::new)
            .enumerate()
            .collect();
        let feeder = {
            let run_cancel = run_cancel.clone();
            tokio::spawn(async move {
                for task in tasks {
                    tokio::select! {
                        sent = task_tx.send(task) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                        _ = run_cancel.cancelled() => break,
                    }
                }
            })
        };

        let workers: Vec<_> = (0..concurrency)
            .map(|worker| {
                let this = self.clone();
                let task_rx = task_rx.clone();
                let result_tx = result_tx.clone();
                let run_cancel = run_cancel.clone();
                tokio::spawn(async move {
                    loop {
                        let task = task_rx.lock().await.recv().await;
                        let Some((index, spec)) = task else {
                            break;
                        };
                        if run_cancel.is_cancelled() {
                            // Left for the report builder to mark as never started
                            continue;
                        }
                        info!(worker, vm_spec = %spec.id, "Worker picked up VM");
                        let outcome = this.run_spec(spec, &run_cancel).await;
                        if result_tx.send((index, outcome)).await.is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();
        drop(result_tx);

        while let Some((index, outcome)) = result_rx.recv().await {
            if let Some(message) = outcome.abandoned {
                builder.warn(outcome.report.vm_spec_id.clone(), message);
            }
            builder.insert(index, outcome.report);
        }

        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task failed");
            }
        }
        if let Err(e) = feeder.await {
            error!(error = %e, "Feeder task failed");
        }

        // Anything still tracked (a crashed worker) is torn down before returning
        for teardown in self.lifecycle.reap_registered().await {
            let message = match &teardown.error {
                Some(e) => format!("instance {} reaped at shutdown and abandoned: {e}", teardown.name),
                None => format!("instance {} reaped at shutdown", teardown.name),
            };
            builder.warn(teardown.vm_spec_id.clone(), message);
        }

        let interrupted = if deadline_hit.load(Ordering::SeqCst) {
            Some(RunStatus::DeadlineExceeded)
        } else if self.cancel.is_cancelled() {
            Some(RunStatus::Cancelled)
        } else {
            None
        };

        // Stops the deadline timer
        run_cancel.cancel();
        if let Some(timer) = timer {
            let _ = timer.await;
        }

        let report = builder.finish(interrupted);
        info!(
            run_id = %report.run_id,
            status = %report.status,
            warnings = report.warnings.len(),
            "Run finished"
        );
        report
    }

    /// Full per-spec pipeline; the instance is always torn down
    async fn run_spec(&self, spec: Arc<VmSpec>, cancel: &CancellationToken) -> VmOutcome {
        let vm_spec_id = spec.id.clone();
        let name = instance_name(&self.settings.run_id, &vm_spec_id);

        let mut instance = match self.lifecycle.provision(spec, name).await {
            Ok(instance) => instance,
            Err(failure) => {
                let failure = *failure;
                return outcome(vm_spec_id, false, Some(failure.error.to_string()), Vec::new(), failure.teardown);
            }
        };

        let ready = if cancel.is_cancelled() {
            let error = LifecycleError::Cancelled {
                vm_spec: vm_spec_id.clone(),
            };
            instance.fail(&error);
            Err(error)
        } else {
            self.lifecycle
                .await_ready(&mut instance, self.settings.ready_deadline, cancel)
                .await
        };

        let results = match ready {
            Ok(()) => {
                self.dispatcher
                    .run_suite(&instance, &self.settings.steps, cancel)
                    .await
            }
            Err(e) => {
                error!(vm_spec = %vm_spec_id, error = %e, "VM not ready, skipping benchmarks");
                Vec::new()
            }
        };

        let reached_ready = instance.reached_ready();
        let error = instance.last_error().map(str::to_string);
        let teardown = self.lifecycle.teardown(instance).await;
        outcome(vm_spec_id, reached_ready, error, results, teardown)
    }
}

fn outcome(
    vm_spec_id: String,
    reached_ready: bool,
    error: Option<String>,
    results: Vec<BenchmarkResult>,
    teardown: Teardown,
) -> VmOutcome {
    let abandoned = teardown
        .error
        .as_ref()
        .filter(|_| teardown.is_abandoned())
        .map(ToString::to_string);

    VmOutcome {
        report: VmReport {
            vm_spec_id,
            domain: teardown.domain,
            final_state: teardown.final_state,
            reached_ready,
            error,
            results,
        },
        abandoned,
    }
}
