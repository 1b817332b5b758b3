//! Benchmark dispatch
//!
//! Runs the configured steps against one ready instance, strictly in order,
//! one at a time. Each step yields exactly one terminal [`BenchmarkResult`];
//! a failed step never stops the steps after it.
//!
//! Retry policy per attempt outcome:
//!
//! | outcome                     | action                         | terminal status |
//! |-----------------------------|--------------------------------|-----------------|
//! | exit 0, output parses       | done                           | `Success`       |
//! | exit 0, parse error         | done, raw output kept          | `Failed`        |
//! | non-zero exit               | done, stdout+stderr kept       | `Failed`        |
//! | connection error            | retry after fixed backoff      | `Failed`        |
//! | command timeout             | retry after fixed backoff      | `TimedOut`      |

use std::sync::Arc;
use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder};
use kvm_bench_common::{BenchmarkResult, BenchmarkStep, StepStatus};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RemoteError;
use crate::lifecycle::VmInstance;
use crate::parser::BenchmarkParser;
use crate::remote::RemoteExecutor;

/// Reason recorded on steps that were never started
pub const SKIPPED_CANCELLED: &str = "run cancelled before step started";

/// Sequences benchmark steps against an instance
#[derive(Clone)]
pub struct BenchmarkDispatcher {
    executor: RemoteExecutor,
    parser: Arc<dyn BenchmarkParser>,
    retry_backoff: Duration,
}

impl BenchmarkDispatcher {
    pub fn new(executor: RemoteExecutor, parser: Arc<dyn BenchmarkParser>, retry_backoff: Duration) -> Self {
        Self {
            executor,
            parser,
            retry_backoff,
        }
    }

    /// Run every step in configured order.
    ///
    /// Once `cancel` fires, steps not yet started are recorded as `Skipped`;
    /// the step in flight finishes its current attempt.
    pub async fn run_suite(
        &self,
        instance: &VmInstance,
        steps: &[BenchmarkStep],
        cancel: &CancellationToken,
    ) -> Vec<BenchmarkResult> {
        let mut results = Vec::with_capacity(steps.len());

        for step in steps {
            if cancel.is_cancelled() {
                debug!(instance = %instance.name(), benchmark = %step.name, "Skipping step after cancellation");
                results.push(BenchmarkResult::skipped(&step.name, SKIPPED_CANCELLED));
                continue;
            }
            results.push(self.run_step(instance, step, cancel).await);
        }

        results
    }

    /// Run one step with its retry budget
    pub async fn run_step(
        &self,
        instance: &VmInstance,
        step: &BenchmarkStep,
        cancel: &CancellationToken,
    ) -> BenchmarkResult {
        let started = Instant::now();
        let max_attempts = step.max_attempts.max(1);
        let command = step.render(instance.spec());
        let mut delays = ConstantBuilder::default()
            .with_delay(self.retry_backoff)
            .with_max_times((max_attempts - 1) as usize)
            .build();

        info!(
            instance = %instance.name(),
            benchmark = %step.name,
            max_attempts,
            "Running benchmark"
        );

        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let error = match self.executor.run(instance, &command, step.timeout()).await {
                Ok(output) if output.success() => {
                    return match self.parser.parse(&step.name, step.output, &output.stdout) {
                        Ok(metrics) => {
                            info!(
                                instance = %instance.name(),
                                benchmark = %step.name,
                                attempt,
                                metrics = metrics.len(),
                                "Benchmark succeeded"
                            );
                            BenchmarkResult::success(&step.name, output.stdout, metrics, attempt, started.elapsed())
                        }
                        Err(e) => {
                            warn!(instance = %instance.name(), benchmark = %step.name, error = %e, "Unparseable output");
                            BenchmarkResult::failure(
                                &step.name,
                                StepStatus::Failed,
                                output.stdout,
                                e.to_string(),
                                attempt,
                                started.elapsed(),
                            )
                        }
                    };
                }
                Ok(output) => {
                    warn!(
                        instance = %instance.name(),
                        benchmark = %step.name,
                        exit_code = output.exit_code,
                        "Benchmark command failed"
                    );
                    return BenchmarkResult::failure(
                        &step.name,
                        StepStatus::Failed,
                        output.combined(),
                        format!("command exited with status {}", output.exit_code),
                        attempt,
                        started.elapsed(),
                    );
                }
                Err(e) => e,
            };

            if attempt >= max_attempts {
                warn!(
                    instance = %instance.name(),
                    benchmark = %step.name,
                    attempts = attempt,
                    error = %error,
                    "Retry budget exhausted"
                );
                return exhausted(step, &error, attempt, started.elapsed(), "retry budget exhausted");
            }

            let delay = delays.next().unwrap_or(self.retry_backoff);
            warn!(
                instance = %instance.name(),
                benchmark = %step.name,
                attempt,
                error = %error,
                delay = ?delay,
                "Benchmark attempt failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {}
            }
            if cancel.is_cancelled() {
                return exhausted(step, &error, attempt, started.elapsed(), "run cancelled before retry");
            }
        }
    }
}

fn exhausted(
    step: &BenchmarkStep,
    error: &RemoteError,
    attempts: u32,
    elapsed: Duration,
    reason: &str,
) -> BenchmarkResult {
    let status = if error.is_timeout() {
        StepStatus::TimedOut
    } else {
        StepStatus::Failed
    };
    BenchmarkResult::failure(
        &step.name,
        status,
        String::new(),
        format!("{error} ({reason} after {attempts} attempts)"),
        attempts,
        elapsed,
    )
}
