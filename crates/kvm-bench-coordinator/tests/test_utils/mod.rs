//! Shared test utilities for integration tests
//!
//! Wires the coordinator to the in-memory collaborators from
//! kvm-bench-test-utils with short, paused-clock friendly timings.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use kvm_bench_common::{BenchmarkStep, VmSpec};
use kvm_bench_coordinator::parser::{BenchmarkParser, GenericParser};
use kvm_bench_coordinator::remote::{Credentials, RemoteExecutor};
use kvm_bench_coordinator::{
    BenchmarkDispatcher, LifecyclePolicy, ResourceRegistry, RunCoordinator, RunSettings,
    VmInstance, VmLifecycleManager,
};
use kvm_bench_test_utils::{FakeHypervisor, ScriptedSessions, test_run_id};
use tokio_util::sync::CancellationToken;

/// Delay between attempts of a failing step
pub const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Per-VM readiness deadline
pub const READY_DEADLINE: Duration = Duration::from_secs(60);

/// Collaborators plus the knobs a test may adjust before building
pub struct Harness {
    pub hypervisor: Arc<FakeHypervisor>,
    pub sessions: ScriptedSessions,
    pub parser: Arc<dyn BenchmarkParser>,
    pub policy: LifecyclePolicy,
    pub settings: RunSettings,
    pub retry_backoff: Duration,
    registry: ResourceRegistry,
}

impl Harness {
    pub fn new(hypervisor: FakeHypervisor, sessions: ScriptedSessions, steps: Vec<BenchmarkStep>) -> Self {
        let policy = LifecyclePolicy {
            hypervisor_call_timeout: Duration::from_secs(30),
            define_timeout: Duration::from_secs(60),
            ready_poll_interval: Duration::from_secs(1),
            ready_max_poll_interval: Duration::from_secs(4),
            cleanup_max_attempts: 3,
            cleanup_backoff: Duration::from_secs(1),
            readiness_command: None,
        };
        let settings = RunSettings {
            run_id: test_run_id(),
            concurrency: 2,
            run_deadline: None,
            ready_deadline: READY_DEADLINE,
            steps,
        };
        Self {
            hypervisor: Arc::new(hypervisor),
            sessions,
            parser: Arc::new(GenericParser),
            policy,
            settings,
            retry_backoff: RETRY_BACKOFF,
            registry: ResourceRegistry::new(),
        }
    }

    pub fn executor(&self) -> RemoteExecutor {
        RemoteExecutor::new(Arc::new(self.sessions.clone()), Credentials::new("bench"))
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn lifecycle(&self) -> VmLifecycleManager {
        VmLifecycleManager::new(
            self.hypervisor.clone(),
            self.executor(),
            self.registry.clone(),
            self.policy.clone(),
        )
    }

    pub fn dispatcher(&self) -> BenchmarkDispatcher {
        BenchmarkDispatcher::new(self.executor(), self.parser.clone(), self.retry_backoff)
    }

    pub fn coordinator(&self) -> RunCoordinator {
        RunCoordinator::new(self.lifecycle(), self.dispatcher(), self.settings.clone())
    }

    /// Provision `spec` and wait until it is ready
    pub async fn ready_instance(&self, spec: VmSpec) -> VmInstance {
        let lifecycle = self.lifecycle();
        let name = format!("kvm-bench-{}-test", spec.id);
        let mut instance = lifecycle.provision(Arc::new(spec), name).await.unwrap();
        lifecycle
            .await_ready(&mut instance, READY_DEADLINE, &CancellationToken::new())
            .await
            .unwrap();
        instance
    }
}
