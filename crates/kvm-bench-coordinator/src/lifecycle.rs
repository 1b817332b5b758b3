//! VM lifecycle management
//!
//! [`VmLifecycleManager`] drives one instance through
//! `provision → await_ready → teardown` against the hypervisor collaborator,
//! mirroring every state change into the [`ResourceRegistry`].
//!
//! Every hypervisor call is bounded by the configured call timeout, the
//! readiness wait by its deadline, and teardown by its retry budget, so no
//! lifecycle operation can block indefinitely.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use kvm_bench_common::{LifecycleState, VmSpec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{HypervisorError, LifecycleError};
use crate::hypervisor::Hypervisor;
use crate::registry::{ResourceRegistry, TrackedVm};
use crate::remote::RemoteExecutor;
use crate::wait::{WaitConfig, WaitError, wait_for_resource};

// ── Instance record ─────────────────────────────────────────────────────────

/// Mutable runtime record of one VM
///
/// Owned by the lifecycle manager, lent to the dispatcher while benchmarks
/// run, and consumed by [`VmLifecycleManager::teardown`].
#[derive(Debug)]
pub struct VmInstance {
    spec: Arc<VmSpec>,
    name: String,
    domain: Option<String>,
    state: LifecycleState,
    address: Option<String>,
    created_at: DateTime<Utc>,
    last_error: Option<String>,
    reached_ready: bool,
    /// `define` was called, so a domain named after the instance may exist
    define_issued: bool,
}

impl VmInstance {
    pub fn new(spec: Arc<VmSpec>, name: impl Into<String>) -> Self {
        Self {
            spec,
            name: name.into(),
            domain: None,
            state: LifecycleState::Requested,
            address: None,
            created_at: Utc::now(),
            last_error: None,
            reached_ready: false,
            define_issued: false,
        }
    }

    /// Rebuild an instance from a registry entry (shutdown sweep)
    pub fn from_tracked(tracked: TrackedVm) -> Self {
        Self {
            spec: tracked.spec,
            name: tracked.name,
            domain: tracked.domain,
            state: tracked.state,
            address: tracked.address,
            created_at: tracked.registered_at,
            last_error: None,
            reached_ready: tracked.state == LifecycleState::Ready,
            define_issued: tracked.state != LifecycleState::Requested,
        }
    }

    pub fn spec(&self) -> &VmSpec {
        &self.spec
    }

    pub fn vm_spec_id(&self) -> &str {
        &self.spec.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Whether the instance ever reached `Ready`
    pub fn reached_ready(&self) -> bool {
        self.reached_ready
    }

    /// Move to `next`, rejecting transitions the state machine forbids
    pub fn transition(&mut self, next: LifecycleState) -> Result<(), LifecycleError> {
        if !self.state.can_transition_to(next) {
            return Err(LifecycleError::IllegalTransition {
                instance: self.name.clone(),
                from: self.state,
                to: next,
            });
        }
        debug!(instance = %self.name, from = %self.state, to = %next, "State transition");
        self.state = next;
        if next == LifecycleState::Ready {
            self.reached_ready = true;
        }
        Ok(())
    }

    /// Record an error and move to `Failed` (no-op if already failed or terminal)
    pub fn fail(&mut self, error: &impl std::fmt::Display) {
        self.last_error = Some(error.to_string());
        if self.state.can_transition_to(LifecycleState::Failed) {
            self.state = LifecycleState::Failed;
        }
    }
}

// ── Manager ─────────────────────────────────────────────────────────────────

/// Hypervisor calls `define` may make in sequence (image creation, then the
/// domain definition), each bounded by the call timeout
pub const DEFINE_CALL_SPAN: u32 = 2;

/// Timing and retry policy for lifecycle operations
#[derive(Debug, Clone)]
pub struct LifecyclePolicy {
    /// Bound on every individual hypervisor call
    pub hypervisor_call_timeout: Duration,
    /// Bound on `define`, which spans several hypervisor calls
    pub define_timeout: Duration,
    /// First delay between readiness probes
    pub ready_poll_interval: Duration,
    /// Cap on the readiness probe delay
    pub ready_max_poll_interval: Duration,
    /// Teardown attempts before an instance is abandoned
    pub cleanup_max_attempts: u32,
    /// First delay between teardown attempts (doubles each time)
    pub cleanup_backoff: Duration,
    /// Guest command that must exit 0 before the guest counts as ready
    pub readiness_command: Option<String>,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        use kvm_bench_common::defaults::*;
        let call = Duration::from_secs(DEFAULT_HYPERVISOR_CALL_TIMEOUT_SECS);
        Self {
            hypervisor_call_timeout: call,
            define_timeout: call.saturating_mul(DEFINE_CALL_SPAN),
            ready_poll_interval: Duration::from_secs(DEFAULT_READY_POLL_INTERVAL_SECS),
            ready_max_poll_interval: Duration::from_secs(DEFAULT_READY_MAX_POLL_INTERVAL_SECS),
            cleanup_max_attempts: DEFAULT_CLEANUP_MAX_ATTEMPTS,
            cleanup_backoff: Duration::from_secs(DEFAULT_CLEANUP_BACKOFF_SECS),
            readiness_command: None,
        }
    }
}

/// Provisioning failed; the partial instance has already been torn down
#[derive(Debug)]
pub struct ProvisionFailure {
    pub error: LifecycleError,
    pub teardown: Teardown,
}

/// Outcome of a teardown; never an error, abandonment is reported in-band
#[derive(Debug)]
pub struct Teardown {
    pub name: String,
    pub vm_spec_id: String,
    pub domain: Option<String>,
    /// `Destroyed` or `Abandoned`
    pub final_state: LifecycleState,
    /// Teardown attempts made (0 when nothing was ever allocated)
    pub attempts: u32,
    /// Why the instance was abandoned
    pub error: Option<LifecycleError>,
}

impl Teardown {
    pub fn is_abandoned(&self) -> bool {
        self.final_state == LifecycleState::Abandoned
    }
}

/// Drives instances through their lifecycle
#[derive(Clone)]
pub struct VmLifecycleManager {
    hypervisor: Arc<dyn Hypervisor>,
    executor: RemoteExecutor,
    registry: ResourceRegistry,
    policy: LifecyclePolicy,
}

impl VmLifecycleManager {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        executor: RemoteExecutor,
        registry: ResourceRegistry,
        policy: LifecyclePolicy,
    ) -> Self {
        Self {
            hypervisor,
            executor,
            registry,
            policy,
        }
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Bound a hypervisor call by the configured call timeout
    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, HypervisorError>>,
    ) -> Result<T, HypervisorError> {
        bounded(operation, self.policy.hypervisor_call_timeout, fut).await
    }

    fn sync_registry(&self, instance: &VmInstance) {
        self.registry.update(
            instance.name(),
            instance.state(),
            instance.domain(),
            instance.address(),
        );
    }

    /// Define and start a domain for `spec`.
    ///
    /// The instance is registered before the first hypervisor call. On
    /// success it is `Booting`; on failure it has already been torn down and
    /// deregistered. A name the registry already tracks is refused without
    /// touching the registry or the hypervisor.
    pub async fn provision(
        &self,
        spec: Arc<VmSpec>,
        name: impl Into<String>,
    ) -> Result<VmInstance, Box<ProvisionFailure>> {
        let mut instance = VmInstance::new(spec, name);
        if !self
            .registry
            .register(TrackedVm::new(instance.name(), instance.spec.clone()))
        {
            // The entry and any domain behind it belong to another instance
            let error = LifecycleError::NameInUse {
                instance: instance.name().to_string(),
            };
            error!(vm_spec = %instance.vm_spec_id(), error = %error, "Provisioning refused");
            instance.fail(&error);
            instance.state = LifecycleState::Destroyed;
            let teardown = self.summary(instance, 0, None);
            return Err(Box::new(ProvisionFailure { error, teardown }));
        }

        info!(
            vm_spec = %instance.vm_spec_id(),
            instance = %instance.name(),
            "Provisioning VM"
        );

        match self.define_and_start(&mut instance).await {
            Ok(()) => Ok(instance),
            Err(source) => {
                let error = LifecycleError::Provision {
                    vm_spec: instance.vm_spec_id().to_string(),
                    source,
                };
                error!(instance = %instance.name(), error = %error, "Provisioning failed");
                instance.fail(&error);
                self.sync_registry(&instance);
                let teardown = self.teardown(instance).await;
                Err(Box::new(ProvisionFailure { error, teardown }))
            }
        }
    }

    async fn define_and_start(&self, instance: &mut VmInstance) -> Result<(), HypervisorError> {
        instance
            .transition(LifecycleState::Provisioning)
            .map_err(|e| HypervisorError::command("provision", e.to_string()))?;
        self.sync_registry(instance);

        instance.define_issued = true;
        let domain = bounded(
            "define",
            self.policy.define_timeout,
            self.hypervisor.define(instance.name(), instance.spec()),
        )
        .await?;
        instance.domain = Some(domain.clone());
        self.sync_registry(instance);

        self.call("start", self.hypervisor.start(&domain)).await?;
        instance
            .transition(LifecycleState::Booting)
            .map_err(|e| HypervisorError::command("start", e.to_string()))?;
        self.sync_registry(instance);

        info!(instance = %instance.name(), domain = %domain, "Domain booting");
        Ok(())
    }

    /// Poll until the guest is reachable, or `deadline` passes, or `cancel` fires.
    ///
    /// Never blocks longer than `deadline`. On failure the instance is left
    /// `Failed` with the error recorded; the caller still owns teardown.
    pub async fn await_ready(
        &self,
        instance: &mut VmInstance,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError> {
        let Some(domain) = instance.domain.clone() else {
            return Err(LifecycleError::IllegalTransition {
                instance: instance.name.clone(),
                from: instance.state,
                to: LifecycleState::Ready,
            });
        };
        if !instance.state.can_transition_to(LifecycleState::Ready) {
            return Err(LifecycleError::IllegalTransition {
                instance: instance.name.clone(),
                from: instance.state,
                to: LifecycleState::Ready,
            });
        }

        let config = WaitConfig {
            initial_delay: self.policy.ready_poll_interval,
            max_delay: self.policy.ready_max_poll_interval,
            timeout: deadline,
        };

        let probes = AtomicU32::new(0);
        let result = wait_for_resource(
            config,
            Some(cancel),
            || {
                probes.fetch_add(1, Ordering::Relaxed);
                self.probe(&domain, deadline)
            },
            instance.name(),
        )
        .await;

        match result {
            Ok(address) => {
                instance.address = Some(address.clone());
                instance.transition(LifecycleState::Ready)?;
                self.sync_registry(instance);
                info!(
                    instance = %instance.name(),
                    address = %address,
                    elapsed_ms = (Utc::now() - instance.created_at).num_milliseconds(),
                    "VM ready"
                );
                Ok(())
            }
            Err(WaitError::Timeout { .. }) => {
                let error = LifecycleError::ReadinessTimeout {
                    vm_spec: instance.vm_spec_id().to_string(),
                    deadline,
                    attempts: probes.load(Ordering::Relaxed),
                };
                warn!(instance = %instance.name(), error = %error, "VM never became ready");
                instance.fail(&error);
                self.sync_registry(instance);
                Err(error)
            }
            Err(WaitError::Cancelled { .. }) => {
                let error = LifecycleError::Cancelled {
                    vm_spec: instance.vm_spec_id().to_string(),
                };
                info!(instance = %instance.name(), "Readiness wait cancelled");
                instance.fail(&error);
                self.sync_registry(instance);
                Err(error)
            }
        }
    }

    /// One readiness probe; any failure just means "not yet"
    async fn probe(&self, domain: &str, command_timeout: Duration) -> Option<String> {
        let info = match self.call("describe", self.hypervisor.describe(domain)).await {
            Ok(info) => info,
            Err(e) => {
                debug!(domain = %domain, error = %e, "describe failed");
                return None;
            }
        };
        let address = info.reachable_address()?.to_string();

        if let Err(e) = self.executor.probe(&address).await {
            debug!(domain = %domain, address = %address, error = %e, "Session not available yet");
            return None;
        }

        if let Some(command) = &self.policy.readiness_command {
            match self.executor.run_on(&address, command, command_timeout).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    debug!(domain = %domain, exit_code = output.exit_code, "Readiness command not satisfied");
                    return None;
                }
                Err(e) => {
                    debug!(domain = %domain, error = %e, "Readiness command failed");
                    return None;
                }
            }
        }

        Some(address)
    }

    /// Stop and remove the domain and its storage.
    ///
    /// Retries with exponential backoff up to the cleanup budget, then marks
    /// the instance `Abandoned`. Never fails and never observes cancellation.
    /// The instance is deregistered either way.
    pub async fn teardown(&self, mut instance: VmInstance) -> Teardown {
        // An instance swept mid-teardown is already Cleaning
        if instance.state != LifecycleState::Cleaning {
            if let Err(e) = instance.transition(LifecycleState::Cleaning) {
                warn!(instance = %instance.name(), error = %e, "Teardown skipped");
                self.registry.deregister(instance.name());
                return self.summary(instance, 0, None);
            }
        }
        if instance.domain.is_none() && instance.define_issued {
            // `define` may have completed after we stopped waiting for it
            instance.domain = Some(instance.name.clone());
        }
        self.sync_registry(&instance);

        let Some(domain) = instance.domain.clone() else {
            // Nothing was ever defined
            instance.state = LifecycleState::Destroyed;
            self.registry.deregister(instance.name());
            debug!(instance = %instance.name(), "Nothing to tear down");
            return self.summary(instance, 0, None);
        };

        info!(instance = %instance.name(), domain = %domain, "Tearing down VM");

        let attempts = AtomicU32::new(0);
        let max_attempts = self.policy.cleanup_max_attempts.max(1);
        let result = (|| async {
            attempts.fetch_add(1, Ordering::Relaxed);
            self.destroy_domain(&domain).await
        })
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(self.policy.cleanup_backoff)
                .with_max_delay(self.policy.cleanup_backoff.saturating_mul(16))
                .with_factor(2.0)
                .with_max_times((max_attempts - 1) as usize),
        )
        .notify(|e, delay| {
            warn!(
                domain = %domain,
                error = %e,
                delay = ?delay,
                "Teardown attempt failed, retrying"
            );
        })
        .await;
        let attempts = attempts.load(Ordering::Relaxed);

        let error = match result {
            Ok(()) => {
                instance.state = LifecycleState::Destroyed;
                info!(instance = %instance.name(), domain = %domain, attempts, "VM destroyed");
                None
            }
            Err(source) => {
                let error = LifecycleError::Cleanup {
                    domain: domain.clone(),
                    attempts,
                    source,
                };
                error!(instance = %instance.name(), error = %error, "Abandoning VM");
                instance.fail(&error);
                instance.state = LifecycleState::Abandoned;
                Some(error)
            }
        };

        self.registry.deregister(instance.name());
        self.summary(instance, attempts, error)
    }

    /// Stop then undefine; a missing domain counts as already gone
    async fn destroy_domain(&self, domain: &str) -> Result<(), HypervisorError> {
        match self.call("stop", self.hypervisor.stop(domain)).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(domain = %domain, "Domain already gone");
            }
            Err(e) => return Err(e),
        }
        match self.call("undefine", self.hypervisor.undefine(domain)).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn summary(&self, instance: VmInstance, attempts: u32, error: Option<LifecycleError>) -> Teardown {
        Teardown {
            vm_spec_id: instance.vm_spec_id().to_string(),
            name: instance.name,
            domain: instance.domain,
            final_state: instance.state,
            attempts,
            error,
        }
    }

    /// Tear down everything still in the registry, concurrently.
    ///
    /// Used at shutdown so that no instance outlives the run.
    pub async fn reap_registered(&self) -> Vec<Teardown> {
        let leftovers = self.registry.snapshot();
        if leftovers.is_empty() {
            return Vec::new();
        }

        warn!(count = leftovers.len(), "Tearing down instances left in registry");
        let teardowns = leftovers
            .into_iter()
            .map(|tracked| self.teardown(VmInstance::from_tracked(tracked)));
        futures::future::join_all(teardowns).await
    }
}

async fn bounded<T>(
    operation: &'static str,
    timeout: Duration,
    fut: impl Future<Output = Result<T, HypervisorError>>,
) -> Result<T, HypervisorError> {
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or(Err(HypervisorError::Timeout { operation, timeout }))
}
