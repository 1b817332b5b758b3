//! Registry entry types

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kvm_bench_common::{LifecycleState, VmSpec};

/// What the registry knows about one live instance
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedVm {
    /// Instance (and domain) name, unique per run
    pub name: String,
    pub spec: Arc<VmSpec>,
    /// Hypervisor domain id, once defined
    pub domain: Option<String>,
    pub state: LifecycleState,
    /// Guest address, once known
    pub address: Option<String>,
    pub registered_at: DateTime<Utc>,
}

impl TrackedVm {
    pub fn new(name: impl Into<String>, spec: Arc<VmSpec>) -> Self {
        Self {
            name: name.into(),
            spec,
            domain: None,
            state: LifecycleState::Requested,
            address: None,
            registered_at: Utc::now(),
        }
    }

    pub fn vm_spec_id(&self) -> &str {
        &self.spec.id
    }
}
