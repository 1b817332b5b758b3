//! Thread-safe registry of live VM instances
//!
//! The registry is the single source of truth for what must be torn down.
//! Instances are registered before the first hypervisor call that could
//! allocate anything and deregistered only once teardown has finished
//! (destroyed or abandoned). The shutdown sweep drains whatever is left.

mod types;

pub use types::TrackedVm;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kvm_bench_common::LifecycleState;

/// Shared, mutex-guarded instance table
///
/// Cheap to clone; every clone sees the same table.
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    inner: Arc<Mutex<HashMap<String, TrackedVm>>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, TrackedVm>> {
        // A panicking worker must not hide live instances from cleanup
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking an instance.
    ///
    /// Returns false (and leaves the existing entry alone) if the name is
    /// already tracked.
    pub fn register(&self, vm: TrackedVm) -> bool {
        let mut resources = self.lock();
        if resources.contains_key(&vm.name) {
            return false;
        }
        resources.insert(vm.name.clone(), vm);
        true
    }

    /// Record the latest state, domain id and address of an instance
    pub fn update(
        &self,
        name: &str,
        state: LifecycleState,
        domain: Option<&str>,
        address: Option<&str>,
    ) {
        if let Some(vm) = self.lock().get_mut(name) {
            vm.state = state;
            if let Some(domain) = domain {
                vm.domain = Some(domain.to_string());
            }
            if let Some(address) = address {
                vm.address = Some(address.to_string());
            }
        }
    }

    /// Stop tracking an instance; returns its last known entry
    pub fn deregister(&self, name: &str) -> Option<TrackedVm> {
        self.lock().remove(name)
    }

    /// Consistent copy of every tracked instance, oldest first
    pub fn snapshot(&self) -> Vec<TrackedVm> {
        let mut vms: Vec<TrackedVm> = self.lock().values().cloned().collect();
        vms.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        vms
    }

    pub fn get(&self, name: &str) -> Option<TrackedVm> {
        self.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Get the count of currently tracked instances
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if there are no tracked instances
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
