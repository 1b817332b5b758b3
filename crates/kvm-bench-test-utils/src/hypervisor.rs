//! In-memory hypervisor
//!
//! Domains are named after the instance and carry the spec id they were
//! defined for, so faults can be injected per spec. Every call is recorded.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use kvm_bench_common::VmSpec;
use kvm_bench_coordinator::HypervisorError;
use kvm_bench_coordinator::hypervisor::{DomainInfo, DomainState, Hypervisor};

/// A recorded hypervisor call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HypervisorCall {
    Define(String),
    Start(String),
    Stop(String),
    Undefine(String),
    Describe(String),
}

impl HypervisorCall {
    pub fn domain(&self) -> &str {
        match self {
            Self::Define(d) | Self::Start(d) | Self::Stop(d) | Self::Undefine(d) | Self::Describe(d) => d,
        }
    }
}

#[derive(Debug)]
struct FakeDomain {
    spec_id: String,
    running: bool,
    address: String,
}

#[derive(Debug, Default)]
struct FakeState {
    domains: BTreeMap<String, FakeDomain>,
    defined_total: usize,
    peak_live: usize,
    fail_define: HashSet<String>,
    fail_start: HashSet<String>,
    never_ready: HashSet<String>,
    /// Remaining stop failures per spec id
    stop_failures: HashMap<String, u32>,
    define_delay: Duration,
    /// Per spec id: `define` creates the domain, then stalls this long
    define_stalls: HashMap<String, Duration>,
    calls: Vec<HypervisorCall>,
}

/// Hypervisor that keeps domains in memory
#[derive(Debug, Default)]
pub struct FakeHypervisor {
    state: Mutex<FakeState>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `define` fails for this spec
    pub fn fail_define(self, spec_id: &str) -> Self {
        self.lock().fail_define.insert(spec_id.to_string());
        self
    }

    /// `start` fails for this spec (the domain is already defined)
    pub fn fail_start(self, spec_id: &str) -> Self {
        self.lock().fail_start.insert(spec_id.to_string());
        self
    }

    /// Domains of this spec run but never get an address
    pub fn never_ready(self, spec_id: &str) -> Self {
        self.lock().never_ready.insert(spec_id.to_string());
        self
    }

    /// The first `times` stops of this spec fail (`u32::MAX` for always)
    pub fn fail_stop(self, spec_id: &str, times: u32) -> Self {
        self.lock().stop_failures.insert(spec_id.to_string(), times);
        self
    }

    /// Every `define` takes this long
    pub fn with_define_delay(self, delay: Duration) -> Self {
        self.lock().define_delay = delay;
        self
    }

    /// `define` for this spec creates the domain, then takes `stall` to return
    pub fn stall_define(self, spec_id: &str, stall: Duration) -> Self {
        self.lock().define_stalls.insert(spec_id.to_string(), stall);
        self
    }

    /// Domains currently defined
    pub fn live_domains(&self) -> Vec<String> {
        self.lock().domains.keys().cloned().collect()
    }

    /// Total number of domains ever defined
    pub fn defined_total(&self) -> usize {
        self.lock().defined_total
    }

    /// Most domains ever defined at the same time
    pub fn peak_live(&self) -> usize {
        self.lock().peak_live
    }

    /// Every call so far, in order
    pub fn calls(&self) -> Vec<HypervisorCall> {
        self.lock().calls.clone()
    }

    /// Calls made against one domain
    pub fn calls_for(&self, domain: &str) -> Vec<HypervisorCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.domain() == domain)
            .cloned()
            .collect()
    }
}

fn not_found(domain: &str) -> HypervisorError {
    HypervisorError::NotFound {
        domain: domain.to_string(),
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn define(&self, name: &str, spec: &VmSpec) -> Result<String, HypervisorError> {
        let delay = {
            let mut state = self.lock();
            state.calls.push(HypervisorCall::Define(name.to_string()));
            state.define_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let stall = {
            let mut state = self.lock();
            if state.fail_define.contains(&spec.id) {
                return Err(HypervisorError::command("define", "injected define failure"));
            }
            state.defined_total += 1;
            let address = format!("192.168.122.{}", 10 + state.defined_total);
            state.domains.insert(
                name.to_string(),
                FakeDomain {
                    spec_id: spec.id.clone(),
                    running: false,
                    address,
                },
            );
            state.peak_live = state.peak_live.max(state.domains.len());
            state.define_stalls.get(&spec.id).copied()
        };
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
        Ok(name.to_string())
    }

    async fn start(&self, domain: &str) -> Result<(), HypervisorError> {
        let mut state = self.lock();
        state.calls.push(HypervisorCall::Start(domain.to_string()));
        let fail_start = match state.domains.get(domain) {
            Some(d) => state.fail_start.contains(&d.spec_id),
            None => return Err(not_found(domain)),
        };
        if fail_start {
            return Err(HypervisorError::command("start", "injected start failure"));
        }
        if let Some(d) = state.domains.get_mut(domain) {
            d.running = true;
        }
        Ok(())
    }

    async fn stop(&self, domain: &str) -> Result<(), HypervisorError> {
        let mut state = self.lock();
        state.calls.push(HypervisorCall::Stop(domain.to_string()));
        let spec_id = match state.domains.get(domain) {
            Some(d) => d.spec_id.clone(),
            None => return Err(not_found(domain)),
        };
        match state.stop_failures.get_mut(&spec_id) {
            Some(remaining) if *remaining > 0 => {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(HypervisorError::command("stop", "injected stop failure"));
            }
            _ => {}
        }
        if let Some(d) = state.domains.get_mut(domain) {
            d.running = false;
        }
        Ok(())
    }

    async fn undefine(&self, domain: &str) -> Result<(), HypervisorError> {
        let mut state = self.lock();
        state.calls.push(HypervisorCall::Undefine(domain.to_string()));
        state
            .domains
            .remove(domain)
            .map(|_| ())
            .ok_or_else(|| not_found(domain))
    }

    async fn describe(&self, domain: &str) -> Result<DomainInfo, HypervisorError> {
        let mut state = self.lock();
        state.calls.push(HypervisorCall::Describe(domain.to_string()));
        let d = state.domains.get(domain).ok_or_else(|| not_found(domain))?;
        let info = if !d.running {
            DomainInfo {
                state: DomainState::ShutOff,
                ip_address: None,
            }
        } else if state.never_ready.contains(&d.spec_id) {
            DomainInfo {
                state: DomainState::Running,
                ip_address: None,
            }
        } else {
            DomainInfo {
                state: DomainState::Running,
                ip_address: Some(d.address.clone()),
            }
        };
        Ok(info)
    }
}
