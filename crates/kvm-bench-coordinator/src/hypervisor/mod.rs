//! Hypervisor collaborator
//!
//! The orchestration engine only talks to the hypervisor through the
//! [`Hypervisor`] trait. [`VirshHypervisor`] drives a local libvirt daemon
//! through the `virsh` and `qemu-img` binaries; tests substitute an
//! in-memory fake.

mod virsh;
mod xml;

pub use virsh::{VirshConfig, VirshHypervisor};
pub use xml::{DomainXml, render_domain_xml};

use async_trait::async_trait;
use kvm_bench_common::VmSpec;
use serde::{Deserialize, Serialize};

use crate::error::HypervisorError;

/// Domain run state as reported by the hypervisor
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DomainState {
    Running,
    Blocked,
    Paused,
    ShuttingDown,
    ShutOff,
    Crashed,
    Suspended,
    Unknown,
}

impl DomainState {
    /// Parse `virsh domstate` output
    pub fn from_virsh(text: &str) -> Self {
        match text.trim() {
            "running" => Self::Running,
            "idle" | "blocked" => Self::Blocked,
            "paused" => Self::Paused,
            "in shutdown" => Self::ShuttingDown,
            "shut off" => Self::ShutOff,
            "crashed" => Self::Crashed,
            "pmsuspended" => Self::Suspended,
            _ => Self::Unknown,
        }
    }
}

/// Result of `describe`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    pub state: DomainState,
    /// First IPv4 address leased to the guest, if any
    pub ip_address: Option<String>,
}

impl DomainInfo {
    /// Running with an address: the guest may be probed remotely
    pub fn reachable_address(&self) -> Option<&str> {
        match self.state {
            DomainState::Running => self.ip_address.as_deref(),
            _ => None,
        }
    }
}

/// Domain management capability used by the lifecycle manager.
///
/// Every method may fail with a distinguishable [`HypervisorError`]; callers
/// bound each call with their own deadline.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Allocate backing storage and define a domain named `name`.
    ///
    /// Returns the domain id, which must be `name`: when `define` outlives
    /// its deadline the caller tears down `name` without ever seeing the id.
    async fn define(&self, name: &str, spec: &VmSpec) -> Result<String, HypervisorError>;

    /// Boot a defined domain
    async fn start(&self, domain: &str) -> Result<(), HypervisorError>;

    /// Force the domain off. Stopping a domain that is not running succeeds.
    async fn stop(&self, domain: &str) -> Result<(), HypervisorError>;

    /// Remove the domain definition and its backing storage
    async fn undefine(&self, domain: &str) -> Result<(), HypervisorError>;

    /// Current run state and guest address
    async fn describe(&self, domain: &str) -> Result<DomainInfo, HypervisorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domstate_parsing() {
        assert_eq!(DomainState::from_virsh("running\n\n"), DomainState::Running);
        assert_eq!(DomainState::from_virsh("shut off"), DomainState::ShutOff);
        assert_eq!(DomainState::from_virsh("in shutdown"), DomainState::ShuttingDown);
        assert_eq!(DomainState::from_virsh("something new"), DomainState::Unknown);
    }

    #[test]
    fn test_reachable_only_when_running() {
        let info = DomainInfo {
            state: DomainState::Paused,
            ip_address: Some("192.168.122.10".into()),
        };
        assert_eq!(info.reachable_address(), None);

        let info = DomainInfo {
            state: DomainState::Running,
            ..info
        };
        assert_eq!(info.reachable_address(), Some("192.168.122.10"));
    }
}
