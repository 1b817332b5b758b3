//! Shared test utilities for kvm-bench
//!
//! In-memory stand-ins for the hypervisor and guest sessions, so the whole
//! orchestration engine can be driven under a paused tokio clock without
//! libvirt or SSH.
//!
//! ## Modules
//!
//! - [`fixtures`]: VM specs, benchmark steps and run ids
//! - [`hypervisor`]: [`FakeHypervisor`] with per-spec fault injection
//! - [`remote`]: [`ScriptedSessions`] answering commands from a script

pub mod fixtures;
pub mod hypervisor;
pub mod remote;

// Re-export commonly used items
pub use fixtures::{RejectingParser, matrix, spec, step, test_run_id};
pub use hypervisor::{FakeHypervisor, HypervisorCall};
pub use remote::{Scripted, ScriptedSessions};
