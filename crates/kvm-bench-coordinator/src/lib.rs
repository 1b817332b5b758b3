//! kvm-bench-coordinator - KVM/QEMU benchmark orchestration engine
//!
//! This crate provisions guest VMs of several sizes on a local libvirt host,
//! runs a fixed battery of benchmarks inside each, collects the results into
//! a [`kvm_bench_common::RunReport`], and guarantees every VM is torn down.
//!
//! ## Modules
//!
//! - [`config`]: Run configuration loading and validation
//! - [`error`]: Error taxonomy
//! - [`hypervisor`]: Hypervisor collaborator trait and the `virsh` driver
//! - [`remote`]: Remote sessions and the per-command executor
//! - [`parser`]: Benchmark output parsing
//! - [`registry`]: Live-instance registry used for cleanup bookkeeping
//! - [`lifecycle`]: VM provisioning, readiness and teardown
//! - [`dispatcher`]: Ordered benchmark execution with retries
//! - [`orchestrator`]: Run coordinator and results output
//! - [`wait`]: Deadline-bounded polling with backoff

pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod hypervisor;
pub mod lifecycle;
pub mod orchestrator;
pub mod parser;
pub mod registry;
pub mod remote;
pub mod wait;

pub use config::RunConfig;
pub use dispatcher::BenchmarkDispatcher;
pub use error::{ConfigError, HypervisorError, LifecycleError, ParseError, RemoteError};
pub use lifecycle::{LifecyclePolicy, Teardown, VmInstance, VmLifecycleManager};
pub use orchestrator::{RunCoordinator, RunSettings};
pub use registry::ResourceRegistry;
