//! kvm-bench-common - Shared data model
//!
//! Types shared by the coordinator and its test fixtures, kept free of any
//! runtime or hypervisor dependencies.
//!
//! ## Modules
//!
//! - [`defaults`]: Default configuration values
//! - [`lifecycle`]: VM lifecycle states and legal transitions
//! - [`report`]: Aggregate run report and flat result records
//! - [`result`]: Per-step benchmark result
//! - [`spec`]: VM size variants and benchmark step definitions
//! - [`stats`]: Step duration statistics (min/avg/max)

pub mod defaults;
pub mod lifecycle;
pub mod report;
pub mod result;
pub mod spec;
pub mod stats;

// Re-export commonly used types
pub use lifecycle::LifecycleState;
pub use report::{ResultRecord, RunReport, RunReportBuilder, RunStatus, RunWarning, VmReport};
pub use result::{BenchmarkResult, Metrics, StepStatus};
pub use spec::{BenchmarkStep, DiskCache, DiskIo, NetworkTuning, OutputFormat, StorageTuning, VmSpec};
pub use stats::DurationStats;

