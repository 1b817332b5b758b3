//! Error taxonomy for the orchestration engine
//!
//! Per-VM errors (`LifecycleError`, `RemoteError`, `ParseError`) are
//! contained within that VM's contribution to the run report. Only
//! `ConfigError` aborts a run, and it does so before any VM exists.

use std::time::Duration;

use kvm_bench_common::LifecycleState;
use thiserror::Error;

/// Failures reported by the hypervisor collaborator
#[derive(Debug, Error)]
pub enum HypervisorError {
    /// Domain does not exist (safe to skip during teardown)
    #[error("domain '{domain}' not found")]
    NotFound { domain: String },

    /// The hypervisor rejected or failed an operation
    #[error("{operation} failed: {message}")]
    Command {
        operation: &'static str,
        message: String,
    },

    /// The call did not return within its deadline
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Local I/O around the call failed (image files, domain XML)
    #[error("I/O error during {operation}: {source}")]
    Io {
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl HypervisorError {
    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, HypervisorError::NotFound { .. })
    }

    pub fn command(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Command {
            operation,
            message: message.into(),
        }
    }

    pub fn io(operation: &'static str, source: std::io::Error) -> Self {
        Self::Io { operation, source }
    }
}

/// Failures of a single remote command execution
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Session could not be opened, or the transport dropped mid-command
    #[error("connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    /// The command exceeded its timeout
    #[error("command timed out after {timeout:?}")]
    TimedOut { timeout: Duration },
}

impl RemoteError {
    pub fn connection(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RemoteError::TimedOut { .. })
    }
}

/// Benchmark output could not be turned into metrics
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to parse '{benchmark}' output: {message}")]
pub struct ParseError {
    pub benchmark: String,
    pub message: String,
}

impl ParseError {
    pub fn new(benchmark: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            benchmark: benchmark.into(),
            message: message.into(),
        }
    }
}

/// VM-level lifecycle failures
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Image preparation, domain definition or start failed
    #[error("provisioning '{vm_spec}' failed: {source}")]
    Provision {
        vm_spec: String,
        #[source]
        source: HypervisorError,
    },

    /// Another live instance already uses this name
    #[error("instance name '{instance}' is already in use")]
    NameInUse { instance: String },

    /// The guest never became reachable
    #[error("'{vm_spec}' not reachable within {deadline:?} ({attempts} probes)")]
    ReadinessTimeout {
        vm_spec: String,
        deadline: Duration,
        attempts: u32,
    },

    /// The run was cancelled while waiting for the guest
    #[error("readiness wait for '{vm_spec}' cancelled")]
    Cancelled { vm_spec: String },

    /// Teardown failed after exhausting its retries
    #[error("teardown of '{domain}' abandoned after {attempts} attempts: {source}")]
    Cleanup {
        domain: String,
        attempts: u32,
        #[source]
        source: HypervisorError,
    },

    /// A lifecycle step was attempted from the wrong state
    #[error("illegal transition {from} -> {to} for '{instance}'")]
    IllegalTransition {
        instance: String,
        from: LifecycleState,
        to: LifecycleState,
    },
}

/// Configuration load and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration
    #[error("Failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Failed to parse JSON configuration
    #[error("Failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("test_matrix cannot be empty")]
    EmptyMatrix,

    #[error("test_matrix entry '{0}' has no matching vm_specs entry")]
    UnknownSpec(String),

    #[error("test_matrix lists '{0}' more than once")]
    DuplicateMatrixEntry(String),

    #[error("vm spec '{id}' is invalid: {reason}")]
    InvalidSpec { id: String, reason: &'static str },

    #[error("benchmarks cannot be empty")]
    NoBenchmarks,

    #[error("benchmark '{0}' is defined more than once")]
    DuplicateBenchmark(String),

    #[error("benchmark '{name}' is invalid: {reason}")]
    InvalidBenchmark { name: String, reason: &'static str },

    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("cleanup.max_attempts must be at least 1")]
    InvalidCleanupAttempts,

    #[error("credentials.username cannot be empty")]
    EmptyUsername,

    #[error("vm specs '{first}' and '{second}' map to the same domain name")]
    DomainNameCollision { first: String, second: String },

    #[error("{field} is invalid: {reason}")]
    InvalidDeadline {
        field: &'static str,
        reason: &'static str,
    },

    #[error("hypervisor.base_image is required to define domains")]
    MissingBaseImage,
}

impl ConfigError {
    /// Create an IO error with path context
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
