//! VM size variants and benchmark step definitions
//!
//! Both types are loaded once from configuration and treated as read-only
//! for the rest of a run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults::{default_step_max_attempts, default_step_timeout_secs};

/// Immutable description of one VM size variant (e.g. "small", "large")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    /// Identifier used as the key of this spec in the test matrix and report.
    ///
    /// Filled from the configuration map key when omitted.
    #[serde(default)]
    pub id: String,
    /// Number of virtual CPUs
    pub vcpus: u32,
    /// Guest memory in MiB
    pub memory_mb: u64,
    /// Root disk size in GiB
    pub disk_gb: u64,
    /// Network interface tuning
    #[serde(default)]
    pub network: NetworkTuning,
    /// Root disk tuning
    #[serde(default)]
    pub storage: StorageTuning,
}

impl VmSpec {
    /// Create a spec with default network and storage tuning
    pub fn new(id: impl Into<String>, vcpus: u32, memory_mb: u64, disk_gb: u64) -> Self {
        Self {
            id: id.into(),
            vcpus,
            memory_mb,
            disk_gb,
            network: NetworkTuning::default(),
            storage: StorageTuning::default(),
        }
    }

    /// Guest memory in KiB, the unit libvirt expects
    pub fn memory_kib(&self) -> u64 {
        self.memory_mb * 1024
    }
}

/// NIC model and multiqueue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTuning {
    /// Emulated NIC model
    #[serde(default = "default_nic_model")]
    pub model: String,
    /// virtio-net queue pairs (None leaves the hypervisor default)
    #[serde(default)]
    pub queues: Option<u32>,
}

impl Default for NetworkTuning {
    fn default() -> Self {
        Self {
            model: default_nic_model(),
            queues: None,
        }
    }
}

fn default_nic_model() -> String {
    "virtio".to_string()
}

/// Root disk bus and host-side caching
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageTuning {
    /// Disk bus (virtio, sata, scsi)
    #[serde(default = "default_disk_bus")]
    pub bus: String,
    /// Host page cache mode
    #[serde(default)]
    pub cache: DiskCache,
    /// Host I/O submission mode
    #[serde(default)]
    pub io: DiskIo,
}

impl Default for StorageTuning {
    fn default() -> Self {
        Self {
            bus: default_disk_bus(),
            cache: DiskCache::default(),
            io: DiskIo::default(),
        }
    }
}

fn default_disk_bus() -> String {
    "virtio".to_string()
}

/// libvirt `<driver cache=...>` values
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DiskCache {
    #[default]
    None,
    Writeback,
    Writethrough,
    Directsync,
    Unsafe,
}

/// libvirt `<driver io=...>` values
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DiskIo {
    #[default]
    Native,
    Threads,
    IoUring,
}

/// Shape of a benchmark's raw output, used to pick a parsing strategy
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// One named benchmark invocation run inside a guest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkStep {
    /// Unique benchmark name (e.g. "cpu", "disk-randread")
    pub name: String,
    /// Remote command template.
    ///
    /// `{vm}`, `{vcpus}`, `{memory_mb}` and `{disk_gb}` are replaced with the
    /// target spec's values before execution.
    pub command: String,
    /// Expected output shape
    #[serde(default)]
    pub output: OutputFormat,
    /// Per-attempt command timeout in seconds
    #[serde(default = "default_step_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum number of attempts, first attempt included
    #[serde(default = "default_step_max_attempts", alias = "retry_budget")]
    pub max_attempts: u32,
}

impl BenchmarkStep {
    /// Create a text-output step with default timeout and retry budget
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            output: OutputFormat::default(),
            timeout_secs: default_step_timeout_secs(),
            max_attempts: default_step_max_attempts(),
        }
    }

    pub fn with_output(mut self, output: OutputFormat) -> Self {
        self.output = output;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Per-attempt timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Substitute spec values into the command template
    pub fn render(&self, spec: &VmSpec) -> String {
        self.command
            .replace("{vm}", &spec.id)
            .replace("{vcpus}", &spec.vcpus.to_string())
            .replace("{memory_mb}", &spec.memory_mb.to_string())
            .replace("{disk_gb}", &spec.disk_gb.to_string())
    }
}
