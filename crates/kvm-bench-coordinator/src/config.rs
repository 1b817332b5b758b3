//! Configuration types for the coordinator
//!
//! A run is configured by a single YAML or JSON file, loaded once and
//! validated before any VM is created. Durations are given in seconds.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use kvm_bench_common::defaults::{
    default_cleanup_backoff_secs, default_cleanup_max_attempts, default_concurrency,
    default_hypervisor_call_timeout_secs, default_ready_max_poll_interval_secs,
    default_ready_poll_interval_secs, default_ready_timeout_secs, default_retry_backoff_secs,
    default_run_timeout_secs,
};
use kvm_bench_common::{BenchmarkStep, VmSpec};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::hypervisor::VirshConfig;
use crate::lifecycle::{DEFINE_CALL_SPAN, LifecyclePolicy};
use crate::orchestrator::domain_label;
use crate::remote::Credentials;

/// Time budgets for a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deadlines {
    /// Whole-run deadline (0 disables it)
    #[serde(default = "default_run_timeout_secs")]
    pub run_secs: u64,
    /// Per-VM readiness deadline
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_secs: u64,
    /// First delay between readiness probes
    #[serde(default = "default_ready_poll_interval_secs")]
    pub ready_poll_interval_secs: u64,
    /// Cap on readiness probe delay
    #[serde(default = "default_ready_max_poll_interval_secs")]
    pub ready_max_poll_interval_secs: u64,
    /// Bound on any single hypervisor call
    #[serde(default = "default_hypervisor_call_timeout_secs")]
    pub hypervisor_call_secs: u64,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            run_secs: default_run_timeout_secs(),
            ready_secs: default_ready_timeout_secs(),
            ready_poll_interval_secs: default_ready_poll_interval_secs(),
            ready_max_poll_interval_secs: default_ready_max_poll_interval_secs(),
            hypervisor_call_secs: default_hypervisor_call_timeout_secs(),
        }
    }
}

impl Deadlines {
    pub fn run(&self) -> Option<Duration> {
        (self.run_secs > 0).then(|| Duration::from_secs(self.run_secs))
    }

    pub fn ready(&self) -> Duration {
        Duration::from_secs(self.ready_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::InvalidDeadline { field, reason });
        if self.ready_secs == 0 {
            return invalid("deadlines.ready_secs", "must be at least 1");
        }
        if self.ready_poll_interval_secs == 0 {
            return invalid("deadlines.ready_poll_interval_secs", "must be at least 1");
        }
        if self.ready_max_poll_interval_secs < self.ready_poll_interval_secs {
            return invalid(
                "deadlines.ready_max_poll_interval_secs",
                "cannot be smaller than ready_poll_interval_secs",
            );
        }
        if self.hypervisor_call_secs == 0 {
            return invalid("deadlines.hypervisor_call_secs", "must be at least 1");
        }
        Ok(())
    }
}

/// Teardown retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupPolicy {
    /// Attempts before an instance is abandoned (first attempt included)
    #[serde(default = "default_cleanup_max_attempts")]
    pub max_attempts: u32,
    /// First delay between attempts; doubles after each failure
    #[serde(default = "default_cleanup_backoff_secs")]
    pub backoff_secs: u64,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_cleanup_max_attempts(),
            backoff_secs: default_cleanup_backoff_secs(),
        }
    }
}

/// Configuration for a benchmark run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// VmSpec identifiers to run, in report order
    pub test_matrix: Vec<String>,
    /// Available size variants keyed by identifier
    #[serde(default)]
    pub vm_specs: BTreeMap<String, VmSpec>,
    /// Benchmark steps, in execution order
    #[serde(default)]
    pub benchmarks: Vec<BenchmarkStep>,
    /// VMs benchmarked at the same time
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub deadlines: Deadlines,
    #[serde(default)]
    pub cleanup: CleanupPolicy,
    /// Fixed delay between attempts of a failing step
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    pub credentials: Credentials,
    /// Guest command that must exit 0 before a VM counts as ready
    #[serde(default)]
    pub readiness_command: Option<String>,
    #[serde(default)]
    pub hypervisor: VirshConfig,
    /// Where to write the JSON report
    #[serde(default)]
    pub output: Option<PathBuf>,
}

impl RunConfig {
    /// Load from a `.json` file, or YAML for any other extension
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::io(path.display().to_string(), e))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        }
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        Ok(config.with_spec_ids())
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        Ok(config.with_spec_ids())
    }

    /// The map key is the spec identifier
    fn with_spec_ids(mut self) -> Self {
        for (id, spec) in &mut self.vm_specs {
            spec.id = id.clone();
        }
        self
    }

    /// Check everything a run depends on before any VM exists
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.test_matrix.is_empty() {
            return Err(ConfigError::EmptyMatrix);
        }
        let mut seen = HashSet::new();
        let mut labels: HashMap<String, &str> = HashMap::new();
        for id in &self.test_matrix {
            if !seen.insert(id.as_str()) {
                return Err(ConfigError::DuplicateMatrixEntry(id.clone()));
            }
            if let Some(first) = labels.insert(domain_label(id), id.as_str()) {
                return Err(ConfigError::DomainNameCollision {
                    first: first.to_string(),
                    second: id.clone(),
                });
            }
            let spec = self
                .vm_specs
                .get(id)
                .ok_or_else(|| ConfigError::UnknownSpec(id.clone()))?;
            validate_spec(spec)?;
        }

        if self.benchmarks.is_empty() {
            return Err(ConfigError::NoBenchmarks);
        }
        let mut names = HashSet::new();
        for step in &self.benchmarks {
            if !names.insert(step.name.as_str()) {
                return Err(ConfigError::DuplicateBenchmark(step.name.clone()));
            }
            validate_step(step)?;
        }

        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.cleanup.max_attempts == 0 {
            return Err(ConfigError::InvalidCleanupAttempts);
        }
        if self.credentials.username.trim().is_empty() {
            return Err(ConfigError::EmptyUsername);
        }
        if self.credentials.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidDeadline {
                field: "credentials.connect_timeout_secs",
                reason: "must be at least 1",
            });
        }
        self.deadlines.validate()
    }

    /// Checks only needed when domains will really be defined
    pub fn validate_hypervisor(&self) -> Result<(), ConfigError> {
        if self.hypervisor.base_image.is_none() {
            return Err(ConfigError::MissingBaseImage);
        }
        Ok(())
    }

    /// Restrict the matrix to `filter`, keeping matrix order
    pub fn only(&mut self, filter: &[String]) -> Result<(), ConfigError> {
        if filter.is_empty() {
            return Ok(());
        }
        if let Some(unknown) = filter.iter().find(|id| !self.test_matrix.contains(id)) {
            return Err(ConfigError::UnknownSpec(unknown.clone()));
        }
        self.test_matrix.retain(|id| filter.contains(id));
        Ok(())
    }

    /// Matrix entries resolved to specs, in matrix order
    pub fn matrix_specs(&self) -> Result<Vec<VmSpec>, ConfigError> {
        self.test_matrix
            .iter()
            .map(|id| {
                self.vm_specs
                    .get(id)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownSpec(id.clone()))
            })
            .collect()
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        let call = Duration::from_secs(self.deadlines.hypervisor_call_secs);
        LifecyclePolicy {
            hypervisor_call_timeout: call,
            define_timeout: call.saturating_mul(DEFINE_CALL_SPAN),
            ready_poll_interval: Duration::from_secs(self.deadlines.ready_poll_interval_secs),
            ready_max_poll_interval: Duration::from_secs(self.deadlines.ready_max_poll_interval_secs),
            cleanup_max_attempts: self.cleanup.max_attempts,
            cleanup_backoff: Duration::from_secs(self.cleanup.backoff_secs),
            readiness_command: self.readiness_command.clone(),
        }
    }
}

fn validate_spec(spec: &VmSpec) -> Result<(), ConfigError> {
    let invalid = |reason| ConfigError::InvalidSpec {
        id: spec.id.clone(),
        reason,
    };
    if spec.vcpus == 0 {
        return Err(invalid("vcpus must be at least 1"));
    }
    if spec.memory_mb == 0 {
        return Err(invalid("memory_mb must be at least 1"));
    }
    if spec.disk_gb == 0 {
        return Err(invalid("disk_gb must be at least 1"));
    }
    Ok(())
}

fn validate_step(step: &BenchmarkStep) -> Result<(), ConfigError> {
    let invalid = |reason| ConfigError::InvalidBenchmark {
        name: step.name.clone(),
        reason,
    };
    if step.name.trim().is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if step.command.trim().is_empty() {
        return Err(invalid("command cannot be empty"));
    }
    if step.max_attempts == 0 {
        return Err(invalid("max_attempts must be at least 1"));
    }
    if step.timeout_secs == 0 {
        return Err(invalid("timeout_secs must be at least 1"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
test_matrix: [small, large]
vm_specs:
  small: { vcpus: 1, memory_mb: 1024, disk_gb: 10 }
  medium: { vcpus: 2, memory_mb: 4096, disk_gb: 20 }
  large:
    vcpus: 8
    memory_mb: 16384
    disk_gb: 80
    storage: { cache: none, io: native }
benchmarks:
  - name: cpu
    command: sysbench cpu --threads={vcpus} --time=60 run
  - name: disk
    command: fio --output-format=json /opt/bench/randread.fio
    output: json
    timeout_secs: 900
    retry_budget: 2
credentials:
  username: bench
  identity_file: /etc/kvm-bench/vm_key
"#;

    fn example() -> RunConfig {
        RunConfig::from_yaml_str(EXAMPLE).unwrap()
    }

    #[test]
    fn test_yaml_with_defaults() {
        let config = example();
        config.validate().unwrap();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.deadlines.ready_secs, 300);
        assert_eq!(config.cleanup.max_attempts, 3);
        assert_eq!(config.benchmarks[1].max_attempts, 2);
        assert_eq!(config.credentials.port, 22);
        assert_eq!(config.vm_specs["large"].id, "large");
    }

    #[test]
    fn test_matrix_specs_in_order() {
        let ids: Vec<String> = example()
            .matrix_specs()
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, ["small", "large"]);
    }

    #[test]
    fn test_unknown_matrix_entry() {
        let mut config = example();
        config.test_matrix.push("huge".into());
        assert!(matches!(config.validate(), Err(ConfigError::UnknownSpec(id)) if id == "huge"));
    }

    #[test]
    fn test_duplicate_matrix_entry() {
        let mut config = example();
        config.test_matrix.push("small".into());
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateMatrixEntry(_))));
    }

    #[test]
    fn test_rejections() {
        let mut config = example();
        config.vm_specs.get_mut("small").unwrap().vcpus = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSpec { .. })));

        let mut config = example();
        config.benchmarks[0].max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidBenchmark { .. })));

        let mut config = example();
        config.benchmarks[1].name = "cpu".into();
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateBenchmark(_))));

        let mut config = example();
        config.benchmarks.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoBenchmarks)));

        let mut config = example();
        config.concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroConcurrency)));

        let mut config = example();
        config.credentials.username = " ".into();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyUsername)));

        let mut config = example();
        config.test_matrix.clear();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyMatrix)));
    }

    #[test]
    fn test_colliding_domain_names_rejected() {
        let mut config = example();
        for id in ["db.small", "db/small"] {
            config
                .vm_specs
                .insert(id.to_string(), VmSpec::new(id, 2, 2048, 20));
            config.test_matrix.push(id.to_string());
        }
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DomainNameCollision { first, second })
                if first == "db.small" && second == "db/small"
        ));
    }

    #[test]
    fn test_deadline_rejections() {
        let cases: [(fn(&mut RunConfig), &str); 5] = [
            (|c| c.deadlines.ready_secs = 0, "deadlines.ready_secs"),
            (|c| c.deadlines.ready_poll_interval_secs = 0, "deadlines.ready_poll_interval_secs"),
            (
                |c| c.deadlines.ready_max_poll_interval_secs = 2,
                "deadlines.ready_max_poll_interval_secs",
            ),
            (|c| c.deadlines.hypervisor_call_secs = 0, "deadlines.hypervisor_call_secs"),
            (|c| c.credentials.connect_timeout_secs = 0, "credentials.connect_timeout_secs"),
        ];
        for (mutate, expected) in cases {
            let mut config = example();
            mutate(&mut config);
            match config.validate() {
                Err(ConfigError::InvalidDeadline { field, .. }) => assert_eq!(field, expected),
                other => panic!("{expected}: expected InvalidDeadline, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_define_timeout_spans_calls() {
        let policy = example().lifecycle_policy();
        assert_eq!(policy.hypervisor_call_timeout, Duration::from_secs(120));
        assert_eq!(policy.define_timeout, Duration::from_secs(240));
    }

    #[test]
    fn test_only_filter() {
        let mut config = example();
        config.only(&["large".to_string()]).unwrap();
        assert_eq!(config.test_matrix, ["large"]);

        let mut config = example();
        assert!(config.only(&["medium".to_string()]).is_err());
    }

    #[test]
    fn test_run_deadline_zero_disables() {
        let mut config = example();
        assert_eq!(config.deadlines.run(), Some(Duration::from_secs(14_400)));
        config.deadlines.run_secs = 0;
        assert_eq!(config.deadlines.run(), None);
    }

    #[test]
    fn test_hypervisor_requires_base_image() {
        let mut config = example();
        assert!(matches!(config.validate_hypervisor(), Err(ConfigError::MissingBaseImage)));
        config.hypervisor.base_image = Some("/srv/jammy.qcow2".into());
        config.validate_hypervisor().unwrap();
    }

    #[test]
    fn test_load_json_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        let json = serde_json::to_string(&example()).unwrap();
        std::fs::write(&path, json).unwrap();

        let loaded = RunConfig::load(&path).unwrap();
        assert_eq!(loaded, example());
    }

    #[test]
    fn test_load_missing_file() {
        let err = RunConfig::load(Path::new("/nonexistent/kvm-bench.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
