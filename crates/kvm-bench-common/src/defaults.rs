//! Default configuration values shared across kvm-bench components
//!
//! Durations are expressed in seconds so they can be used directly as serde
//! field defaults for the `*_secs` configuration keys.

/// Default number of VMs benchmarked at the same time
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Default overall run deadline in seconds (4 hours)
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 14_400;

/// Default time a guest gets to become reachable after start
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 300;

/// Default initial delay between readiness probes
pub const DEFAULT_READY_POLL_INTERVAL_SECS: u64 = 5;

/// Default cap on the readiness poll delay once backoff has grown
pub const DEFAULT_READY_MAX_POLL_INTERVAL_SECS: u64 = 30;

/// Default bound on any single hypervisor call
pub const DEFAULT_HYPERVISOR_CALL_TIMEOUT_SECS: u64 = 120;

/// Default per-step command timeout
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 600;

/// Default attempts per benchmark step (first attempt included)
pub const DEFAULT_STEP_MAX_ATTEMPTS: u32 = 3;

/// Default fixed delay between benchmark step attempts
pub const DEFAULT_RETRY_BACKOFF_SECS: u64 = 10;

/// Default teardown attempts before an instance is abandoned
pub const DEFAULT_CLEANUP_MAX_ATTEMPTS: u32 = 3;

/// Default initial delay between teardown attempts (doubles each attempt)
pub const DEFAULT_CLEANUP_BACKOFF_SECS: u64 = 2;

/// Default SSH port on guests
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default libvirt connection URI
pub const DEFAULT_LIBVIRT_URI: &str = "qemu:///system";

/// Default libvirt network guests attach to
pub const DEFAULT_LIBVIRT_NETWORK: &str = "default";

/// Default directory for per-domain disk overlays and XML definitions
pub const DEFAULT_IMAGE_DIR: &str = "/var/lib/libvirt/images";

/// Default TCP connect timeout when opening a guest session
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Prefix for every domain created by kvm-bench
pub const DOMAIN_NAME_PREFIX: &str = "kvm-bench";

// Serde default functions for struct field defaults

pub fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

pub fn default_run_timeout_secs() -> u64 {
    DEFAULT_RUN_TIMEOUT_SECS
}

pub fn default_ready_timeout_secs() -> u64 {
    DEFAULT_READY_TIMEOUT_SECS
}

pub fn default_ready_poll_interval_secs() -> u64 {
    DEFAULT_READY_POLL_INTERVAL_SECS
}

pub fn default_ready_max_poll_interval_secs() -> u64 {
    DEFAULT_READY_MAX_POLL_INTERVAL_SECS
}

pub fn default_hypervisor_call_timeout_secs() -> u64 {
    DEFAULT_HYPERVISOR_CALL_TIMEOUT_SECS
}

pub fn default_step_timeout_secs() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

pub fn default_step_max_attempts() -> u32 {
    DEFAULT_STEP_MAX_ATTEMPTS
}

pub fn default_retry_backoff_secs() -> u64 {
    DEFAULT_RETRY_BACKOFF_SECS
}

pub fn default_cleanup_max_attempts() -> u32 {
    DEFAULT_CLEANUP_MAX_ATTEMPTS
}

pub fn default_cleanup_backoff_secs() -> u64 {
    DEFAULT_CLEANUP_BACKOFF_SECS
}

pub fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

pub fn default_libvirt_uri() -> String {
    DEFAULT_LIBVIRT_URI.to_string()
}

pub fn default_libvirt_network() -> String {
    DEFAULT_LIBVIRT_NETWORK.to_string()
}

pub fn default_image_dir() -> std::path::PathBuf {
    std::path::PathBuf::from(DEFAULT_IMAGE_DIR)
}

pub fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}
