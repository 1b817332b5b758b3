//! `virsh`/`qemu-img` backed hypervisor driver

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use kvm_bench_common::VmSpec;
use kvm_bench_common::defaults::{default_image_dir, default_libvirt_network, default_libvirt_uri};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::xml::{DomainXml, render_domain_xml};
use super::{DomainInfo, DomainState, Hypervisor};
use crate::command::{ProcessError, ProcessOutput, run_captured};
use crate::error::HypervisorError;

/// Connection and storage settings for the local libvirt daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirshConfig {
    /// libvirt connection URI
    #[serde(default = "default_libvirt_uri")]
    pub uri: String,
    /// qcow2 cloud image every domain's root disk is layered on
    #[serde(default)]
    pub base_image: Option<PathBuf>,
    /// Where overlays and domain XML files are written
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,
    /// libvirt network guests attach to
    #[serde(default = "default_libvirt_network")]
    pub network: String,
    /// cloud-init NoCloud seed ISO (user, SSH key), attached read-only
    #[serde(default)]
    pub seed_iso: Option<PathBuf>,
}

impl Default for VirshConfig {
    fn default() -> Self {
        Self {
            uri: default_libvirt_uri(),
            base_image: None,
            image_dir: default_image_dir(),
            network: default_libvirt_network(),
            seed_iso: None,
        }
    }
}

/// Hypervisor driver that shells out to `virsh` and `qemu-img`
#[derive(Debug, Clone)]
pub struct VirshHypervisor {
    config: VirshConfig,
    call_timeout: Duration,
}

impl VirshHypervisor {
    pub fn new(config: VirshConfig, call_timeout: Duration) -> Self {
        Self {
            config,
            call_timeout,
        }
    }

    fn overlay_path(&self, name: &str) -> PathBuf {
        self.config.image_dir.join(format!("{name}.qcow2"))
    }

    fn xml_path(&self, name: &str) -> PathBuf {
        self.config.image_dir.join(format!("{name}.xml"))
    }

    async fn virsh(&self, operation: &'static str, args: &[&str]) -> Result<ProcessOutput, HypervisorError> {
        let mut full = vec!["-c", self.config.uri.as_str()];
        full.extend_from_slice(args);
        self.exec(operation, "virsh", &full).await
    }

    async fn exec(
        &self,
        operation: &'static str,
        program: &str,
        args: &[&str],
    ) -> Result<ProcessOutput, HypervisorError> {
        run_captured(program, args, self.call_timeout)
            .await
            .map_err(|e| match e {
                ProcessError::TimedOut { timeout, .. } => HypervisorError::Timeout { operation, timeout },
                ProcessError::Spawn { source, .. } => HypervisorError::io(operation, source),
            })
    }

    /// Run a virsh subcommand against `domain`, mapping failures
    async fn domain_op(
        &self,
        operation: &'static str,
        args: &[&str],
        domain: &str,
    ) -> Result<ProcessOutput, HypervisorError> {
        let output = self.virsh(operation, args).await?;
        if output.success() {
            return Ok(output);
        }
        Err(classify_failure(operation, domain, &output))
    }

    async fn create_overlay(&self, name: &str, spec: &VmSpec) -> Result<PathBuf, HypervisorError> {
        let base = self
            .config
            .base_image
            .as_ref()
            .ok_or_else(|| HypervisorError::command("define", "no base image configured"))?;
        let overlay = self.overlay_path(name);
        let base = base.display().to_string();
        let overlay_arg = overlay.display().to_string();
        let size = format!("{}G", spec.disk_gb);

        let output = self
            .exec(
                "qemu-img create",
                "qemu-img",
                &["create", "-f", "qcow2", "-F", "qcow2", "-b", &base, &overlay_arg, &size],
            )
            .await?;
        if !output.success() {
            return Err(HypervisorError::command("qemu-img create", output.diagnostic()));
        }
        Ok(overlay)
    }

    async fn define_inner(&self, name: &str, spec: &VmSpec) -> Result<(), HypervisorError> {
        let overlay = self.create_overlay(name, spec).await?;

        let xml = render_domain_xml(&DomainXml {
            name,
            spec,
            disk: &overlay,
            seed_iso: self.config.seed_iso.as_deref(),
            network: &self.config.network,
        });
        let xml_path = self.xml_path(name);
        tokio::fs::write(&xml_path, xml)
            .await
            .map_err(|e| HypervisorError::io("write domain xml", e))?;

        let xml_arg = xml_path.display().to_string();
        self.domain_op("define", &["define", &xml_arg], name).await?;
        Ok(())
    }

    /// Names of all defined domains (running or not) starting with `prefix`
    pub async fn list_domains(&self, prefix: &str) -> Result<Vec<String>, HypervisorError> {
        let output = self.virsh("list", &["list", "--all", "--name"]).await?;
        if !output.success() {
            return Err(HypervisorError::command("list", output.diagnostic()));
        }
        Ok(parse_domain_list(&output.stdout, prefix))
    }

    /// Delete the overlay and XML files for `name`; missing files are fine
    async fn remove_storage(&self, name: &str) -> Result<(), HypervisorError> {
        for path in [self.overlay_path(name), self.xml_path(name)] {
            remove_if_exists(&path)
                .await
                .map_err(|e| HypervisorError::io("remove storage", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn define(&self, name: &str, spec: &VmSpec) -> Result<String, HypervisorError> {
        info!(domain = %name, vcpus = spec.vcpus, memory_mb = spec.memory_mb, "Defining domain");

        if let Err(e) = self.define_inner(name, spec).await {
            // Nothing is defined yet, so teardown would not find these files
            if let Err(cleanup) = self.remove_storage(name).await {
                warn!(domain = %name, error = %cleanup, "Failed to remove partial storage");
            }
            return Err(e);
        }
        Ok(name.to_string())
    }

    async fn start(&self, domain: &str) -> Result<(), HypervisorError> {
        self.domain_op("start", &["start", domain], domain).await?;
        info!(domain = %domain, "Domain started");
        Ok(())
    }

    async fn stop(&self, domain: &str) -> Result<(), HypervisorError> {
        match self.domain_op("destroy", &["destroy", domain], domain).await {
            Ok(_) => Ok(()),
            Err(HypervisorError::Command { message, .. }) if message.contains("not running") => {
                debug!(domain = %domain, "Domain already stopped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn undefine(&self, domain: &str) -> Result<(), HypervisorError> {
        let undefined = self.domain_op("undefine", &["undefine", domain], domain).await;
        // Storage goes even if the definition is already gone
        self.remove_storage(domain).await?;
        undefined.map(|_| ())
    }

    async fn describe(&self, domain: &str) -> Result<DomainInfo, HypervisorError> {
        let output = self.domain_op("domstate", &["domstate", domain], domain).await?;
        let state = DomainState::from_virsh(&output.stdout);

        let ip_address = if state == DomainState::Running {
            match self
                .virsh("domifaddr", &["domifaddr", domain, "--source", "lease"])
                .await
            {
                Ok(output) if output.success() => parse_domifaddr(&output.stdout),
                Ok(output) => {
                    debug!(domain = %domain, error = %output.diagnostic(), "No lease yet");
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        Ok(DomainInfo { state, ip_address })
    }
}

fn classify_failure(operation: &'static str, domain: &str, output: &ProcessOutput) -> HypervisorError {
    let message = output.diagnostic();
    if message.contains("failed to get domain") || message.contains("Domain not found") {
        HypervisorError::NotFound {
            domain: domain.to_string(),
        }
    } else {
        HypervisorError::command(operation, message)
    }
}

/// First IPv4 address from `virsh domifaddr` output
fn parse_domifaddr(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let idx = fields.iter().position(|f| *f == "ipv4")?;
        let addr = fields.get(idx + 1)?;
        Some(addr.split('/').next().unwrap_or(addr).to_string())
    })
}

fn parse_domain_list(stdout: &str, prefix: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty() && name.starts_with(prefix))
        .map(str::to_string)
        .collect()
}

async fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_domifaddr() {
        let stdout = " Name       MAC address          Protocol     Address\n\
-------------------------------------------------------------------------------\n \
vnet0      52:54:00:6b:3c:1a    ipv6         fe80::5054:ff:fe6b:3c1a/64\n \
vnet0      52:54:00:6b:3c:1a    ipv4         192.168.122.45/24\n";
        assert_eq!(parse_domifaddr(stdout).as_deref(), Some("192.168.122.45"));
    }

    #[test]
    fn test_parse_domifaddr_empty() {
        let stdout = " Name       MAC address          Protocol     Address\n\
-------------------------------------------------------------------------------\n";
        assert_eq!(parse_domifaddr(stdout), None);
    }

    #[test]
    fn test_parse_domain_list_filters_prefix() {
        let stdout = "kvm-bench-small-2e3f4a5b\nubuntu-dev\n\nkvm-bench-large-2e3f4a5b\n";
        assert_eq!(
            parse_domain_list(stdout, "kvm-bench-"),
            ["kvm-bench-small-2e3f4a5b", "kvm-bench-large-2e3f4a5b"]
        );
    }

    #[test]
    fn test_classify_not_found() {
        let output = ProcessOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "error: failed to get domain 'kvm-bench-small-0190a1b2'\n".into(),
        };
        assert!(classify_failure("destroy", "kvm-bench-small-0190a1b2", &output).is_not_found());

        let output = ProcessOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "error: Requested operation is not valid: domain is not running".into(),
        };
        let err = classify_failure("destroy", "d", &output);
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("not running"));
    }

    #[test]
    fn test_config_defaults() {
        let config: VirshConfig = serde_yaml::from_str("base_image: /srv/jammy.qcow2\n").unwrap();
        assert_eq!(config.uri, "qemu:///system");
        assert_eq!(config.image_dir, PathBuf::from("/var/lib/libvirt/images"));
        assert_eq!(config.network, "default");
        assert!(config.seed_iso.is_none());
    }

    #[tokio::test]
    async fn test_remove_storage_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let hv = VirshHypervisor::new(
            VirshConfig {
                image_dir: dir.path().to_path_buf(),
                ..VirshConfig::default()
            },
            Duration::from_secs(5),
        );
        std::fs::write(hv.overlay_path("vm"), b"qcow").unwrap();

        hv.remove_storage("vm").await.unwrap();
        assert!(!hv.overlay_path("vm").exists());
        hv.remove_storage("vm").await.unwrap();
    }

    #[tokio::test]
    async fn test_define_without_base_image_fails() {
        let dir = tempfile::tempdir().unwrap();
        let hv = VirshHypervisor::new(
            VirshConfig {
                image_dir: dir.path().to_path_buf(),
                ..VirshConfig::default()
            },
            Duration::from_secs(5),
        );
        let err = hv.define("vm", &VmSpec::new("small", 1, 1024, 10)).await.unwrap_err();
        assert!(matches!(err, HypervisorError::Command { operation: "define", .. }));
    }
}
