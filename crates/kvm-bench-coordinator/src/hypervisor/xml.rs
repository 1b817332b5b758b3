//! libvirt domain XML rendering

use std::fmt::Write;
use std::path::Path;

use kvm_bench_common::VmSpec;

/// Inputs for one domain definition
#[derive(Debug, Clone)]
pub struct DomainXml<'a> {
    pub name: &'a str,
    pub spec: &'a VmSpec,
    /// qcow2 overlay used as the root disk
    pub disk: &'a Path,
    /// cloud-init NoCloud seed attached as a cdrom
    pub seed_iso: Option<&'a Path>,
    /// libvirt network the NIC attaches to
    pub network: &'a str,
}

/// Render a kvm domain definition for `virsh define`
pub fn render_domain_xml(params: &DomainXml<'_>) -> String {
    let spec = params.spec;
    let mut xml = String::with_capacity(2048);

    // Writing into a String cannot fail
    let _ = writeln!(xml, "<domain type='kvm'>");
    let _ = writeln!(xml, "  <name>{}</name>", escape(params.name));
    let _ = writeln!(xml, "  <memory unit='KiB'>{}</memory>", spec.memory_kib());
    let _ = writeln!(
        xml,
        "  <currentMemory unit='KiB'>{}</currentMemory>",
        spec.memory_kib()
    );
    let _ = writeln!(xml, "  <vcpu placement='static'>{}</vcpu>", spec.vcpus);
    let _ = writeln!(xml, "  <os>");
    let _ = writeln!(xml, "    <type arch='x86_64' machine='q35'>hvm</type>");
    let _ = writeln!(xml, "    <boot dev='hd'/>");
    let _ = writeln!(xml, "  </os>");
    let _ = writeln!(xml, "  <features>\n    <acpi/>\n    <apic/>\n  </features>");
    let _ = writeln!(xml, "  <cpu mode='host-model'>");
    let _ = writeln!(
        xml,
        "    <topology sockets='1' dies='1' cores='{}' threads='1'/>",
        spec.vcpus
    );
    let _ = writeln!(xml, "  </cpu>");
    let _ = writeln!(xml, "  <devices>");

    let _ = writeln!(xml, "    <disk type='file' device='disk'>");
    let _ = writeln!(
        xml,
        "      <driver name='qemu' type='qcow2' cache='{}' io='{}'/>",
        spec.storage.cache, spec.storage.io
    );
    let _ = writeln!(
        xml,
        "      <source file='{}'/>",
        escape(&params.disk.display().to_string())
    );
    let _ = writeln!(
        xml,
        "      <target dev='{}' bus='{}'/>",
        root_disk_target(&spec.storage.bus),
        escape(&spec.storage.bus)
    );
    let _ = writeln!(xml, "    </disk>");

    if let Some(seed) = params.seed_iso {
        let _ = writeln!(xml, "    <disk type='file' device='cdrom'>");
        let _ = writeln!(xml, "      <driver name='qemu' type='raw'/>");
        let _ = writeln!(
            xml,
            "      <source file='{}'/>",
            escape(&seed.display().to_string())
        );
        let _ = writeln!(xml, "      <target dev='sdb' bus='sata'/>");
        let _ = writeln!(xml, "      <readonly/>");
        let _ = writeln!(xml, "    </disk>");
    }

    let _ = writeln!(xml, "    <interface type='network'>");
    let _ = writeln!(xml, "      <source network='{}'/>", escape(params.network));
    let _ = writeln!(xml, "      <model type='{}'/>", escape(&spec.network.model));
    if let Some(queues) = spec.network.queues {
        let _ = writeln!(xml, "      <driver queues='{queues}'/>");
    }
    let _ = writeln!(xml, "    </interface>");

    let _ = writeln!(xml, "    <console type='pty'>");
    let _ = writeln!(xml, "      <target type='serial' port='0'/>");
    let _ = writeln!(xml, "    </console>");
    let _ = writeln!(xml, "  </devices>");
    let _ = writeln!(xml, "</domain>");
    xml
}

fn root_disk_target(bus: &str) -> &'static str {
    match bus {
        "virtio" => "vda",
        "ide" => "hda",
        _ => "sda",
    }
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_bench_common::{DiskCache, DiskIo};
    use std::path::PathBuf;

    fn render(spec: &VmSpec, seed: Option<&Path>) -> String {
        let disk = PathBuf::from("/var/lib/libvirt/images/kvm-bench-small.qcow2");
        render_domain_xml(&DomainXml {
            name: "kvm-bench-small",
            spec,
            disk: &disk,
            seed_iso: seed,
            network: "default",
        })
    }

    #[test]
    fn test_sizes_and_topology() {
        let spec = VmSpec::new("small", 2, 2048, 20);
        let xml = render(&spec, None);
        assert!(xml.contains("<memory unit='KiB'>2097152</memory>"));
        assert!(xml.contains("<vcpu placement='static'>2</vcpu>"));
        assert!(xml.contains("cores='2'"));
        assert!(xml.contains("<target dev='vda' bus='virtio'/>"));
        assert!(!xml.contains("device='cdrom'"));
    }

    #[test]
    fn test_storage_and_network_tuning() {
        let mut spec = VmSpec::new("large", 8, 16384, 80);
        spec.storage.cache = DiskCache::Writeback;
        spec.storage.io = DiskIo::IoUring;
        spec.network.queues = Some(8);

        let xml = render(&spec, None);
        assert!(xml.contains("cache='writeback' io='io_uring'"));
        assert!(xml.contains("<driver queues='8'/>"));
    }

    #[test]
    fn test_seed_iso_attached() {
        let spec = VmSpec::new("small", 1, 1024, 10);
        let seed = PathBuf::from("/srv/seed.iso");
        let xml = render(&spec, Some(&seed));
        assert!(xml.contains("device='cdrom'"));
        assert!(xml.contains("<source file='/srv/seed.iso'/>"));
    }

    #[test]
    fn test_escaping() {
        assert_eq!(escape("a<b>&'c'"), "a&lt;b&gt;&amp;&apos;c&apos;");
    }
}
