//! Hypervisor domain descriptors.
//!
//! [`Descriptor`] is a small XML tree addressed by [`NodeId`] handles: nodes
//! are appended under a parent and attributes or text set through the
//! handle, then the whole tree is serialized once with [`Descriptor::to_xml`].

use crate::network::Interface;
use crate::storage::Disk;

/// Handle to a node inside one [`Descriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(usize);

#[derive(Debug)]
struct Node {
    tag: String,
    attrs: Vec<(String, String)>,
    text: Option<String>,
    children: Vec<NodeId>,
}

#[derive(Debug)]
pub struct Descriptor {
    nodes: Vec<Node>,
}

impl Descriptor {
    pub fn new(root: &str) -> Self {
        Self {
            nodes: vec![Node {
                tag: root.to_string(),
                attrs: Vec::new(),
                text: None,
                children: Vec::new(),
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Append an empty `<tag>` under `parent`.
    pub fn child(&mut self, parent: NodeId, tag: &str) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            tag: tag.to_string(),
            attrs: Vec::new(),
            text: None,
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Append `<tag>text</tag>` under `parent`.
    pub fn leaf(&mut self, parent: NodeId, tag: &str, text: impl ToString) -> NodeId {
        let id = self.child(parent, tag);
        self.set_text(id, text);
        id
    }

    pub fn attr(&mut self, node: NodeId, name: &str, value: impl ToString) -> NodeId {
        self.nodes[node.0].attrs.push((name.to_string(), value.to_string()));
        node
    }

    pub fn set_text(&mut self, node: NodeId, text: impl ToString) {
        self.nodes[node.0].text = Some(text.to_string());
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_node(NodeId(0), 0, &mut out);
        out
    }

    fn write_node(&self, id: NodeId, depth: usize, out: &mut String) {
        let node = &self.nodes[id.0];
        let indent = "  ".repeat(depth);
        out.push_str(&indent);
        out.push('<');
        out.push_str(&node.tag);
        for (k, v) in &node.attrs {
            out.push_str(&format!(" {}=\"{}\"", k, escape(v)));
        }
        match (&node.text, node.children.is_empty()) {
            (None, true) => out.push_str("/>\n"),
            (Some(text), true) => {
                out.push_str(&format!(">{}</{}>\n", escape(text), node.tag));
            }
            (text, false) => {
                out.push_str(">\n");
                if let Some(text) = text {
                    out.push_str(&format!("{}  {}\n", indent, escape(text)));
                }
                for child in &node.children {
                    self.write_node(*child, depth + 1, out);
                }
                out.push_str(&format!("{}</{}>\n", indent, node.tag));
            }
        }
    }
}

fn escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Everything needed to describe one KVM domain.
#[derive(Debug, Clone)]
pub struct DomainConfig<'a> {
    pub name: &'a str,
    pub memory_kib: u64,
    pub vcpus: u32,
    pub emulator: &'a str,
    pub disks: &'a [Disk],
    pub interfaces: &'a [Interface],
}

/// `vda`, `vdb`, ... `vdz`, `vdaa`, ...
fn disk_target(index: usize) -> String {
    let mut suffix = Vec::new();
    let mut n = index;
    loop {
        suffix.push(b'a' + (n % 26) as u8);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    suffix.reverse();
    format!("vd{}", String::from_utf8_lossy(&suffix))
}

/// Build the `<domain type="kvm">` descriptor. Disks attach as virtio
/// devices in slice order.
pub fn build_domain(config: &DomainConfig<'_>) -> Descriptor {
    let mut d = Descriptor::new("domain");
    let root = d.root();
    d.attr(root, "type", "kvm");

    d.leaf(root, "name", config.name);
    let memory = d.leaf(root, "memory", config.memory_kib);
    d.attr(memory, "unit", "KiB");
    let current = d.leaf(root, "currentMemory", config.memory_kib);
    d.attr(current, "unit", "KiB");
    let vcpu = d.leaf(root, "vcpu", config.vcpus);
    d.attr(vcpu, "placement", "static");

    let cpu = d.child(root, "cpu");
    d.attr(cpu, "mode", "host-passthrough");

    let os = d.child(root, "os");
    let os_type = d.leaf(os, "type", "hvm");
    d.attr(os_type, "arch", "x86_64");
    d.attr(os_type, "machine", "pc");
    let boot = d.child(os, "boot");
    d.attr(boot, "dev", "hd");

    let features = d.child(root, "features");
    d.child(features, "acpi");
    d.child(features, "apic");

    d.leaf(root, "on_poweroff", "destroy");
    d.leaf(root, "on_reboot", "restart");
    d.leaf(root, "on_crash", "destroy");

    let devices = d.child(root, "devices");
    d.leaf(devices, "emulator", config.emulator);
    let usb = d.child(devices, "controller");
    d.attr(usb, "type", "usb");
    d.attr(usb, "index", 0);
    let pci = d.child(devices, "controller");
    d.attr(pci, "type", "pci");
    d.attr(pci, "index", 0);
    d.attr(pci, "model", "pci-root");

    for (i, disk) in config.disks.iter().enumerate() {
        let node = d.child(devices, "disk");
        d.attr(node, "type", "file");
        d.attr(node, "device", "disk");
        let driver = d.child(node, "driver");
        d.attr(driver, "name", "qemu");
        d.attr(driver, "type", disk.format.as_str());
        d.attr(driver, "cache", "unsafe");
        let source = d.child(node, "source");
        d.attr(source, "file", &disk.path);
        let target = d.child(node, "target");
        d.attr(target, "dev", disk_target(i));
        d.attr(target, "bus", "virtio");
    }

    for iface in config.interfaces {
        let node = d.child(devices, "interface");
        d.attr(node, "type", "bridge");
        let source = d.child(node, "source");
        d.attr(source, "bridge", &iface.bridge);
        let model = d.child(node, "model");
        d.attr(model, "type", "virtio");
        let mac = d.child(node, "mac");
        d.attr(mac, "address", &iface.mac);
    }

    let serial = d.child(devices, "serial");
    d.attr(serial, "type", "pty");
    let graphics = d.child(devices, "graphics");
    d.attr(graphics, "type", "vnc");
    d.attr(graphics, "autoport", "yes");
    let balloon = d.child(devices, "memballoon");
    d.attr(balloon, "model", "virtio");

    d
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DiskFormat;

    #[test]
    fn test_tree_builder_serializes_nested_nodes() {
        let mut d = Descriptor::new("a");
        let root = d.root();
        let b = d.child(root, "b");
        d.attr(b, "x", "1 & 2");
        d.leaf(b, "c", "<text>");
        d.child(root, "empty");
        assert_eq!(
            d.to_xml(),
            "<a>\n  <b x=\"1 &amp; 2\">\n    <c>&lt;text&gt;</c>\n  </b>\n  <empty/>\n</a>\n"
        );
    }

    #[test]
    fn test_disk_target_names() {
        assert_eq!(disk_target(0), "vda");
        assert_eq!(disk_target(1), "vdb");
        assert_eq!(disk_target(25), "vdz");
        assert_eq!(disk_target(26), "vdaa");
    }

    #[test]
    fn test_build_domain_descriptor() {
        let disks = vec![
            Disk {
                path: "/srv/rally/vms/rci_1/disk0.qcow2".into(),
                format: DiskFormat::Qcow2,
            },
            Disk {
                path: "/srv/rally/vms/rci_1/disk1.img".into(),
                format: DiskFormat::Raw,
            },
        ];
        let interfaces = vec![Interface {
            bridge: "nr1".into(),
            mac: "52:54:00:aa:bb:cc".into(),
        }];
        let xml = build_domain(&DomainConfig {
            name: "rci_1",
            memory_kib: 2097152,
            vcpus: 2,
            emulator: "/usr/bin/kvm",
            disks: &disks,
            interfaces: &interfaces,
        })
        .to_xml();

        assert!(xml.starts_with("<domain type=\"kvm\">\n"));
        assert!(xml.contains("<name>rci_1</name>"));
        assert!(xml.contains("<memory unit=\"KiB\">2097152</memory>"));
        assert!(xml.contains("<currentMemory unit=\"KiB\">2097152</currentMemory>"));
        assert!(xml.contains("<vcpu placement=\"static\">2</vcpu>"));
        assert!(xml.contains("<emulator>/usr/bin/kvm</emulator>"));
        assert!(xml.contains("<graphics type=\"vnc\" autoport=\"yes\"/>"));
        assert!(xml.contains("<memballoon model=\"virtio\"/>"));
        assert!(xml.contains("<source bridge=\"nr1\"/>"));
        assert!(xml.contains("<model type=\"virtio\"/>"));
        assert!(xml.contains("<mac address=\"52:54:00:aa:bb:cc\"/>"));

        let first = xml.find("disk0.qcow2").unwrap();
        let second = xml.find("disk1.img").unwrap();
        assert!(first < second);
        assert!(xml.contains("<target dev=\"vda\" bus=\"virtio\"/>"));
        assert!(xml.contains("<target dev=\"vdb\" bus=\"virtio\"/>"));
        assert!(xml.contains("<driver name=\"qemu\" type=\"raw\" cache=\"unsafe\"/>"));

        // The descriptor is its own parser's input.
        assert_eq!(crate::host::parse_domain_resources(&xml).unwrap(), (2097152, 2));
    }
}
