pub mod bridge;

pub use bridge::{BridgeAllocator, BridgeScope};

/// A VM's attachment to a host bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub bridge: String,
    pub mac: String,
}

/// Find the IPv4 address of the first complete entry in the host's ARP
/// table (`/proc/net/arp`) whose hardware address is one of `macs`.
///
/// ```text
/// IP address       HW type     Flags       HW address            Mask     Device
/// 192.168.122.42   0x1         0x2         52:54:00:12:34:56     *        virbr0
/// ```
///
/// Entries with flags `0x0` are incomplete and skipped.
pub fn find_address(arp_table: &str, macs: &[String]) -> Option<String> {
    arp_table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[2] == "0x0" {
            return None;
        }
        macs.iter()
            .any(|m| m.eq_ignore_ascii_case(fields[3]))
            .then(|| fields[0].to_string())
    })
}
