//! Backend address selection.

use std::net::Ipv4Addr;

/// Selects the usable address from a backend host entry.
///
/// A host entry may carry several comma-separated addresses when a machine
/// is multi-homed. The first address inside the RFC1918 intranet ranges
/// (10/8, 172.16/12, 192.168/16) wins; if none matches, the first entry is
/// used as-is.
pub fn intranet_ip(host: &str) -> &str {
    if !host.contains(',') {
        return host;
    }
    let mut first = None;
    for candidate in host.split(',') {
        first.get_or_insert(candidate);
        if let Ok(ip) = candidate.parse::<Ipv4Addr>() {
            if ip.is_private() {
                return candidate;
            }
        }
    }
    first.unwrap_or(host)
}
