//! Source-address binding for AppRole logins.

use ipnet::IpNet;
use std::net::IpAddr;

/// Parse a bound CIDR entry. A bare address is treated as a host route.
pub fn parse_cidr(entry: &str) -> Option<IpNet> {
    let entry = entry.trim();
    if let Ok(net) = entry.parse::<IpNet>() {
        return Some(net);
    }
    let addr = entry.parse::<IpAddr>().ok()?;
    let host_prefix = if addr.is_ipv4() { 32 } else { 128 };
    IpNet::new(addr, host_prefix).ok()
}

/// An empty list admits every address. Unparsable entries never match.
pub fn ip_allowed(bound_cidr_list: &[String], source_ip: IpAddr) -> bool {
    if bound_cidr_list.is_empty() {
        return true;
    }

    let source_ip = source_ip.to_canonical();
    bound_cidr_list.iter().any(|entry| match parse_cidr(entry) {
        Some(net) => net.contains(&source_ip),
        None => {
            tracing::warn!(cidr = %entry, "Ignoring unparsable bound CIDR entry");
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_list_is_unrestricted() {
        assert!(ip_allowed(&[], "203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn containment_uses_prefix_length() {
        let cidrs = list(&["10.0.0.0/8"]);
        assert!(ip_allowed(&cidrs, "10.255.1.2".parse().unwrap()));
        assert!(!ip_allowed(&cidrs, "11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn bare_address_is_host_route() {
        let cidrs = list(&["192.168.1.10"]);
        assert!(ip_allowed(&cidrs, "192.168.1.10".parse().unwrap()));
        assert!(!ip_allowed(&cidrs, "192.168.1.11".parse().unwrap()));
    }

    #[test]
    fn ipv4_mapped_ipv6_peer_matches_ipv4_range() {
        let cidrs = list(&["127.0.0.0/8"]);
        assert!(ip_allowed(&cidrs, "::ffff:127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn ipv6_ranges() {
        let cidrs = list(&["2001:db8::/32"]);
        assert!(ip_allowed(&cidrs, "2001:db8::1".parse().unwrap()));
        assert!(!ip_allowed(&cidrs, "2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn garbage_entries_never_match() {
        let cidrs = list(&["not-a-cidr", "10.0.0.0/99"]);
        assert!(!ip_allowed(&cidrs, "10.0.0.1".parse().unwrap()));

        let mixed = list(&["junk", "10.0.0.0/8"]);
        assert!(ip_allowed(&mixed, "10.0.0.1".parse().unwrap()));
    }
}
