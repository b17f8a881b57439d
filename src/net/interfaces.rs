//! Local IPv4 and broadcast address enumeration for discovery.

use std::net::Ipv4Addr;

use get_if_addrs::IfAddr;

/// IPv4 addresses of non-loopback interfaces. Never contains `127.0.0.1`.
pub fn local_ip_addresses() -> Vec<Ipv4Addr> {
    let mut addresses = Vec::new();
    if let Ok(interfaces) = get_if_addrs::get_if_addrs() {
        for iface in interfaces {
            if iface.is_loopback() {
                continue;
            }
            if let IfAddr::V4(v4) = iface.addr {
                addresses.push(v4.ip);
            }
        }
    }
    addresses
}

/// Broadcast addresses for every non-loopback IPv4 interface, computing
/// `ip | !mask` when the interface reports none. Falls back to the limited
/// broadcast address so the result is never empty.
pub fn broadcast_addresses() -> Vec<Ipv4Addr> {
    let mut broadcasts = Vec::new();
    if let Ok(interfaces) = get_if_addrs::get_if_addrs() {
        for iface in interfaces {
            if iface.is_loopback() {
                continue;
            }
            if let IfAddr::V4(v4) = iface.addr {
                let broadcast = v4.broadcast.unwrap_or_else(|| {
                    let ip = u32::from(v4.ip);
                    let mask = u32::from(v4.netmask);
                    Ipv4Addr::from(ip | !mask)
                });
                if !broadcasts.contains(&broadcast) {
                    broadcasts.push(broadcast);
                }
            }
        }
    }
    if broadcasts.is_empty() {
        broadcasts.push(Ipv4Addr::BROADCAST);
    }
    broadcasts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_addresses_exclude_loopback() {
        for ip in local_ip_addresses() {
            assert!(!ip.is_loopback());
        }
    }

    #[test]
    fn broadcast_addresses_never_empty() {
        let broadcasts = broadcast_addresses();
        assert!(!broadcasts.is_empty());
    }
}
