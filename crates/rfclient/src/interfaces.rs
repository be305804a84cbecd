//! C1: interface enumeration and the registry's `active` flag.
//!
//! Mirrors the original `RFClient::load_interfaces()` (a `getifaddrs(3)`
//! scan), ported onto `nix::ifaddrs::getifaddrs` so the Rust code calls
//! the same libc primitive the C agent did.

use crate::error::{Result, RfClientError};
use crate::types::Interface;
use parking_lot::RwLock;
use sonic_types::{IpAddress, MacAddress};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Interface whose port-derivation and registration is skipped: the
/// management NIC used for the control plane itself.
pub const DEFAULT_MANAGEMENT_INTERFACE: &str = "eth0";

/// Derives the port number from the first run of digits in an interface
/// name, e.g. `eth12` -> 12, `swp3.100` -> 3 (the `.100` denotes a VLAN
/// subinterface and is parsed separately by [`parse_port_and_vlan`]).
pub fn parse_port_and_vlan(name: &str) -> Option<(u32, Option<u16>)> {
    let digit_start = name.find(|c: char| c.is_ascii_digit())?;
    let rest = &name[digit_start..];

    if let Some((port_str, vlan_str)) = rest.split_once('.') {
        let port: u32 = port_str.parse().ok()?;
        let vlan: u16 = vlan_str
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect::<String>()
            .parse()
            .ok()?;
        Some((port, Some(vlan)))
    } else {
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        let port: u32 = digits.parse().ok()?;
        Some((port, None))
    }
}

/// True for names this agent treats as physical/virtual data-plane
/// ports worth registering (i.e. everything but the management
/// interface and loopback).
pub fn is_physical_naming_convention(name: &str) -> bool {
    name != DEFAULT_MANAGEMENT_INTERFACE
        && name != "lo"
        && name.chars().any(|c| c.is_ascii_digit())
}

#[derive(Default)]
struct Inner {
    by_name: HashMap<String, Interface>,
}

/// Thread-safe, read-mostly lookup by name. The interface set is frozen
/// after startup; only the `active` bit inside each entry ever changes,
/// under the same lock (spec section 4.1).
#[derive(Clone, Default)]
pub struct InterfaceRegistry {
    inner: Arc<RwLock<Inner>>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, iface: Interface) {
        self.inner.write().by_name.insert(iface.name.clone(), iface);
    }

    pub fn lookup(&self, name: &str) -> Option<Interface> {
        self.inner.read().by_name.get(name).cloned()
    }

    pub fn lookup_by_port(&self, port: u32) -> Option<Interface> {
        self.inner
            .read()
            .by_name
            .values()
            .find(|i| i.port == port)
            .cloned()
    }

    pub fn all(&self) -> Vec<Interface> {
        self.inner.read().by_name.values().cloned().collect()
    }

    /// Sets `active` for every interface sharing `port` (a physical port
    /// and its VLAN subinterfaces all share one `vm_port`).
    pub fn set_active_by_port(&self, port: u32, active: bool) {
        let mut inner = self.inner.write();
        for iface in inner.by_name.values_mut() {
            if iface.port == port {
                iface.active = active;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Capability interface satisfied by [`InterfaceRegistry`], so the flow
/// table and port mapper don't need a back-pointer to the concrete
/// registry (Design Notes section 9, "cyclic references").
pub trait InterfaceLookup: Send + Sync {
    fn lookup(&self, name: &str) -> Option<Interface>;
}

impl InterfaceLookup for InterfaceRegistry {
    fn lookup(&self, name: &str) -> Option<Interface> {
        InterfaceRegistry::lookup(self, name)
    }
}

/// Scans host interfaces via `getifaddrs(2)`, builds an [`Interface`] for
/// each physical one (skipping the management interface and loopback),
/// and returns them in discovery order. Does not block on link-up state;
/// callers wait for "running" separately via [`wait_running`] so the
/// scan itself cannot hang forever on a never-up NIC.
#[cfg(target_os = "linux")]
pub fn load_interfaces() -> Result<Vec<Interface>> {
    use nix::ifaddrs::getifaddrs;
    use nix::sys::socket::SockaddrLike;
    use std::collections::BTreeMap;

    let addrs = getifaddrs().map_err(|e| RfClientError::SocketSetup(e.to_string()))?;

    let mut by_name: BTreeMap<String, (Option<MacAddress>, Vec<IpAddress>)> = BTreeMap::new();

    for ifa in addrs {
        let name = ifa.interface_name.clone();
        if !is_physical_naming_convention(&name) {
            continue;
        }
        let entry = by_name.entry(name).or_default();

        if let Some(addr) = ifa.address.as_ref() {
            if let Some(link) = addr.as_link_addr() {
                if let Some(bytes) = link.addr() {
                    if bytes.len() == 6 {
                        entry.0 = Some(MacAddress::new([
                            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5],
                        ]));
                    }
                }
            } else if let Some(sin) = addr.as_sockaddr_in() {
                let ip: std::net::Ipv4Addr = sin.ip();
                entry.1.push(ip.into());
            } else if let Some(sin6) = addr.as_sockaddr_in6() {
                // strip the scope id implicitly: `ip()` never carries one.
                let ip: std::net::Ipv6Addr = sin6.ip();
                entry.1.push(ip.into());
            }
        }
    }

    let mut result = Vec::new();
    for (name, (mac, ip_list)) in by_name {
        let Some((port, vlan)) = parse_port_and_vlan(&name) else {
            warn!(interface = %name, "cannot derive port number, skipping");
            continue;
        };
        let Some(hw_addr) = mac else {
            warn!(interface = %name, "no hardware address, skipping");
            continue;
        };
        info!(interface = %name, port, "loaded interface");
        let vlan = vlan.and_then(|v| sonic_types::VlanId::new(v).ok());
        result.push(Interface {
            port,
            name,
            hw_addr,
            vlan,
            ip_list,
            active: false,
            // A VLAN subinterface shares its port with a physical parent
            // already registered/heartbeat-mapped separately; it must not
            // be double-counted as its own physical port (spec section
            // 4.1 / "Registration: for each physical interface").
            physical: vlan.is_none(),
        });
    }

    if result.is_empty() {
        return Err(RfClientError::NoUsableInterfaces);
    }

    Ok(result)
}

#[cfg(not(target_os = "linux"))]
pub fn load_interfaces() -> Result<Vec<Interface>> {
    Err(RfClientError::SocketSetup(
        "interface enumeration is only implemented for Linux".into(),
    ))
}

/// Blocks (with a bounded poll) until `/sys/class/net/<name>/operstate`
/// reports `"up"`, i.e. the kernel's "running" state (spec section 4.1).
/// A NIC that never comes up is logged and skipped, not fatal -- only
/// zero usable interfaces overall is fatal (spec section 6).
pub async fn wait_running(name: &str, max_attempts: u32) -> bool {
    let path = format!("/sys/class/net/{name}/operstate");
    for _ in 0..max_attempts {
        if let Ok(state) = tokio::fs::read_to_string(&path).await {
            if state.trim() == "up" {
                return true;
            }
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
    warn!(interface = %name, "never reported running, skipping");
    false
}

/// Derives the 48-bit `vm_id` by hashing the management interface's MAC,
/// matching the original's `get_interface_id()` hex-packing behavior:
/// the six MAC octets concatenated as hex digits, parsed back as an
/// integer.
pub fn vm_id_from_mac(mac: &MacAddress) -> u64 {
    let bytes = mac.as_bytes();
    let mut id: u64 = 0;
    for b in bytes {
        id = (id << 8) | (*b as u64);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_port() {
        assert_eq!(parse_port_and_vlan("eth12"), Some((12, None)));
    }

    #[test]
    fn parses_vlan_subinterface() {
        assert_eq!(parse_port_and_vlan("swp3.100"), Some((3, Some(100))));
    }

    #[test]
    fn rejects_management_and_loopback() {
        assert!(!is_physical_naming_convention("eth0"));
        assert!(!is_physical_naming_convention("lo"));
        assert!(is_physical_naming_convention("swp1"));
    }

    #[test]
    fn vm_id_is_deterministic_hash_of_mac() {
        let mac: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let id = vm_id_from_mac(&mac);
        assert_eq!(id, 0xaabbccddeeff);
    }

    #[test]
    fn vlan_subinterface_shares_port_but_is_not_physical() {
        let (port, vlan) = parse_port_and_vlan("swp3.100").unwrap();
        let vlan = vlan.and_then(|v| sonic_types::VlanId::new(v).ok());
        let sub = Interface {
            port,
            name: "swp3.100".into(),
            hw_addr: "aa:aa:aa:aa:aa:01".parse().unwrap(),
            vlan,
            ip_list: vec![],
            active: false,
            physical: vlan.is_none(),
        };
        assert_eq!(sub.port, 3);
        assert!(!sub.physical, "a VLAN subinterface must not be registered as its own physical port");
    }

    #[test]
    fn registry_active_flag_applies_to_shared_port() {
        let reg = InterfaceRegistry::new();
        reg.insert(Interface {
            port: 1,
            name: "swp1".into(),
            hw_addr: "aa:aa:aa:aa:aa:01".parse().unwrap(),
            vlan: None,
            ip_list: vec![],
            active: false,
            physical: true,
        });
        reg.set_active_by_port(1, true);
        assert!(reg.lookup("swp1").unwrap().active);
    }
}
