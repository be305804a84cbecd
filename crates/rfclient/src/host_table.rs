//! C5: the shared IP -> (MAC, interface) map.
//!
//! Written by the route-source adapters on neighbor-reachable events,
//! read by the gateway resolver and the flow-mod builder. Deletion is
//! not implemented; see `DESIGN.md` open question 1.

use crate::types::HostEntry;
use parking_lot::RwLock;
use sonic_types::{IpAddress, MacAddress};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, HostEntry>,
}

/// Cheaply cloneable handle; all clones share the same underlying map.
#[derive(Clone, Default)]
pub struct HostTable {
    inner: Arc<RwLock<Inner>>,
}

impl HostTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent for a repeated MAC, overwriting for a changed one.
    pub fn insert(&self, entry: HostEntry) {
        let key = entry.ip.to_string();
        self.inner.write().entries.insert(key, entry);
    }

    pub fn lookup(&self, ip: &IpAddress) -> Option<HostEntry> {
        self.inner.read().entries.get(&ip.to_string()).cloned()
    }

    pub fn mac_for(&self, ip: &IpAddress) -> Option<MacAddress> {
        self.lookup(ip).map(|e| e.mac)
    }

    pub fn contains(&self, ip: &IpAddress) -> bool {
        self.inner.read().entries.contains_key(&ip.to_string())
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Interface;
    use std::net::Ipv4Addr;

    fn iface() -> Interface {
        Interface {
            port: 1,
            name: "eth1".into(),
            hw_addr: "aa:aa:aa:aa:aa:01".parse().unwrap(),
            vlan: None,
            ip_list: vec![],
            active: true,
            physical: true,
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let table = HostTable::new();
        let ip: IpAddress = Ipv4Addr::new(10, 0, 0, 1).into();
        let mac: MacAddress = "bb:bb:bb:bb:bb:01".parse().unwrap();
        table.insert(HostEntry {
            ip,
            mac,
            interface: iface(),
        });
        assert_eq!(table.mac_for(&ip), Some(mac));
    }

    #[test]
    fn overwrite_updates_mac() {
        let table = HostTable::new();
        let ip: IpAddress = Ipv4Addr::new(10, 0, 0, 1).into();
        let mac1: MacAddress = "bb:bb:bb:bb:bb:01".parse().unwrap();
        let mac2: MacAddress = "cc:cc:cc:cc:cc:01".parse().unwrap();
        table.insert(HostEntry { ip, mac: mac1, interface: iface() });
        table.insert(HostEntry { ip, mac: mac2, interface: iface() });
        assert_eq!(table.mac_for(&ip), Some(mac2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unresolved_host_is_none() {
        let table = HostTable::new();
        let ip: IpAddress = Ipv4Addr::new(10, 0, 0, 9).into();
        assert!(table.mac_for(&ip).is_none());
        assert!(!table.contains(&ip));
    }
}
