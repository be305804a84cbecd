//! C6: translates resolved routes, host entries, and NHLFEs into
//! [`FlowMod`] records, and caches them per-port while the destination
//! port is inactive (spec sections 3 and 4.6).

use crate::host_table::HostTable;
use crate::types::{HostEntry, Interface, NhlfeFrame, NhlfeOp, RouteEntry};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sonic_types::{IpAddress, MacAddress};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Lower priority band; longer prefixes win by adding
/// `prefix_len * PRIORITY_BAND`.
pub const PRIORITY_LOW: u16 = 0x4010;
pub const PRIORITY_BAND: u16 = 0x0A;
/// Priority for controller-punt flow-mods (protocol traffic).
pub const PRIORITY_HIGH: u16 = 0x8020;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowModOp {
    Add,
    Delete,
    Controller,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Match {
    EthDst(MacAddress),
    Vlan(u16),
    Ipv4 { addr: std::net::Ipv4Addr, mask: std::net::Ipv4Addr },
    Ipv6 { addr: std::net::Ipv6Addr, prefix_len: u8 },
    MplsInLabel(u32),
    EtherType(u16),
    IpProto(u8),
    L4SrcPort(u16),
    L4DstPort(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    SetEthSrc(MacAddress),
    SetEthDst(MacAddress),
    SwapVlanId(u16),
    PushMpls(u32),
    PopMpls,
    SwapMpls(u32),
    OutputToPort(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Option_ {
    Priority(u16),
}

/// The message this agent ships over IPC to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMod {
    pub op: FlowModOp,
    pub vm_id: u64,
    pub vm_port: u32,
    pub match_list: Vec<Match>,
    pub action_list: Vec<Action>,
    pub option_list: Vec<Option_>,
}

/// What gets cached for a route emission diverted by an inactive port
/// (spec section 4.6). Unlike host-entry emissions (simply dropped),
/// route emissions survive to be replayed once the port activates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedRm {
    pub op: FlowModOp,
    pub addr: IpAddress,
    pub prefix_len: u8,
    pub gateway_mac: MacAddress,
}

fn priority_for_prefix(prefix_len: u8) -> u16 {
    PRIORITY_LOW + (prefix_len as u16) * PRIORITY_BAND
}

fn ip_match(addr: &IpAddress, prefix_len: u8) -> Match {
    match addr {
        IpAddress::V4(a) => {
            let mask = if prefix_len == 0 {
                std::net::Ipv4Addr::UNSPECIFIED
            } else {
                std::net::Ipv4Addr::from(u32::MAX.checked_shl(32 - prefix_len as u32).unwrap_or(0))
            };
            Match::Ipv4 { addr: a.inner(), mask }
        }
        IpAddress::V6(a) => Match::Ipv6 { addr: a.inner(), prefix_len },
    }
}

fn eth_and_ip_actions(
    local: &Interface,
    gateway_mac: MacAddress,
) -> Vec<Action> {
    let mut actions = vec![
        Action::SetEthSrc(local.hw_addr),
        Action::SetEthDst(gateway_mac),
    ];
    if let Some(vlan) = local.vlan {
        actions.push(Action::SwapVlanId(vlan.as_u16()));
    }
    actions
}

/// Builds a route-entry flow-mod (spec section 4.6, "Route-entry
/// emission"). Returns `None` if the gateway MAC cannot be resolved --
/// callers are expected to have checked the host table first.
pub fn build_route_flow_mod(
    op: FlowModOp,
    vm_id: u64,
    route: &RouteEntry,
    gateway_mac: MacAddress,
) -> FlowMod {
    let mut match_list = vec![ip_match(&route.dst, route.prefix_len)];
    if let Some(vlan) = route.interface.vlan {
        match_list.push(Match::Vlan(vlan.as_u16()));
    }
    FlowMod {
        op,
        vm_id,
        vm_port: route.interface.port,
        match_list,
        action_list: eth_and_ip_actions(&route.interface, gateway_mac),
        option_list: vec![Option_::Priority(priority_for_prefix(route.prefix_len))],
    }
}

/// Builds a host-entry flow-mod: identical shape to a route entry but
/// with a full-prefix mask (/32 or /128).
pub fn build_host_flow_mod(op: FlowModOp, vm_id: u64, host: &HostEntry) -> FlowMod {
    let prefix_len = match host.ip {
        IpAddress::V4(_) => 32,
        IpAddress::V6(_) => 128,
    };
    let mut match_list = vec![ip_match(&host.ip, prefix_len)];
    if let Some(vlan) = host.interface.vlan {
        match_list.push(Match::Vlan(vlan.as_u16()));
    }
    FlowMod {
        op,
        vm_id,
        vm_port: host.interface.port,
        match_list,
        action_list: eth_and_ip_actions(&host.interface, host.mac),
        option_list: vec![Option_::Priority(priority_for_prefix(prefix_len))],
    }
}

/// Builds an NHLFE flow-mod (spec section 4.6, "NHLFE emission").
/// Returns `None` if the next hop's interface cannot be found in the
/// host table, or its gateway MAC cannot be resolved.
pub fn build_nhlfe_flow_mod(vm_id: u64, frame: &NhlfeFrame, host_table: &HostTable) -> Option<FlowMod> {
    let host = host_table.lookup(&frame.next_hop)?;
    if !host.interface.active {
        warn!(interface = %host.interface.name, "cannot send route via inactive interface");
        return None;
    }

    let op = match frame.table_op {
        crate::types::TableOp::Add => FlowModOp::Add,
        crate::types::TableOp::Remove => FlowModOp::Delete,
    };

    let mpls_action = match frame.nhlfe_op {
        NhlfeOp::Push => Action::PushMpls(frame.out_label_host_order()),
        NhlfeOp::Pop => Action::PopMpls,
        NhlfeOp::Swap => Action::SwapMpls(frame.out_label_host_order()),
    };

    let mut action_list = eth_and_ip_actions(&host.interface, host.mac);
    action_list.push(mpls_action);

    Some(FlowMod {
        op,
        vm_id,
        vm_port: host.interface.port,
        match_list: vec![Match::MplsInLabel(frame.in_label)],
        action_list,
        option_list: vec![],
    })
}

/// One controller-punt rule: an (ether-type or ip-proto, optional L4
/// port) tuple that should be sent to the controller rather than
/// forwarded (spec section 4.6).
struct PuntRule {
    ether_type: Option<u16>,
    ip_proto: Option<u8>,
    l4_dst_port: Option<u16>,
}

const ETH_P_ARP: u16 = 0x0806;
const ETH_P_IP: u16 = 0x0800;
const ETH_P_IPV6: u16 = 0x86DD;
const IPPROTO_ICMP: u8 = 1;
const IPPROTO_ICMPV6: u8 = 58;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_OSPF: u8 = 89;
const BGP_PORT: u16 = 179;

fn punt_rules_for(is_ipv6: bool) -> Vec<PuntRule> {
    if is_ipv6 {
        vec![
            PuntRule { ether_type: Some(ETH_P_IPV6), ip_proto: Some(IPPROTO_ICMPV6), l4_dst_port: None },
            PuntRule { ether_type: Some(ETH_P_IPV6), ip_proto: Some(IPPROTO_TCP), l4_dst_port: Some(BGP_PORT) },
            PuntRule { ether_type: Some(ETH_P_IPV6), ip_proto: Some(IPPROTO_OSPF), l4_dst_port: None },
        ]
    } else {
        vec![
            PuntRule { ether_type: Some(ETH_P_ARP), ip_proto: None, l4_dst_port: None },
            PuntRule { ether_type: Some(ETH_P_IP), ip_proto: Some(IPPROTO_ICMP), l4_dst_port: None },
            PuntRule { ether_type: Some(ETH_P_IP), ip_proto: Some(IPPROTO_TCP), l4_dst_port: Some(BGP_PORT) },
            PuntRule { ether_type: Some(ETH_P_IP), ip_proto: Some(IPPROTO_OSPF), l4_dst_port: None },
        ]
    }
}

/// Builds the set of controller-punt flow-mods issued when a port
/// becomes active (spec section 4.6 / 4.9): ARP/ICMP for IPv4,
/// ICMPv6 for IPv6, BGP on TCP/179, OSPF by IP-proto 89, for each
/// address family the interface carries.
pub fn build_controller_punts(vm_id: u64, local: &Interface) -> Vec<FlowMod> {
    let mut mods = Vec::new();
    let has_v4 = local.ip_list.iter().any(|ip| matches!(ip, IpAddress::V4(_))) || local.ip_list.is_empty();
    let has_v6 = local.ip_list.iter().any(|ip| matches!(ip, IpAddress::V6(_)));

    let mut families = Vec::new();
    if has_v4 {
        families.push(false);
    }
    if has_v6 {
        families.push(true);
    }

    for is_ipv6 in families {
        for rule in punt_rules_for(is_ipv6) {
            let mut match_list = Vec::new();
            if let Some(et) = rule.ether_type {
                match_list.push(Match::EtherType(et));
            }
            if let Some(proto) = rule.ip_proto {
                match_list.push(Match::IpProto(proto));
            }
            if let Some(port) = rule.l4_dst_port {
                match_list.push(Match::L4DstPort(port));
            }
            mods.push(FlowMod {
                op: FlowModOp::Controller,
                vm_id,
                vm_port: local.port,
                match_list,
                action_list: vec![],
                option_list: vec![Option_::Priority(PRIORITY_HIGH)],
            });
        }
    }
    mods
}

/// Rebuilds the flow-mod a [`CachedRm`] stood in for, once the owning
/// port has become active again (spec section 4.6, "Port-down cache").
/// `local` must be the interface the cache was keyed on.
pub fn build_replay_flow_mod(vm_id: u64, local: &Interface, cached: &CachedRm) -> FlowMod {
    let mut match_list = vec![ip_match(&cached.addr, cached.prefix_len)];
    if let Some(vlan) = local.vlan {
        match_list.push(Match::Vlan(vlan.as_u16()));
    }
    FlowMod {
        op: cached.op,
        vm_id,
        vm_port: local.port,
        match_list,
        action_list: eth_and_ip_actions(local, cached.gateway_mac),
        option_list: vec![Option_::Priority(priority_for_prefix(cached.prefix_len))],
    }
}

/// The per-port cache of route-entry flow-mods diverted while a port is
/// inactive (spec invariant: `cache[P] != empty => P is inactive`).
#[derive(Clone, Default)]
pub struct PortCache {
    inner: Arc<Mutex<HashMap<u32, Vec<CachedRm>>>>,
}

impl PortCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, port: u32, rm: CachedRm) {
        self.inner.lock().entry(port).or_default().push(rm);
    }

    /// Atomically takes and clears the cache for `port`, so the flush can
    /// never re-populate itself from its own drain (spec testable
    /// property 3).
    pub fn take(&self, port: u32) -> Vec<CachedRm> {
        self.inner.lock().remove(&port).unwrap_or_default()
    }

    pub fn len_for(&self, port: u32) -> usize {
        self.inner.lock().get(&port).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn iface(active: bool) -> Interface {
        Interface {
            port: 1,
            name: "eth1".into(),
            hw_addr: "aa:aa:aa:aa:aa:01".parse().unwrap(),
            vlan: None,
            ip_list: vec![],
            active,
            physical: true,
        }
    }

    /// End-to-end scenario S1 from spec section 8.
    #[test]
    fn s1_resolved_add_matches_literal_values() {
        let route = RouteEntry {
            dst: Ipv4Addr::new(10, 1, 0, 0).into(),
            prefix_len: 16,
            gateway: Ipv4Addr::new(10, 0, 0, 1).into(),
            interface: iface(true),
        };
        let gw_mac: MacAddress = "bb:bb:bb:bb:bb:01".parse().unwrap();
        let fm = build_route_flow_mod(FlowModOp::Add, 1, &route, gw_mac);

        assert_eq!(fm.vm_port, 1);
        assert!(fm.action_list.contains(&Action::SetEthSrc("aa:aa:aa:aa:aa:01".parse().unwrap())));
        assert!(fm.action_list.contains(&Action::SetEthDst(gw_mac)));
        assert_eq!(fm.option_list, vec![Option_::Priority(0x40B0)]);
    }

    #[test]
    fn default_route_has_all_zero_match_and_lowest_priority() {
        let route = RouteEntry {
            dst: Ipv4Addr::UNSPECIFIED.into(),
            prefix_len: 0,
            gateway: Ipv4Addr::new(10, 0, 0, 1).into(),
            interface: iface(true),
        };
        let fm = build_route_flow_mod(FlowModOp::Add, 1, &route, MacAddress::ZERO);
        assert_eq!(
            fm.match_list[0],
            Match::Ipv4 { addr: Ipv4Addr::UNSPECIFIED, mask: Ipv4Addr::UNSPECIFIED }
        );
        assert_eq!(fm.option_list, vec![Option_::Priority(PRIORITY_LOW)]);
    }

    #[test]
    fn host_vs_default_priority_differ_only_by_band() {
        let host = HostEntry {
            ip: Ipv4Addr::new(10, 0, 0, 5).into(),
            mac: MacAddress::ZERO,
            interface: iface(true),
        };
        let default_route = RouteEntry {
            dst: Ipv4Addr::UNSPECIFIED.into(),
            prefix_len: 0,
            gateway: Ipv4Addr::new(10, 0, 0, 1).into(),
            interface: iface(true),
        };
        let host_fm = build_host_flow_mod(FlowModOp::Add, 1, &host);
        let route_fm = build_route_flow_mod(FlowModOp::Add, 1, &default_route, MacAddress::ZERO);

        assert_eq!(host_fm.option_list, vec![Option_::Priority(PRIORITY_LOW + 32 * PRIORITY_BAND)]);
        assert_eq!(route_fm.option_list, vec![Option_::Priority(PRIORITY_LOW)]);
    }

    /// Scenario S4 from spec section 8.
    #[test]
    fn s4_nhlfe_swap_matches_literal_values() {
        let host_table = HostTable::new();
        let next_hop: IpAddress = Ipv4Addr::new(10, 0, 0, 1).into();
        host_table.insert(HostEntry {
            ip: next_hop,
            mac: "cc:cc:cc:cc:cc:01".parse().unwrap(),
            interface: iface(true),
        });

        let frame = NhlfeFrame {
            table_op: crate::types::TableOp::Add,
            next_hop,
            in_label: 100,
            out_label_be: 200u32.to_be(),
            nhlfe_op: NhlfeOp::Swap,
        };

        let fm = build_nhlfe_flow_mod(1, &frame, &host_table).unwrap();
        assert_eq!(fm.op, FlowModOp::Add);
        assert_eq!(fm.match_list, vec![Match::MplsInLabel(100)]);
        assert!(fm.action_list.contains(&Action::SwapMpls(200)));
        assert_eq!(fm.vm_port, 1);
    }

    /// Scenario S3 from spec section 8: the replayed flow-mod matches
    /// what a direct (never-cached) emission would have produced.
    #[test]
    fn replay_matches_direct_emission() {
        let local = iface(true);
        let cached = CachedRm {
            op: FlowModOp::Add,
            addr: Ipv4Addr::new(192, 168, 5, 0).into(),
            prefix_len: 24,
            gateway_mac: "bb:bb:bb:bb:bb:01".parse().unwrap(),
        };
        let replayed = build_replay_flow_mod(1, &local, &cached);

        let route = RouteEntry {
            dst: cached.addr,
            prefix_len: cached.prefix_len,
            gateway: Ipv4Addr::new(10, 0, 0, 1).into(),
            interface: local.clone(),
        };
        let direct = build_route_flow_mod(FlowModOp::Add, 1, &route, cached.gateway_mac);
        assert_eq!(replayed, direct);
    }

    #[test]
    fn port_cache_drains_exactly_once() {
        let cache = PortCache::new();
        cache.push(2, CachedRm {
            op: FlowModOp::Add,
            addr: Ipv4Addr::new(192, 168, 5, 0).into(),
            prefix_len: 24,
            gateway_mac: MacAddress::ZERO,
        });
        assert_eq!(cache.len_for(2), 1);
        let drained = cache.take(2);
        assert_eq!(drained.len(), 1);
        assert_eq!(cache.len_for(2), 0);
        assert!(cache.take(2).is_empty());
    }
}
