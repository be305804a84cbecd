//! Core data model shared across the ingest, resolution, and emission
//! subsystems (spec section 3).

use sonic_types::{IpAddress, MacAddress, VlanId};
use std::time::Instant;

/// A locally enumerated NIC. Created once at startup; the interface list
/// itself is immutable afterwards. Only `active` ever changes, guarded by
/// the owning [`crate::interfaces::InterfaceRegistry`]'s lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub port: u32,
    pub name: String,
    pub hw_addr: MacAddress,
    pub vlan: Option<VlanId>,
    pub ip_list: Vec<IpAddress>,
    pub active: bool,
    pub physical: bool,
}

impl Interface {
    pub fn is_vlan_subinterface(&self) -> bool {
        self.vlan.is_some()
    }
}

/// `IP -> (MAC, interface)`. Overwritten on update for the same IP; never
/// deleted for the agent's lifetime (see `DESIGN.md` open question 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub ip: IpAddress,
    pub mac: MacAddress,
    pub interface: Interface,
}

/// A route as known to the kernel or FPM peer. `key()` is the route
/// table's primary key, matching spec section 3 verbatim:
/// `"dst/prefix via gateway"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub dst: IpAddress,
    pub prefix_len: u8,
    pub gateway: IpAddress,
    pub interface: Interface,
}

impl RouteEntry {
    pub fn key(&self) -> String {
        format!("{}/{} via {}", self.dst, self.prefix_len, self.gateway)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOp {
    Add,
    Delete,
}

/// Queued for C4; `ready_at` may be pushed forward by `ROUTE_COOLDOWN` on
/// a retry so fresh events are never starved behind a slow retry.
#[derive(Debug, Clone)]
pub struct PendingRoute {
    pub op: RouteOp,
    pub entry: RouteEntry,
    pub ready_at: Instant,
}

impl PendingRoute {
    pub fn new(op: RouteOp, entry: RouteEntry) -> Self {
        PendingRoute {
            op,
            entry,
            ready_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOp {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NhlfeOp {
    Push,
    Pop,
    Swap,
}

/// An MPLS label-switching entry decoded from an FPM `NHLFE` frame.
/// Transient: produced, translated into a [`crate::flow_mod::FlowMod`],
/// and discarded.
///
/// `out_label` arrives network-byte-order and is normalized with
/// `u32::from_be` before use; `in_label` is used as received. This
/// asymmetry exists in the original RouteFlow wire format and is
/// preserved deliberately (see `DESIGN.md` open question 2), not a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NhlfeFrame {
    pub table_op: TableOp,
    pub next_hop: IpAddress,
    pub in_label: u32,
    pub out_label_be: u32,
    pub nhlfe_op: NhlfeOp,
}

impl NhlfeFrame {
    pub fn out_label_host_order(&self) -> u32 {
        u32::from_be(self.out_label_be)
    }
}
