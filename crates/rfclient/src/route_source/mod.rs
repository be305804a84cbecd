//! C2: route-source adapters. Two independent ways to learn about
//! kernel routing/neighbor state feed the same downstream consumers
//! (C3's pending queue and C5's host table) through one capability
//! trait, so nothing past this module needs to know which adapter is
//! active (Design Notes section 9: "two adapters, one downstream").

pub mod fpm;
pub mod netlink;

use crate::error::Result;
use crate::flow_mod::PortCache;
use crate::host_table::HostTable;
use crate::interfaces::InterfaceRegistry;
use crate::outbound::OutboundSender;
use crate::pending_queue::PendingQueueSender;
use crate::resolver::PendingNd;
use async_trait::async_trait;

/// Shared handles every adapter needs to turn a raw kernel/FPM event
/// into the agent's data model. `outbound`/`port_cache` are here only
/// for the FPM-adapter's NHLFE path, which (like the original) resolves
/// and emits inline rather than going through C3/C4 -- an NHLFE's next
/// hop is only ever encountered once it is already a host-table entry.
/// `pending_nd` lets a neighbor-reachable event close out the resolver's
/// in-flight discovery socket for that gateway (spec section 4.4.1).
#[derive(Clone)]
pub struct RouteSourceContext {
    pub interfaces: InterfaceRegistry,
    pub host_table: HostTable,
    pub pending: PendingQueueSender,
    pub outbound: OutboundSender,
    pub port_cache: PortCache,
    pub pending_nd: PendingNd,
    pub vm_id: u64,
}

/// A source of route and neighbor updates. Exactly one adapter is
/// active per agent instance, selected at startup by `--netlink`/`--fpm`
/// (spec section 6); both publish to the same [`RouteSourceContext`].
#[async_trait]
pub trait RouteSource: Send + Sync {
    /// Runs until the underlying socket closes or a fatal error occurs.
    async fn run(&self, ctx: RouteSourceContext) -> Result<()>;
}

/// Writes a freshly-resolved neighbor into the host table and fans out
/// its side effects (spec section 4.2, "Neighbor events for reachable
/// entries translate into host-table writes and, if the interface is
/// active, a host-entry flow-mod emission"): closes out any in-flight
/// neighbor-discovery socket for this IP (section 4.4.1), then emits
/// the host-entry flow-mod if the owning interface is active, or drops
/// it with a warning otherwise (section 4.6 treats host entries and
/// route entries differently on an inactive port: the former is
/// dropped, the latter cached).
pub(crate) fn apply_host_entry(ctx: &RouteSourceContext, entry: crate::types::HostEntry) {
    ctx.pending_nd.stop(&entry.ip);
    let active = entry.interface.active;
    let (ip, name) = (entry.ip, entry.interface.name.clone());
    ctx.host_table.insert(entry.clone());
    if active {
        let fm = crate::flow_mod::build_host_flow_mod(crate::flow_mod::FlowModOp::Add, ctx.vm_id, &entry);
        ctx.outbound.push(fm);
    } else {
        tracing::warn!(interface = %name, ip = %ip, "host entry resolved on inactive port, dropping emission");
    }
}
