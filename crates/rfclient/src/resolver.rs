//! C4: the gateway resolver. Owns the route table and unresolved set,
//! drains C3, and retries unresolved gateways on a cooldown.
//!
//! Ported from the original's `GWResolverCb` thread (`FlowTable.cc`):
//! that code guarded a route table shared across threads with a mutex.
//! Here the route table is owned outright by the single task running
//! [`run_resolver`], so no lock is needed -- only [`HostTable`] and the
//! outbound queue, which other tasks also touch, stay behind shared
//! handles.

use crate::flow_mod::{self, FlowModOp, PortCache};
use crate::host_table::HostTable;
use crate::outbound::OutboundSender;
use crate::pending_queue::PendingQueueReceiver;
use crate::types::{PendingRoute, RouteEntry, RouteOp};
use parking_lot::Mutex;
use sonic_types::IpAddress;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// How long an unresolved route waits before the resolver retries its
/// gateway, matching the original's `ROUTE_COOLDOWN` (5000ms).
pub const ROUTE_COOLDOWN: Duration = Duration::from_millis(5000);

/// Guards against issuing a second neighbour-discovery connect for a
/// gateway that already has one in flight (original: `pendingNeighbours`,
/// keyed by gateway string, guarded by `ndMutex`).
#[derive(Clone, Default)]
pub struct PendingNd {
    inflight: Arc<Mutex<HashSet<String>>>,
}

impl PendingNd {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_start(&self, key: &str) -> bool {
        let mut g = self.inflight.lock();
        if g.contains(key) {
            false
        } else {
            g.insert(key.to_string());
            true
        }
    }

    fn finish(&self, key: &str) {
        self.inflight.lock().remove(key);
    }

    /// Called once the host table gains a real entry for `host`, so a
    /// stale in-flight resolution doesn't block a future retry (original:
    /// `stopND`, invoked from `updateHostTable` on `RTM_NEWNEIGH`).
    pub fn stop(&self, host: &IpAddress) {
        self.inflight.lock().remove(&host.to_string());
    }
}

/// Forces the kernel to attempt neighbor resolution for `gateway` by
/// opening a non-blocking TCP connect and walking away from it -- the
/// connect itself is never awaited to completion, only issued (original:
/// `initiateND`, a raw non-blocking `connect()`). IPv6 is refused
/// outright, matching the original's explicit refusal for that address
/// family (a documented gap, not a bug; see `DESIGN.md`).
fn spawn_neighbor_discovery(gateway: IpAddress, pending_nd: PendingNd) {
    let key = gateway.to_string();
    if !pending_nd.try_start(&key) {
        debug!(gateway = %key, "already doing neighbor discovery");
        return;
    }
    let IpAddress::V4(_) = gateway else {
        warn!(gateway = %key, "refusing neighbor discovery for IPv6");
        pending_nd.finish(&key);
        return;
    };

    debug!(gateway = %key, "starting neighbor discovery");
    let addr = format!("{key}:179");
    // Spawning (rather than awaiting) is what makes this "issue and walk
    // away": the runtime starts driving the connect the moment it is
    // spawned, but nothing here waits on its outcome. The in-flight flag
    // is cleared solely by `PendingNd::stop()` on the corresponding
    // host-table write (`route_source::apply_host_entry`), never by this
    // task finishing -- there must be exactly one removal path.
    tokio::spawn(async move {
        let _ = TcpStream::connect(&addr).await;
    });
}

struct RouteTable {
    routes: HashMap<String, RouteEntry>,
    unresolved: HashSet<String>,
}

impl RouteTable {
    fn new() -> Self {
        RouteTable { routes: HashMap::new(), unresolved: HashSet::new() }
    }
}

/// Everything the resolver needs to emit or cache a resolved route,
/// bundled so the per-item processing functions don't take a dozen
/// arguments.
#[derive(Clone)]
pub struct ResolverContext {
    pub host_table: HostTable,
    pub outbound: OutboundSender,
    pub port_cache: PortCache,
    pub pending_nd: PendingNd,
    pub vm_id: u64,
}

/// Emits the flow-mod if the destination port is active, otherwise
/// caches it for replay once the port comes back (spec section 4.6;
/// the original instead dropped the flow-mod here, a redesign recorded
/// in `DESIGN.md` open question 1... see resolution notes for 4.6).
fn emit_or_cache(op: FlowModOp, route: &RouteEntry, ctx: &ResolverContext) {
    let gateway_mac = ctx.host_table.mac_for(&route.gateway).expect("caller verified resolution");
    if route.interface.active {
        let fm = flow_mod::build_route_flow_mod(op, ctx.vm_id, route, gateway_mac);
        ctx.outbound.push(fm);
    } else {
        warn!(interface = %route.interface.name, "port inactive, caching route emission");
        ctx.port_cache.push(
            route.interface.port,
            flow_mod::CachedRm { op, addr: route.dst, prefix_len: route.prefix_len, gateway_mac },
        );
    }
}

impl RouteTable {
    fn apply(&mut self, pending: PendingRoute, ctx: &ResolverContext) {
        let key = pending.entry.key();
        let resolved = ctx.host_table.contains(&pending.entry.gateway);

        match pending.op {
            RouteOp::Add => {
                if self.routes.contains_key(&key) {
                    warn!(route = %key, "received duplicate route add");
                    return;
                }
                self.routes.insert(key.clone(), pending.entry.clone());
                if resolved {
                    debug!(route = %key, "adding route");
                    emit_or_cache(FlowModOp::Add, &pending.entry, ctx);
                } else {
                    warn!(route = %key, "cannot resolve gateway, will retry");
                    self.unresolved.insert(key);
                    spawn_neighbor_discovery(pending.entry.gateway, ctx.pending_nd.clone());
                }
            }
            RouteOp::Delete => {
                if self.routes.remove(&key).is_some() {
                    self.unresolved.remove(&key);
                    debug!(route = %key, "deleting route");
                    emit_or_cache_delete(&pending.entry, ctx);
                } else {
                    warn!(route = %key, "received route removal but not in routing table");
                }
            }
        }
    }

    /// Retries every still-unresolved gateway; anything that resolves
    /// this round is emitted and dropped from the unresolved set.
    fn sweep_unresolved(&mut self, ctx: &ResolverContext) {
        if self.unresolved.is_empty() {
            return;
        }
        let mut newly_resolved = Vec::new();
        for key in &self.unresolved {
            let Some(route) = self.routes.get(key) else { continue };
            if ctx.host_table.contains(&route.gateway) {
                info!(route = %key, "previously unresolved route now resolvable");
                emit_or_cache(FlowModOp::Add, route, ctx);
                newly_resolved.push(key.clone());
            } else {
                debug!(route = %key, "still unresolved, retrying");
                spawn_neighbor_discovery(route.gateway, ctx.pending_nd.clone());
            }
        }
        for key in newly_resolved {
            self.unresolved.remove(&key);
        }
    }

    fn unresolved_is_empty(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// A delete emits unconditionally regardless of resolution state (a
/// withdrawal the controller needs either way); it still respects the
/// active/inactive split since RFServer needs the output port either way.
fn emit_or_cache_delete(route: &RouteEntry, ctx: &ResolverContext) {
    let gateway_mac = ctx.host_table.mac_for(&route.gateway).unwrap_or(sonic_types::MacAddress::ZERO);
    if route.interface.active {
        let fm = flow_mod::build_route_flow_mod(FlowModOp::Delete, ctx.vm_id, route, gateway_mac);
        ctx.outbound.push(fm);
    } else {
        ctx.port_cache.push(
            route.interface.port,
            flow_mod::CachedRm {
                op: FlowModOp::Delete,
                addr: route.dst,
                prefix_len: route.prefix_len,
                gateway_mac,
            },
        );
    }
}

/// Runs until the pending-route queue closes. While unresolved routes
/// remain, retries them every [`ROUTE_COOLDOWN`] in addition to draining
/// whatever new pending routes arrive in the meantime.
pub async fn run_resolver(mut queue: PendingQueueReceiver, ctx: ResolverContext) {
    let mut table = RouteTable::new();
    loop {
        let drained = if table.unresolved_is_empty() {
            queue.drain().await
        } else {
            tokio::select! {
                drained = queue.drain() => drained,
                _ = tokio::time::sleep(ROUTE_COOLDOWN) => Vec::new(),
            }
        };

        if drained.is_empty() && table.unresolved_is_empty() {
            break;
        }
        for item in drained {
            table.apply(item, &ctx);
        }
        table.sweep_unresolved(&ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_mod::FlowMod;
    use crate::outbound::outbound_queue;
    use crate::pending_queue::pending_queue;
    use crate::types::{HostEntry, Interface};
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

    fn route(active: bool) -> RouteEntry {
        RouteEntry {
            dst: Ipv4Addr::new(10, 1, 0, 0).into(),
            prefix_len: 16,
            gateway: Ipv4Addr::new(10, 0, 0, 1).into(),
            interface: iface(active),
        }
    }

    fn context() -> (ResolverContext, tokio::sync::mpsc::UnboundedReceiver<FlowMod>) {
        let (outbound, rx) = outbound_queue();
        let ctx = ResolverContext {
            host_table: HostTable::new(),
            outbound,
            port_cache: PortCache::new(),
            pending_nd: PendingNd::new(),
            vm_id: 7,
        };
        (ctx, rx)
    }

    /// Scenario S2 from spec section 8: a route whose gateway is already
    /// resolved is emitted immediately, without ever touching the
    /// unresolved set.
    #[tokio::test]
    async fn resolved_gateway_emits_immediately() {
        let (ctx, mut rx) = context();
        let r = route(true);
        ctx.host_table.insert(HostEntry {
            ip: r.gateway,
            mac: "bb:bb:bb:bb:bb:01".parse().unwrap(),
            interface: r.interface.clone(),
        });

        let mut table = RouteTable::new();
        table.apply(PendingRoute::new(RouteOp::Add, r.clone()), &ctx);

        assert!(table.unresolved_is_empty());
        let fm = rx.try_recv().expect("flow-mod should have been queued");
        assert_eq!(fm.vm_port, 1);
    }

    /// Testable property 5 (section 8): an unresolved gateway is retried
    /// on the next sweep and resolves once the host table catches up,
    /// without the caller resubmitting the route.
    #[tokio::test]
    async fn unresolved_gateway_resolves_on_sweep() {
        let (ctx, mut rx) = context();
        let r = route(true);

        let mut table = RouteTable::new();
        table.apply(PendingRoute::new(RouteOp::Add, r.clone()), &ctx);
        assert!(!table.unresolved_is_empty());
        assert!(rx.try_recv().is_err());

        ctx.host_table.insert(HostEntry {
            ip: r.gateway,
            mac: "bb:bb:bb:bb:bb:01".parse().unwrap(),
            interface: r.interface.clone(),
        });
        table.sweep_unresolved(&ctx);

        assert!(table.unresolved_is_empty());
        assert!(rx.try_recv().is_ok());
    }

    /// Scenario S5 from spec section 8: a duplicate ADD is logged and
    /// dropped, and a DELETE for an unknown route is logged and ignored;
    /// neither panics nor double-emits.
    #[tokio::test]
    async fn duplicate_add_and_unknown_delete_are_ignored() {
        let (ctx, mut rx) = context();
        let r = route(true);
        ctx.host_table.insert(HostEntry {
            ip: r.gateway,
            mac: "bb:bb:bb:bb:bb:01".parse().unwrap(),
            interface: r.interface.clone(),
        });

        let mut table = RouteTable::new();
        table.apply(PendingRoute::new(RouteOp::Add, r.clone()), &ctx);
        table.apply(PendingRoute::new(RouteOp::Add, r.clone()), &ctx);
        assert_eq!(table.routes.len(), 1);

        let mut unknown = route(true);
        unknown.dst = Ipv4Addr::new(192, 168, 9, 0).into();
        table.apply(PendingRoute::new(RouteOp::Delete, unknown), &ctx);

        // Exactly one flow-mod from the single successful add.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn delete_removes_from_route_and_unresolved_sets() {
        let (ctx, mut rx) = context();
        let r = route(true);

        let mut table = RouteTable::new();
        table.apply(PendingRoute::new(RouteOp::Add, r.clone()), &ctx);
        assert!(!table.unresolved_is_empty());
        let _ = rx.try_recv();

        table.apply(PendingRoute::new(RouteOp::Delete, r.clone()), &ctx);
        assert!(table.routes.is_empty());
        assert!(table.unresolved_is_empty());
    }

    #[tokio::test]
    async fn pending_nd_rejects_ipv6_gateway() {
        let pending_nd = PendingNd::new();
        let gw: IpAddress = "fe80::1".parse().unwrap();
        // Should not register as in-flight since it's rejected up front.
        spawn_neighbor_discovery(gw, pending_nd.clone());
        tokio::task::yield_now().await;
        assert!(pending_nd.try_start(&gw.to_string()));
    }
}
