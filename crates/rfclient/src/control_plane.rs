//! C9: the control-plane handler. Consumes `PortConfig` messages from the
//! central server, drives each port's ACTIVE/INACTIVE state machine
//! (spec section 4.9), and retires outbound flow-mod credit on ack.
//!
//! Ported from the original's `RFClient::process` (`RFClient.cc`), which
//! held `ifMutex` for the whole switch statement; here the lock lives
//! inside [`crate::interfaces::InterfaceRegistry`] itself, so each branch
//! below only takes it for the single operation it actually needs.

use crate::flow_mod::{self, FlowModOp, PortCache};
use crate::interfaces::InterfaceRegistry;
use crate::ipc::{IpcMessage, IpcTransport, PortConfig, PortConfigOp};
use crate::outbound::{OutboundSender, OutstandingCounter};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ControlPlaneContext {
    pub interfaces: InterfaceRegistry,
    pub outbound: OutboundSender,
    pub port_cache: PortCache,
    pub outstanding: OutstandingCounter,
    pub vm_id: u64,
}

/// Applies one `PortConfig` message (spec section 4.9's state-machine
/// table). Split out from [`run_control_plane`] so tests can drive it
/// without a live transport.
fn handle_port_config(config: PortConfig, ctx: &ControlPlaneContext) {
    match config.operation {
        PortConfigOp::MapRequest => {
            warn!(vm_port = config.vm_port, "received deprecated PortConfig MAP_REQUEST");
        }
        PortConfigOp::Reset => {
            info!(vm_port = config.vm_port, "port reset, marking inactive");
            ctx.interfaces.set_active_by_port(config.vm_port, false);
        }
        PortConfigOp::MapSuccess => {
            info!(vm_port = config.vm_port, "port mapped, marking active");
            ctx.interfaces.set_active_by_port(config.vm_port, true);
            flush_port(config.vm_port, ctx);
        }
        PortConfigOp::RouteModAck => {
            ctx.outstanding.decrement();
        }
    }
}

/// Issues the controller-punt flow-mods for a newly active port, then
/// replays and clears whatever the per-port cache accumulated while it
/// was inactive (spec section 4.6/4.9). The punt flow-mods go out first,
/// matching scenario S3 in spec section 8.
fn flush_port(vm_port: u32, ctx: &ControlPlaneContext) {
    let Some(iface) = ctx.interfaces.lookup_by_port(vm_port) else {
        warn!(vm_port, "port activated but no matching interface registered");
        return;
    };

    for fm in flow_mod::build_controller_punts(ctx.vm_id, &iface) {
        ctx.outbound.push(fm);
    }

    let cached = ctx.port_cache.take(vm_port);
    if !cached.is_empty() {
        info!(vm_port, count = cached.len(), "replaying cached route flow-mods");
    }
    for entry in cached {
        let fm = flow_mod::build_replay_flow_mod(ctx.vm_id, &iface, &entry);
        ctx.outbound.push(fm);
    }
}

/// Runs until the transport errors out (the IPC layer closing is treated
/// the same as any other transport error per spec section 7's
/// disposition table: logged, not fatal, by the caller).
pub async fn run_control_plane(
    transport: Arc<dyn IpcTransport>,
    ctx: ControlPlaneContext,
) -> crate::error::Result<()> {
    loop {
        match transport.recv().await? {
            IpcMessage::PortConfig(config) => handle_port_config(config, &ctx),
            other => warn!(?other, "unexpected inbound IPC message, dropping"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_mod::CachedRm;
    use crate::outbound::outbound_queue;
    use crate::types::Interface;

    fn iface(port: u32, active: bool) -> Interface {
        Interface {
            port,
            name: format!("eth{port}"),
            hw_addr: "aa:aa:aa:aa:aa:01".parse().unwrap(),
            vlan: None,
            ip_list: vec![],
            active,
            physical: true,
        }
    }

    fn context() -> (ControlPlaneContext, tokio::sync::mpsc::UnboundedReceiver<flow_mod::FlowMod>) {
        let (outbound, rx) = outbound_queue();
        let ctx = ControlPlaneContext {
            interfaces: InterfaceRegistry::new(),
            outbound,
            port_cache: PortCache::new(),
            outstanding: OutstandingCounter::new(),
            vm_id: 1,
        };
        (ctx, rx)
    }

    #[test]
    fn reset_marks_interface_inactive() {
        let (ctx, _rx) = context();
        ctx.interfaces.insert(iface(2, true));
        handle_port_config(PortConfig { vm_port: 2, operation: PortConfigOp::Reset }, &ctx);
        assert!(!ctx.interfaces.lookup_by_port(2).unwrap().active);
    }

    /// Scenario S3 from spec section 8: on MAP_SUCCESS, controller-punt
    /// flow-mods are emitted before the replayed cached route, and the
    /// cache ends up empty.
    #[test]
    fn map_success_flushes_cache_after_punt_rules() {
        let (ctx, mut rx) = context();
        ctx.interfaces.insert(iface(2, false));
        ctx.port_cache.push(2, CachedRm {
            op: FlowModOp::Add,
            addr: std::net::Ipv4Addr::new(192, 168, 5, 0).into(),
            prefix_len: 24,
            gateway_mac: "bb:bb:bb:bb:bb:01".parse().unwrap(),
        });

        handle_port_config(PortConfig { vm_port: 2, operation: PortConfigOp::MapSuccess }, &ctx);

        assert!(ctx.interfaces.lookup_by_port(2).unwrap().active);
        assert_eq!(ctx.port_cache.len_for(2), 0);

        let mut saw_controller = false;
        let mut saw_route = false;
        while let Ok(fm) = rx.try_recv() {
            match fm.op {
                FlowModOp::Controller => {
                    saw_controller = true;
                    assert!(!saw_route, "controller punts must precede the cached replay");
                }
                FlowModOp::Add => saw_route = true,
                FlowModOp::Delete => {}
            }
        }
        assert!(saw_controller && saw_route);
    }

    #[test]
    fn route_mod_ack_decrements_outstanding() {
        let (ctx, _rx) = context();
        ctx.outstanding.increment();
        ctx.outstanding.increment();
        handle_port_config(PortConfig { vm_port: 1, operation: PortConfigOp::RouteModAck }, &ctx);
        assert_eq!(ctx.outstanding.get(), 1);
    }

    #[test]
    fn map_request_is_logged_and_ignored() {
        let (ctx, mut rx) = context();
        handle_port_config(PortConfig { vm_port: 9, operation: PortConfigOp::MapRequest }, &ctx);
        assert!(rx.try_recv().is_err());
    }
}
