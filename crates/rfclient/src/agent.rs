//! Composition root: owns every shared table and spawns every task that
//! the original ran as a dedicated OS thread (spec section 5), replacing
//! the C++ original's process-scope globals (`RFClient.hh`'s member
//! fields threaded through constructors) with one owned `Agent` value
//! (Design Notes section 9, "globals in the source").

use crate::config::Config;
use crate::control_plane::{self, ControlPlaneContext};
use crate::error::{Disposition, Result, RfClientError};
use crate::flow_mod::PortCache;
use crate::host_table::HostTable;
use crate::interfaces::{self, InterfaceRegistry};
use crate::ipc::{IpcMessage, IpcTransport, PortRegister, TcpIpcTransport};
use crate::outbound::{self, OutstandingCounter};
use crate::pending_queue;
use crate::port_mapper;
use crate::resolver::{self, PendingNd, ResolverContext};
use crate::route_source::fpm::{FpmRouteSource, FPM_DEFAULT_PORT};
use crate::route_source::netlink::{self, NetlinkRouteSource};
use crate::route_source::{RouteSource, RouteSourceContext};
use std::sync::Arc;
use tracing::{error, info, warn};

/// How long to poll `/sys/class/net/<name>/operstate` before giving up
/// on a single interface (spec section 4.1: "blocks until the interface
/// reports running"). 100ms * 100 = 10s per interface, a generous but
/// bounded wait so one dead NIC cannot hang startup forever.
const WAIT_RUNNING_ATTEMPTS: u32 = 100;

/// Credit-window size for the outbound pump (spec section 3's emission
/// invariant 2: "at most N outstanding", default 1).
const MAX_OUTSTANDING: u64 = 1;

pub struct Agent {
    interfaces: InterfaceRegistry,
    host_table: HostTable,
    port_cache: PortCache,
    pending_nd: PendingNd,
    outstanding: OutstandingCounter,
    vm_id: u64,
    fpm: bool,
    transport: Arc<dyn IpcTransport>,
}

impl Agent {
    /// Enumerates local interfaces, waits for each to come up, registers
    /// it with the central server, and connects the IPC transport (spec
    /// sections 4.1 and 6). Fails fatally only if zero interfaces end up
    /// usable or the transport cannot connect (spec section 6's exit
    /// codes).
    pub async fn bootstrap(config: &Config) -> Result<Agent> {
        let candidates = interfaces::load_interfaces()?;

        let vm_id = match config.vm_id {
            Some(id) => id,
            None => {
                let vm_iface = candidates
                    .iter()
                    .find(|i| i.name == config.interface)
                    .ok_or_else(|| RfClientError::InterfaceNotFound(config.interface.clone()))?;
                interfaces::vm_id_from_mac(&vm_iface.hw_addr)
            }
        };

        let transport: Arc<dyn IpcTransport> = Arc::new(TcpIpcTransport::connect(&config.ipc_address).await?);

        let registry = InterfaceRegistry::new();
        for mut iface in candidates {
            if !interfaces::wait_running(&iface.name, WAIT_RUNNING_ATTEMPTS).await {
                continue;
            }
            iface.active = false;
            // VLAN subinterfaces share a vm_port with their physical
            // parent (see InterfaceRegistry::set_active_by_port) and are
            // kept in the registry for lookup, but only the physical
            // interface itself gets a PortRegister -- otherwise the
            // controller sees one duplicate registration per subinterface.
            if iface.physical {
                info!(interface = %iface.name, port = iface.port, "registering port");
                transport
                    .send(IpcMessage::PortRegister(PortRegister {
                        vm_id,
                        vm_port: iface.port,
                        mac: iface.hw_addr,
                    }))
                    .await?;
            }
            registry.insert(iface);
        }
        if registry.is_empty() {
            return Err(RfClientError::NoUsableInterfaces);
        }

        Ok(Agent {
            interfaces: registry,
            host_table: HostTable::new(),
            port_cache: PortCache::new(),
            pending_nd: PendingNd::new(),
            outstanding: OutstandingCounter::new(),
            vm_id,
            fpm: config.fpm,
            transport,
        })
    }

    /// Spawns every task (C2 route source, the always-on neighbor
    /// listener, C4's resolver, C7's pump, C8's mapper, C9's control
    /// plane) and races them to the first exit. Any one of these tasks
    /// returning is unexpected -- each is meant to loop forever -- so the
    /// agent treats it as a reason to shut down; [`report_exit`] only
    /// decides, via [`Disposition`], whether that gets logged as a fatal
    /// error or a plain warning before the agent unwinds.
    pub async fn run(self) -> Result<()> {
        let (pending_tx, pending_rx) = pending_queue::pending_queue();
        let (outbound_tx, outbound_rx) = outbound::outbound_queue();

        let route_ctx = RouteSourceContext {
            interfaces: self.interfaces.clone(),
            host_table: self.host_table.clone(),
            pending: pending_tx,
            outbound: outbound_tx.clone(),
            port_cache: self.port_cache.clone(),
            pending_nd: self.pending_nd.clone(),
            vm_id: self.vm_id,
        };

        let neighbor_ctx = route_ctx.clone();
        let neighbor_task = tokio::spawn(async move {
            let res = netlink::run_neighbor_listener(neighbor_ctx).await;
            ("neighbor-listener", res)
        });

        let route_source_ctx = route_ctx.clone();
        let fpm = self.fpm;
        let route_task = tokio::spawn(async move {
            let res: Result<()> = if fpm {
                FpmRouteSource { port: FPM_DEFAULT_PORT }.run(route_source_ctx).await
            } else {
                NetlinkRouteSource.run(route_source_ctx).await
            };
            ("route-source", res)
        });

        let resolver_ctx = ResolverContext {
            host_table: self.host_table.clone(),
            outbound: outbound_tx.clone(),
            port_cache: self.port_cache.clone(),
            pending_nd: self.pending_nd.clone(),
            vm_id: self.vm_id,
        };
        let resolver_task = tokio::spawn(async move {
            resolver::run_resolver(pending_rx, resolver_ctx).await;
            ("resolver", Ok(()))
        });

        let pump_transport = self.transport.clone();
        let pump_outstanding = self.outstanding.clone();
        let pump_task = tokio::spawn(async move {
            let res = outbound::run_outbound_pump(outbound_rx, pump_transport, pump_outstanding, MAX_OUTSTANDING).await;
            ("outbound-pump", res)
        });

        let mapper_interfaces = self.interfaces.clone();
        let mapper_vm_id = self.vm_id;
        let mapper_task = tokio::spawn(async move {
            port_mapper::run_port_mapper(mapper_interfaces, mapper_vm_id).await;
            ("port-mapper", Ok(()))
        });

        let control_plane_ctx = ControlPlaneContext {
            interfaces: self.interfaces.clone(),
            outbound: outbound_tx.clone(),
            port_cache: self.port_cache.clone(),
            outstanding: self.outstanding.clone(),
            vm_id: self.vm_id,
        };
        let control_plane_transport = self.transport.clone();
        let control_plane_task = tokio::spawn(async move {
            let res = control_plane::run_control_plane(control_plane_transport, control_plane_ctx).await;
            ("control-plane", res)
        });

        tokio::select! {
            res = neighbor_task => report_exit(res),
            res = route_task => report_exit(res),
            res = resolver_task => report_exit(res),
            res = pump_task => report_exit(res),
            res = mapper_task => report_exit(res),
            res = control_plane_task => report_exit(res),
        }
    }
}

fn report_exit(joined: std::result::Result<(&'static str, Result<()>), tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok((name, Ok(()))) => {
            warn!(task = name, "task exited cleanly, shutting down agent");
            Ok(())
        }
        Ok((name, Err(e))) => {
            match e.disposition() {
                Disposition::Fatal => error!(task = name, error = %e, "fatal error, shutting down agent"),
                _ => warn!(task = name, error = %e, "task exited with a non-fatal error"),
            }
            Err(e)
        }
        Err(join_err) => {
            error!(error = %join_err, "task panicked");
            Err(RfClientError::Ipc(join_err.to_string()))
        }
    }
}
