//! RFClient: the per-virtual-router agent of a RouteFlow-style
//! distributed router. Translates kernel routing/MPLS updates into
//! flow-modification directives shipped over IPC to a central server
//! that programs physical switches.
//!
//! See `SPEC_FULL.md` for the full component breakdown (C1-C9).

pub mod agent;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod flow_mod;
pub mod host_table;
pub mod interfaces;
pub mod ipc;
pub mod outbound;
pub mod pending_queue;
pub mod port_mapper;
pub mod resolver;
pub mod route_source;
pub mod types;
