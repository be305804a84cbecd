//! C2 FPM-adapter: a TCP server speaking the Forwarding Plane Manager
//! framing (spec section 6), one client at a time, matching the
//! original `FPMServer::fpm_serve`'s accept-then-serve-forever loop.
//!
//! Netlink-encoded `NETLINK` frames carry raw `RTM_NEWROUTE`/
//! `RTM_DELROUTE` payloads; this adapter decodes only the NHLFE vendor
//! extension directly (the byte layout is fixed, not netlink-encoded),
//! and otherwise reuses the NL-adapter's netlink message decoder for
//! the embedded route payload. `FTN` is accepted but not implemented,
//! matching the original (`FPM FTN not yet implemented`).

use crate::error::{Result, RfClientError};
use crate::types::{NhlfeFrame, NhlfeOp, TableOp};
use async_trait::async_trait;
use sonic_types::IpAddress;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::{RouteSource, RouteSourceContext};

pub const FPM_DEFAULT_PORT: u16 = 2620;
const FPM_HEADER_LEN: usize = 4;
const FPM_MSG_TYPE_NETLINK: u8 = 1;
const FPM_MSG_TYPE_NHLFE: u8 = 2;
const FPM_MSG_TYPE_FTN: u8 = 3;

/// The fixed-layout NHLFE vendor payload (spec section 6): version byte,
/// ip_version byte, a 16-byte next-hop slot (only the leading 4 or 16
/// bytes are meaningful depending on `ip_version`), an op byte, then
/// `in_label`/`out_label` as big-endian u32s.
fn parse_nhlfe_payload(payload: &[u8]) -> Result<NhlfeFrame> {
    if payload.len() < 1 + 1 + 16 + 1 + 4 + 4 {
        return Err(RfClientError::Malformed("NHLFE payload too short".into()));
    }

    let table_op = match payload[0] {
        1 => TableOp::Add,
        2 => TableOp::Remove,
        other => return Err(RfClientError::UnknownOpCode(format!("NHLFE table_op {other}"))),
    };
    let ip_version = payload[1];
    let next_hop_bytes = &payload[2..18];
    let nhlfe_op_byte = payload[18];
    // `in_label` is read the way the original vendor struct was: a raw
    // memory cast with no byte-swap, unlike `out_label` below (see
    // `NhlfeFrame`'s doc comment and `DESIGN.md` open question 2).
    let in_label = u32::from_ne_bytes(payload[19..23].try_into().unwrap());
    let out_label_be = u32::from_be_bytes(payload[23..27].try_into().unwrap());

    let next_hop = match ip_version {
        4 => {
            let octets: [u8; 4] = next_hop_bytes[0..4].try_into().unwrap();
            IpAddress::from(std::net::Ipv4Addr::from(octets))
        }
        6 => {
            let octets: [u8; 16] = next_hop_bytes.try_into().unwrap();
            IpAddress::from(std::net::Ipv6Addr::from(octets))
        }
        other => {
            return Err(RfClientError::Malformed(format!("unrecognized NHLFE ip_version {other}")))
        }
    };

    let nhlfe_op = match nhlfe_op_byte {
        1 => NhlfeOp::Push,
        2 => NhlfeOp::Pop,
        3 => NhlfeOp::Swap,
        other => return Err(RfClientError::UnknownOpCode(format!("NHLFE nhlfe_op {other}"))),
    };

    Ok(NhlfeFrame {
        table_op,
        next_hop,
        in_label,
        // stored big-endian on the wire as received; normalized to host
        // order only by `out_label_host_order()`, never here -- this is
        // the documented asymmetry from the original vendor struct.
        out_label_be: out_label_be.to_be(),
        nhlfe_op,
    })
}

async fn read_frame(stream: &mut TcpStream) -> Result<(u8, Vec<u8>)> {
    let mut header = [0u8; FPM_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let msg_type = header[1];
    let total_len = u16::from_be_bytes([header[2], header[3]]) as usize;
    if total_len < FPM_HEADER_LEN {
        return Err(RfClientError::Fpm(format!("frame length {total_len} shorter than header")));
    }
    let mut payload = vec![0u8; total_len - FPM_HEADER_LEN];
    stream.read_exact(&mut payload).await?;
    Ok((msg_type, payload))
}

/// NHLFE frames resolve and emit inline, the same way `updateNHLFE` did
/// in the original: the next hop must already be a host-table entry
/// (there is no pending/unresolved state for NHLFEs), so there is
/// nothing for C3/C4 to do here.
fn handle_nhlfe(payload: &[u8], ctx: &RouteSourceContext) {
    match parse_nhlfe_payload(payload) {
        Ok(frame) => {
            info!(
                next_hop = %frame.next_hop,
                in_label = frame.in_label,
                out_label = frame.out_label_host_order(),
                op = ?frame.nhlfe_op,
                "fpm NHLFE frame"
            );
            match crate::flow_mod::build_nhlfe_flow_mod(ctx.vm_id, &frame, &ctx.host_table) {
                Some(fm) => ctx.outbound.push(fm),
                None => warn!(next_hop = %frame.next_hop, "failed to locate interface or resolve gateway for LSP"),
            }
        }
        Err(e) => warn!(error = %e, "malformed NHLFE frame, dropping"),
    }
}

async fn serve_client(mut stream: TcpStream, ctx: RouteSourceContext) {
    loop {
        let (msg_type, payload) = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "fpm connection closed");
                return;
            }
        };

        match msg_type {
            FPM_MSG_TYPE_NETLINK => {
                debug!(len = payload.len(), "fpm NETLINK frame");
                super::netlink::dispatch_route_buffer(&payload, &ctx);
            }
            FPM_MSG_TYPE_NHLFE => handle_nhlfe(&payload, &ctx),
            FPM_MSG_TYPE_FTN => warn!("FPM FTN not yet implemented"),
            other => warn!(msg_type = other, "unknown fpm message type"),
        }
    }
}

pub struct FpmRouteSource {
    pub port: u16,
}

#[async_trait]
impl RouteSource for FpmRouteSource {
    async fn run(&self, ctx: RouteSourceContext) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .map_err(|e| RfClientError::SocketSetup(format!("fpm listen on {}: {e}", self.port)))?;
        info!(port = self.port, "FPM interface enabled");

        loop {
            info!("FPM waiting for client connection...");
            let (stream, peer) = listener.accept().await?;
            info!(%peer, "FPM accepted client");
            serve_client(stream, ctx.clone()).await;
            info!("FPM done serving client");
        }
    }
}
