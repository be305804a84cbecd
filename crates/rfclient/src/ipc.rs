//! The IPC boundary to the central controller (`rfserver`).
//!
//! The transport and its serialization are explicitly out of scope for
//! this agent's core (spec section 1); what is in scope is the message
//! shapes and the single-byte-type-tagged BSON framing described in
//! spec section 6. [`IpcTransport`] keeps the rest of the agent
//! transport-agnostic, the same way [`crate::route_source::RouteSource`]
//! keeps C4/C5/C6 adapter-agnostic (Design Notes section 9).

use crate::error::{Result, RfClientError};
use crate::flow_mod::FlowMod;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sonic_types::MacAddress;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// `rfclient -> rfserver`: announces a local port at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRegister {
    pub vm_id: u64,
    pub vm_port: u32,
    pub mac: MacAddress,
}

/// `rfserver -> rfclient`: server-driven per-port state transitions
/// (spec section 4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortConfigOp {
    MapRequest,
    Reset,
    MapSuccess,
    RouteModAck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    pub vm_port: u32,
    pub operation: PortConfigOp,
}

/// One BSON-tagged IPC frame, tag byte implicit in the enum variant
/// order when serialized through [`encode_frame`]/[`decode_frame`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IpcMessage {
    PortRegister(PortRegister),
    RouteMod(FlowMod),
    PortConfig(PortConfig),
}

impl IpcMessage {
    fn type_tag(&self) -> u8 {
        match self {
            IpcMessage::PortRegister(_) => 1,
            IpcMessage::RouteMod(_) => 2,
            IpcMessage::PortConfig(_) => 3,
        }
    }
}

/// Encodes a frame as `<type:u8><len:u32 LE><bson payload>`.
pub fn encode_frame(msg: &IpcMessage) -> Result<Vec<u8>> {
    let payload = bson::to_vec(msg).map_err(|e| RfClientError::Ipc(e.to_string()))?;
    let mut frame = Vec::with_capacity(payload.len() + 5);
    frame.push(msg.type_tag());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub fn decode_payload(payload: &[u8]) -> Result<IpcMessage> {
    bson::from_slice(payload).map_err(|e| RfClientError::Ipc(e.to_string()))
}

/// Capability satisfied by whatever concrete transport the deployment
/// chooses; the agent's core components only ever depend on this trait.
#[async_trait]
pub trait IpcTransport: Send + Sync {
    async fn send(&self, msg: IpcMessage) -> Result<()>;
    async fn recv(&self) -> Result<IpcMessage>;
}

/// A length-prefixed BSON-over-TCP transport, the concrete default for
/// running this agent end to end (spec section 6 names the framing;
/// the carrier itself is left to the deployment).
pub struct TcpIpcTransport {
    stream: Mutex<TcpStream>,
}

impl TcpIpcTransport {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(TcpIpcTransport { stream: Mutex::new(stream) })
    }
}

#[async_trait]
impl IpcTransport for TcpIpcTransport {
    async fn send(&self, msg: IpcMessage) -> Result<()> {
        let frame = encode_frame(&msg)?;
        let mut stream = self.stream.lock().await;
        stream.write_all(&frame).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<IpcMessage> {
        let mut stream = self.stream.lock().await;
        let mut header = [0u8; 5];
        stream.read_exact(&mut header).await?;
        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        decode_payload(&payload)
    }
}

/// An in-process fake transport for tests: records every sent message
/// and never receives anything unless fed via [`InMemoryTransport::feed`].
pub struct InMemoryTransport {
    sent: Mutex<Vec<IpcMessage>>,
    inbox: Mutex<std::collections::VecDeque<IpcMessage>>,
    sent_count: AtomicUsize,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        InMemoryTransport {
            sent: Mutex::new(Vec::new()),
            inbox: Mutex::new(std::collections::VecDeque::new()),
            sent_count: AtomicUsize::new(0),
        }
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent_count.load(Ordering::SeqCst)
    }

    pub async fn feed(&self, msg: IpcMessage) {
        self.inbox.lock().await.push_back(msg);
    }

    pub async fn sent_messages(&self) -> Vec<IpcMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl IpcTransport for InMemoryTransport {
    async fn send(&self, msg: IpcMessage) -> Result<()> {
        self.sent_count.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().await.push(msg);
        Ok(())
    }

    async fn recv(&self) -> Result<IpcMessage> {
        loop {
            if let Some(msg) = self.inbox.lock().await.pop_front() {
                return Ok(msg);
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_mod::FlowModOp;

    /// Testable property 8 from spec section 8: BSON round-trips the
    /// full match/action/option set.
    #[test]
    fn flow_mod_round_trips_through_bson() {
        let fm = FlowMod {
            op: FlowModOp::Add,
            vm_id: 42,
            vm_port: 3,
            match_list: vec![crate::flow_mod::Match::MplsInLabel(100)],
            action_list: vec![crate::flow_mod::Action::PopMpls],
            option_list: vec![crate::flow_mod::Option_::Priority(7)],
        };
        let msg = IpcMessage::RouteMod(fm.clone());
        let frame = encode_frame(&msg).unwrap();
        let decoded = decode_payload(&frame[5..]).unwrap();
        match decoded {
            IpcMessage::RouteMod(decoded_fm) => assert_eq!(decoded_fm, fm),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn type_tags_are_stable() {
        let port_register = IpcMessage::PortRegister(PortRegister {
            vm_id: 1,
            vm_port: 1,
            mac: MacAddress::ZERO,
        });
        assert_eq!(port_register.type_tag(), 1);
    }
}
