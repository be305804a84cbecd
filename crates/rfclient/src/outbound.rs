//! C7: drains the outbound flow-mod queue onto the IPC transport,
//! respecting an at-most-N-outstanding credit window (spec section 4.7).

use crate::error::Result;
use crate::flow_mod::FlowMod;
use crate::ipc::{IpcMessage, IpcTransport};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

/// Shared credit counter: incremented by the pump on send, decremented
/// by the control-plane handler (C9) on `PCT_ROUTEMOD_ACK`.
#[derive(Clone, Default)]
pub struct OutstandingCounter {
    count: Arc<AtomicU64>,
    notify: Arc<Notify>,
}

impl OutstandingCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements, saturating at zero: a stray or duplicate ack must
    /// never make the counter wrap and silently reopen the window past
    /// what has actually been sent. Wakes anyone parked in
    /// [`Self::wait_below`] so a returned credit is picked up immediately
    /// instead of on the next poll.
    pub fn decrement(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(1)));
        self.notify.notify_one();
    }

    /// Blocks until the outstanding count drops below `max`. Checks the
    /// condition both before and after registering interest, the usual
    /// pattern for `Notify`, so a `decrement()` landing in between never
    /// gets missed.
    async fn wait_below(&self, max: u64) {
        loop {
            if self.get() < max {
                return;
            }
            let notified = self.notify.notified();
            if self.get() < max {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<FlowMod>,
}

impl OutboundSender {
    pub fn push(&self, flow_mod: FlowMod) {
        let _ = self.tx.send(flow_mod);
    }
}

pub fn outbound_queue() -> (OutboundSender, mpsc::UnboundedReceiver<FlowMod>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (OutboundSender { tx }, rx)
}

/// Runs until the queue is closed. `max_outstanding` defaults to 1 per
/// spec section 3's emission invariant.
pub async fn run_outbound_pump(
    mut rx: mpsc::UnboundedReceiver<FlowMod>,
    transport: Arc<dyn IpcTransport>,
    outstanding: OutstandingCounter,
    max_outstanding: u64,
) -> Result<()> {
    while let Some(flow_mod) = rx.recv().await {
        outstanding.wait_below(max_outstanding).await;
        debug!(vm_port = flow_mod.vm_port, "sending flow-mod");
        transport.send(IpcMessage::RouteMod(flow_mod)).await?;
        outstanding.increment();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_mod::FlowModOp;
    use crate::ipc::InMemoryTransport;

    fn flow_mod() -> FlowMod {
        FlowMod {
            op: FlowModOp::Add,
            vm_id: 1,
            vm_port: 1,
            match_list: vec![],
            action_list: vec![],
            option_list: vec![],
        }
    }

    /// Scenario S6 from spec section 8: with `max_outstanding=1`, two
    /// back-to-back ADDs yield one immediate send, and the second waits
    /// for a decrement (an ack) before going out.
    #[tokio::test]
    async fn blocks_second_send_until_credit_returned() {
        let (tx, rx) = outbound_queue();
        let transport = Arc::new(InMemoryTransport::new());
        let outstanding = OutstandingCounter::new();

        tx.push(flow_mod());
        tx.push(flow_mod());
        drop(tx);

        let counter = outstanding.clone();
        let sent = transport.clone();
        let handle = tokio::spawn(run_outbound_pump(rx, sent, counter, 1));

        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        assert_eq!(transport.sent_count(), 1);

        outstanding.decrement();
        handle.await.unwrap().unwrap();
        assert_eq!(transport.sent_count(), 2);
    }
}
