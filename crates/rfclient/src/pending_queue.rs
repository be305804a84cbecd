//! C3: the pending-route FIFO between the route-source adapters and the
//! gateway resolver.
//!
//! Multiple producers (the active adapter, and the resolver itself for
//! retries) push; a single consumer (the resolver) pops. Built on an
//! unbounded `tokio::sync::mpsc` channel, which already gives FIFO
//! ordering and a blocking `recv` plus a non-blocking drain via
//! `try_recv`.

use crate::types::PendingRoute;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct PendingQueueSender {
    tx: mpsc::UnboundedSender<PendingRoute>,
}

impl PendingQueueSender {
    pub fn push(&self, route: PendingRoute) {
        // The receiver only drops once the agent is shutting down; a send
        // error at that point is not actionable.
        let _ = self.tx.send(route);
    }
}

pub struct PendingQueueReceiver {
    rx: mpsc::UnboundedReceiver<PendingRoute>,
}

impl PendingQueueReceiver {
    /// Blocks until at least one item is available, then drains
    /// everything currently buffered (spec section 4.4: "drain all items
    /// currently in C3").
    pub async fn drain(&mut self) -> Vec<PendingRoute> {
        let Some(first) = self.rx.recv().await else {
            return Vec::new();
        };
        let mut items = vec![first];
        while let Ok(item) = self.rx.try_recv() {
            items.push(item);
        }
        items
    }
}

pub fn pending_queue() -> (PendingQueueSender, PendingQueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PendingQueueSender { tx }, PendingQueueReceiver { rx })
}
