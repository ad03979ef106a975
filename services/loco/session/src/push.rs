//! Push subscriptions keyed by method.
//!
//! Packets that match no pending request are server-initiated pushes
//! (`MSG`, `COMPLETE`, `KICKOUT`, ...). Subscribers register per method and
//! receive every later push with that method, in arrival order.

use std::sync::Arc;

use dashmap::DashMap;
use loco_wire::Packet;
use tokio::sync::mpsc;
use tracing::trace;

/// Receiving end of a push subscription
pub type PushReceiver = mpsc::UnboundedReceiver<Packet>;

/// Per-method push subscribers shared between a session handle and its driver
#[derive(Debug, Clone, Default)]
pub struct PushRegistry {
    subscribers: Arc<DashMap<String, Vec<mpsc::UnboundedSender<Packet>>>>,
}

impl PushRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to pushes with `method`
    pub fn subscribe(&self, method: &str) -> PushReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Deliver `packet` to every live subscriber of its method.
    ///
    /// Dropped receivers are pruned. Returns how many subscribers got it.
    pub fn dispatch(&self, packet: &Packet) -> usize {
        let mut delivered = 0;
        let mut now_empty = false;

        if let Some(mut senders) = self.subscribers.get_mut(&packet.method) {
            senders.retain(|tx| tx.send(packet.clone()).is_ok());
            delivered = senders.len();
            now_empty = senders.is_empty();
        }

        if now_empty {
            self.subscribers
                .remove_if(&packet.method, |_, senders| senders.is_empty());
        }

        trace!(
            "Push {} (packet id {}) delivered to {} subscribers",
            packet.method,
            packet.packet_id,
            delivered
        );
        delivered
    }

    /// Number of live subscriptions for `method`
    pub fn subscriber_count(&self, method: &str) -> usize {
        self.subscribers
            .get(method)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Drop every subscription, ending all receivers
    pub fn clear(&self) {
        self.subscribers.clear();
    }
}
