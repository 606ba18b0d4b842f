//! Chain notifications for wallets, relays and stakers.

use std::sync::Arc;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use ldoged_consensus::Hash256;
use ldoged_primitives::Block;
use parking_lot::Mutex;
use tracing::debug;

use crate::entry::ChainEntry;
use crate::error::VerifyError;

#[derive(Clone, Debug)]
pub enum ChainEvent {
    /// The best chain tip moved.
    Tip(ChainEntry),
    Connect {
        entry: ChainEntry,
        block: Arc<Block>,
    },
    Disconnect {
        entry: ChainEntry,
        block: Arc<Block>,
    },
    Reconnect {
        entry: ChainEntry,
        block: Arc<Block>,
    },
    Reorganize {
        old_tip: ChainEntry,
        new_tip: ChainEntry,
    },
    Checkpoint {
        hash: Hash256,
        height: u32,
    },
    Orphan {
        hash: Hash256,
    },
    Resolved {
        hash: Hash256,
        entry: ChainEntry,
    },
    BadOrphan {
        error: VerifyError,
        peer: Option<u64>,
    },
    Competitor {
        entry: ChainEntry,
        block: Arc<Block>,
    },
    /// The chain caught up with the network.
    Full,
    Reset(ChainEntry),
}

impl ChainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ChainEvent::Tip(_) => "tip",
            ChainEvent::Connect { .. } => "connect",
            ChainEvent::Disconnect { .. } => "disconnect",
            ChainEvent::Reconnect { .. } => "reconnect",
            ChainEvent::Reorganize { .. } => "reorganize",
            ChainEvent::Checkpoint { .. } => "checkpoint",
            ChainEvent::Orphan { .. } => "orphan",
            ChainEvent::Resolved { .. } => "resolved",
            ChainEvent::BadOrphan { .. } => "bad orphan",
            ChainEvent::Competitor { .. } => "competitor",
            ChainEvent::Full => "full",
            ChainEvent::Reset(_) => "reset",
        }
    }
}

/// Fans events out to subscribers without ever blocking the chain. A full
/// bounded subscriber misses the event; a dropped receiver is forgotten.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<ChainEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<ChainEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn subscribe_bounded(&self, capacity: usize) -> Receiver<ChainEvent> {
        let (tx, rx) = bounded(capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn emit(&self, event: ChainEvent) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|subscriber| match subscriber.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(event = event.name(), "subscriber queue full, event dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_subscribers_are_forgotten() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        let dropped = bus.subscribe();
        drop(dropped);

        bus.emit(ChainEvent::Full);
        assert_eq!(bus.subscriber_count(), 1);
        assert!(matches!(kept.try_recv(), Ok(ChainEvent::Full)));
    }

    #[test]
    fn full_subscriber_does_not_block() {
        let bus = EventBus::new();
        let slow = bus.subscribe_bounded(1);
        bus.emit(ChainEvent::Orphan { hash: [1; 32] });
        bus.emit(ChainEvent::Orphan { hash: [2; 32] });

        assert!(matches!(slow.try_recv(), Ok(ChainEvent::Orphan { hash }) if hash == [1; 32]));
        assert!(slow.try_recv().is_err());
        assert_eq!(bus.subscriber_count(), 1);
    }
}
