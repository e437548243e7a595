use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::events::OrchestratorEvent;

/// A broadcast-style event bus built on top of flume channels.
///
/// Each call to [`EventBus::subscribe`] creates a receiver that sees every
/// event published after the subscription was created. Cloning the bus is
/// cheap; all clones share the same subscriber list.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<flume::Sender<OrchestratorEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<OrchestratorEvent> {
        let (tx, rx) = flume::unbounded();
        self.senders().push(tx);
        rx
    }

    /// Publish an event to all current subscribers.
    ///
    /// Subscribers whose receivers have been dropped are pruned.
    pub fn publish(&self, event: OrchestratorEvent) {
        tracing::trace!(kind = event.kind(), task_id = %event.task_id(), "publish");
        self.senders().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders().len()
    }

    // A panicking subscriber cannot leave the sender list half-updated, so a
    // poisoned lock is still safe to use.
    fn senders(&self) -> MutexGuard<'_, Vec<flume::Sender<OrchestratorEvent>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn exit(code: i32) -> OrchestratorEvent {
        OrchestratorEvent::Exit {
            task_id: Uuid::nil(),
            code,
        }
    }

    #[test]
    fn every_subscriber_receives_events() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(exit(0));
        assert_eq!(a.try_recv().unwrap(), exit(0));
        assert_eq!(b.try_recv().unwrap(), exit(0));
    }

    #[test]
    fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.publish(exit(1));
        let rx = bus.subscribe();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        let gone = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        drop(gone);
        bus.publish(exit(0));
        assert_eq!(bus.subscriber_count(), 1);
        assert!(keep.try_recv().is_ok());
    }
}
