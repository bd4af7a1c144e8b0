//! Broadcast event bus for distributing `EngineEvent` to multiple subscribers.
//!
//! Publishing with no active subscribers is a no-op; a slow subscriber lags
//! rather than blocking the scheduler.

use taskloom_types::event::EngineEvent;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Multi-consumer event bus for engine events.
///
/// Cloning the bus clones the sender, so every component shares one channel.
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

/// Wait for the next event belonging to `execution_id`, skipping others.
///
/// Returns `None` once the bus is closed.
pub async fn next_for_execution(
    rx: &mut broadcast::Receiver<EngineEvent>,
    execution_id: Uuid,
) -> Option<EngineEvent> {
    loop {
        match rx.recv().await {
            Ok(event) if event.execution_id() == execution_id => return Some(event),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "event subscriber lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
