//! Event emission port and its broadcast-channel implementation.

use procflow_types::event::WorkflowEvent;
use tokio::sync::broadcast;

/// Fire-and-forget sink for workflow events.
///
/// Emission happens after the state change is persisted; a failing sink
/// must never fail the action that produced the event.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: WorkflowEvent);
}

/// In-process fan-out of workflow events.
///
/// Every subscriber sees every event published after it subscribed. A
/// subscriber that falls more than `capacity` events behind gets
/// `RecvError::Lagged` and skips ahead.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
    capacity: usize,
}

impl EventBus {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    /// Send to current subscribers. Returns how many received it; zero
    /// when nobody is listening.
    pub fn publish(&self, event: WorkflowEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: WorkflowEvent) {
        let name = event.name();
        let instance_id = event.instance().id;
        let delivered = self.publish(event);
        tracing::debug!(event = name, %instance_id, delivered, "workflow event emitted");
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
