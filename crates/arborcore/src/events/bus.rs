use crate::events::{WorkflowEvent, WorkflowObserver};
use crate::node::{LogEntry, NodeHandle, WorkflowId, WorkflowStatus};
use crate::snapshot::StateMap;
use tokio::sync::broadcast;

/// Observer callbacks as they travel over the bus
#[derive(Debug, Clone)]
pub enum BusMessage {
    Log(LogEntry),
    Event(WorkflowEvent),
    StateUpdated {
        node_id: WorkflowId,
        state: StateMap,
    },
    TreeChanged {
        root_id: WorkflowId,
        root_status: WorkflowStatus,
    },
}

/// Broadcast sink that turns observer callbacks into [`BusMessage`]s.
///
/// Register it on a root workflow and hand out receivers with
/// [`EventBus::subscribe`]. Messages sent while nobody is subscribed are dropped.
pub struct EventBus {
    sender: broadcast::Sender<BusMessage>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }

    pub fn emit(&self, message: BusMessage) {
        if self.sender.send(message).is_err() {
            tracing::trace!("Dropped bus message, no subscribers");
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl WorkflowObserver for EventBus {
    fn on_log(&self, entry: &LogEntry) {
        self.emit(BusMessage::Log(entry.clone()));
    }

    fn on_event(&self, event: &WorkflowEvent) {
        self.emit(BusMessage::Event(event.clone()));
    }

    fn on_state_updated(&self, node: &NodeHandle) {
        self.emit(BusMessage::StateUpdated {
            node_id: node.id(),
            state: node.state_snapshot().unwrap_or_default(),
        });
    }

    fn on_tree_changed(&self, root: &NodeHandle) {
        self.emit(BusMessage::TreeChanged {
            root_id: root.id(),
            root_status: root.status(),
        });
    }
}
