use crate::events::WorkflowEvent;
use crate::node::{LogEntry, NodeHandle};

/// Listener registered on a root workflow.
///
/// Receives every log entry, event, state update and tree change from the
/// whole tree beneath the root. Callbacks run synchronously on the emitting
/// workflow's task, so they should return quickly. A panicking callback is
/// isolated and logged; it never reaches other observers or the workflow.
/// The process panic hook still runs first, so the default hook prints the
/// panic to stderr as well.
pub trait WorkflowObserver: Send + Sync {
    fn on_log(&self, entry: &LogEntry);

    fn on_event(&self, event: &WorkflowEvent);

    fn on_state_updated(&self, node: &NodeHandle);

    fn on_tree_changed(&self, root: &NodeHandle);
}
