//! Routing of events, logs and state updates to the root's observers

use crate::tree;
use crate::workflow::Workflow;
use arborcore::{LogEntry, TreeError, WorkflowEvent, WorkflowObserver};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Register `observer` on a root workflow.
pub fn add_observer(workflow: &Workflow, observer: Arc<dyn WorkflowObserver>) -> Result<(), TreeError> {
    if let Some(parent) = workflow.parent() {
        return Err(TreeError::NotRoot {
            workflow: workflow.label(),
            parent: parent.label(),
        });
    }

    workflow.inner.observers.write().push(observer);
    tracing::debug!(workflow = %workflow.id(), "Registered observer");
    Ok(())
}

/// Record `event` on the source's node and deliver it to the root's observers.
///
/// Structural events also trigger `on_tree_changed` with the root's node.
pub fn emit_event(source: &Workflow, event: WorkflowEvent) -> Result<(), TreeError> {
    source.node().push_event(event.clone());

    let root = tree::get_root(source)?;
    let observers = root.inner.observers.read().clone();
    let structural = event.is_structural();

    tracing::trace!(workflow = %source.id(), event = event.kind(), observers = observers.len(), "Emitting event");

    for observer in &observers {
        deliver("on_event", || observer.on_event(&event));
        if structural {
            deliver("on_tree_changed", || observer.on_tree_changed(root.node()));
        }
    }

    Ok(())
}

pub(crate) fn route_log(source: &Workflow, entry: &LogEntry) -> Result<(), TreeError> {
    for observer in tree::get_root_observers(source)? {
        deliver("on_log", || observer.on_log(entry));
    }
    Ok(())
}

pub(crate) fn route_state_updated(source: &Workflow) -> Result<(), TreeError> {
    for observer in tree::get_root_observers(source)? {
        deliver("on_state_updated", || observer.on_state_updated(source.node()));
    }
    Ok(())
}

/// Run one observer callback, containing any panic it raises.
fn deliver(callback: &'static str, f: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        tracing::warn!(callback, "Observer failed: {}", panic_message(panic.as_ref()));
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
