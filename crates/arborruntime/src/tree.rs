//! Attach/detach of workflows and the walks that keep the tree honest.
//!
//! Every operation keeps two trees in step: the live [`Workflow`] tree and
//! the [`NodeHandle`](arborcore::NodeHandle) data tree. A workflow has at
//! most one parent and is never its own ancestor.

use crate::bus;
use crate::workflow::Workflow;
use arborcore::{TreeError, WorkflowEvent, WorkflowObserver};
use std::collections::HashSet;
use std::sync::Arc;

pub fn attach_child(parent: &Workflow, child: &Workflow) -> Result<(), TreeError> {
    if parent.has_child(child) {
        return Err(TreeError::AlreadyAttached {
            parent: parent.label(),
            child: child.label(),
        });
    }

    let current_parent = child.parent();
    if let Some(current) = &current_parent {
        if !current.ptr_eq(parent) {
            return Err(TreeError::ParentConflict {
                child: child.label(),
                current_parent: current.label(),
                new_parent: parent.label(),
            });
        }
    }

    if parent.ptr_eq(child) || is_descendant_of(parent, child)? {
        return Err(TreeError::CircularReference {
            parent: parent.label(),
            child: child.label(),
        });
    }

    if current_parent.is_none() {
        *child.inner.parent.write() = Some(Arc::downgrade(&parent.inner));
    }
    child.node().set_parent(Some(parent.id()));
    parent.inner.children.write().push(child.clone());
    parent.node().push_child(child.node());

    tracing::debug!(parent = %parent.id(), child = %child.id(), "Attached child workflow '{}'", child.name());

    bus::emit_event(
        parent,
        WorkflowEvent::ChildAttached {
            parent_id: parent.id(),
            child_id: child.id(),
            child_name: child.name().to_string(),
        },
    )
}

pub fn detach_child(parent: &Workflow, child: &Workflow) -> Result<(), TreeError> {
    if !parent.has_child(child) {
        return Err(TreeError::NotAttached {
            parent: parent.label(),
            child: child.label(),
        });
    }

    parent.inner.children.write().retain(|c| !c.ptr_eq(child));
    parent.node().remove_child(child.node());
    *child.inner.parent.write() = None;
    child.node().set_parent(None);

    tracing::debug!(parent = %parent.id(), child = %child.id(), "Detached child workflow '{}'", child.name());

    bus::emit_event(
        parent,
        WorkflowEvent::ChildDetached {
            parent_id: parent.id(),
            child_id: child.id(),
        },
    )
}

/// Attach `child` to `parent` unless it already is.
pub fn ensure_attached(parent: &Workflow, child: &Workflow) -> Result<(), TreeError> {
    if parent.has_child(child) {
        return Ok(());
    }
    attach_child(parent, child)
}

/// Whether `ancestor` appears on the parent chain above `node`.
///
/// Fails with [`TreeError::CycleDetected`] if the walk revisits a workflow.
pub fn is_descendant_of(node: &Workflow, ancestor: &Workflow) -> Result<bool, TreeError> {
    let mut visited = HashSet::from([node.identity()]);
    let mut current = node.parent();

    while let Some(workflow) = current {
        if workflow.ptr_eq(ancestor) {
            return Ok(true);
        }
        if !visited.insert(workflow.identity()) {
            return Err(TreeError::CycleDetected {
                workflow: workflow.label(),
            });
        }
        current = workflow.parent();
    }

    Ok(false)
}

/// Top-most ancestor of `node` (`node` itself for a root).
pub fn get_root(node: &Workflow) -> Result<Workflow, TreeError> {
    let mut visited = HashSet::from([node.identity()]);
    let mut root = node.clone();

    while let Some(parent) = root.parent() {
        if !visited.insert(parent.identity()) {
            return Err(TreeError::CycleDetected {
                workflow: parent.label(),
            });
        }
        root = parent;
    }

    Ok(root)
}

pub fn get_root_observers(node: &Workflow) -> Result<Vec<Arc<dyn WorkflowObserver>>, TreeError> {
    let root = get_root(node)?;
    let observers = root.inner.observers.read().clone();
    Ok(observers)
}

/// Check the subtree under `root` for parent-link and mirror violations,
/// starting with `root`'s own link upwards.
///
/// Returns one message per violation; an empty list means both trees agree.
pub fn validate_tree(root: &Workflow) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    let live_parent = root.parent().map(|parent| parent.id());
    let node_parent = root.node().parent_id();
    if live_parent != node_parent {
        errors.push(format!(
            "{} has live parent {:?} but its node points at {:?}",
            root.label(),
            live_parent,
            node_parent
        ));
    }

    validate_workflow(root, &mut seen, &mut errors);
    errors
}

fn validate_workflow(workflow: &Workflow, seen: &mut HashSet<usize>, errors: &mut Vec<String>) {
    if !seen.insert(workflow.identity()) {
        errors.push(format!("{} is reachable more than once", workflow.label()));
        return;
    }

    let children = workflow.children();
    let node_children = workflow.node().children();

    if children.len() != node_children.len() {
        errors.push(format!(
            "{} has {} child workflows but {} child nodes",
            workflow.label(),
            children.len(),
            node_children.len()
        ));
    }

    for (index, child) in children.iter().enumerate() {
        match child.parent() {
            Some(parent) if parent.ptr_eq(workflow) => {}
            Some(parent) => errors.push(format!(
                "{} is listed under {} but its parent is {}",
                child.label(),
                workflow.label(),
                parent.label()
            )),
            None => errors.push(format!(
                "{} is listed under {} but has no parent",
                child.label(),
                workflow.label()
            )),
        }

        if child.node().parent_id() != Some(workflow.id()) {
            errors.push(format!(
                "node of {} does not point at parent node {}",
                child.label(),
                workflow.id()
            ));
        }

        match node_children.get(index) {
            Some(node) if node.ptr_eq(child.node()) => {}
            _ => errors.push(format!(
                "node of {} is not at position {} under {}",
                child.label(),
                index,
                workflow.label()
            )),
        }

        validate_workflow(child, seen, errors);
    }
}
