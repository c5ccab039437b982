use arborcore::{NodeHandle, Result, WorkflowId};
use std::collections::{HashMap, HashSet};

/// Id-indexed, read-only view of a workflow data tree.
///
/// The index is built once; nodes attached later are not visible through it,
/// but every node it does hold is live.
#[derive(Debug, Clone)]
pub struct EventTree {
    root: NodeHandle,
    index: HashMap<WorkflowId, NodeHandle>,
}

impl EventTree {
    pub fn new(root: NodeHandle) -> Self {
        let mut index = HashMap::new();
        let mut pending = vec![root.clone()];
        while let Some(node) = pending.pop() {
            if index.contains_key(&node.id()) {
                continue;
            }
            pending.extend(node.children());
            index.insert(node.id(), node);
        }
        Self { root, index }
    }

    pub fn root(&self) -> &NodeHandle {
        &self.root
    }

    pub fn get_node(&self, id: WorkflowId) -> Option<NodeHandle> {
        self.index.get(&id).cloned()
    }

    pub fn get_children(&self, id: WorkflowId) -> Vec<NodeHandle> {
        self.index
            .get(&id)
            .map(NodeHandle::children)
            .unwrap_or_default()
    }

    /// Ancestors of `id`, nearest first.
    pub fn get_ancestors(&self, id: WorkflowId) -> Vec<NodeHandle> {
        let mut ancestors = Vec::new();
        let mut visited = HashSet::from([id]);
        let mut current = self.index.get(&id).and_then(NodeHandle::parent_id);

        while let Some(parent_id) = current {
            if !visited.insert(parent_id) {
                break;
            }
            let Some(parent) = self.index.get(&parent_id) else {
                break;
            };
            ancestors.push(parent.clone());
            current = parent.parent_id();
        }

        ancestors
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The whole tree as nested plain JSON.
    pub fn export(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.root)?)
    }
}
