use crate::error::WorkflowError;
use crate::node::WorkflowId;
use crate::reflection::ReflectionLevel;
use crate::snapshot::StateMap;
use crate::Value;
use serde::{Deserialize, Serialize};

/// Events emitted by workflows in a tree.
///
/// Nodes are referenced by id: an event lives in its source node's buffer and
/// must not own that node or its root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    ChildAttached {
        parent_id: WorkflowId,
        child_id: WorkflowId,
        child_name: String,
    },
    ChildDetached {
        parent_id: WorkflowId,
        child_id: WorkflowId,
    },
    StateSnapshot {
        node_id: WorkflowId,
        state: StateMap,
    },
    StepStart {
        node_id: WorkflowId,
        step: String,
    },
    StepEnd {
        node_id: WorkflowId,
        step: String,
        duration_ms: u64,
    },
    TaskStart {
        node_id: WorkflowId,
        task: String,
    },
    TaskEnd {
        node_id: WorkflowId,
        task: String,
        duration_ms: u64,
    },
    Error {
        node_id: WorkflowId,
        error: WorkflowError,
    },
    TreeUpdated {
        root_id: WorkflowId,
    },
    AgentStart {
        node_id: WorkflowId,
        agent: String,
    },
    AgentEnd {
        node_id: WorkflowId,
        agent: String,
        duration_ms: u64,
    },
    ToolInvocation {
        node_id: WorkflowId,
        tool: String,
        input: Value,
    },
    CacheHit {
        node_id: WorkflowId,
        key: String,
    },
    CacheMiss {
        node_id: WorkflowId,
        key: String,
    },
    ReflectionStart {
        node_id: WorkflowId,
        level: ReflectionLevel,
        attempt: u32,
    },
    ReflectionEnd {
        node_id: WorkflowId,
        should_retry: bool,
        reason: String,
    },
}

impl WorkflowEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowEvent::ChildAttached { .. } => "child_attached",
            WorkflowEvent::ChildDetached { .. } => "child_detached",
            WorkflowEvent::StateSnapshot { .. } => "state_snapshot",
            WorkflowEvent::StepStart { .. } => "step_start",
            WorkflowEvent::StepEnd { .. } => "step_end",
            WorkflowEvent::TaskStart { .. } => "task_start",
            WorkflowEvent::TaskEnd { .. } => "task_end",
            WorkflowEvent::Error { .. } => "error",
            WorkflowEvent::TreeUpdated { .. } => "tree_updated",
            WorkflowEvent::AgentStart { .. } => "agent_start",
            WorkflowEvent::AgentEnd { .. } => "agent_end",
            WorkflowEvent::ToolInvocation { .. } => "tool_invocation",
            WorkflowEvent::CacheHit { .. } => "cache_hit",
            WorkflowEvent::CacheMiss { .. } => "cache_miss",
            WorkflowEvent::ReflectionStart { .. } => "reflection_start",
            WorkflowEvent::ReflectionEnd { .. } => "reflection_end",
        }
    }

    /// Structural events additionally trigger `on_tree_changed`.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::TreeUpdated { .. }
                | WorkflowEvent::ChildAttached { .. }
                | WorkflowEvent::ChildDetached { .. }
        )
    }

    /// The node the event is about.
    pub fn node_id(&self) -> WorkflowId {
        match self {
            WorkflowEvent::ChildAttached { parent_id, .. }
            | WorkflowEvent::ChildDetached { parent_id, .. } => *parent_id,
            WorkflowEvent::TreeUpdated { root_id } => *root_id,
            WorkflowEvent::StateSnapshot { node_id, .. }
            | WorkflowEvent::StepStart { node_id, .. }
            | WorkflowEvent::StepEnd { node_id, .. }
            | WorkflowEvent::TaskStart { node_id, .. }
            | WorkflowEvent::TaskEnd { node_id, .. }
            | WorkflowEvent::Error { node_id, .. }
            | WorkflowEvent::AgentStart { node_id, .. }
            | WorkflowEvent::AgentEnd { node_id, .. }
            | WorkflowEvent::ToolInvocation { node_id, .. }
            | WorkflowEvent::CacheHit { node_id, .. }
            | WorkflowEvent::CacheMiss { node_id, .. }
            | WorkflowEvent::ReflectionStart { node_id, .. }
            | WorkflowEvent::ReflectionEnd { node_id, .. } => *node_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn structural_kinds() {
        let id = Uuid::new_v4();
        assert!(WorkflowEvent::TreeUpdated { root_id: id }.is_structural());
        assert!(WorkflowEvent::ChildDetached { parent_id: id, child_id: id }.is_structural());
        assert!(!WorkflowEvent::StepStart { node_id: id, step: "s".into() }.is_structural());
    }

    #[test]
    fn tagged_with_snake_case_type() {
        let event = WorkflowEvent::StepEnd {
            node_id: Uuid::nil(),
            step: "load".into(),
            duration_ms: 12,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "step_end");
        assert_eq!(json["duration_ms"], 12);
    }
}
