use crate::reflection::{ReflectionConfig, ReflectionManager};
use crate::workflow::Workflow;
use arborcore::{BusMessage, EventBus, FlowError, Result, TreeError, Value, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Main runtime for executing workflow trees
pub struct FlowRuntime {
    config: RuntimeConfig,
    event_bus: Arc<EventBus>,
    workflows: Arc<RwLock<HashMap<WorkflowId, Workflow>>>,
}

impl FlowRuntime {
    /// Create a new runtime with default settings
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size.max(1)));

        Self {
            config,
            event_bus,
            workflows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Register a root workflow for later execution by id
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<WorkflowId> {
        ensure_root(&workflow)?;
        let id = workflow.id();
        self.workflows.write().await.insert(id, workflow);
        tracing::debug!(workflow = %id, "Registered workflow");
        Ok(id)
    }

    /// Execute a registered workflow by id
    pub async fn execute_workflow(&self, workflow_id: WorkflowId) -> Result<Value> {
        let workflow = self
            .workflows
            .read()
            .await
            .get(&workflow_id)
            .cloned()
            .ok_or_else(|| FlowError::execution(format!("Workflow not found: {}", workflow_id)))?;

        self.execute(&workflow).await
    }

    /// Execute a root workflow directly (without registration)
    pub async fn execute(&self, workflow: &Workflow) -> Result<Value> {
        ensure_root(workflow)?;
        self.wire_event_bus(workflow);
        self.apply_defaults(workflow);

        tracing::info!(workflow = %workflow.id(), name = %workflow.name(), "Executing workflow tree");
        workflow.run().await
    }

    /// Subscribe to everything the executed trees report
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<BusMessage> {
        self.event_bus.subscribe()
    }

    /// Get the event bus for direct access
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Register the bus on `root` unless it is already among its observers.
    ///
    /// The root's own observer list is the record, so nothing outlives the tree.
    fn wire_event_bus(&self, root: &Workflow) {
        let bus = Arc::as_ptr(&self.event_bus) as *const ();
        let mut observers = root.inner.observers.write();
        if !observers.iter().any(|o| Arc::as_ptr(o) as *const () == bus) {
            observers.push(self.event_bus.clone());
            tracing::debug!(workflow = %root.id(), "Wired runtime event bus");
        }
    }

    /// Give every workflow in the tree the configured defaults it lacks.
    fn apply_defaults(&self, root: &Workflow) {
        let step_timeout = self.config.step_timeout();
        if let Some(timeout) = step_timeout {
            if root.step_timeout().is_none() {
                root.set_step_timeout(timeout);
            }
        }

        if !self.config.reflection.enabled {
            return;
        }

        let mut visited = HashSet::new();
        let mut pending = vec![root.clone()];
        while let Some(workflow) = pending.pop() {
            if !visited.insert(workflow.id()) {
                continue;
            }
            if workflow.reflection().is_none() {
                workflow.set_reflection(Arc::new(ReflectionManager::new(self.config.reflection.clone())));
            }
            pending.extend(workflow.children());
        }
    }
}

impl Default for FlowRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_root(workflow: &Workflow) -> Result<()> {
    match workflow.parent() {
        Some(parent) => Err(TreeError::NotRoot {
            workflow: workflow.label(),
            parent: parent.label(),
        }
        .into()),
        None => Ok(()),
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub event_buffer_size: usize,
    /// Applied to workflows that carry no reflection manager of their own
    pub reflection: ReflectionConfig,
    /// Default timeout for every step in an executed tree
    pub step_timeout_ms: Option<u64>,
}

impl RuntimeConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            reflection: ReflectionConfig::default(),
            step_timeout_ms: None,
        }
    }
}
