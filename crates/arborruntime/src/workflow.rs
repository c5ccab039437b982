use crate::bus;
use crate::context::{Attempt, ExecutionContext};
use crate::reflection::{execute_with_reflection, ReflectionContext, ReflectionManager};
use crate::tree;
use arborcore::{
    capture_state, FlowError, LogEntry, LogLevel, NodeHandle, ObservedState, Result, StateMap,
    TreeError, Value, WorkflowError, WorkflowEvent, WorkflowId, WorkflowObserver, WorkflowStatus,
};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Body of a workflow
pub type ExecutorFn = Arc<dyn Fn(ExecutionContext) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A live node of the workflow tree.
///
/// `Workflow` is a cheap handle; clones refer to the same instance. The
/// parent link is weak and children are owned, so a tree lives as long as
/// its root is referenced; a workflow that outlives its parent becomes a
/// root of its own. Every instance mirrors itself into a
/// [`NodeHandle`] data tree kept in lockstep by the [`tree`] operations.
#[derive(Clone)]
pub struct Workflow {
    pub(crate) inner: Arc<WorkflowInner>,
}

pub(crate) struct WorkflowInner {
    id: WorkflowId,
    name: String,
    node: NodeHandle,
    pub(crate) parent: RwLock<Option<Weak<WorkflowInner>>>,
    pub(crate) children: RwLock<Vec<Workflow>>,
    status: RwLock<WorkflowStatus>,
    pub(crate) observers: RwLock<Vec<Arc<dyn WorkflowObserver>>>,
    executor: RwLock<Option<ExecutorFn>>,
    state: RwLock<Option<Arc<dyn ObservedState>>>,
    reflection: RwLock<Option<Arc<ReflectionManager>>>,
    step_timeout: RwLock<Option<Duration>>,
    cancellation: CancellationToken,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        let name = name.into();
        Self {
            inner: Arc::new(WorkflowInner {
                id,
                node: NodeHandle::new(id, name.clone()),
                name,
                parent: RwLock::new(None),
                children: RwLock::new(Vec::new()),
                status: RwLock::new(WorkflowStatus::Idle),
                observers: RwLock::new(Vec::new()),
                executor: RwLock::new(None),
                state: RwLock::new(None),
                reflection: RwLock::new(None),
                step_timeout: RwLock::new(None),
                cancellation: CancellationToken::new(),
            }),
        }
    }

    /// Create a workflow already attached to `parent`.
    pub fn child_of(parent: &Workflow, name: impl Into<String>) -> Result<Self> {
        let child = Self::new(name);
        tree::attach_child(parent, &child)?;
        Ok(child)
    }

    pub fn with_executor<F, Fut>(self, executor: F) -> Self
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let executor: ExecutorFn =
            Arc::new(move |ctx| -> BoxFuture<'static, Result<Value>> { Box::pin(executor(ctx)) });
        *self.inner.executor.write() = Some(executor);
        self
    }

    pub fn with_state<S: ObservedState + 'static>(self, state: Arc<S>) -> Self {
        *self.inner.state.write() = Some(state);
        self
    }

    pub fn with_reflection(self, manager: Arc<ReflectionManager>) -> Self {
        self.set_reflection(manager);
        self
    }

    /// Default timeout for this workflow's steps; descendants inherit it.
    pub fn with_step_timeout(self, timeout: Duration) -> Self {
        self.set_step_timeout(timeout);
        self
    }

    pub fn set_reflection(&self, manager: Arc<ReflectionManager>) {
        *self.inner.reflection.write() = Some(manager);
    }

    pub fn set_step_timeout(&self, timeout: Duration) {
        *self.inner.step_timeout.write() = Some(timeout);
    }

    pub fn id(&self) -> WorkflowId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// `name (id)`, as used in error messages.
    pub fn label(&self) -> String {
        format!("'{}' ({})", self.inner.name, self.inner.id)
    }

    pub fn node(&self) -> &NodeHandle {
        &self.inner.node
    }

    pub fn status(&self) -> WorkflowStatus {
        *self.inner.status.read()
    }

    /// The live parent, if it is still referenced.
    ///
    /// Once the parent has been dropped this workflow becomes a root: the
    /// stale link is cleared and the node's parent id with it.
    pub fn parent(&self) -> Option<Workflow> {
        let link = self.inner.parent.read().as_ref().map(|weak| weak.upgrade());
        match link {
            None => None,
            Some(Some(inner)) => Some(Workflow { inner }),
            Some(None) => {
                self.release_dead_parent();
                None
            }
        }
    }

    fn release_dead_parent(&self) {
        let mut link = self.inner.parent.write();
        if link.as_ref().is_some_and(|weak| weak.strong_count() == 0) {
            *link = None;
            self.inner.node.set_parent(None);
            tracing::debug!(workflow = %self.inner.id, "Parent dropped, '{}' is now a root", self.inner.name);
        }
    }

    pub fn children(&self) -> Vec<Workflow> {
        self.inner.children.read().clone()
    }

    pub fn has_child(&self, child: &Workflow) -> bool {
        self.inner.children.read().iter().any(|c| c.ptr_eq(child))
    }

    pub fn is_root(&self) -> bool {
        self.parent().is_none()
    }

    pub fn ptr_eq(&self, other: &Workflow) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub fn reflection(&self) -> Option<Arc<ReflectionManager>> {
        self.inner.reflection.read().clone()
    }

    pub fn has_executor(&self) -> bool {
        self.inner.executor.read().is_some()
    }

    /// Step timeout set on this workflow or its nearest ancestor.
    pub fn step_timeout(&self) -> Option<Duration> {
        let mut visited = HashSet::new();
        let mut current = Some(self.clone());
        while let Some(workflow) = current {
            if !visited.insert(workflow.identity()) {
                return None;
            }
            if let Some(timeout) = *workflow.inner.step_timeout.read() {
                return Some(timeout);
            }
            current = workflow.parent();
        }
        None
    }

    pub fn attach_child(&self, child: &Workflow) -> Result<()> {
        Ok(tree::attach_child(self, child)?)
    }

    pub fn detach_child(&self, child: &Workflow) -> Result<()> {
        Ok(tree::detach_child(self, child)?)
    }

    pub fn add_observer(&self, observer: Arc<dyn WorkflowObserver>) -> Result<()> {
        Ok(bus::add_observer(self, observer)?)
    }

    /// Emit an event from this workflow to its root's observers.
    pub fn emit(&self, event: WorkflowEvent) -> Result<()> {
        Ok(bus::emit_event(self, event)?)
    }

    pub fn set_status(&self, status: WorkflowStatus) -> Result<()> {
        *self.inner.status.write() = status;
        self.inner.node.set_status(status);
        tracing::debug!(workflow = %self.id(), name = %self.name(), %status, "Status changed");

        let root = tree::get_root(self)?;
        self.emit(WorkflowEvent::TreeUpdated { root_id: root.id() })
    }

    /// Append to the node's log buffer and notify the root's observers.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.push_log(LogEntry::new(self.id(), level, message));
    }

    pub fn log_with_data(&self, level: LogLevel, message: impl Into<String>, data: impl Into<Value>) {
        self.push_log(LogEntry::new(self.id(), level, message).with_data(data));
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    fn push_log(&self, entry: LogEntry) {
        match entry.level {
            LogLevel::Debug => tracing::debug!(workflow = %self.id(), name = %self.name(), "{}", entry.message),
            LogLevel::Info => tracing::info!(workflow = %self.id(), name = %self.name(), "{}", entry.message),
            LogLevel::Warn => tracing::warn!(workflow = %self.id(), name = %self.name(), "{}", entry.message),
            LogLevel::Error => tracing::error!(workflow = %self.id(), name = %self.name(), "{}", entry.message),
        }

        self.inner.node.push_log(entry.clone());
        if let Err(e) = bus::route_log(self, &entry) {
            tracing::error!(workflow = %self.id(), "Failed to route log entry: {}", e);
        }
    }

    /// Policy-filtered view of this workflow's observed state.
    pub fn capture_state(&self) -> StateMap {
        let state = self.inner.state.read().clone();
        capture_state(state.as_deref())
    }

    /// Capture state, store it on the node and tell the tree about it.
    pub fn snapshot_state(&self) -> Result<StateMap> {
        let state = self.capture_state();
        self.inner.node.set_state_snapshot(state.clone());
        self.emit(WorkflowEvent::StateSnapshot {
            node_id: self.id(),
            state: state.clone(),
        })?;
        bus::route_state_updated(self)?;

        let root = tree::get_root(self)?;
        self.emit(WorkflowEvent::TreeUpdated { root_id: root.id() })?;
        Ok(state)
    }

    /// Cancel this workflow and everything beneath it.
    ///
    /// Cancellation is cooperative: running steps finish, later steps and
    /// runs observe it at their start.
    pub fn cancel(&self) {
        let mut visited = HashSet::new();
        let mut pending = vec![self.clone()];
        while let Some(workflow) = pending.pop() {
            if !visited.insert(workflow.identity()) {
                continue;
            }
            workflow.inner.cancellation.cancel();
            pending.extend(workflow.children());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    pub(crate) fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    /// Run the workflow's executor inside its lifecycle.
    ///
    /// On failure the returned error is a [`WorkflowError`] carrying the
    /// state and log buffer at the point of failure, or a structural
    /// [`TreeError`].
    pub async fn run(&self) -> Result<Value> {
        if self.is_cancelled() {
            self.set_status(WorkflowStatus::Cancelled)?;
            return Err(FlowError::Cancelled);
        }

        self.set_status(WorkflowStatus::Running)?;
        tracing::info!(workflow = %self.id(), name = %self.name(), "Starting workflow");
        let start = Instant::now();

        let executor = self.inner.executor.read().clone();
        let result = match executor {
            Some(executor) => self.execute(executor).await,
            None => Err(FlowError::execution(format!(
                "workflow {} has no executor",
                self.label()
            ))),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(value) => {
                self.inner.node.set_state_snapshot(self.capture_state());
                self.set_status(WorkflowStatus::Completed)?;
                tracing::info!(workflow = %self.id(), name = %self.name(), "Workflow completed in {}ms", duration_ms);
                Ok(value)
            }
            Err(FlowError::Cancelled) => {
                self.set_status(WorkflowStatus::Cancelled)?;
                tracing::warn!(workflow = %self.id(), name = %self.name(), "Workflow cancelled after {}ms", duration_ms);
                Err(FlowError::Cancelled)
            }
            Err(error) => {
                let error = self.capture_error(error);
                self.inner.node.set_state_snapshot(self.capture_state());
                self.set_status(WorkflowStatus::Failed)?;
                self.report_failure(&error)?;
                tracing::error!(workflow = %self.id(), name = %self.name(), "Workflow failed after {}ms: {}", duration_ms, error);
                Err(error)
            }
        }
    }

    async fn execute(&self, executor: ExecutorFn) -> Result<Value> {
        match self.reflection() {
            Some(manager) if manager.is_enabled() => {
                let workflow = self.clone();
                execute_with_reflection(
                    |attempt: Attempt| executor(ExecutionContext::new(self.clone()).with_attempt(attempt)),
                    &manager,
                    |error: &FlowError, attempt_number: u32| {
                        ReflectionContext::new(workflow.clone(), error.clone(), attempt_number)
                            .with_level(manager.config().level)
                    },
                )
                .await
            }
            _ => executor(ExecutionContext::new(self.clone())).await,
        }
    }

    /// Wrap an execution error with this workflow's state and a copy of its
    /// log buffer. Errors that were already captured, structural errors and
    /// cancellation pass through unchanged.
    pub(crate) fn capture_error(&self, error: FlowError) -> FlowError {
        match error {
            FlowError::Workflow(_) | FlowError::Tree(_) | FlowError::Cancelled => error,
            other => WorkflowError::capture(
                self.id(),
                other,
                self.capture_state(),
                self.inner.node.logs(),
            )
            .into(),
        }
    }

    /// Emit an `error` event for `error` unless this node already reported it.
    pub(crate) fn report_failure(&self, error: &FlowError) -> std::result::Result<(), TreeError> {
        let Some(captured) = error.as_workflow_error() else {
            return Ok(());
        };

        let already_reported = self.inner.node.read().events.iter().any(|event| {
            matches!(
                event,
                WorkflowEvent::Error { error: reported, .. }
                    if reported.workflow_id == captured.workflow_id
                        && reported.timestamp == captured.timestamp
                        && reported.message == captured.message
            )
        });
        if already_reported {
            return Ok(());
        }

        bus::emit_event(
            self,
            WorkflowEvent::Error {
                node_id: self.id(),
                error: captured.clone(),
            },
        )
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}
