//! The capability handed to a workflow's executor

use crate::event_tree::EventTree;
use crate::reflection::{ReflectionContext, ReflectionEntry, ReflectionManager, ReflectionResult};
use crate::steps::{with_step, with_task, StepOptions, TaskOptions};
use crate::tree;
use crate::workflow::Workflow;
use arborcore::{Agent, AgentRequest, FlowError, LogLevel, Result, Value, WorkflowEvent};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::WaitForCancellationFuture;

/// One execution attempt of a workflow body
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attempt {
    /// 1-based
    pub number: u32,
    /// Input suggested by reflection for this attempt
    pub revised_input: Option<serde_json::Value>,
}

impl Attempt {
    pub fn first() -> Self {
        Self {
            number: 1,
            revised_input: None,
        }
    }

    pub fn next(previous: u32, revised_input: Option<serde_json::Value>) -> Self {
        Self {
            number: previous + 1,
            revised_input,
        }
    }
}

/// What a workflow body can do while it runs.
///
/// A fresh context is created for every attempt, so prompt bookkeeping does
/// not leak from a failed attempt into its retry.
#[derive(Clone)]
pub struct ExecutionContext {
    workflow: Workflow,
    attempt: Attempt,
    last_prompt: Arc<Mutex<Option<Workflow>>>,
}

impl ExecutionContext {
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow,
            attempt: Attempt::first(),
            last_prompt: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_attempt(mut self, attempt: Attempt) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn attempt(&self) -> &Attempt {
        &self.attempt
    }

    pub fn revised_input(&self) -> Option<&serde_json::Value> {
        self.attempt.revised_input.as_ref()
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.workflow.debug(message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.workflow.info(message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.workflow.warn(message);
    }

    /// Log progress as `current` of `total`.
    pub fn progress(&self, current: u64, total: u64, message: impl Into<String>) {
        let mut data = BTreeMap::new();
        data.insert("current".to_string(), Value::from(current));
        data.insert("total".to_string(), Value::from(total));
        self.workflow
            .log_with_data(LogLevel::Info, message, Value::Object(data));
    }

    pub fn emit(&self, event: WorkflowEvent) -> Result<()> {
        self.workflow.emit(event)
    }

    pub async fn step<T, F, Fut>(&self, name: impl Into<String>, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_step(&self.workflow, StepOptions::new(name), f).await
    }

    pub async fn step_with<T, F, Fut>(&self, options: StepOptions, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_step(&self.workflow, options, f).await
    }

    pub async fn task<F, Fut>(&self, options: TaskOptions, f: F) -> Result<Vec<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Workflow>>>,
    {
        with_task(&self.workflow, options, f).await
    }

    /// Attach `child` under the running workflow (if needed) and run it.
    pub async fn spawn_workflow(&self, child: &Workflow) -> Result<Value> {
        tree::ensure_attached(&self.workflow, child)?;
        child.run().await
    }

    /// Run one agent call as a `prompt` child node.
    pub async fn prompt(&self, agent: Arc<dyn Agent>, request: AgentRequest) -> Result<Value> {
        let node = prompt_workflow(agent, request);
        tree::attach_child(&self.workflow, &node)?;
        *self.last_prompt.lock() = Some(node.clone());
        node.run().await
    }

    /// Supersede the last prompt made through this context with a new call.
    ///
    /// The old node stays in the tree marked `superseded`; the new prompt is
    /// attached next to it under the same parent.
    pub async fn replace_last_prompt_result(&self, request: AgentRequest, agent: Arc<dyn Agent>) -> Result<Value> {
        let previous = self.last_prompt.lock().clone();
        let Some(previous) = previous else {
            return Err(FlowError::execution(format!(
                "workflow {} has no prompt result to replace",
                self.workflow.label()
            )));
        };

        previous.node().set_metadata("superseded", true);
        let parent = previous.parent().unwrap_or_else(|| self.workflow.clone());

        let replacement = prompt_workflow(agent, request);
        replacement
            .node()
            .set_metadata("replaces", previous.id().to_string());
        tree::attach_child(&parent, &replacement)?;
        self.workflow.debug(format!(
            "Prompt {} superseded by {}",
            previous.id(),
            replacement.id()
        ));

        *self.last_prompt.lock() = Some(replacement.clone());
        replacement.run().await
    }

    /// Read-only index over the whole tree this workflow belongs to.
    pub fn event_tree(&self) -> Result<EventTree> {
        let root = tree::get_root(&self.workflow)?;
        Ok(EventTree::new(root.node().clone()))
    }

    pub fn reflection(&self) -> ReflectionHandle {
        ReflectionHandle {
            workflow: self.workflow.clone(),
            manager: self.workflow.reflection(),
            attempt_number: self.attempt.number,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.workflow.is_cancelled()
    }

    /// Resolves once the workflow is cancelled; meant for `tokio::select!`.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.workflow.cancellation_token().cancelled()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("workflow", &self.workflow)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Read-only access to the running workflow's reflection manager
#[derive(Debug, Clone)]
pub struct ReflectionHandle {
    workflow: Workflow,
    manager: Option<Arc<ReflectionManager>>,
    attempt_number: u32,
}

impl ReflectionHandle {
    pub fn is_enabled(&self) -> bool {
        self.manager.as_ref().is_some_and(|m| m.is_enabled())
    }

    /// Ask the manager for a decision outside of a failure.
    pub async fn trigger_reflection(&self, reason: Option<String>) -> ReflectionResult {
        let manager = match &self.manager {
            Some(manager) if manager.is_enabled() => manager,
            _ => return ReflectionResult::abort("reflection is not enabled"),
        };

        let reason = reason.unwrap_or_else(|| "manually triggered reflection".to_string());
        let context = ReflectionContext::new(
            self.workflow.clone(),
            FlowError::execution(reason),
            self.attempt_number,
        )
        .with_level(manager.config().level);
        manager.reflect(context).await
    }

    pub fn get_reflection_history(&self) -> Vec<ReflectionEntry> {
        self.manager
            .as_ref()
            .map(|m| m.history())
            .unwrap_or_default()
    }
}

fn prompt_workflow(agent: Arc<dyn Agent>, request: AgentRequest) -> Workflow {
    let name = format!("prompt:{}", agent.name());
    let workflow = Workflow::new(name).with_executor(move |ctx: ExecutionContext| {
        let agent = agent.clone();
        let request = request.clone();
        async move {
            let node_id = ctx.workflow().id();
            let agent_name = agent.name().to_string();
            ctx.emit(WorkflowEvent::AgentStart {
                node_id,
                agent: agent_name.clone(),
            })?;

            let start = Instant::now();
            let response = agent.respond(request).await?;
            ctx.emit(WorkflowEvent::AgentEnd {
                node_id,
                agent: agent_name,
                duration_ms: start.elapsed().as_millis() as u64,
            })?;

            Ok(Value::from(response))
        }
    });
    workflow.node().set_metadata("kind", "prompt");
    workflow
}
