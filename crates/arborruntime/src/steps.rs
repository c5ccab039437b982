//! Step and task wrappers around workflow bodies

use crate::executor::{run_concurrent, run_sequential, ErrorMergeStrategy};
use crate::tree;
use crate::workflow::Workflow;
use arborcore::{FlowError, LogLevel, Result, Value, WorkflowEvent};
use std::future::Future;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct StepOptions {
    pub name: String,
    /// Capture a state snapshot once the step succeeds
    pub snapshot: bool,
    /// Log the step's duration
    pub track_timing: bool,
    /// Overrides the workflow's inherited step timeout
    pub timeout: Option<Duration>,
}

impl StepOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            snapshot: false,
            track_timing: true,
            timeout: None,
        }
    }

    pub fn with_snapshot(mut self) -> Self {
        self.snapshot = true;
        self
    }

    pub fn without_timing(mut self) -> Self {
        self.track_timing = false;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub name: String,
    /// Run the returned child workflows together instead of one by one
    pub concurrent: bool,
    pub merge: Option<ErrorMergeStrategy>,
}

impl TaskOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrent: false,
            merge: None,
        }
    }

    pub fn concurrent(mut self) -> Self {
        self.concurrent = true;
        self
    }

    pub fn with_merge(mut self, strategy: ErrorMergeStrategy) -> Self {
        self.merge = Some(strategy);
        self
    }
}

/// Run `f` as a named step of `workflow`.
///
/// Emits `step_start`/`step_end`, logs timing and snapshots state per
/// `options`. A failure is captured with the workflow's state and log
/// buffer, reported as an `error` event and returned.
pub async fn with_step<T, F, Fut>(workflow: &Workflow, options: StepOptions, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if workflow.is_cancelled() {
        return Err(FlowError::Cancelled);
    }

    workflow.emit(WorkflowEvent::StepStart {
        node_id: workflow.id(),
        step: options.name.clone(),
    })?;
    tracing::debug!(workflow = %workflow.id(), step = %options.name, "Step started");

    let start = Instant::now();
    let outcome = match options.timeout.or_else(|| workflow.step_timeout()) {
        Some(limit) => match tokio::time::timeout(limit, f()).await {
            Ok(outcome) => outcome,
            Err(_) => Err(FlowError::Timeout {
                step: options.name.clone(),
                millis: limit.as_millis() as u64,
            }),
        },
        None => f().await,
    };
    let duration_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok(value) => {
            if options.track_timing {
                workflow.log_with_data(
                    LogLevel::Info,
                    format!("Step '{}' completed in {}ms", options.name, duration_ms),
                    duration_ms,
                );
            }
            workflow.emit(WorkflowEvent::StepEnd {
                node_id: workflow.id(),
                step: options.name.clone(),
                duration_ms,
            })?;
            if options.snapshot {
                workflow.snapshot_state()?;
            }
            Ok(value)
        }
        Err(FlowError::Cancelled) => Err(FlowError::Cancelled),
        Err(error) => {
            let error = workflow.capture_error(error);
            workflow.report_failure(&error)?;
            workflow.log(
                LogLevel::Error,
                format!("Step '{}' failed after {}ms: {}", options.name, duration_ms, error),
            );
            Err(error)
        }
    }
}

/// Run `f` as a named task of `workflow`; `f` returns the child workflows
/// to execute.
///
/// Children not yet attached are attached to `workflow`. They then run one
/// after another, or all together when `options.concurrent` is set, in
/// which case failures are reduced per `options.merge`. Returns the
/// children's outputs in child order.
pub async fn with_task<F, Fut>(workflow: &Workflow, options: TaskOptions, f: F) -> Result<Vec<Value>>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Vec<Workflow>>>,
{
    if workflow.is_cancelled() {
        return Err(FlowError::Cancelled);
    }

    workflow.emit(WorkflowEvent::TaskStart {
        node_id: workflow.id(),
        task: options.name.clone(),
    })?;
    tracing::debug!(workflow = %workflow.id(), task = %options.name, "Task started");

    let start = Instant::now();
    let outcome = async {
        let children = f().await?;
        for child in &children {
            tree::ensure_attached(workflow, child)?;
        }
        let values = if options.concurrent {
            run_concurrent(&children, options.merge.as_ref()).await?
        } else {
            run_sequential(&children).await?
        };
        Ok::<Vec<Value>, FlowError>(values)
    }
    .await;
    let duration_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok(values) => {
            workflow.emit(WorkflowEvent::TaskEnd {
                node_id: workflow.id(),
                task: options.name.clone(),
                duration_ms,
            })?;
            tracing::debug!(workflow = %workflow.id(), task = %options.name, "Task completed in {}ms", duration_ms);
            Ok(values)
        }
        Err(FlowError::Cancelled) => Err(FlowError::Cancelled),
        Err(error) => {
            let error = workflow.capture_error(error);
            workflow.report_failure(&error)?;
            workflow.log(
                LogLevel::Error,
                format!("Task '{}' failed after {}ms: {}", options.name, duration_ms, error),
            );
            Err(error)
        }
    }
}
