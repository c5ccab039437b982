//! Execution of a task's child workflows
//!
//! Concurrent batches start every child before awaiting any and always wait
//! for all of them, so a failing child never leaves siblings unobserved.

use crate::workflow::Workflow;
use arborcore::{FlowError, Result, Value, WorkflowError};
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub type CombineFn = Arc<dyn Fn(Vec<WorkflowError>) -> WorkflowError + Send + Sync>;

/// How failures of a concurrent batch are reduced to one error
#[derive(Clone)]
pub struct ErrorMergeStrategy {
    pub enabled: bool,
    /// Most errors handed to `combine` in one call
    pub max_merge_depth: usize,
    combine: CombineFn,
}

impl ErrorMergeStrategy {
    pub const DEFAULT_MAX_MERGE_DEPTH: usize = 10;

    /// An enabled strategy using `combine`.
    pub fn new<F>(combine: F) -> Self
    where
        F: Fn(Vec<WorkflowError>) -> WorkflowError + Send + Sync + 'static,
    {
        Self {
            enabled: true,
            max_merge_depth: Self::DEFAULT_MAX_MERGE_DEPTH,
            combine: Arc::new(combine),
        }
    }

    /// An enabled strategy joining all messages into one error.
    pub fn concatenate() -> Self {
        Self::new(concatenate_errors)
    }

    /// Depths below 2 are treated as 2 so each fold makes progress.
    pub fn with_max_merge_depth(mut self, depth: usize) -> Self {
        self.max_merge_depth = depth;
        self
    }

    /// Fold `errors`, in order, into a single error.
    ///
    /// Each `combine` call sees at most `max_merge_depth` errors; past the
    /// first call the running result is folded with the next batch.
    /// Returns `None` without calling `combine` when there is nothing to merge.
    pub fn merge(&self, errors: Vec<WorkflowError>) -> Option<WorkflowError> {
        let depth = self.max_merge_depth.max(2);
        let mut pending = errors.into_iter();

        let first: Vec<_> = pending.by_ref().take(depth).collect();
        if first.is_empty() {
            return None;
        }
        let mut merged = (self.combine)(first);

        loop {
            let next: Vec<_> = pending.by_ref().take(depth - 1).collect();
            if next.is_empty() {
                break;
            }
            let mut batch = Vec::with_capacity(next.len() + 1);
            batch.push(merged);
            batch.extend(next);
            merged = (self.combine)(batch);
        }

        Some(merged)
    }
}

impl Default for ErrorMergeStrategy {
    fn default() -> Self {
        Self {
            enabled: false,
            ..Self::concatenate()
        }
    }
}

impl fmt::Debug for ErrorMergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorMergeStrategy")
            .field("enabled", &self.enabled)
            .field("max_merge_depth", &self.max_merge_depth)
            .finish_non_exhaustive()
    }
}

/// Join messages with `"; "`, keeping the first error's workflow and state
/// and every error's logs.
pub fn concatenate_errors(errors: Vec<WorkflowError>) -> WorkflowError {
    let workflow_id = errors.first().map(|e| e.workflow_id).unwrap_or_else(Uuid::nil);
    let message = errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    let state = errors.first().map(|e| e.state.clone()).unwrap_or_default();
    let logs = errors.into_iter().flat_map(|e| e.logs).collect();

    WorkflowError::new(workflow_id, message)
        .with_state(state)
        .with_logs(logs)
}

/// Run `children` one after another, stopping at the first failure.
pub async fn run_sequential(children: &[Workflow]) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(children.len());
    for child in children {
        values.push(child.run().await?);
    }
    Ok(values)
}

/// Run `children` together and wait for every one of them.
///
/// Without an enabled `merge` strategy the first failure in child order is
/// returned; otherwise all failures are merged in child order.
pub async fn run_concurrent(children: &[Workflow], merge: Option<&ErrorMergeStrategy>) -> Result<Vec<Value>> {
    tracing::debug!("Running {} child workflows concurrently", children.len());

    let outcomes = join_all(children.iter().map(|child| child.run())).await;

    let mut values = Vec::with_capacity(children.len());
    let mut failures = Vec::new();
    for (child, outcome) in children.iter().zip(outcomes) {
        match outcome {
            Ok(value) => values.push(value),
            Err(error) => {
                tracing::warn!(workflow = %child.id(), "Child workflow '{}' failed: {}", child.name(), error);
                failures.push((child, error));
            }
        }
    }

    if failures.is_empty() {
        return Ok(values);
    }

    match merge {
        Some(strategy) if strategy.enabled => {
            let count = failures.len();
            let errors = failures
                .into_iter()
                .map(|(child, error)| into_workflow_error(child, error))
                .collect();
            match strategy.merge(errors) {
                Some(merged) => {
                    tracing::debug!("Merged {} child failures", count);
                    Err(merged.into())
                }
                None => Ok(values),
            }
        }
        _ => match failures.into_iter().next() {
            Some((_, first)) => Err(first),
            None => Ok(values),
        },
    }
}

fn into_workflow_error(child: &Workflow, error: FlowError) -> WorkflowError {
    match error {
        FlowError::Workflow(captured) => *captured,
        other => WorkflowError::capture(child.id(), other, child.capture_state(), child.node().logs()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn error(message: &str) -> WorkflowError {
        WorkflowError::new(Uuid::new_v4(), message)
    }

    #[test]
    fn merge_with_nothing_never_combines() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let strategy = ErrorMergeStrategy::new(move |errors| {
            counter.fetch_add(1, Ordering::SeqCst);
            concatenate_errors(errors)
        });

        assert!(strategy.merge(Vec::new()).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn merge_folds_in_batches_of_max_depth() {
        let batch_sizes = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sizes = batch_sizes.clone();
        let strategy = ErrorMergeStrategy::new(move |errors| {
            sizes.lock().push(errors.len());
            concatenate_errors(errors)
        })
        .with_max_merge_depth(2);

        let merged = strategy
            .merge(vec![error("a"), error("b"), error("c"), error("d")])
            .unwrap();

        assert_eq!(merged.message, "a; b; c; d");
        assert_eq!(*batch_sizes.lock(), vec![2, 2, 2]);
    }

    #[test]
    fn merge_depth_below_two_still_folds_pairs() {
        for depth in [0, 1] {
            let batch_sizes = Arc::new(parking_lot::Mutex::new(Vec::new()));
            let sizes = batch_sizes.clone();
            let strategy = ErrorMergeStrategy::new(move |errors| {
                sizes.lock().push(errors.len());
                concatenate_errors(errors)
            })
            .with_max_merge_depth(depth);

            let merged = strategy
                .merge(vec![error("a"), error("b"), error("c")])
                .unwrap();

            assert_eq!(merged.message, "a; b; c");
            assert_eq!(*batch_sizes.lock(), vec![2, 2], "depth {}", depth);
        }
    }

    #[test]
    fn merge_fits_in_one_call_when_depth_allows() {
        let merged = ErrorMergeStrategy::concatenate()
            .merge(vec![error("first"), error("second")])
            .unwrap();
        assert_eq!(merged.message, "first; second");
    }

    #[test]
    fn default_strategy_is_disabled() {
        let strategy = ErrorMergeStrategy::default();
        assert!(!strategy.enabled);
        assert_eq!(strategy.max_merge_depth, ErrorMergeStrategy::DEFAULT_MAX_MERGE_DEPTH);
    }
}
