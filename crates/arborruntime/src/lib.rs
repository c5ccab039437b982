//! Workflow execution runtime
//!
//! This crate provides the live workflow tree and everything that runs on
//! it: attach/detach, observer routing, step and task wrappers, concurrent
//! fan-out with error merging, and reflection-driven retries.

pub mod bus;
mod context;
mod event_tree;
mod executor;
pub mod reflection;
mod runtime;
mod steps;
pub mod tree;
mod workflow;

pub use context::{Attempt, ExecutionContext, ReflectionHandle};
pub use event_tree::EventTree;
pub use executor::{concatenate_errors, run_concurrent, run_sequential, CombineFn, ErrorMergeStrategy};
pub use reflection::{
    classify_error, classify_failure, execute_with_reflection, AttemptSummary, ErrorClass,
    ReflectionConfig, ReflectionContext, ReflectionEntry, ReflectionManager, ReflectionResult,
};
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use steps::{with_step, with_task, StepOptions, TaskOptions};
pub use workflow::{ExecutorFn, Workflow};
