//! Core abstractions for the arbor workflow kernel
//!
//! This crate holds the data model shared by every other component: the
//! serializable workflow node tree, events and the observer capability,
//! state snapshots, error types and the agent collaborator contract.

mod agent;
mod error;
pub mod events;
mod node;
mod reflection;
pub mod snapshot;
mod value;

pub use agent::{Agent, AgentRequest};
pub use error::{FlowError, TreeError, WorkflowError};
pub use events::*;
pub use node::{LogEntry, LogLevel, NodeHandle, WorkflowId, WorkflowNode, WorkflowStatus};
pub use reflection::{ReflectionDecision, ReflectionLevel};
pub use snapshot::{capture_state, FieldPolicy, ObservedField, ObservedState, StateMap, REDACTED};
pub use value::Value;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
