//! Failure analysis and the retry loop built on it
//!
//! A [`ReflectionManager`] decides whether a failed attempt is worth
//! repeating. Rate limits, auth failures and transport errors are never
//! retried here; they belong to a backoff layer. Everything else is decided
//! by a delegate [`Agent`] when one is configured, or by message heuristics.

use crate::context::Attempt;
use crate::workflow::Workflow;
use arborcore::{
    Agent, AgentRequest, FlowError, ReflectionDecision, ReflectionLevel, Result, WorkflowEvent,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate-limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
    "quota",
];

const AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "unauthenticated",
    "authentication",
    "authorization",
    "forbidden",
    "invalid api key",
    "permission denied",
];

const NETWORK_PATTERNS: &[&str] = &[
    "network",
    "connection refused",
    "connection reset",
    "econnrefused",
    "econnreset",
    "enotfound",
    "dns",
    "socket hang up",
];

const VALIDATION_PATTERNS: &[&str] = &[
    "validation",
    "invalid",
    "parse",
    "parsing",
    "schema",
    "malformed",
    "unexpected token",
];

const TIMEOUT_PATTERNS: &[&str] = &["timeout", "timed out"];

/// Coarse category of a failure, derived from its message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    RateLimit,
    Authentication,
    Network,
    Validation,
    Timeout,
    Other,
}

impl ErrorClass {
    /// Categories reflection never retries.
    pub fn is_non_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::RateLimit | ErrorClass::Authentication | ErrorClass::Network
        )
    }

    fn describe(&self) -> &'static str {
        match self {
            ErrorClass::RateLimit => "rate limit",
            ErrorClass::Authentication => "authentication",
            ErrorClass::Network => "network",
            ErrorClass::Validation => "validation",
            ErrorClass::Timeout => "timeout",
            ErrorClass::Other => "unclassified",
        }
    }
}

/// Classify a failure, trusting the error variant over its message.
///
/// Step timeouts carry the step name in their message, so they are
/// recognised by variant (also when captured inside a [`WorkflowError`](arborcore::WorkflowError)).
pub fn classify_failure(error: &FlowError) -> ErrorClass {
    match error {
        FlowError::Timeout { .. } => ErrorClass::Timeout,
        FlowError::Workflow(captured) => match captured.original() {
            Some(original) => classify_failure(original),
            None => classify_error(&captured.message),
        },
        other => classify_error(&other.to_string()),
    }
}

/// Classify an error message, case-insensitively.
pub fn classify_error(message: &str) -> ErrorClass {
    let message = message.to_lowercase();
    let matches_any = |patterns: &[&str]| patterns.iter().any(|p| message.contains(p));

    if matches_any(RATE_LIMIT_PATTERNS) {
        ErrorClass::RateLimit
    } else if matches_any(AUTH_PATTERNS) {
        ErrorClass::Authentication
    } else if matches_any(NETWORK_PATTERNS) {
        ErrorClass::Network
    } else if matches_any(TIMEOUT_PATTERNS) {
        ErrorClass::Timeout
    } else if matches_any(VALIDATION_PATTERNS) {
        ErrorClass::Validation
    } else {
        ErrorClass::Other
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReflectionConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub retry_delay_ms: Option<u64>,
    pub level: ReflectionLevel,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: 3,
            retry_delay_ms: None,
            level: ReflectionLevel::Workflow,
        }
    }
}

impl ReflectionConfig {
    pub fn enabled(max_attempts: u32) -> Self {
        Self {
            enabled: true,
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_level(mut self, level: ReflectionLevel) -> Self {
        self.level = level;
        self
    }
}

/// Summary of an earlier failed attempt, handed to the next reflection
#[derive(Debug, Clone, Serialize)]
pub struct AttemptSummary {
    pub attempt: u32,
    pub error: String,
    pub reason: String,
}

/// Everything known about a failure when deciding on a retry
#[derive(Debug, Clone)]
pub struct ReflectionContext {
    pub level: ReflectionLevel,
    pub workflow: Workflow,
    pub error: FlowError,
    pub attempt_number: u32,
    pub previous_attempts: Vec<AttemptSummary>,
}

impl ReflectionContext {
    pub fn new(workflow: Workflow, error: FlowError, attempt_number: u32) -> Self {
        Self {
            level: ReflectionLevel::Workflow,
            workflow,
            error,
            attempt_number,
            previous_attempts: Vec::new(),
        }
    }

    pub fn with_level(mut self, level: ReflectionLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_previous_attempts(mut self, attempts: Vec<AttemptSummary>) -> Self {
        self.previous_attempts = attempts;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReflectionResult {
    pub should_retry: bool,
    pub reason: String,
    pub revised_input: Option<serde_json::Value>,
}

impl ReflectionResult {
    pub fn retry(reason: impl Into<String>) -> Self {
        Self {
            should_retry: true,
            reason: reason.into(),
            revised_input: None,
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            should_retry: false,
            reason: reason.into(),
            revised_input: None,
        }
    }
}

impl From<ReflectionDecision> for ReflectionResult {
    fn from(decision: ReflectionDecision) -> Self {
        Self {
            should_retry: decision.should_retry,
            reason: decision.reason,
            revised_input: decision.revised_input,
        }
    }
}

/// Audit record of one reflection.
///
/// Only `success` changes after creation, once a retry it led to succeeds.
#[derive(Debug, Clone, Serialize)]
pub struct ReflectionEntry {
    timestamp: DateTime<Utc>,
    level: ReflectionLevel,
    reason: String,
    error: String,
    resolution: String,
    success: bool,
}

impl ReflectionEntry {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn level(&self) -> ReflectionLevel {
        self.level
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    pub fn resolution(&self) -> &str {
        &self.resolution
    }

    pub fn success(&self) -> bool {
        self.success
    }
}

pub struct ReflectionManager {
    config: ReflectionConfig,
    delegate: Option<Arc<dyn Agent>>,
    history: RwLock<Vec<ReflectionEntry>>,
}

impl ReflectionManager {
    pub fn new(config: ReflectionConfig) -> Self {
        Self {
            config,
            delegate: None,
            history: RwLock::new(Vec::new()),
        }
    }

    /// Let `agent` make the retry decision instead of the heuristics.
    pub fn with_delegate(mut self, agent: Arc<dyn Agent>) -> Self {
        self.delegate = Some(agent);
        self
    }

    pub fn config(&self) -> &ReflectionConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    pub fn history(&self) -> Vec<ReflectionEntry> {
        self.history.read().clone()
    }

    /// Mark the most recent entry as having led to a successful retry.
    pub fn mark_last_successful(&self) {
        if let Some(entry) = self.history.write().last_mut() {
            entry.success = true;
        }
    }

    /// Decide whether the failure described by `context` should be retried.
    pub async fn reflect(&self, context: ReflectionContext) -> ReflectionResult {
        let workflow = &context.workflow;
        if let Err(e) = workflow.emit(WorkflowEvent::ReflectionStart {
            node_id: workflow.id(),
            level: context.level,
            attempt: context.attempt_number,
        }) {
            tracing::warn!(workflow = %workflow.id(), "Failed to emit reflection start: {}", e);
        }

        let message = context.error.to_string();
        let class = classify_failure(&context.error);

        let result = if class.is_non_retryable() {
            ReflectionResult::abort(format!(
                "{} errors are not retried by reflection",
                class.describe()
            ))
        } else if let Some(delegate) = &self.delegate {
            self.ask_delegate(delegate.as_ref(), &context).await
        } else {
            heuristic_decision(class, context.attempt_number, self.max_attempts())
        };

        tracing::info!(
            workflow = %workflow.id(),
            attempt = context.attempt_number,
            should_retry = result.should_retry,
            "Reflection decided: {}",
            result.reason
        );

        self.history.write().push(ReflectionEntry {
            timestamp: Utc::now(),
            level: context.level,
            reason: result.reason.clone(),
            error: message,
            resolution: if result.should_retry { "retry" } else { "abort" }.to_string(),
            success: false,
        });

        if result.should_retry {
            if let Some(delay_ms) = self.config.retry_delay_ms {
                tracing::debug!(workflow = %workflow.id(), "Waiting {}ms before retry", delay_ms);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }
        }

        if let Err(e) = workflow.emit(WorkflowEvent::ReflectionEnd {
            node_id: workflow.id(),
            should_retry: result.should_retry,
            reason: result.reason.clone(),
        }) {
            tracing::warn!(workflow = %workflow.id(), "Failed to emit reflection end: {}", e);
        }

        result
    }

    async fn ask_delegate(&self, delegate: &dyn Agent, context: &ReflectionContext) -> ReflectionResult {
        let request = AgentRequest::new(self.build_prompt(context))
            .with_system(
                "You analyse failed workflow executions and decide whether retrying can succeed. \
                 Answer with JSON only.",
            )
            .with_response_schema(ReflectionDecision::schema());

        let response = match delegate.respond(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(agent = delegate.name(), "Reflection delegate failed: {}", e);
                return ReflectionResult::abort(format!("reflection delegate failed: {}", e));
            }
        };

        match serde_json::from_value::<ReflectionDecision>(response) {
            Ok(decision) => decision.into(),
            Err(e) => {
                tracing::warn!(agent = delegate.name(), "Reflection delegate returned an invalid decision: {}", e);
                ReflectionResult::abort(format!("reflection delegate returned an invalid decision: {}", e))
            }
        }
    }

    fn build_prompt(&self, context: &ReflectionContext) -> String {
        let error = &context.error;
        let stack = error
            .as_workflow_error()
            .and_then(|e| e.stack.as_deref())
            .unwrap_or("unavailable");

        let mut prompt = String::new();
        let _ = writeln!(prompt, "A {} level execution failed.", context.level);
        let _ = writeln!(prompt, "Workflow: {} ({})", context.workflow.name(), context.workflow.id());
        let _ = writeln!(prompt, "Attempt: {} of {}", context.attempt_number, self.max_attempts());
        let _ = writeln!(prompt, "Error: {}", error);
        let _ = writeln!(prompt, "Stack: {}", stack);

        if context.previous_attempts.is_empty() {
            let _ = writeln!(prompt, "Previous attempts: none");
        } else {
            let _ = writeln!(prompt, "Previous attempts:");
            for attempt in &context.previous_attempts {
                let _ = writeln!(
                    prompt,
                    "- attempt {}: {} (reflection: {})",
                    attempt.attempt, attempt.error, attempt.reason
                );
            }
        }

        let _ = writeln!(
            prompt,
            "Decide whether another attempt can succeed. Respond with \
             {{\"should_retry\": bool, \"reason\": string, \"revised_input\": optional}}."
        );
        prompt
    }
}

impl std::fmt::Debug for ReflectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReflectionManager")
            .field("config", &self.config)
            .field("delegate", &self.delegate.as_ref().map(|d| d.name().to_string()))
            .field("history", &self.history.read().len())
            .finish()
    }
}

fn heuristic_decision(class: ErrorClass, attempt_number: u32, max_attempts: u32) -> ReflectionResult {
    match class {
        ErrorClass::Validation => ReflectionResult::retry("validation errors may pass on another attempt"),
        ErrorClass::Timeout if attempt_number <= 1 => ReflectionResult::retry("first timeout, retrying once"),
        ErrorClass::Timeout => ReflectionResult::abort("timed out again"),
        _ if attempt_number < max_attempts => {
            ReflectionResult::retry(format!("attempt {} of {} failed", attempt_number, max_attempts))
        }
        _ => ReflectionResult::abort(format!("no attempts left after {}", attempt_number)),
    }
}

/// Run `operation` up to the manager's attempt limit, reflecting on each
/// failure before trying again.
///
/// `build_context` turns a failure into a [`ReflectionContext`]; summaries
/// of earlier attempts are filled in here. Structural errors and
/// cancellation are returned at once. When retries run out, or reflection
/// says stop, the last error is returned unchanged.
pub async fn execute_with_reflection<T, F, Fut, B>(
    mut operation: F,
    manager: &ReflectionManager,
    mut build_context: B,
) -> Result<T>
where
    F: FnMut(Attempt) -> Fut,
    Fut: Future<Output = Result<T>>,
    B: FnMut(&FlowError, u32) -> ReflectionContext,
{
    let max_attempts = manager.max_attempts();
    let mut attempt = Attempt::first();
    let mut previous_attempts = Vec::new();

    loop {
        let number = attempt.number;
        let error = match operation(attempt).await {
            Ok(value) => {
                if number > 1 {
                    manager.mark_last_successful();
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !manager.is_enabled()
            || number >= max_attempts
            || error.is_structural()
            || matches!(error, FlowError::Cancelled)
        {
            return Err(error);
        }

        let context = build_context(&error, number).with_previous_attempts(previous_attempts.clone());
        let result = manager.reflect(context).await;
        if !result.should_retry {
            return Err(error);
        }

        previous_attempts.push(AttemptSummary {
            attempt: number,
            error: error.to_string(),
            reason: result.reason,
        });
        attempt = Attempt::next(number, result.revised_input);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_case_insensitively() {
        assert_eq!(classify_error("Rate Limit exceeded"), ErrorClass::RateLimit);
        assert_eq!(classify_error("429 Too Many Requests"), ErrorClass::RateLimit);
        assert_eq!(classify_error("Invalid API key provided"), ErrorClass::Authentication);
        assert_eq!(classify_error("ECONNREFUSED 127.0.0.1:443"), ErrorClass::Network);
        assert_eq!(classify_error("Schema Validation failed"), ErrorClass::Validation);
        assert_eq!(classify_error("Step 'fetch' timed out after 50ms"), ErrorClass::Timeout);
        assert_eq!(classify_error("something odd"), ErrorClass::Other);
    }

    #[test]
    fn timeouts_are_recognised_by_variant() {
        for step in ["parse", "network-fetch", "validate-auth"] {
            let timeout = FlowError::Timeout {
                step: step.to_string(),
                millis: 50,
            };
            assert_eq!(classify_failure(&timeout), ErrorClass::Timeout, "step {}", step);

            let captured = FlowError::from(arborcore::WorkflowError::capture(
                uuid::Uuid::new_v4(),
                timeout,
                Default::default(),
                Vec::new(),
            ));
            assert_eq!(classify_failure(&captured), ErrorClass::Timeout, "step {}", step);
        }
        assert_eq!(
            classify_error("Step 'parse' timed out after 50ms"),
            ErrorClass::Timeout
        );
        assert_eq!(
            classify_failure(&FlowError::execution("ECONNRESET")),
            ErrorClass::Network
        );
    }

    #[test]
    fn heuristics() {
        assert!(heuristic_decision(ErrorClass::Validation, 2, 3).should_retry);
        assert!(heuristic_decision(ErrorClass::Timeout, 1, 3).should_retry);
        assert!(!heuristic_decision(ErrorClass::Timeout, 2, 3).should_retry);
        assert!(heuristic_decision(ErrorClass::Other, 2, 3).should_retry);
        assert!(!heuristic_decision(ErrorClass::Other, 3, 3).should_retry);
    }

    #[test]
    fn zero_attempts_means_one() {
        let manager = ReflectionManager::new(ReflectionConfig::enabled(0));
        assert_eq!(manager.max_attempts(), 1);
    }
}
