use serde::{Deserialize, Serialize};
use std::fmt;

/// Where in the stack a failure is being reflected on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReflectionLevel {
    #[default]
    Workflow,
    Agent,
    Prompt,
}

impl fmt::Display for ReflectionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReflectionLevel::Workflow => "workflow",
            ReflectionLevel::Agent => "agent",
            ReflectionLevel::Prompt => "prompt",
        })
    }
}

/// Structured retry decision returned by a reflection delegate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionDecision {
    pub should_retry: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revised_input: Option<serde_json::Value>,
}

impl ReflectionDecision {
    /// JSON schema a delegate's response must satisfy.
    pub fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "required": ["should_retry", "reason"],
            "properties": {
                "should_retry": { "type": "boolean" },
                "reason": { "type": "string" },
                "revised_input": {}
            }
        })
    }
}
