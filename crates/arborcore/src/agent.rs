use crate::{Result, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Structured request handed to an [`Agent`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// JSON schema the response is expected to satisfy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub input: Value,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_response_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn with_input(mut self, input: impl Into<Value>) -> Self {
        self.input = input.into();
        self
    }
}

/// Request/response collaborator (an LLM call, a tool loop, a cache...).
///
/// The kernel only relies on getting a validated structured response back.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    async fn respond(&self, request: AgentRequest) -> Result<serde_json::Value>;
}
