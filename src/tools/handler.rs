use async_trait::async_trait;
use serde_json::Value;

/// A tool's execution handler. Consumers implement this for each tool.
/// `Err` is the failure channel; the dispatch layer converts it to an
/// error-flagged tool_result exactly once.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, input: &Value) -> Result<String, String>;
}

/// A tool contract: the wire-visible parts plus the host-owned handler.
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub(crate) handler: Box<dyn ToolHandler>,
}

impl ToolDefinition {
    /// Invoke the handler. Never panics out of a well-behaved handler;
    /// whatever it reports comes back as the `Err` string.
    pub async fn invoke(&self, input: &Value) -> Result<String, String> {
        self.handler.call(input).await
    }
}
