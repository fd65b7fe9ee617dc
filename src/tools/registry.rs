use serde_json::{json, Value};

use super::handler::{ToolDefinition, ToolHandler};

/// Name + description pair for the system prompt's tool list.
#[derive(Debug, Clone)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
}

/// Flat catalog of available tools. The sequence is the policy: lookup is
/// a linear first-match scan, export preserves registration order.
pub struct ToolRegistry {
    tools: Vec<ToolDefinition>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Register a tool. `input_schema` is the JSON object schema sent to
    /// the model.
    pub fn add(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: impl ToolHandler + 'static,
    ) -> Self {
        self.tools.push(ToolDefinition {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler: Box::new(handler),
        });
        self
    }

    /// Wire form for the API request: `{name, description, input_schema}`,
    /// handler dropped.
    pub fn export_for_api(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect()
    }

    /// Case-sensitive linear scan; first match wins on duplicates.
    pub fn find(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Summaries for the system prompt's tool section.
    pub fn summaries(&self) -> Vec<ToolSummary> {
        self.tools
            .iter()
            .map(|t| ToolSummary {
                name: t.name.clone(),
                description: t.description.clone(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
