pub mod handler;
pub mod registry;

pub use handler::{ToolDefinition, ToolHandler};
pub use registry::{ToolRegistry, ToolSummary};
