pub mod arguments;
pub mod error;
pub mod registry;
pub mod schema;
pub mod traits;

// Re-export common types
pub use arguments::adapt_arguments;
pub use error::{ToolError, ToolResult};
pub use registry::{ToolRegistry, DEFAULT_TOOL_TIMEOUT};
pub use schema::{validate_schema, ParamType, SchemaBuilder, ToolSchema};
pub use traits::{FnTool, Tool};
