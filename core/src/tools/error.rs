use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool disabled: {0}")]
    Disabled(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::NotFound(_) => "TOOL_NOT_FOUND",
            ToolError::Disabled(_) => "TOOL_DISABLED",
            ToolError::InvalidArguments(_) => "INVALID_ARGUMENTS",
            ToolError::InvalidSchema(_) => "INVALID_SCHEMA",
            ToolError::ExecutionFailed(_) => "EXECUTION_FAILED",
            ToolError::Timeout(_) => "TIMEOUT",
            ToolError::Internal(_) => "INTERNAL",
        }
    }
}

pub type ToolResult<T> = Result<T, ToolError>;
