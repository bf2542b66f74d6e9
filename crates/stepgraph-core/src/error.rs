use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepGraphError {
    // Model errors
    #[error("Model request failed: {0}")]
    ModelRequest(String),

    #[error("Model response parse error: {0}")]
    ModelResponse(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool invocation failed: {tool}: {message}")]
    ToolInvocation { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Execution errors
    #[error("Recursion limit of {limit} steps exceeded at node '{node}'")]
    RecursionLimitExceeded { node: String, limit: usize },

    #[error("Routing error at node '{node}': {message}")]
    Routing { node: String, message: String },

    #[error("State merge conflict on replace field '{field}': {writers} concurrent writers")]
    StateMergeConflict { field: String, writers: usize },

    #[error("Graph compile error: {0}")]
    GraphCompile(String),

    #[error("Node '{node}' failed: {message}")]
    NodeFailed { node: String, message: String },

    #[error("Run cancelled")]
    Cancelled,

    // State errors
    #[error("Unknown state field: {0}")]
    UnknownField(String),

    #[error("State field '{field}' has unexpected shape: {message}")]
    FieldType { field: String, message: String },

    #[error("Node '{node}' wrote field '{field}' outside its declared scope")]
    OutOfScope { node: String, field: String },

    // Run management errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run '{0}' is not waiting for input")]
    NotInterrupted(String),

    #[error("Run '{0}' is already active")]
    RunActive(String),

    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StepGraphError>;
