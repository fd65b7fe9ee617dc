use std::path::PathBuf;

/// Failures from the storage layer. Every variant carries the path it
/// happened on so callers never have to reconstruct it.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{}: not found", path.display())]
    NotFound { path: PathBuf },
    #[error("{}: corrupt JSON at line {line}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("model call failed: {0}")]
    ModelCall(#[from] InferenceError),
    #[error("conversation not loaded")]
    NotLoaded,
    #[error("conversation already exists: {}", .0.display())]
    AlreadyExists(PathBuf),
    #[error("compaction input too large: {input_tokens} tokens exceeds {limit}")]
    InputTooLarge { input_tokens: u32, limit: u32 },
    #[error("token budget exhausted: system prompt and max_tokens leave no room for messages")]
    TokenBudgetExhausted,
    #[error(
        "still over budget after {attempts} compactions \
         ({dropped_count} messages, ~{estimated_dropped_tokens} tokens over)"
    )]
    CompactionExhausted {
        attempts: u32,
        dropped_count: usize,
        estimated_dropped_tokens: u32,
    },
    #[error("turn budget exhausted: {0} model calls in one turn")]
    TurnBudgetExhausted(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {body}")]
    ApiError { status: u16, body: String },
    #[error("failed to parse response: {0}")]
    Parse(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("ANTHROPIC_API_KEY not set")]
    MissingApiKey,
    #[error("{var}: not an integer: {value}")]
    InvalidInt { var: &'static str, value: String },
}
