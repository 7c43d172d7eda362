#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(
        "prompt too long for model context (estimated {estimated} tokens > max_model_len {limit})"
    )]
    PromptTooLarge { estimated: u64, limit: u64 },
    #[error("upstream error: {message}")]
    Upstream { status: Option<u16>, message: String },
    #[error("client disconnected")]
    ClientDisconnected,
    #[error("store error: {0}")]
    Store(String),
}

impl CoreError {
    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Upstream { status, message: message.into() }
    }
}
